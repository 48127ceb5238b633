// src/scanner/watcher.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::scanner::scan::{ScanSummary, Scanner};
use crate::store::{Store, Workflow as WorkflowRow};
use crate::workflow;

/// Debounce window for repeated events on the same (workflow, path) pair.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

type DebounceKey = (String, PathBuf);

/// Incremental change watcher.
///
/// Holds the filesystem-event stream and the map of workflow id to watched
/// absolute paths. Events are debounced per (workflow, path) — the last
/// event wins — and then run through the scanner's digest pipeline.
pub struct Watcher {
    store: Arc<Store>,
    scanner: Arc<Scanner>,
    fs_watcher: Mutex<RecommendedWatcher>,
    watched_paths: Mutex<HashMap<String, Vec<PathBuf>>>,
    debounce: Mutex<HashMap<DebounceKey, JoinHandle<()>>>,
    stop: CancellationToken,
}

impl Watcher {
    /// Create the watcher and spawn its event loop.
    pub fn new(
        store: Arc<Store>,
        scanner: Arc<Scanner>,
        stop: CancellationToken,
    ) -> Result<Arc<Self>> {
        // Channel from the blocking notify callback into the async world.
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

        let fs_watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        if let Err(err) = event_tx.send(event) {
                            eprintln!("watchflow: failed to forward notify event: {err}");
                        }
                    }
                }
                Err(err) => {
                    eprintln!("watchflow: file watch error: {err}");
                }
            },
            Config::default(),
        )?;

        let watcher = Arc::new(Self {
            store,
            scanner,
            fs_watcher: Mutex::new(fs_watcher),
            watched_paths: Mutex::new(HashMap::new()),
            debounce: Mutex::new(HashMap::new()),
            stop: stop.clone(),
        });

        let event_watcher = Arc::clone(&watcher);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event_watcher.handle_event(event),
                        None => break,
                    },
                }
            }
            debug!("watcher event loop ended");
        });

        Ok(watcher)
    }

    /// Scan and arm every enabled workflow.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let workflows = self.store.workflows().list_enabled()?;
        for wf in &workflows {
            if let Err(err) = self.scanner.scan_workflow(&wf.id).await {
                warn!(workflow = %wf.name, error = %err, "initial scan failed");
            }
            if let Err(err) = self.add_workflow_watch(wf) {
                warn!(workflow = %wf.name, error = %err, "failed to register watches");
            }
        }
        info!(workflows = workflows.len(), "file watcher started");
        Ok(())
    }

    /// Stop watching everything and cancel pending debounce timers.
    pub fn stop(&self) {
        let mut watched = self.watched_paths.lock();
        let mut fs_watcher = self.fs_watcher.lock();
        for paths in watched.values() {
            for path in paths {
                let _ = fs_watcher.unwatch(path);
            }
        }
        watched.clear();
        drop(fs_watcher);
        drop(watched);

        let mut debounce = self.debounce.lock();
        for (_, handle) in debounce.drain() {
            handle.abort();
        }
        info!("file watcher stopped");
    }

    /// Enable a workflow: fresh initial scan, then watch registration.
    ///
    /// Idempotent: a workflow that is already armed is left alone.
    pub async fn enable_workflow(&self, workflow_id: &str) -> Result<()> {
        if self.watched_paths.lock().contains_key(workflow_id) {
            debug!(workflow = %workflow_id, "workflow already being watched");
            return Ok(());
        }

        let wf = self.store.workflows().get(workflow_id)?;
        if let Err(err) = self.scanner.scan_workflow(workflow_id).await {
            warn!(workflow = %wf.name, error = %err, "initial scan failed");
        }
        self.add_workflow_watch(&wf)
            .with_context(|| format!("registering watches for workflow '{}'", wf.name))?;

        info!(workflow = %wf.name, "workflow enabled and watching started");
        Ok(())
    }

    /// Disable a workflow: remove watches and abort its debounce timers.
    ///
    /// Task rows are untouched. Idempotent.
    pub fn disable_workflow(&self, workflow_id: &str) {
        let paths = match self.watched_paths.lock().remove(workflow_id) {
            Some(paths) => paths,
            None => {
                debug!(workflow = %workflow_id, "workflow is not being watched");
                return;
            }
        };

        let mut fs_watcher = self.fs_watcher.lock();
        for path in &paths {
            if let Err(err) = fs_watcher.unwatch(path) {
                warn!(?path, error = %err, "failed to remove watch");
            }
        }
        drop(fs_watcher);

        let mut debounce = self.debounce.lock();
        debounce.retain(|(wf_id, _), handle| {
            if wf_id == workflow_id {
                handle.abort();
                false
            } else {
                true
            }
        });

        info!(workflow = %workflow_id, "workflow disabled and watching stopped");
    }

    /// Drop the workflow's file index and task history, then rescan.
    pub async fn clear_index(&self, workflow_id: &str) -> Result<ScanSummary> {
        let tasks = self.store.tasks().delete_by_workflow(workflow_id)?;
        let files = self.store.files().delete_by_workflow(workflow_id)?;
        info!(workflow = %workflow_id, files, tasks, "index cleared");
        self.scanner.scan_workflow(workflow_id).await
    }

    /// Trigger a scan without touching watch state.
    pub async fn scan_workflow(&self, workflow_id: &str) -> Result<ScanSummary> {
        self.scanner.scan_workflow(workflow_id).await
    }

    /// Workflow ids that currently have registered watches.
    pub fn watched_workflows(&self) -> Vec<String> {
        self.watched_paths.lock().keys().cloned().collect()
    }

    /// Number of debounce timers currently pending.
    pub fn pending_debounces(&self) -> usize {
        self.debounce.lock().len()
    }

    fn add_workflow_watch(&self, wf: &WorkflowRow) -> Result<()> {
        let def = workflow::parse(&wf.yaml_source)
            .with_context(|| format!("parsing workflow '{}'", wf.name))?;

        let mut registered = Vec::new();
        let mut fs_watcher = self.fs_watcher.lock();

        for scan_path in &def.paths {
            let root = PathBuf::from(scan_path);
            let root = root.canonicalize().unwrap_or(root); // best-effort

            if let Err(err) = fs_watcher.watch(&root, RecursiveMode::NonRecursive) {
                warn!(path = ?root, error = %err, "failed to watch path");
                continue;
            }
            debug!(path = ?root, workflow = %wf.name, "watching path");
            registered.push(root.clone());

            // Register watches for subdirectories that exist now. Directories
            // created later are picked up on the next scan, not automatically.
            if def.options.include_subdirs {
                for entry in WalkDir::new(&root).min_depth(1).into_iter().flatten() {
                    if entry.file_type().is_dir() {
                        let sub = entry.path();
                        if let Err(err) = fs_watcher.watch(sub, RecursiveMode::NonRecursive) {
                            warn!(path = ?sub, error = %err, "failed to watch subdirectory");
                        } else {
                            registered.push(sub.to_path_buf());
                        }
                    }
                }
            }
        }
        drop(fs_watcher);

        self.watched_paths.lock().insert(wf.id.clone(), registered);
        Ok(())
    }

    /// Route one filesystem event into per-workflow debounce timers.
    fn handle_event(self: &Arc<Self>, event: Event) {
        for path in &event.paths {
            if !path.is_file() {
                continue;
            }
            for workflow_id in self.workflows_for_path(path) {
                self.debounce_file(workflow_id, path.clone());
            }
        }
    }

    fn workflows_for_path(&self, path: &Path) -> Vec<String> {
        let watched = self.watched_paths.lock();
        watched
            .iter()
            .filter(|(_, paths)| paths.iter().any(|base| path.parent() == Some(base.as_path())))
            .map(|(workflow_id, _)| workflow_id.clone())
            .collect()
    }

    /// (Re)arm the debounce timer for a (workflow, path) pair.
    ///
    /// The last event wins: an existing timer is aborted and replaced.
    fn debounce_file(self: &Arc<Self>, workflow_id: String, path: PathBuf) {
        let key: DebounceKey = (workflow_id.clone(), path.clone());
        let mut debounce = self.debounce.lock();

        if let Some(previous) = debounce.remove(&key) {
            previous.abort();
        }

        let watcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;

            watcher.debounce.lock().remove(&(workflow_id.clone(), path.clone()));
            if watcher.stop.is_cancelled() {
                return;
            }
            if let Err(err) = watcher.process_event_file(&workflow_id, &path).await {
                warn!(workflow = %workflow_id, ?path, error = %err, "failed to process file event");
            }
        });
        debounce.insert(key, handle);
    }

    /// Run one debounced file through the scanner's digest pipeline.
    async fn process_event_file(&self, workflow_id: &str, path: &Path) -> Result<()> {
        let wf = self.store.workflows().get(workflow_id)?;
        if !wf.enabled {
            return Ok(());
        }
        let def = workflow::parse(&wf.yaml_source)
            .with_context(|| format!("parsing workflow '{}'", wf.name))?;

        if !workflow::matches_file_glob(path, &def.options.file_glob) {
            debug!(?path, glob = %def.options.file_glob, "event file does not match glob");
            return Ok(());
        }
        if workflow::matches_ignore(path, &def.options.ignore) {
            debug!(?path, "event file matches ignore pattern");
            return Ok(());
        }

        info!(?path, workflow = %wf.name, "processing file change");
        self.scanner.process_file(workflow_id, &def, path).await?;
        Ok(())
    }
}
