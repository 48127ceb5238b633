// src/scanner/scan.rs

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blake3::Hasher;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::store::Store;
use crate::store::TaskStatus;
use crate::workflow::{self, WorkflowDef};

/// Interval between pending-count re-checks while backpressure blocks.
const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Aggregated result of one scan pass.
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub files_scanned: usize,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_skipped: usize,
    pub tasks_created: usize,
    pub errors: Vec<String>,
}

/// What happened to a single file on its way through the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ProcessOutcome {
    pub new: bool,
    pub changed: bool,
    pub skipped: bool,
    pub task_created: bool,
}

/// Walks trigger paths, indexes files by content digest, and emits tasks.
pub struct Scanner {
    store: Arc<Store>,
    /// Per-workflow cap on pending tasks; `0` disables backpressure.
    max_pending_tasks: usize,
    stop: CancellationToken,
}

impl Scanner {
    pub fn new(store: Arc<Store>, max_pending_tasks: usize, stop: CancellationToken) -> Self {
        Self {
            store,
            max_pending_tasks,
            stop,
        }
    }

    /// Scan all trigger paths of a workflow.
    ///
    /// Per-file errors are aggregated into the summary rather than aborting
    /// the pass.
    pub async fn scan_workflow(&self, workflow_id: &str) -> Result<ScanSummary> {
        let wf = self
            .store
            .workflows()
            .get(workflow_id)
            .context("loading workflow for scan")?;
        let def = workflow::parse(&wf.yaml_source)
            .with_context(|| format!("parsing workflow '{}'", wf.name))?;

        let mut summary = ScanSummary::default();
        for scan_path in &def.paths {
            self.scan_path(workflow_id, &def, scan_path, &mut summary)
                .await;
        }

        info!(
            workflow = %wf.name,
            scanned = summary.files_scanned,
            new = summary.files_new,
            changed = summary.files_changed,
            skipped = summary.files_skipped,
            tasks = summary.tasks_created,
            "scan completed"
        );
        Ok(summary)
    }

    async fn scan_path(
        &self,
        workflow_id: &str,
        def: &WorkflowDef,
        scan_path: &str,
        summary: &mut ScanSummary,
    ) {
        let root = PathBuf::from(scan_path);
        let root = root.canonicalize().unwrap_or(root); // best-effort

        if !root.exists() {
            summary.errors.push(format!("path not found: {root:?}"));
            return;
        }

        let max_depth = if def.options.include_subdirs {
            usize::MAX
        } else {
            1
        };

        for entry in WalkDir::new(&root).max_depth(max_depth) {
            if self.stop.is_cancelled() {
                return;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    summary.errors.push(format!("walk error under {root:?}: {err}"));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if !workflow::matches_file_glob(path, &def.options.file_glob) {
                continue;
            }
            if workflow::matches_ignore(path, &def.options.ignore) {
                debug!(?path, "file matches ignore pattern, skipping");
                continue;
            }

            summary.files_scanned += 1;
            match self.process_file(workflow_id, def, path).await {
                Ok(outcome) => {
                    summary.files_new += outcome.new as usize;
                    summary.files_changed += (outcome.changed && !outcome.new) as usize;
                    summary.files_skipped += outcome.skipped as usize;
                    summary.tasks_created += outcome.task_created as usize;
                }
                Err(err) => {
                    summary.errors.push(format!("scanning {path:?}: {err}"));
                }
            }
        }
    }

    /// Digest one file and apply the insert/update/emit rules.
    ///
    /// Shared between the initial scan and the incremental watcher so both
    /// sides behave identically.
    pub(crate) async fn process_file(
        &self,
        workflow_id: &str,
        def: &WorkflowDef,
        path: &Path,
    ) -> Result<ProcessOutcome> {
        let (digest, size) = digest_file(path)?;
        let path_str = path.to_string_lossy().into_owned();

        let existing = self
            .store
            .files()
            .get_by_workflow_and_path(workflow_id, &path_str)?;

        let mut outcome = ProcessOutcome::default();
        let file_id = match existing {
            None => {
                let record =
                    self.store
                        .files()
                        .create(workflow_id, &path_str, &digest, size as i64)?;
                outcome.new = true;
                outcome.changed = true;
                info!(path = %path_str, "new file detected");
                record.id
            }
            Some(mut record) => {
                if record.digest != digest {
                    record.digest = digest;
                    record.size_bytes = size as i64;
                    record.last_scanned_at = Utc::now();
                    self.store.files().update(&record)?;
                    outcome.changed = true;
                    info!(path = %path_str, "file changed");
                } else {
                    outcome.skipped = true;
                    if def.options.skip_on_nochange {
                        debug!(path = %path_str, "file unchanged, skipping");
                        return Ok(outcome);
                    }
                }
                record.id
            }
        };

        if outcome.changed || !def.options.skip_on_nochange {
            self.wait_for_task_slot(workflow_id).await;
            if self.stop.is_cancelled() {
                return Ok(outcome);
            }

            let output = workflow::output_path(
                path,
                &def.convert,
                def.options.output_dir_pattern.as_deref(),
            );
            let task = self.store.tasks().create(
                workflow_id,
                &file_id,
                &path_str,
                &output.to_string_lossy(),
            )?;
            outcome.task_created = true;
            info!(task = %task.id, input = %path_str, output = %task.output_path, "task created");
        }

        Ok(outcome)
    }

    /// Block until the workflow's pending-task count drops below the cap.
    ///
    /// Cooperative backpressure: bounds queue depth from fast scans feeding
    /// slow pipelines. Re-checks on a coarse interval and gives up on
    /// shutdown.
    async fn wait_for_task_slot(&self, workflow_id: &str) {
        if self.max_pending_tasks == 0 {
            return;
        }

        loop {
            if self.stop.is_cancelled() {
                return;
            }

            let pending = match self
                .store
                .tasks()
                .count(Some(workflow_id), Some(TaskStatus::Pending))
            {
                Ok(count) => count,
                Err(err) => {
                    warn!(workflow = %workflow_id, error = %err, "failed to count pending tasks");
                    tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL).await;
                    continue;
                }
            };

            if (pending as usize) < self.max_pending_tasks {
                return;
            }

            info!(
                workflow = %workflow_id,
                pending,
                limit = self.max_pending_tasks,
                "pending task limit reached, waiting"
            );
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL) => {}
            }
        }
    }
}

/// Compute the content digest and size of a file.
///
/// Streams the file through the hasher in fixed-size chunks; the digest is
/// the lowercase hex form.
pub fn digest_file(path: &Path) -> Result<(String, u64)> {
    let mut file =
        File::open(path).with_context(|| format!("opening file for digest: {path:?}"))?;

    let mut hasher = Hasher::new();
    let mut buf = [0u8; 8192];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hasher.finalize().to_hex().to_string(), size))
}
