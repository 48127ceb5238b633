// src/sched/executor.rs

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::LogHub;
use crate::store::{StepStatus, Store, Task, TaskStatus, TaskStep};
use crate::workflow::{self, PluginStep, Step, StepKind, Variables, WorkflowDef};

/// One worker from the pool.
///
/// Carries a claimed task from `pending` to a terminal state: parses the
/// workflow, runs each step as a shell subprocess with captured stdio, and
/// persists every state transition. All log lines go to the task's scratch
/// file and, synchronously, to the log hub.
pub struct Executor {
    id: usize,
    store: Arc<Store>,
    hub: Arc<LogHub>,
    log_dir: PathBuf,
    task_timeout: Duration,
    step_timeout: Duration,
    busy: AtomicBool,
    current_task: Mutex<Option<String>>,
}

/// What a finished step tells the task loop to do next.
enum StepControl {
    Continue,
    /// Exit code 100: stop the workflow, task completes.
    StopSuccess,
    /// Exit code 101: stop the workflow, task fails.
    StopFailure,
    /// Regular step failure (non-zero exit, missing plugin, ...).
    Failed,
    StepTimedOut {
        name: String,
        secs: u64,
    },
    TaskTimedOut,
    Cancelled,
}

/// How the task loop ended.
enum TaskEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// How a subprocess wait ended.
enum ProcessEnd {
    Exited(std::process::Output),
    StepTimeout,
    TaskTimeout,
    Cancelled,
}

impl Executor {
    pub(crate) fn new(
        id: usize,
        store: Arc<Store>,
        hub: Arc<LogHub>,
        log_dir: PathBuf,
        task_timeout: Duration,
        step_timeout: Duration,
    ) -> Self {
        Self {
            id,
            store,
            hub,
            log_dir,
            task_timeout,
            step_timeout,
            busy: AtomicBool::new(false),
            current_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn current_task(&self) -> Option<String> {
        self.current_task.lock().clone()
    }

    /// Execute one task to a terminal state.
    ///
    /// Accepts only `pending` rows; anything else means another executor or
    /// a direct cancellation got there first, and the call is a silent
    /// no-op.
    pub async fn execute_task(&self, task_id: &str, cancel: CancellationToken) -> Result<()> {
        self.busy.store(true, Ordering::SeqCst);
        *self.current_task.lock() = Some(task_id.to_string());

        let result = self.execute_task_inner(task_id, &cancel).await;

        self.busy.store(false, Ordering::SeqCst);
        self.current_task.lock().take();
        result
    }

    async fn execute_task_inner(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut task = self.store.tasks().get(task_id).context("loading task")?;
        if task.status != TaskStatus::Pending {
            debug!(
                executor = self.id,
                task = %task_id,
                status = %task.status,
                "task is not pending, skipping"
            );
            return Ok(());
        }

        let wf = self
            .store
            .workflows()
            .get(&task.workflow_id)
            .context("loading workflow")?;

        // The definition is re-parsed at execution start; a workflow edited
        // into a non-parsing state fails the task here.
        let def = match workflow::parse(&wf.yaml_source) {
            Ok(def) => def,
            Err(err) => {
                return self.fail_before_steps(&mut task, format!("failed to parse workflow: {err}"));
            }
        };

        let output_path = PathBuf::from(&task.output_path);
        if let Some(parent) = output_path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return self.fail_before_steps(
                    &mut task,
                    format!("failed to create output directory: {err}"),
                );
            }
        }

        if let Err(err) = fs::create_dir_all(&self.log_dir) {
            return self
                .fail_before_steps(&mut task, format!("failed to create log directory: {err}"));
        }
        let log_path = self.log_dir.join(format!("{}.log", task.id));
        let log_file = match fs::File::create(&log_path) {
            Ok(file) => file,
            Err(err) => {
                return self
                    .fail_before_steps(&mut task, format!("failed to create log file: {err}"));
            }
        };
        let mut log = TaskLog {
            writer: BufWriter::new(log_file),
            hub: Arc::clone(&self.hub),
            task_id: task.id.clone(),
        };

        let started_at = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(started_at);
        self.store
            .tasks()
            .update(&task)
            .context("marking task running")?;

        log.line(format!("[Executor-{}] Task started", self.id));
        log.line(format!("Input: {}", task.input_path));
        log.line(format!("Output: {}", task.output_path));
        log.line(format!("Workflow: {}", wf.name));
        if !def.env.is_empty() {
            log.line("Environment variables:");
            for (key, value) in &def.env {
                log.line(format!("  {key}={value}"));
            }
        }

        let vars = Variables::for_paths(std::path::Path::new(&task.input_path), &output_path);
        let deadline = Instant::now() + self.task_timeout;

        let mut end = TaskEnd::Completed;
        for (i, step) in def.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                log.line("Task cancelled");
                end = TaskEnd::Cancelled;
                break;
            }

            log.line(format!("--- Step {}: {} ---", i + 1, step.name));

            let control = match &step.kind {
                StepKind::Run { command } => {
                    self.run_command_step(&task, step, command, &def, &vars, deadline, cancel, &mut log)
                        .await
                }
                StepKind::Uses { reference, with } => {
                    self.run_plugin_step(&task, step, reference, with, &def, &vars, deadline, cancel, &mut log)
                        .await
                }
            };

            let control = match control {
                Ok(control) => control,
                Err(err) => {
                    log.line(format!("ERROR: {err:#}"));
                    StepControl::Failed
                }
            };

            match control {
                StepControl::Continue => {}
                StepControl::StopSuccess => break,
                StepControl::StopFailure => {
                    end = TaskEnd::Failed("Workflow stopped with failure".to_string());
                    break;
                }
                StepControl::Failed => {
                    end = TaskEnd::Failed("One or more steps failed".to_string());
                    break;
                }
                StepControl::StepTimedOut { name, secs } => {
                    end = TaskEnd::Failed(format!("step '{name}' timed out after {secs}s"));
                    break;
                }
                StepControl::TaskTimedOut => {
                    end = TaskEnd::Failed(format!(
                        "task timed out after {}s",
                        self.task_timeout.as_secs()
                    ));
                    break;
                }
                StepControl::Cancelled => {
                    end = TaskEnd::Cancelled;
                    break;
                }
            }
        }

        let completed_at = Utc::now();
        task.completed_at = Some(completed_at);
        match end {
            TaskEnd::Completed => {
                task.status = TaskStatus::Completed;
                task.error_message.clear();
                log.line(format!("[Executor-{}] Task completed successfully", self.id));
            }
            TaskEnd::Failed(message) => {
                task.status = TaskStatus::Failed;
                task.error_message = message;
                log.line(format!("[Executor-{}] Task failed", self.id));
            }
            TaskEnd::Cancelled => {
                task.status = TaskStatus::Cancelled;
                task.error_message = "Task cancelled".to_string();
                log.line(format!("[Executor-{}] Task cancelled", self.id));
            }
        }
        log.line(format!(
            "Total execution time: {} ms",
            (completed_at - started_at).num_milliseconds()
        ));

        if let Err(err) = log.flush() {
            warn!(task = %task.id, error = %err, "failed to flush task log");
        }
        drop(log);

        // Collapse the scratch log into the row, then remove the file.
        match fs::read_to_string(&log_path) {
            Ok(content) => task.log_text = content,
            Err(err) => {
                warn!(task = %task.id, error = %err, "failed to read task log file");
            }
        }
        self.store
            .tasks()
            .update(&task)
            .context("persisting terminal task state")?;

        self.hub.broadcast_task_complete(&task.id);

        if let Err(err) = fs::remove_file(&log_path) {
            warn!(task = %task.id, error = %err, "failed to remove task log file");
        }

        info!(
            executor = self.id,
            task = %task.id,
            status = %task.status,
            "task finished"
        );
        Ok(())
    }

    /// Fail a task before any step ran (parse error, output dir, log file).
    ///
    /// The row still passes through `running` so its lifecycle keeps the
    /// usual shape: started-at set, then terminal with completed-at.
    fn fail_before_steps(&self, task: &mut Task, message: String) -> Result<()> {
        warn!(executor = self.id, task = %task.id, %message, "task failed before steps");

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.store.tasks().update(task).context("marking task running")?;

        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.log_text = format!(
            "[{}] ERROR: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message
        );
        task.error_message = message;
        self.store
            .tasks()
            .update(task)
            .context("persisting terminal task state")?;

        self.hub.broadcast_task_complete(&task.id);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command_step(
        &self,
        task: &Task,
        step: &Step,
        command: &str,
        def: &WorkflowDef,
        vars: &Variables,
        deadline: Instant,
        cancel: &CancellationToken,
        log: &mut TaskLog,
    ) -> Result<StepControl> {
        let mut row = self
            .store
            .task_steps()
            .create(&task.id, &step.name, command)?;

        let command = workflow::substitute(command, vars);
        log.line(format!("Command: {command}"));

        // Workflow env first, step env wins on conflict; all values
        // variable-substituted.
        let mut env = BTreeMap::new();
        for (key, value) in &def.env {
            env.insert(key.clone(), workflow::substitute(value, vars));
        }
        for (key, value) in &step.env {
            env.insert(key.clone(), workflow::substitute(value, vars));
        }
        if !step.env.is_empty() {
            log.line("Step environment variables:");
            for (key, value) in &step.env {
                log.line(format!("  {}={}", key, workflow::substitute(value, vars)));
            }
        }

        row.command = command.clone();
        row.status = StepStatus::Running;
        row.started_at = Some(Utc::now());
        self.store.task_steps().update(&row)?;

        log.line("Executing command...");
        let ended = run_shell(&command, &env, self.step_timeout, deadline, cancel).await?;
        self.finish_step(row, ended, self.step_timeout, log)
    }

    /// Expand a `uses:` step: resolve the plugin version, validate its
    /// dependencies, prepare inputs, and run each plugin step in order.
    #[allow(clippy::too_many_arguments)]
    async fn run_plugin_step(
        &self,
        task: &Task,
        step: &Step,
        reference: &str,
        with: &BTreeMap<String, String>,
        def: &WorkflowDef,
        vars: &Variables,
        deadline: Instant,
        cancel: &CancellationToken,
        log: &mut TaskLog,
    ) -> Result<StepControl> {
        log.line(format!("Plugin: {reference}"));

        let (plugin_name, requested_version) = match workflow::parse_plugin_reference(reference) {
            Ok(parsed) => parsed,
            Err(err) => {
                log.line(format!("ERROR: {err}"));
                return Ok(StepControl::Failed);
            }
        };

        let version_row = match &requested_version {
            Some(version) => self.store.plugins().get_version(&plugin_name, version)?,
            None => match self.store.plugins().get_by_name(&plugin_name)? {
                Some(plugin) => Some(self.store.plugins().get_active_version(&plugin.id)?),
                None => None,
            },
        };
        let Some(version_row) = version_row else {
            log.line(format!(
                "ERROR: plugin '{}' (version: {}) not found",
                plugin_name,
                requested_version.as_deref().unwrap_or("active")
            ));
            return Ok(StepControl::Failed);
        };

        let plugin = match workflow::parse_plugin(&version_row.yaml_source) {
            Ok(plugin) => plugin,
            Err(err) => {
                log.line(format!("ERROR: failed to parse plugin: {err}"));
                return Ok(StepControl::Failed);
            }
        };
        log.line(format!("Plugin loaded: {} v{}", plugin.name, plugin.version));
        if !plugin.description.is_empty() {
            log.line(format!("Description: {}", plugin.description));
        }

        if !plugin.dependencies.is_empty() {
            log.line("Checking dependencies...");
            if let Err(err) = workflow::validate_dependencies(&plugin.dependencies) {
                log.line(format!("ERROR: dependency check failed: {err}"));
                return Ok(StepControl::Failed);
            }
            log.line("All dependencies satisfied");
        }

        let inputs = match workflow::prepare_inputs(&plugin, with) {
            Ok(inputs) => inputs,
            Err(err) => {
                log.line(format!("ERROR: failed to prepare inputs: {err}"));
                return Ok(StepControl::Failed);
            }
        };
        if !inputs.is_empty() {
            log.line("Plugin inputs:");
            for (key, value) in &inputs {
                log.line(format!("  {key}: {value}"));
            }
        }

        for (i, plugin_step) in plugin.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(StepControl::Cancelled);
            }

            log.line(format!("  Plugin Step {}: {}", i + 1, plugin_step.name));

            if let Some(condition) = &plugin_step.condition {
                let should_run = workflow::evaluate_condition(condition, &inputs, vars);
                log.line(format!("  Condition: {condition} = {should_run}"));
                if !should_run {
                    log.line("  Skipping step (condition not met)");
                    continue;
                }
            }

            let control = self
                .run_one_plugin_step(task, step, &plugin, plugin_step, def, &inputs, vars, deadline, cancel, log)
                .await?;
            match control {
                StepControl::Continue => {}
                other => return Ok(other),
            }
        }

        log.line(format!("Plugin '{}' completed successfully", plugin.name));
        Ok(StepControl::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one_plugin_step(
        &self,
        task: &Task,
        step: &Step,
        plugin: &workflow::PluginDef,
        plugin_step: &PluginStep,
        def: &WorkflowDef,
        inputs: &BTreeMap<String, String>,
        vars: &Variables,
        deadline: Instant,
        cancel: &CancellationToken,
        log: &mut TaskLog,
    ) -> Result<StepControl> {
        let row_name = format!("{} / {}", step.name, plugin_step.name);
        let mut row = self
            .store
            .task_steps()
            .create(&task.id, &row_name, &plugin_step.run)?;

        // Input substitution first, then workflow variables.
        let mut command = workflow::substitute_inputs(&plugin_step.run, inputs);
        command = workflow::substitute(&command, vars);
        log.line(format!("  Command: {command}"));

        row.command = command.clone();
        row.status = StepStatus::Running;
        row.started_at = Some(Utc::now());
        self.store.task_steps().update(&row)?;

        // Plugin steps may carry their own timeout, in seconds.
        let step_timeout = plugin_step
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.step_timeout);

        let merged = workflow::merge_environment(&def.env, &plugin.env, &plugin_step.env);
        let mut env = BTreeMap::new();
        for (key, value) in merged {
            let value = workflow::substitute(&value, vars);
            let value = workflow::substitute_inputs(&value, inputs);
            env.insert(key, value);
        }

        log.line("  Executing command...");
        let ended = run_shell(&command, &env, step_timeout, deadline, cancel).await?;
        self.finish_step(row, ended, step_timeout, log)
    }

    /// Record a finished subprocess on its step row and map the exit code
    /// to workflow control.
    fn finish_step(
        &self,
        mut row: TaskStep,
        ended: ProcessEnd,
        step_timeout: Duration,
        log: &mut TaskLog,
    ) -> Result<StepControl> {
        row.completed_at = Some(Utc::now());

        let control = match ended {
            ProcessEnd::Exited(output) => {
                let code = output.status.code().unwrap_or(-1);
                row.exit_code = Some(code);
                row.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                row.stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if !row.stdout.is_empty() {
                    log.line(format!("STDOUT:\n{}", row.stdout));
                }
                if !row.stderr.is_empty() {
                    log.line(format!("STDERR:\n{}", row.stderr));
                }
                log.line(format!("Exit code: {code}"));

                match code {
                    0 => {
                        row.status = StepStatus::Completed;
                        StepControl::Continue
                    }
                    100 => {
                        row.status = StepStatus::Completed;
                        log.line("Workflow stopped with success (exit code 100)");
                        StepControl::StopSuccess
                    }
                    101 => {
                        row.status = StepStatus::Failed;
                        log.line("Workflow stopped with failure (exit code 101)");
                        StepControl::StopFailure
                    }
                    _ => {
                        row.status = StepStatus::Failed;
                        log.line(format!("ERROR: step '{}' exited with code {code}", row.name));
                        StepControl::Failed
                    }
                }
            }
            ProcessEnd::StepTimeout => {
                row.status = StepStatus::Failed;
                row.stderr = format!("step timed out after {}s", step_timeout.as_secs());
                log.line(format!(
                    "ERROR: step '{}' timed out after {}s",
                    row.name,
                    step_timeout.as_secs()
                ));
                StepControl::StepTimedOut {
                    name: row.name.clone(),
                    secs: step_timeout.as_secs(),
                }
            }
            ProcessEnd::TaskTimeout => {
                row.status = StepStatus::Failed;
                row.stderr = "task timeout reached".to_string();
                log.line(format!(
                    "ERROR: task timeout reached during step '{}'",
                    row.name
                ));
                StepControl::TaskTimedOut
            }
            ProcessEnd::Cancelled => {
                row.status = StepStatus::Failed;
                row.stderr = "cancelled".to_string();
                log.line(format!("Step '{}' terminated by cancellation", row.name));
                StepControl::Cancelled
            }
        };

        self.store.task_steps().update(&row)?;
        Ok(control)
    }
}

/// Run a command through the system shell, racing the wait against the
/// step timeout, the task deadline and cancellation.
///
/// The child inherits the process environment plus `env`. Losing the wait
/// future kills the subprocess (`kill_on_drop`); it is never left behind.
async fn run_shell(
    command: &str,
    env: &BTreeMap<String, String>,
    step_timeout: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ProcessEnd> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("spawning process for command '{command}'"))?;

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    tokio::select! {
        output = &mut wait => Ok(ProcessEnd::Exited(
            output.with_context(|| format!("waiting for command '{command}'"))?,
        )),
        _ = time::sleep(step_timeout) => Ok(ProcessEnd::StepTimeout),
        _ = time::sleep_until(deadline) => Ok(ProcessEnd::TaskTimeout),
        _ = cancel.cancelled() => Ok(ProcessEnd::Cancelled),
    }
}

/// Timestamped scratch-log writer that mirrors every line to the hub.
struct TaskLog {
    writer: BufWriter<fs::File>,
    hub: Arc<LogHub>,
    task_id: String,
}

impl TaskLog {
    fn line(&mut self, message: impl AsRef<str>) {
        let stamped = format!(
            "[{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message.as_ref()
        );
        if let Err(err) = self.writer.write_all(stamped.as_bytes()) {
            warn!(task = %self.task_id, error = %err, "failed to write task log line");
        }
        self.hub.broadcast_log(&self.task_id, &stamped);
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}
