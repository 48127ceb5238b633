use std::error::Error;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use watchflow::config::Config;
use watchflow::engine::Engine;
use watchflow::store::{Store, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

fn engine_config(root: &std::path::Path) -> Config {
    Config {
        database_path: root.join("data").join("engine.db").to_string_lossy().into_owned(),
        log_dir: root.join("logs").to_string_lossy().into_owned(),
        concurrency: 2,
        task_timeout_secs: 60,
        step_timeout_secs: 60,
        scan_interval_secs: 1,
        max_pending_tasks: 50,
    }
}

fn copy_workflow_yaml(dir: &std::path::Path) -> String {
    format!(
        "name: copy\non:\n  paths: [\"{}\"]\nconvert: {{ from: txt, to: out }}\nsteps:\n  - name: copy\n    run: \"cp '${{{{ input_path }}}}' '${{{{ output_path }}}}'\"\noptions:\n  file_glob: \"*.txt\"\n",
        dir.display()
    )
}

async fn wait_for_completed(
    store: &Arc<Store>,
    workflow_id: &str,
    expected: i64,
) -> TestResult {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let done = store
            .tasks()
            .count(Some(workflow_id), Some(TaskStatus::Completed))?;
        if done >= expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("expected {expected} completed tasks, have {done}").into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn engine_runs_the_whole_pipeline_from_scan_to_output() -> TestResult {
    let tmp = tempdir()?;
    let watch_dir = tmp.path().join("in");
    fs::create_dir_all(&watch_dir)?;
    fs::write(watch_dir.join("a.txt"), "hello")?;

    let cfg = engine_config(tmp.path());

    // Seed the workflow before the engine starts, the way external CRUD
    // rows exist across restarts.
    {
        let db_path = std::path::PathBuf::from(&cfg.database_path);
        fs::create_dir_all(db_path.parent().expect("db path has a parent"))?;
        let store = Store::open(&db_path)?;
        store
            .workflows()
            .create("copy", "", &copy_workflow_yaml(&watch_dir), true)?;
    }

    let engine = Engine::start(&cfg).await?;
    let wf = engine
        .store()
        .workflows()
        .get_by_name("copy")?
        .expect("workflow row");

    // The startup scan found the file and the scheduler ran the task.
    wait_for_completed(engine.store(), &wf.id, 1).await?;
    assert_eq!(fs::read_to_string(watch_dir.join("a.out"))?, "hello");

    // A file dropped while the engine runs flows through the watcher.
    fs::write(watch_dir.join("b.txt"), "more")?;
    wait_for_completed(engine.store(), &wf.id, 2).await?;
    assert_eq!(fs::read_to_string(watch_dir.join("b.out"))?, "more");

    let stats = engine.pool_stats();
    assert_eq!(stats.total, 2);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn engine_restart_reconciles_interrupted_tasks() -> TestResult {
    let tmp = tempdir()?;
    let watch_dir = tmp.path().join("in");
    fs::create_dir_all(&watch_dir)?;
    fs::write(watch_dir.join("a.txt"), "hello")?;

    let cfg = engine_config(tmp.path());
    let db_path = std::path::PathBuf::from(&cfg.database_path);
    fs::create_dir_all(db_path.parent().expect("db path has a parent"))?;

    // Simulate the previous process dying mid-task.
    {
        let store = Store::open(&db_path)?;
        let wf = store
            .workflows()
            .create("copy", "", &copy_workflow_yaml(&watch_dir), true)?;
        let task = store.tasks().create(
            &wf.id,
            "file-1",
            &watch_dir.join("a.txt").to_string_lossy(),
            &watch_dir.join("a.out").to_string_lossy(),
        )?;
        store.tasks().update_status(&task.id, TaskStatus::Running)?;
    }

    let engine = Engine::start(&cfg).await?;
    let wf = engine
        .store()
        .workflows()
        .get_by_name("copy")?
        .expect("workflow row");

    // Reconciliation turned running back into pending and the scheduler
    // then completed it.
    wait_for_completed(engine.store(), &wf.id, 1).await?;
    assert_eq!(
        engine
            .store()
            .tasks()
            .count(Some(&wf.id), Some(TaskStatus::Running))?,
        0
    );

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn engine_retry_reruns_a_failed_task() -> TestResult {
    let tmp = tempdir()?;
    let watch_dir = tmp.path().join("in");
    fs::create_dir_all(&watch_dir)?;
    fs::write(watch_dir.join("a.txt"), "hello")?;

    let cfg = engine_config(tmp.path());
    let db_path = std::path::PathBuf::from(&cfg.database_path);
    fs::create_dir_all(db_path.parent().expect("db path has a parent"))?;
    {
        let store = Store::open(&db_path)?;
        store
            .workflows()
            .create("copy", "", &copy_workflow_yaml(&watch_dir), true)?;
    }

    let engine = Engine::start(&cfg).await?;
    let wf = engine
        .store()
        .workflows()
        .get_by_name("copy")?
        .expect("workflow row");
    wait_for_completed(engine.store(), &wf.id, 1).await?;

    let tasks = engine.store().tasks().list(Some(&wf.id), None, 1, 0)?;
    let task = &tasks[0];

    // Completed tasks may not be retried; a failed one may.
    assert!(engine.retry_task(&task.id).is_err());
    engine
        .store()
        .tasks()
        .update_status(&task.id, TaskStatus::Failed)?;
    engine.retry_task(&task.id)?;

    wait_for_completed(engine.store(), &wf.id, 1).await?;
    engine.shutdown().await;
    Ok(())
}
