use std::error::Error;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use watchflow::scanner::{Scanner, Watcher};
use watchflow::store::Store;

type TestResult = Result<(), Box<dyn Error>>;

fn workflow_yaml(dir: &std::path::Path) -> String {
    format!(
        "name: w1\non:\n  paths: [\"{}\"]\nconvert: {{ from: txt, to: out }}\nsteps:\n  - name: s\n    run: \"true\"\noptions:\n  file_glob: \"*.txt\"\n",
        dir.display()
    )
}

async fn wait_for_task_count(
    store: &Arc<Store>,
    workflow_id: &str,
    expected: i64,
    timeout: Duration,
) -> TestResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let count = store.tasks().count(Some(workflow_id), None)?;
        if count >= expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("expected {expected} tasks, have {count}").into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn file_events_produce_tasks_after_the_debounce() -> TestResult {
    let tmp = tempdir()?;
    let store = Arc::new(Store::open_in_memory()?);
    let wf = store
        .workflows()
        .create("w1", "", &workflow_yaml(tmp.path()), true)?;

    let stop = CancellationToken::new();
    let scanner = Arc::new(Scanner::new(Arc::clone(&store), 50, stop.clone()));
    let watcher = Watcher::new(Arc::clone(&store), scanner, stop.clone())?;

    watcher.enable_workflow(&wf.id).await?;
    assert_eq!(watcher.watched_workflows(), vec![wf.id.clone()]);

    // A file written after the watch is armed flows through debounce,
    // digest and task emission.
    fs::write(tmp.path().join("fresh.txt"), "fresh")?;
    wait_for_task_count(&store, &wf.id, 1, Duration::from_secs(5)).await?;

    let tasks = store.tasks().list(Some(&wf.id), None, 10, 0)?;
    assert!(tasks[0].input_path.ends_with("fresh.txt"));
    assert!(tasks[0].output_path.ends_with("fresh.out"));

    stop.cancel();
    watcher.stop();
    Ok(())
}

#[tokio::test]
async fn repeated_writes_within_the_window_collapse_to_one_task() -> TestResult {
    let tmp = tempdir()?;
    let store = Arc::new(Store::open_in_memory()?);
    let wf = store
        .workflows()
        .create("w1", "", &workflow_yaml(tmp.path()), true)?;

    let stop = CancellationToken::new();
    let scanner = Arc::new(Scanner::new(Arc::clone(&store), 50, stop.clone()));
    let watcher = Watcher::new(Arc::clone(&store), scanner, stop.clone())?;
    watcher.enable_workflow(&wf.id).await?;

    // Burst of writes to the same path; the last event wins.
    let path = tmp.path().join("burst.txt");
    for i in 0..5 {
        fs::write(&path, format!("content {i}"))?;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    wait_for_task_count(&store, &wf.id, 1, Duration::from_secs(5)).await?;
    // Allow any stray debounce timers to fire before counting.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(store.tasks().count(Some(&wf.id), None)?, 1);

    stop.cancel();
    watcher.stop();
    Ok(())
}

#[tokio::test]
async fn enable_then_disable_leaves_no_watches_or_timers() -> TestResult {
    let tmp = tempdir()?;
    let store = Arc::new(Store::open_in_memory()?);
    let wf = store
        .workflows()
        .create("w1", "", &workflow_yaml(tmp.path()), true)?;

    let stop = CancellationToken::new();
    let scanner = Arc::new(Scanner::new(Arc::clone(&store), 50, stop.clone()));
    let watcher = Watcher::new(Arc::clone(&store), scanner, stop.clone())?;

    watcher.enable_workflow(&wf.id).await?;
    // Enabling twice is idempotent.
    watcher.enable_workflow(&wf.id).await?;
    assert_eq!(watcher.watched_workflows().len(), 1);

    watcher.disable_workflow(&wf.id);
    assert!(watcher.watched_workflows().is_empty());
    assert_eq!(watcher.pending_debounces(), 0);

    // Disabling again is also idempotent, and task rows are untouched.
    watcher.disable_workflow(&wf.id);

    stop.cancel();
    Ok(())
}

#[tokio::test]
async fn clear_index_rescans_from_scratch() -> TestResult {
    let tmp = tempdir()?;
    fs::write(tmp.path().join("a.txt"), "alpha")?;

    let store = Arc::new(Store::open_in_memory()?);
    let wf = store
        .workflows()
        .create("w1", "", &workflow_yaml(tmp.path()), true)?;

    let stop = CancellationToken::new();
    let scanner = Arc::new(Scanner::new(Arc::clone(&store), 50, stop.clone()));
    let watcher = Watcher::new(Arc::clone(&store), scanner, stop.clone())?;

    let first = watcher.scan_workflow(&wf.id).await?;
    assert_eq!(first.tasks_created, 1);

    // Clearing drops the index and the task history, then re-emits.
    let summary = watcher.clear_index(&wf.id).await?;
    assert_eq!(summary.files_new, 1);
    assert_eq!(summary.tasks_created, 1);
    assert_eq!(store.tasks().count(Some(&wf.id), None)?, 1);

    stop.cancel();
    Ok(())
}
