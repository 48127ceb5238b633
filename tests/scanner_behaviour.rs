use std::error::Error;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use watchflow::scanner::Scanner;
use watchflow::store::{Store, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

fn scanner(store: &Arc<Store>) -> Scanner {
    Scanner::new(Arc::clone(store), 50, CancellationToken::new())
}

fn workflow_yaml(dir: &std::path::Path, options: &str) -> String {
    format!(
        "name: w1\non:\n  paths: [\"{}\"]\nconvert: {{ from: txt, to: out }}\nsteps:\n  - name: s\n    run: \"true\"\noptions:\n{}",
        dir.display(),
        options
    )
}

#[tokio::test]
async fn rescanning_unchanged_files_creates_no_new_tasks() -> TestResult {
    let tmp = tempdir()?;
    fs::write(tmp.path().join("a.txt"), "alpha")?;
    fs::write(tmp.path().join("b.txt"), "beta")?;

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n");
    let wf = store.workflows().create("w1", "", &yaml, true)?;
    let scanner = scanner(&store);

    let first = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(first.files_scanned, 2);
    assert_eq!(first.files_new, 2);
    assert_eq!(first.tasks_created, 2);

    let second = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(second.files_scanned, 2);
    assert_eq!(second.files_new, 0);
    assert_eq!(second.files_changed, 0);
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.tasks_created, 0);

    assert_eq!(store.tasks().count(Some(&wf.id), None)?, 2);
    Ok(())
}

#[tokio::test]
async fn changed_content_triggers_a_new_task() -> TestResult {
    let tmp = tempdir()?;
    let file = tmp.path().join("a.txt");
    fs::write(&file, "alpha")?;

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n");
    let wf = store.workflows().create("w1", "", &yaml, true)?;
    let scanner = scanner(&store);

    scanner.scan_workflow(&wf.id).await?;
    fs::write(&file, "ALPHA")?;

    let rescan = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(rescan.files_changed, 1);
    assert_eq!(rescan.tasks_created, 1);
    assert_eq!(store.tasks().count(Some(&wf.id), None)?, 2);

    // Still exactly one file row for the (workflow, path) pair.
    let record = store
        .files()
        .get_by_workflow_and_path(&wf.id, &file.canonicalize()?.to_string_lossy())?;
    assert!(record.is_some());
    Ok(())
}

#[tokio::test]
async fn skip_on_nochange_false_reemits_tasks() -> TestResult {
    let tmp = tempdir()?;
    fs::write(tmp.path().join("a.txt"), "alpha")?;

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n  skip_on_nochange: false\n");
    let wf = store.workflows().create("w1", "", &yaml, true)?;
    let scanner = scanner(&store);

    scanner.scan_workflow(&wf.id).await?;
    let second = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(second.tasks_created, 1);
    assert_eq!(store.tasks().count(Some(&wf.id), None)?, 2);
    Ok(())
}

#[tokio::test]
async fn glob_and_ignore_filter_the_walk() -> TestResult {
    let tmp = tempdir()?;
    fs::write(tmp.path().join("a.txt"), "keep")?;
    fs::write(tmp.path().join("b.tmp"), "ignored by pattern")?;
    fs::write(tmp.path().join("c.log"), "ignored by glob")?;
    fs::create_dir_all(tmp.path().join(".git"))?;
    fs::write(tmp.path().join(".git").join("d.txt"), "ignored by segment")?;

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = workflow_yaml(
        tmp.path(),
        "  file_glob: \"*.txt,*.tmp\"\n  include_subdirs: true\n  ignore: [\"*.tmp\", \".git\"]\n",
    );
    let wf = store.workflows().create("w1", "", &yaml, true)?;
    let scanner = scanner(&store);

    let summary = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(summary.files_scanned, 1);
    assert_eq!(summary.tasks_created, 1);

    let tasks = store.tasks().list(Some(&wf.id), None, 10, 0)?;
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].input_path.ends_with("a.txt"));
    Ok(())
}

#[tokio::test]
async fn subdirectories_need_include_subdirs() -> TestResult {
    let tmp = tempdir()?;
    fs::write(tmp.path().join("top.txt"), "top")?;
    fs::create_dir_all(tmp.path().join("nested"))?;
    fs::write(tmp.path().join("nested").join("deep.txt"), "deep")?;

    let store = Arc::new(Store::open_in_memory()?);
    let scanner = scanner(&store);

    let shallow = store.workflows().create(
        "shallow",
        "",
        &workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n"),
        true,
    )?;
    let summary = scanner.scan_workflow(&shallow.id).await?;
    assert_eq!(summary.files_scanned, 1);

    let deep = store.workflows().create(
        "deep",
        "",
        &workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n  include_subdirs: true\n"),
        true,
    )?;
    let summary = scanner.scan_workflow(&deep.id).await?;
    assert_eq!(summary.files_scanned, 2);
    Ok(())
}

#[tokio::test]
async fn backpressure_bounds_pending_tasks_per_workflow() -> TestResult {
    let tmp = tempdir()?;
    for i in 0..6 {
        fs::write(tmp.path().join(format!("f{i}.txt")), format!("file {i}"))?;
    }

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = workflow_yaml(tmp.path(), "  file_glob: \"*.txt\"\n");
    let wf = store.workflows().create("w1", "", &yaml, true)?;

    let stop = CancellationToken::new();
    let scanner = Scanner::new(Arc::clone(&store), 3, stop.clone());

    let wf_id = wf.id.clone();
    let scan = tokio::spawn(async move { scanner.scan_workflow(&wf_id).await });

    // The scan must stall at the cap instead of racing ahead.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.tasks().count(Some(&wf.id), Some(TaskStatus::Pending))?, 3);

    // Nothing drains tasks in this test; release the scanner via shutdown.
    stop.cancel();
    let summary = scan.await??;
    assert_eq!(summary.tasks_created, 3);
    Ok(())
}

#[tokio::test]
async fn scan_errors_are_aggregated_not_fatal() -> TestResult {
    let tmp = tempdir()?;
    let missing = tmp.path().join("nope");

    let store = Arc::new(Store::open_in_memory()?);
    let yaml = format!(
        "name: w1\non:\n  paths: [\"{}\", \"{}\"]\nsteps:\n  - name: s\n    run: \"true\"\n",
        missing.display(),
        tmp.path().display()
    );
    fs::write(tmp.path().join("a.txt"), "here")?;
    let wf = store.workflows().create("w1", "", &yaml, true)?;
    let scanner = scanner(&store);

    let summary = scanner.scan_workflow(&wf.id).await?;
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.tasks_created, 1);
    Ok(())
}
