use std::error::Error;

use watchflow::store::{Store, TaskStatus};

type TestResult = Result<(), Box<dyn Error>>;

const WORKFLOW_YAML: &str = "name: w\non:\n  paths: [/tmp/in]\nsteps:\n  - name: s\n    run: \"true\"\n";

fn store_with_workflow() -> Result<(Store, String), Box<dyn Error>> {
    let store = Store::open_in_memory()?;
    let wf = store.workflows().create("w", "", WORKFLOW_YAML, true)?;
    Ok((store, wf.id))
}

#[test]
fn file_rows_are_unique_per_workflow_and_path() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    store.files().create(&wf_id, "/tmp/in/a.txt", "digest-1", 5)?;
    // Second insert for the same (workflow, path) violates the unique key.
    assert!(store.files().create(&wf_id, "/tmp/in/a.txt", "digest-2", 6).is_err());

    // Same path under another workflow is fine.
    let other = store.workflows().create("w2", "", WORKFLOW_YAML, true)?;
    store.files().create(&other.id, "/tmp/in/a.txt", "digest-1", 5)?;

    let found = store.files().get_by_workflow_and_path(&wf_id, "/tmp/in/a.txt")?;
    assert_eq!(found.map(|f| f.digest), Some("digest-1".to_string()));
    Ok(())
}

#[test]
fn file_update_changes_digest_in_place() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    let mut record = store.files().create(&wf_id, "/tmp/in/a.txt", "old", 5)?;
    record.digest = "new".to_string();
    record.size_bytes = 9;
    store.files().update(&record)?;

    let found = store
        .files()
        .get_by_workflow_and_path(&wf_id, "/tmp/in/a.txt")?
        .expect("file row should exist");
    assert_eq!(found.digest, "new");
    assert_eq!(found.size_bytes, 9);
    Ok(())
}

#[test]
fn pending_tasks_come_back_oldest_first() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    let first = store.tasks().create(&wf_id, "f1", "/tmp/in/a.txt", "/tmp/in/a.out")?;
    let second = store.tasks().create(&wf_id, "f2", "/tmp/in/b.txt", "/tmp/in/b.out")?;
    let third = store.tasks().create(&wf_id, "f3", "/tmp/in/c.txt", "/tmp/in/c.out")?;

    let pending = store.tasks().list_pending(10)?;
    let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str(), third.id.as_str()]);

    // The limit caps the claim batch.
    assert_eq!(store.tasks().list_pending(2)?.len(), 2);

    // A non-pending task disappears from the claim list.
    store.tasks().update_status(&first.id, TaskStatus::Running)?;
    let pending = store.tasks().list_pending(10)?;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, second.id);
    let _ = third;
    Ok(())
}

#[test]
fn counts_filter_by_workflow_and_status() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;
    let other = store.workflows().create("w2", "", WORKFLOW_YAML, true)?;

    store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;
    store.tasks().create(&wf_id, "f2", "/b", "/b.out")?;
    store.tasks().create(&other.id, "f3", "/c", "/c.out")?;

    assert_eq!(store.tasks().count(Some(&wf_id), Some(TaskStatus::Pending))?, 2);
    assert_eq!(store.tasks().count(Some(&other.id), Some(TaskStatus::Pending))?, 1);
    assert_eq!(store.tasks().count(None, Some(TaskStatus::Pending))?, 3);
    assert_eq!(store.tasks().count(None, Some(TaskStatus::Running))?, 0);
    Ok(())
}

#[test]
fn reset_running_tasks_leaves_no_running_rows() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    let t1 = store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;
    let t2 = store.tasks().create(&wf_id, "f2", "/b", "/b.out")?;
    let t3 = store.tasks().create(&wf_id, "f3", "/c", "/c.out")?;
    store.tasks().update_status(&t1.id, TaskStatus::Running)?;
    store.tasks().update_status(&t2.id, TaskStatus::Running)?;
    store.tasks().update_status(&t3.id, TaskStatus::Completed)?;

    let reset = store.tasks().reset_running_tasks()?;
    assert_eq!(reset, 2);
    assert_eq!(store.tasks().count(None, Some(TaskStatus::Running))?, 0);
    assert_eq!(store.tasks().count(None, Some(TaskStatus::Pending))?, 2);
    // Terminal rows are untouched.
    assert_eq!(store.tasks().get(&t3.id)?.status, TaskStatus::Completed);
    Ok(())
}

#[test]
fn retry_is_allowed_only_from_failed_or_cancelled() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    let task = store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;

    // Pending and completed tasks cannot be retried.
    assert!(store.tasks().retry(&task.id).is_err());
    store.tasks().update_status(&task.id, TaskStatus::Completed)?;
    assert!(store.tasks().retry(&task.id).is_err());

    // A failed task resets cleanly to pending.
    let mut failed = store.tasks().get(&task.id)?;
    failed.status = TaskStatus::Failed;
    failed.error_message = "boom".to_string();
    failed.log_text = "log".to_string();
    failed.started_at = Some(chrono::Utc::now());
    failed.completed_at = Some(chrono::Utc::now());
    store.tasks().update(&failed)?;

    store.tasks().retry(&task.id)?;
    let retried = store.tasks().get(&task.id)?;
    assert_eq!(retried.status, TaskStatus::Pending);
    assert!(retried.log_text.is_empty());
    assert!(retried.error_message.is_empty());
    assert!(retried.started_at.is_none());
    assert!(retried.completed_at.is_none());
    Ok(())
}

#[test]
fn clear_index_deletes_tasks_steps_and_files() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    store.files().create(&wf_id, "/tmp/in/a.txt", "d", 1)?;
    let task = store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;
    store.task_steps().create(&task.id, "s", "true")?;

    assert_eq!(store.tasks().delete_by_workflow(&wf_id)?, 1);
    assert_eq!(store.files().delete_by_workflow(&wf_id)?, 1);
    assert!(store.task_steps().list_by_task(&task.id)?.is_empty());
    assert_eq!(store.tasks().count(Some(&wf_id), None)?, 0);
    Ok(())
}

#[test]
fn workflow_delete_is_refused_while_tasks_run() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;

    let task = store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;
    store.tasks().update_status(&task.id, TaskStatus::Running)?;
    assert!(store.workflows().delete(&wf_id).is_err());

    store.tasks().update_status(&task.id, TaskStatus::Completed)?;
    store.workflows().delete(&wf_id)?;
    assert!(store.workflows().get(&wf_id).is_err());
    // The cascade removed the task too.
    assert!(store.tasks().get(&task.id).is_err());
    Ok(())
}

#[test]
fn task_steps_keep_execution_order() -> TestResult {
    let (store, wf_id) = store_with_workflow()?;
    let task = store.tasks().create(&wf_id, "f1", "/a", "/a.out")?;

    for i in 0..5 {
        store.task_steps().create(&task.id, &format!("step-{i}"), "true")?;
    }

    let steps = store.task_steps().list_by_task(&task.id)?;
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["step-0", "step-1", "step-2", "step-3", "step-4"]);
    Ok(())
}

#[test]
fn plugin_versions_are_append_only_with_active_pointer() -> TestResult {
    let store = Store::open_in_memory()?;

    let (plugin, v1) = store.plugins().create_plugin(
        "notify",
        "webhooks",
        "1.0.0",
        "name: notify\nversion: 1.0.0\nsteps:\n  - name: s\n    run: \"true\"\n",
    )?;
    assert_eq!(plugin.active_version_id, v1.id);

    let v2 = store.plugins().add_version(
        &plugin.id,
        "1.1.0",
        "name: notify\nversion: 1.1.0\nsteps:\n  - name: s\n    run: \"true\"\n",
    )?;
    let reloaded = store.plugins().get(&plugin.id)?;
    assert_eq!(reloaded.active_version_id, v2.id);
    assert_eq!(store.plugins().get_active_version(&plugin.id)?.version, "1.1.0");

    // Explicit lookup by version string.
    let found = store.plugins().get_version("notify", "1.0.0")?;
    assert_eq!(found.map(|v| v.id), Some(v1.id.clone()));

    // Roll the pointer back to v1.
    store.plugins().set_active_version(&plugin.id, &v1.id)?;
    assert_eq!(store.plugins().get_active_version(&plugin.id)?.version, "1.0.0");

    // The pointer may only reference versions of the same plugin.
    let (other, _) = store.plugins().create_plugin(
        "resize",
        "",
        "1.0.0",
        "name: resize\nversion: 1.0.0\nsteps:\n  - name: s\n    run: \"true\"\n",
    )?;
    assert!(store.plugins().set_active_version(&other.id, &v1.id).is_err());

    assert_eq!(store.plugins().list_versions(&plugin.id)?.len(), 2);
    Ok(())
}

#[test]
fn plugin_delete_removes_all_versions() -> TestResult {
    let store = Store::open_in_memory()?;

    let (plugin, _) = store.plugins().create_plugin(
        "notify",
        "",
        "1.0.0",
        "name: notify\nversion: 1.0.0\nsteps:\n  - name: s\n    run: \"true\"\n",
    )?;
    store.plugins().add_version(&plugin.id, "1.1.0", "name: notify\nversion: 1.1.0\nsteps:\n  - name: s\n    run: \"true\"\n")?;

    store.plugins().delete(&plugin.id)?;
    assert!(store.plugins().get(&plugin.id).is_err());
    assert!(store.plugins().list_versions(&plugin.id)?.is_empty());
    assert!(store.plugins().get_by_name("notify")?.is_none());
    Ok(())
}
