//! Recovery tests for the journal store.
//!
//! These tests verify that:
//! - committed workflows replay identically after a restart
//! - a torn tail (simulated crash mid-write) loses only the last commit
//! - files that are not journals are rejected
//! - damage before the last entry is reported, never truncated away
//! - values JSON cannot carry are refused before they reach the journal

#![cfg(feature = "persistent")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use uuid::Uuid;
use waypoint::storage::journal::{open_journal, JournalConfig, JournalWorkflowStore};
use waypoint::{
    record, EventData, EventRouter, ExecutionError, Record, StepDef, WaypointError, WorkflowDef, WorkflowManager,
    WorkflowStatus, WorkflowStore, FINISH_STATE,
};

fn review_process() -> WorkflowDef {
    let draft = StepDef::builder("Draft")
        .states(["WRITING", "SUBMITTED"])
        .on_event("submit", 0, |step, data| {
            step.memorize(data.payload.clone())?;
            step.transit("SUBMITTED")?;
            Ok(vec!["draft submitted".to_string()])
        })
        .build()
        .unwrap();
    WorkflowDef::builder("review")
        .step(draft)
        .step(StepDef::builder("Approve").states(["PENDING"]).build().unwrap())
        .on_start(|wf| wf.add_step("Draft").map(|_| Vec::new()))
        .on_event("submit", 10, |wf, _| {
            let id = wf.add_step("Approve")?;
            wf.step(id)?.transit("PENDING")?;
            Ok(Vec::new())
        })
        .build()
        .unwrap()
}

fn open(path: &Path) -> (WorkflowManager, Arc<JournalWorkflowStore>) {
    let config = JournalConfig {
        sync_on_write: false,
        ..JournalConfig::default()
    };
    let store = Arc::new(open_journal(path, Some(config)).unwrap());
    let manager = WorkflowManager::new(Arc::new(EventRouter::new()), store.clone());
    manager.register(review_process()).unwrap();
    (manager, store)
}

#[test]
fn test_committed_workflow_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");
    let resource = Uuid::new_v4();

    let (id, before) = {
        let (manager, store) = open(&path);
        let wf = manager.create_workflow("review", "document", resource, Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        manager.commit().unwrap();

        let draft = wf.lock().unwrap().step_id_map().values().next().unwrap().selector;
        let data = EventData::for_resource("document", resource)
            .selector(draft)
            .payload(record! { "pages" => 12 });
        for handle in manager.process_event("submit", &data).unwrap() {
            manager.commit_workflow(&handle.unwrap()).unwrap();
        }
        assert_eq!(store.sequence().unwrap(), 3);
        let snapshot = wf.lock().unwrap().snapshot().clone();
        (wf.id(), snapshot)
    };

    let (manager, store) = open(&path);
    assert_eq!(store.sequence().unwrap(), 3);
    let loaded = manager.load_workflow_by_id("review", id).unwrap();
    let workflow = loaded.lock().unwrap();
    assert_eq!(workflow.snapshot(), &before);
    assert_eq!(workflow.revision(), 3);
    assert_eq!(workflow.step_id_map().len(), 2);
    assert_eq!(manager.messages(id).unwrap().len(), 1);
}

#[test]
fn test_torn_tail_loses_only_last_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");

    let id = {
        let (manager, _) = open(&path);
        let wf = manager.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        manager.commit().unwrap();
        wf.transaction(|tx| tx.memorize(record! { "round" => 1 })).unwrap();
        manager.commit().unwrap();
        wf.transaction(|tx| tx.memorize(record! { "round" => 2 })).unwrap();
        manager.commit().unwrap();
        wf.id()
    };

    // Simulate a crash in the middle of the last write.
    {
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size - 3).unwrap();
    }

    let (manager, store) = open(&path);
    assert_eq!(store.sequence().unwrap(), 2);
    let wf = manager.load_workflow_by_id("review", id).unwrap();
    assert_eq!(wf.lock().unwrap().revision(), 2);
    assert_eq!(
        wf.lock().unwrap().memory().get("round"),
        Some(&waypoint::Value::from(1))
    );

    // New commits land after the last intact entry.
    wf.transaction(|tx| tx.memorize(record! { "round" => 3 })).unwrap();
    manager.commit().unwrap();
    drop(manager);
    drop(store);

    let (manager, _) = open(&path);
    let wf = manager.load_workflow_by_id("review", id).unwrap();
    assert_eq!(wf.lock().unwrap().revision(), 3);
    assert_eq!(
        wf.lock().unwrap().memory().get("round"),
        Some(&waypoint::Value::from(3))
    );
}

#[test]
fn test_replay_is_repeatable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");

    let id = {
        let (manager, _) = open(&path);
        let wf = manager.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| {
            tx.start()?;
            let approve = tx.add_step("Approve")?;
            tx.step(approve)?.transit(FINISH_STATE)
        })
        .unwrap();
        manager.commit().unwrap();
        wf.id()
    };

    let first = {
        let (manager, _) = open(&path);
        let wf = manager.load_workflow_by_id("review", id).unwrap();
        let snapshot = wf.lock().unwrap().snapshot().clone();
        snapshot
    };
    let (manager, store) = open(&path);
    let wf = manager.load_workflow_by_id("review", id).unwrap();
    assert_eq!(wf.lock().unwrap().snapshot(), &first);
    assert_eq!(wf.lock().unwrap().status(), WorkflowStatus::Active);
    assert_eq!(store.load("review", id).unwrap().unwrap().revision, 1);
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("not-a-journal");
    fs::write(&path, b"definitely not a journal").unwrap();

    let err = open_journal(&path, None).unwrap_err();
    assert!(err.is_storage());
}

#[test]
fn test_stale_commit_never_reaches_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");
    let (first, store) = open(&path);
    let wf = first.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
    wf.transaction(|tx| tx.start()).unwrap();
    first.commit().unwrap();

    let second = WorkflowManager::new(Arc::new(EventRouter::new()), store.clone());
    second.register(review_process()).unwrap();
    let copy = second.load_workflow_by_id("review", wf.id()).unwrap();

    wf.transaction(|tx| tx.memorize(record! { "by" => "first" })).unwrap();
    copy.transaction(|tx| tx.memorize(record! { "by" => "second" })).unwrap();
    first.commit().unwrap();
    assert!(second.commit().unwrap_err().is_conflict());
    assert_eq!(store.sequence().unwrap(), 2);
}

#[test]
fn test_non_finite_memory_never_reaches_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");

    let (first, second) = {
        let (manager, _) = open(&path);
        let a = manager.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
        a.transaction(|tx| tx.start()).unwrap();
        manager.commit().unwrap();

        let err = a
            .transaction(|tx| tx.memorize(record! { "x" => f64::NAN }))
            .unwrap_err();
        assert!(matches!(
            err,
            WaypointError::Execution(ExecutionError::NonFiniteValue { ref field }) if field == "x"
        ));
        assert!(!manager.commit_workflow(&a).unwrap());

        let b = manager.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
        b.transaction(|tx| tx.start()).unwrap();
        manager.commit().unwrap();
        (a.id(), b.id())
    };

    let (manager, store) = open(&path);
    assert_eq!(store.sequence().unwrap(), 2);
    assert!(manager.load_workflow_by_id("review", first).is_ok());
    assert!(manager.load_workflow_by_id("review", second).is_ok());
}

#[test]
fn test_damage_before_last_entry_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("workflows.journal");

    {
        let (manager, _) = open(&path);
        let wf = manager.create_workflow("review", "document", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        manager.commit().unwrap();
        wf.transaction(|tx| tx.memorize(record! { "round" => 1 })).unwrap();
        manager.commit().unwrap();
    }

    // Header (5) + entry version (1) + length (4), then into the first payload.
    let mut bytes = fs::read(&path).unwrap();
    bytes[12] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let err = open_journal(&path, None).unwrap_err();
    assert!(err.is_storage());
    assert!(err.to_string().contains("corrupt"));
    assert_eq!(fs::metadata(&path).unwrap().len(), bytes.len() as u64);
}
