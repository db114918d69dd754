use std::sync::Arc;

use uuid::Uuid;
use waypoint::workflow::{NewStep, Role, Stage};
use waypoint::{
    record, EventData, EventRouter, ExecutionError, InMemoryWorkflowStore, Record, StepDef, StepStatus, WaypointError,
    WaypointResult, WorkflowDef, WorkflowHandle, WorkflowManager, WorkflowStatus, WorkflowStore, FINISH_STATE,
};

const SELECTOR_01: Uuid = Uuid::from_u128(0x5354_3031);
const RESOURCE_01: Uuid = Uuid::from_u128(0x5746_3031);

fn sample_process() -> WorkflowDef {
    let step03 = StepDef::builder("Step03")
        .title("Step 03")
        .stage("Stage01")
        .states(["TAKE", "ME", "TO", "THE", "MOON"])
        .on_event("test-event", 0, |step, _| {
            step.memorize(record! { "test_step_key" => "value" })?;
            let s1 = step.add_step(NewStep::new("Step02b").memorize("test_key_02", "value"))?;
            let s2 = step.add_step(NewStep::new("Step02").memorize("test_key_02", s1.to_string()))?;
            step.transit("TAKE")?;
            step.step(s1)?.transit(FINISH_STATE)?;
            step.step(s2)?.transit(FINISH_STATE)?;
            Ok(vec![format!("test_event_step added {s1} and {s2}")])
        })
        .on_transition("TAKE", |step, from| Ok(vec![format!("TRANSITIONING TO TAKE: {} => {from}", step.id())]))
        .build()
        .unwrap();

    WorkflowDef::builder("sample-process")
        .title("Sample Process")
        .revision(1)
        .stage(Stage::new("Stage01", "Stage 01"))
        .stage(Stage::new("Stage02", "Stage 02"))
        .role(Role::new("Role01", "Role 01"))
        .step(StepDef::builder("Step01").stage("Stage01").build().unwrap())
        .step(StepDef::builder("Step02").title("step-02a").stage("Stage01").multiple(true).build().unwrap())
        .step(StepDef::builder("Step02b").title("Step2B").stage("Stage01").multiple(true).build().unwrap())
        .step(step03)
        .on_start(|wf| {
            let step03 = wf.add_step(NewStep::new("Step03").selector(SELECTOR_01))?;
            wf.step(step03)?.transit("MOON")?;
            Ok(Vec::new())
        })
        .on_event("test-event", 0, |wf, data| {
            wf.memorize(record! { "test_key" => "workflow value 2" })?;
            wf.output(record! { "message" => "SUCCESS!" })?;
            wf.output(record! { "file" => "contract/contract-final-v2.pdf" })?;
            Ok(vec![format!("test_event ACTION! #1: {:?}", data.resource_id)])
        })
        .build()
        .unwrap()
}

fn manager_on(store: &Arc<InMemoryWorkflowStore>) -> WorkflowManager {
    let manager = WorkflowManager::new(Arc::new(EventRouter::new()), store.clone());
    manager.register(sample_process()).unwrap();
    manager
}

fn started(manager: &WorkflowManager) -> WorkflowHandle {
    let wf = manager
        .create_workflow(
            "sample-process",
            "test-resource",
            RESOURCE_01,
            record! { "test-param" => "test-value", "step-selector" => SELECTOR_01 },
        )
        .unwrap();
    wf.transaction(|tx| tx.start()).unwrap();
    manager.commit().unwrap();
    wf
}

fn test_event() -> EventData {
    EventData::for_resource("test-resource", RESOURCE_01).selector(SELECTOR_01)
}

/// Fires `test-event`, committing after every handler, and returns the
/// step count seen after each one.
fn fire(manager: &WorkflowManager) -> Vec<usize> {
    manager
        .process_event("test-event", &test_event())
        .unwrap()
        .map(|handle| {
            let handle = handle.unwrap();
            manager.commit_workflow(&handle).unwrap();
            let count = handle.lock().unwrap().step_id_map().len();
            count
        })
        .collect()
}

#[test]
fn reprocessing_an_event_accumulates_steps() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    assert_eq!(wf.lock().unwrap().step_id_map().len(), 1);

    assert_eq!(fire(&manager), [1, 3]);

    // A fresh manager has to replay the workflow from the store.
    let manager = manager_on(&store);
    let loaded = manager.load_workflow_by_id("sample-process", wf.id()).unwrap();
    assert_eq!(loaded.lock().unwrap().step_id_map().len(), 3);

    assert_eq!(fire(&manager), [3, 5]);
}

#[test]
fn step_handler_links_created_steps() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    fire(&manager);

    let workflow = wf.lock().unwrap();
    let step03 = workflow
        .step_id_map()
        .values()
        .find(|s| s.step_key == "Step03")
        .unwrap();
    assert_eq!(step03.state, "TAKE");
    assert_eq!(step03.selector, SELECTOR_01);

    let children: Vec<_> = workflow
        .step_id_map()
        .values()
        .filter(|s| s.step_key != "Step03")
        .collect();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(child.src_step, Some(*step03.id.as_uuid()));
        assert_eq!(child.state, FINISH_STATE);
        assert_eq!(child.status, StepStatus::Completed);
    }
    assert_eq!(workflow.status(), WorkflowStatus::Active);
    assert_eq!(workflow.outputs().len(), 2);
    assert_eq!(
        workflow.memory().get("test_key"),
        Some(&waypoint::Value::from("workflow value 2"))
    );
}

#[test]
fn handler_messages_are_stored_on_commit() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    fire(&manager);

    let messages = manager.messages(wf.id()).unwrap();
    let sources: Vec<_> = messages.iter().map(|m| m.source.as_str()).collect();
    assert!(sources.contains(&"event:test-event"));
    assert!(sources.contains(&"step:Step03:test-event"));
    assert!(sources.contains(&"transition:Step03:TAKE"));
}

#[test]
fn failed_transaction_discards_added_steps() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);

    let err = wf
        .transaction(|tx| {
            tx.add_step("Step02")?;
            tx.add_step("Step02b")?;
            Err::<(), _>(WaypointError::handler("boom"))
        })
        .unwrap_err();
    assert!(err.is_execution());

    let workflow = wf.lock().unwrap();
    assert_eq!(workflow.step_id_map().len(), 1);
    assert!(!workflow.has_pending());
}

#[test]
fn transit_accepts_declared_labels_only() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);

    let state = wf
        .transaction(|tx| {
            let mut step = tx.step_by_selector(SELECTOR_01)?;
            step.transit("ME")?;
            Ok(step.state().to_string())
        })
        .unwrap();
    assert_eq!(state, "ME");

    let err = wf
        .transaction(|tx| tx.step_by_selector(SELECTOR_01)?.transit("NONEXISTENT_LABEL"))
        .unwrap_err();
    assert!(matches!(
        err,
        WaypointError::Execution(ExecutionError::InvalidTransition { ref label, .. }) if label == "NONEXISTENT_LABEL"
    ));
}

#[test]
fn finished_step_rejects_further_transitions() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);

    let second = wf
        .transaction(|tx| {
            let id = tx.add_step("Step01")?;
            tx.step(id)?.transit(FINISH_STATE)?;
            Ok(id)
        })
        .unwrap();
    let err = wf.transaction(|tx| tx.step(second)?.transit(FINISH_STATE)).unwrap_err();
    assert!(matches!(
        err,
        WaypointError::Execution(ExecutionError::TransitionFromFinished { .. })
    ));
}

#[test]
fn non_multiple_step_cannot_be_added_twice() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);

    let err = wf.transaction(|tx| tx.add_step("Step03")).unwrap_err();
    assert!(matches!(err, WaypointError::Execution(ExecutionError::DuplicateStep { .. })));
}

#[test]
fn commit_twice_is_idempotent() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    wf.transaction(|tx| tx.memorize(record! { "note" => "once" })).unwrap();

    assert!(manager.commit_workflow(&wf).unwrap());
    let first = store.load("sample-process", wf.id()).unwrap().unwrap();
    assert!(!manager.commit_workflow(&wf).unwrap());
    let second = store.load("sample-process", wf.id()).unwrap().unwrap();

    assert_eq!(first.revision, second.revision);
    assert_eq!(first.etag, second.etag);
    assert_eq!(first.mutations.len(), second.mutations.len());
}

#[test]
fn replay_reproduces_committed_state() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    fire(&manager);
    let committed = wf.lock().unwrap().snapshot().clone();

    // Uncommitted edits are not part of the stored state.
    wf.transaction(|tx| tx.memorize(record! { "draft" => true })).unwrap();

    let other = manager_on(&store);
    let loaded = other.load_workflow_by_id("sample-process", wf.id()).unwrap();
    assert_eq!(loaded.lock().unwrap().snapshot(), &committed);
}

#[test]
fn load_by_resource_finds_stored_workflow() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);

    let other = manager_on(&store);
    let found = other
        .load_workflow("sample-process", "test-resource", RESOURCE_01)
        .unwrap()
        .unwrap();
    assert_eq!(found.id(), wf.id());
    assert!(other
        .load_workflow("sample-process", "test-resource", Uuid::new_v4())
        .unwrap()
        .is_none());
}

#[test]
fn stale_commit_is_a_conflict() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let first = manager_on(&store);
    let wf = started(&first);

    let second = manager_on(&store);
    let copy = second.load_workflow_by_id("sample-process", wf.id()).unwrap();

    wf.transaction(|tx| tx.memorize(record! { "writer" => "first" })).unwrap();
    copy.transaction(|tx| tx.memorize(record! { "writer" => "second" })).unwrap();

    assert!(first.commit_workflow(&wf).unwrap());
    let err = second.commit_workflow(&copy).unwrap_err();
    assert!(err.is_conflict());
    assert!(copy.lock().unwrap().has_pending());
}

#[test]
fn conflicting_commit_can_be_retried_after_reload() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let first = manager_on(&store);
    let wf = started(&first);

    let second = manager_on(&store);
    let copy = second.load_workflow_by_id("sample-process", wf.id()).unwrap();

    wf.transaction(|tx| tx.memorize(record! { "writer" => "first" })).unwrap();
    copy.transaction(|tx| tx.memorize(record! { "writer" => "second" })).unwrap();
    assert!(first.commit_workflow(&wf).unwrap());
    assert!(second.commit_workflow(&copy).unwrap_err().is_conflict());

    let fresh = second.load_workflow_by_id("sample-process", wf.id()).unwrap();
    assert_eq!(fresh.lock().unwrap().revision(), 2);
    assert_eq!(
        fresh.lock().unwrap().memory().get("writer"),
        Some(&waypoint::Value::from("first"))
    );

    fresh.transaction(|tx| tx.memorize(record! { "writer" => "second" })).unwrap();
    assert!(second.commit_workflow(&fresh).unwrap());
    assert_eq!(store.load("sample-process", wf.id()).unwrap().unwrap().revision, 3);
}

const SELECTOR_A: Uuid = Uuid::from_u128(0x41);
const SELECTOR_B: Uuid = Uuid::from_u128(0x42);

fn two_step_process() -> WorkflowDef {
    let step = |key: &'static str| {
        StepDef::builder(key)
            .on_event("go", 0, move |_, _| Ok(vec![format!("{key} ran")]))
            .build()
            .unwrap()
    };
    WorkflowDef::builder("two-steps")
        .step(step("A"))
        .step(step("B"))
        .on_start(|wf| {
            wf.add_step(NewStep::new("A").selector(SELECTOR_A))?;
            wf.add_step(NewStep::new("B").selector(SELECTOR_B))?;
            Ok(Vec::new())
        })
        .build()
        .unwrap()
}

#[test]
fn step_event_runs_only_the_addressed_step_type() {
    let manager = WorkflowManager::new(Arc::new(EventRouter::new()), Arc::new(InMemoryWorkflowStore::new()));
    manager.register(two_step_process()).unwrap();
    let resource = Uuid::new_v4();
    let wf = manager.create_workflow("two-steps", "item", resource, Record::new()).unwrap();
    wf.transaction(|tx| tx.start()).unwrap();
    manager.commit().unwrap();

    for (selector, expected) in [(SELECTOR_A, "A ran"), (SELECTOR_B, "B ran")] {
        let data = EventData::for_resource("item", resource).selector(selector);
        let handles: Vec<_> = manager
            .process_event("go", &data)
            .unwrap()
            .collect::<WaypointResult<_>>()
            .unwrap();
        assert_eq!(handles.len(), 1);
        manager.commit().unwrap();
        let messages = manager.messages(wf.id()).unwrap();
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some(expected));
    }
    assert_eq!(manager.messages(wf.id()).unwrap().len(), 2);
}

#[test]
fn unknown_event_is_rejected() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let err = manager.process_event("no-such-event", &test_event()).unwrap_err();
    assert!(matches!(err, WaypointError::Execution(ExecutionError::UnknownEvent { .. })));
}

#[test]
fn step_event_without_selector_is_rejected() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    started(&manager);

    let data = EventData::for_resource("test-resource", RESOURCE_01);
    let err = manager.process_event("test-event", &data).unwrap_err();
    assert!(matches!(err, WaypointError::Execution(ExecutionError::MissingSelector { .. })));
}

#[test]
fn paused_workflow_does_not_take_events() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    wf.transaction(|tx| tx.pause()).unwrap();

    let results: Vec<WaypointResult<WorkflowHandle>> = manager.process_event("test-event", &test_event()).unwrap().collect();
    assert!(results.iter().all(Result::is_err));

    wf.transaction(|tx| tx.resume()).unwrap();
    assert_eq!(fire(&manager), [1, 3]);
}

#[test]
fn cancel_finishes_open_steps() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    wf.transaction(|tx| tx.cancel()).unwrap();
    manager.commit().unwrap();

    let workflow = wf.lock().unwrap();
    assert_eq!(workflow.status(), WorkflowStatus::Cancelled);
    assert!(workflow
        .step_id_map()
        .values()
        .all(|s| s.status == StepStatus::Cancelled));
}

#[test]
fn participants_require_declared_roles() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let manager = manager_on(&store);
    let wf = started(&manager);
    let user = Uuid::new_v4();

    wf.transaction(|tx| tx.add_participant("Role01", user)).unwrap();
    let err = wf.transaction(|tx| tx.add_participant("Role99", user)).unwrap_err();
    assert!(matches!(err, WaypointError::Execution(ExecutionError::UnknownRole { .. })));
    assert_eq!(wf.lock().unwrap().participants().len(), 1);
}
