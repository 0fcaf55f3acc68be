// Crash recovery tests
// A bridge process dies mid-saga; the next process restores the execution
// from its checkpoint and re-issues the interrupted step exactly once.

mod fixtures;

use beads_bridge::recovery::NO_CHECKPOINT_REASON;
use beads_bridge::registry::AssignMode;
use beads_bridge::{
    AssignRequest, AssignmentStatus, BridgeError, BridgeState, IssueStatus, MappingStatus,
    NewMapping, Registry, Saga, StartWorkflowRequest, WorkType,
};
use fixtures::{eventually, journal, Behavior, Durable, RecordingStep};

#[tokio::test]
async fn interrupted_step_is_reissued_once_across_restarts() {
    let durable = Durable::new();
    let first = durable.serving_bridge().await;
    let started = first
        .start_workflow(StartWorkflowRequest::new("Research retry policies", WorkType::Research))
        .await
        .unwrap();
    let wf = started.mapping.execution_id.clone();

    let log = journal();
    let saga = Saga::builder("research")
        .step(RecordingStep::new("investigate", Behavior::Succeed, &log))
        .step(RecordingStep::new("summarize", Behavior::Hang, &log))
        .build();
    let running = {
        let bridge = first.clone();
        let wf = wf.clone();
        tokio::spawn(async move { bridge.run_saga(&wf, &saga).await })
    };

    let step_two_started = eventually(|| {
        let bridge = first.clone();
        let wf = wf.clone();
        async move {
            matches!(
                bridge.registry().active_assignment(&wf).await,
                Ok(Some(a)) if a.step_number == 2 && a.status == AssignmentStatus::Started
            )
        }
    })
    .await;
    assert!(step_two_started);

    // the process dies: nothing after this point runs
    running.abort();
    let _ = running.await;
    drop(first);
    assert_eq!(durable.engine.checkpoint(&wf).unwrap().step_number, 1);

    let second = durable.bridge();
    let report = second.start().await.unwrap().unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.restored, 1);
    assert_eq!(report.reassigned, 1);
    assert_eq!(second.state(), BridgeState::Serving);

    let active = second.registry().active_assignment(&wf).await.unwrap().unwrap();
    assert_eq!((active.step_number, active.attempt), (2, 2));
    assert_eq!(active.status, AssignmentStatus::Assigned);

    // a second restart finds the re-issued step and leaves it alone
    let third = durable.bridge();
    let report = third.start().await.unwrap().unwrap();
    assert_eq!(report.reassigned, 0);
    assert_eq!(third.registry().assignments(&wf).await.unwrap().len(), 3);
    assert_eq!(durable.engine.restore_count(&wf), 2);

    third.router().flush().await;
    let comments = durable.ticketing.comments(&started.mapping.issue_id);
    assert!(comments
        .iter()
        .any(|c| c.starts_with("Recovered after restart") && c.contains("re-assigned")));
}

#[tokio::test]
async fn mapping_without_checkpoint_is_failed() {
    let durable = Durable::new();

    // crashed between create_mapping and start_execution
    let issue = {
        let registry = Registry::new(durable.store.clone());
        let issue = beads_bridge::IssueId::new("bd-orphan");
        registry
            .create_mapping(NewMapping::new(
                issue.clone(),
                beads_bridge::ExecutionId::new("wf-poc-orphan"),
                WorkType::Poc,
            ))
            .await
            .unwrap();
        issue
    };

    let bridge = durable.bridge();
    let report = bridge.start().await.unwrap().unwrap();
    assert_eq!(report.failed_no_checkpoint.len(), 1);

    let mapping = bridge.registry().mapping_for_issue(&issue).await.unwrap();
    assert_eq!(mapping.status, MappingStatus::Failed);
    assert_eq!(mapping.status_reason.as_deref(), Some(NO_CHECKPOINT_REASON));
}

#[tokio::test]
async fn engine_outage_aborts_startup_until_retried() {
    let durable = Durable::new();
    let first = durable.serving_bridge().await;
    let wf = first
        .start_workflow(StartWorkflowRequest::new("Validate parser", WorkType::Validation))
        .await
        .unwrap()
        .mapping
        .execution_id;
    first
        .assign(
            &wf,
            AssignRequest::for_type(WorkType::Validation, "fuzz"),
            AssignMode::FailFast,
        )
        .await
        .unwrap();
    drop(first);

    durable.engine.set_unavailable(true);
    let bridge = durable.bridge();
    let result = bridge.start().await;
    assert!(matches!(result, Err(BridgeError::RecoveryAborted { .. })));
    assert!(matches!(bridge.state(), BridgeState::Aborted(_)));
    assert!(matches!(
        bridge
            .start_workflow(StartWorkflowRequest::new("refused", WorkType::Research))
            .await,
        Err(BridgeError::NotServing { .. })
    ));
    assert_eq!(
        bridge.registry().mapping(&wf).await.unwrap().status,
        MappingStatus::Active
    );

    durable.engine.set_unavailable(false);
    bridge.start().await.unwrap();
    assert_eq!(bridge.state(), BridgeState::Serving);
}

#[tokio::test]
async fn terminal_checkpoint_corrects_registry_and_ticket() {
    let durable = Durable::new();
    let first = durable.serving_bridge().await;
    let started = first
        .start_workflow(StartWorkflowRequest::new("Benchmark", WorkType::Performance))
        .await
        .unwrap();
    let wf = started.mapping.execution_id.clone();
    drop(first);

    // the engine finished the execution while the bridge was down
    use beads_bridge::ExecutionEngine;
    durable
        .engine
        .signal(
            &wf,
            beads_bridge::external::engine_signals::EXECUTION_COMPLETED,
            serde_json::json!({}),
        )
        .await
        .unwrap();

    let bridge = durable.bridge();
    let report = bridge.start().await.unwrap().unwrap();
    assert_eq!(report.tickets_corrected, 1);
    assert_eq!(
        bridge.registry().mapping(&wf).await.unwrap().status,
        MappingStatus::Completed
    );
    assert_eq!(
        durable.ticketing.issue(&started.mapping.issue_id).unwrap().status,
        IssueStatus::Closed
    );
}
