// End-to-end bridge tests over the in-memory ticketing store and engine
// Research -> POC handoff, operator cancel, pause/resume and reopen.

mod fixtures;

use beads_bridge::external::engine_signals;
use beads_bridge::{
    AgentId, AnalyticsFilter, AssignmentStatus, BridgeError, IssueStatus, MappingStatus,
    ResultType, Saga, SagaOutcome, SignalKind, StartWorkflowRequest, WorkType, WorkflowResult,
};
use fixtures::{journal, Behavior, Durable, RecordingStep};
use std::time::Duration;

#[tokio::test]
async fn research_hands_off_to_poc_and_completes() {
    let durable = Durable::new();
    let bridge = durable.serving_bridge().await;

    let started = bridge
        .start_workflow(
            StartWorkflowRequest::new("Evaluate async runtimes", WorkType::Research)
                .with_description("Compare tokio and async-std for the bridge")
                .with_initial_agent(AgentId::new("research-01"), "investigate"),
        )
        .await
        .unwrap();
    let wf = started.mapping.execution_id.clone();
    let research = started.assignment.unwrap();

    bridge.begin_step(research.id).await.unwrap();
    bridge
        .record_result(
            WorkflowResult::new(
                wf.clone(),
                WorkType::Research,
                ResultType::Findings,
                serde_json::json!({ "recommended": "tokio" }),
            )
            .with_confidence(0.9),
        )
        .await
        .unwrap();

    let signal = bridge
        .handoff(&wf, research.id, AgentId::new("poc-01"), WorkType::Poc, "prototype")
        .await
        .unwrap();
    assert_eq!(signal.kind, SignalKind::AgentHandoff);
    bridge.router().flush().await;

    let assignments = bridge.registry().assignments(&wf).await.unwrap();
    assert_eq!(assignments.len(), 2);
    assert_eq!(assignments[0].status, AssignmentStatus::Completed);
    assert_eq!(assignments[0].handoff_to, Some(AgentId::new("poc-01")));
    let poc = &assignments[1];
    assert_eq!(poc.step_number, 2);
    assert_eq!(poc.agent_id, AgentId::new("poc-01"));
    assert_eq!(poc.handoff_from, Some(AgentId::new("research-01")));

    bridge
        .complete_step(poc.id, serde_json::json!({ "prototype": "ok" }))
        .await
        .unwrap();
    let mapping = bridge.complete_workflow(&wf).await.unwrap();
    assert_eq!(mapping.status, MappingStatus::Completed);
    bridge.router().flush().await;

    let engine_signals_seen = durable.engine.signals(&wf);
    assert!(engine_signals_seen.contains(&engine_signals::AGENT_HANDOFF.to_string()));
    assert_eq!(
        engine_signals_seen.last().map(String::as_str),
        Some(engine_signals::EXECUTION_COMPLETED)
    );
    assert_eq!(durable.engine.checkpoint(&wf).unwrap().step_number, 2);

    let issue = durable.ticketing.issue(&started.mapping.issue_id).unwrap();
    assert_eq!(issue.status, IssueStatus::Closed);
    assert_eq!(
        issue.description.as_deref(),
        Some("Compare tokio and async-std for the bridge")
    );
    let comments = durable.ticketing.comments(&started.mapping.issue_id);
    assert!(comments.contains(&"Handoff from research-01 to poc-01".to_string()));
    assert!(comments.contains(&"Results stored: findings (confidence: 0.90)".to_string()));

    let analytics = bridge.analytics(&AnalyticsFilter::default()).await.unwrap();
    assert_eq!(analytics.completed, 1);
    assert_eq!(analytics.results_recorded, 1);
}

#[tokio::test]
async fn complete_workflow_refuses_while_step_is_owned() {
    let durable = Durable::new();
    let bridge = durable.serving_bridge().await;
    let wf = bridge
        .start_workflow(
            StartWorkflowRequest::new("Write docs", WorkType::Documentation)
                .with_initial_agent(AgentId::new("docs-01"), "draft"),
        )
        .await
        .unwrap()
        .mapping
        .execution_id;

    assert!(matches!(
        bridge.complete_workflow(&wf).await,
        Err(BridgeError::OwnershipConflict { .. })
    ));
}

#[tokio::test]
async fn cancel_stops_running_saga_and_closes_out() {
    let durable = Durable::new();
    let bridge = durable.serving_bridge().await;
    let started = bridge
        .start_workflow(StartWorkflowRequest::new("Long benchmark", WorkType::Performance))
        .await
        .unwrap();
    let wf = started.mapping.execution_id.clone();

    let log = journal();
    let saga = Saga::builder("bench")
        .step(RecordingStep::new("warmup", Behavior::Succeed, &log))
        .step(RecordingStep::new("measure", Behavior::Hang, &log))
        .build();
    let running = {
        let bridge = bridge.clone();
        let wf = wf.clone();
        tokio::spawn(async move { bridge.run_saga(&wf, &saga).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    bridge.cancel(&wf, "superseded by new plan").await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    bridge.router().flush().await;

    assert_eq!(report.outcome, SagaOutcome::Compensated);
    assert_eq!(report.compensation_order, vec!["warmup".to_string()]);
    assert_eq!(
        bridge.registry().mapping(&wf).await.unwrap().status,
        MappingStatus::Cancelled
    );
    assert!(bridge.registry().active_assignment(&wf).await.unwrap().is_none());
    assert_eq!(
        durable.ticketing.issue(&started.mapping.issue_id).unwrap().status,
        IssueStatus::Cancelled
    );
    assert!(durable
        .ticketing
        .comments(&started.mapping.issue_id)
        .contains(&"Workflow cancelled: superseded by new plan".to_string()));
    assert!(durable
        .engine
        .signals(&wf)
        .contains(&engine_signals::EXECUTION_CANCELLED.to_string()));
}

#[tokio::test]
async fn paused_mapping_refuses_assignment_until_resumed() {
    let durable = Durable::new();
    let bridge = durable.serving_bridge().await;
    let started = bridge
        .start_workflow(StartWorkflowRequest::new("Validate schema", WorkType::Validation))
        .await
        .unwrap();
    let wf = started.mapping.execution_id.clone();

    bridge.pause(&wf, "waiting on upstream").await.unwrap();
    assert_eq!(
        durable.ticketing.issue(&started.mapping.issue_id).unwrap().status,
        IssueStatus::Blocked
    );
    let refused = bridge
        .assign(
            &wf,
            beads_bridge::AssignRequest::for_type(WorkType::Validation, "check"),
            beads_bridge::AssignMode::FailFast,
        )
        .await;
    assert!(matches!(refused, Err(BridgeError::MappingNotActive { .. })));

    bridge.resume(&wf).await.unwrap();
    bridge
        .assign(
            &wf,
            beads_bridge::AssignRequest::for_type(WorkType::Validation, "check"),
            beads_bridge::AssignMode::FailFast,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn reopen_links_follow_up_to_finished_mapping() {
    let durable = Durable::new();
    let bridge = durable.serving_bridge().await;
    let first = bridge
        .start_workflow(StartWorkflowRequest::new("Research caching", WorkType::Research))
        .await
        .unwrap()
        .mapping;

    assert!(matches!(
        bridge.reopen(&first.execution_id, "too early").await,
        Err(BridgeError::InvalidTransition { .. })
    ));

    bridge.complete_workflow(&first.execution_id).await.unwrap();
    let follow_up = bridge
        .reopen(&first.execution_id, "Research caching, round two")
        .await
        .unwrap()
        .mapping;

    assert_ne!(follow_up.issue_id, first.issue_id);
    assert_eq!(follow_up.parent, Some(first.execution_id.clone()));
    assert_eq!(follow_up.work_type, WorkType::Research);
    assert_eq!(follow_up.status, MappingStatus::Active);
}
