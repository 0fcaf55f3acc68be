// Handoff router delivery tests
// Per-mapping ordering, independence of mappings, redelivery after a
// restart and dead-lettering.

mod fixtures;

use beads_bridge::router::{DeliveryState, FileSignalLog, FnHandler, SignalLog};
use beads_bridge::{ExecutionId, Router, RouterSettings, SignalKind};
use fixtures::eventually;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

fn settings(max_delivery_attempts: u32) -> RouterSettings {
    RouterSettings {
        max_delivery_attempts,
        retry_backoff: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn blocked_mapping_does_not_hold_up_others() {
    let router = Router::new(Arc::new(beads_bridge::router::MemorySignalLog::new()), settings(3));
    let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let gate = Arc::new(Semaphore::new(0));

    {
        let seen = seen.clone();
        let gate = gate.clone();
        router.subscribe(
            SignalKind::custom("tick"),
            Arc::new(FnHandler::new("recorder", move |signal| {
                let seen = seen.clone();
                let gate = gate.clone();
                async move {
                    if signal.execution_id.as_str() == "wf-slow" {
                        gate.acquire().await?.forget();
                    }
                    let n = signal.payload["n"].as_u64().unwrap_or_default();
                    seen.lock().unwrap().push((signal.execution_id.to_string(), n));
                    Ok::<(), anyhow::Error>(())
                }
            })),
        );
    }

    let slow = ExecutionId::new("wf-slow");
    let fast = ExecutionId::new("wf-fast");
    for n in 0..5u64 {
        router
            .emit(&slow, SignalKind::custom("tick"), serde_json::json!({ "n": n }))
            .await
            .unwrap();
        router
            .emit(&fast, SignalKind::custom("tick"), serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }

    let fast_done = eventually(|| {
        let seen = seen.clone();
        async move { seen.lock().unwrap().iter().filter(|(id, _)| id == "wf-fast").count() == 5 }
    })
    .await;
    assert!(fast_done);
    assert!(seen.lock().unwrap().iter().all(|(id, _)| id == "wf-fast"));

    gate.add_permits(5);
    router.flush().await;

    let slow_order: Vec<u64> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| id == "wf-slow")
        .map(|(_, n)| *n)
        .collect();
    assert_eq!(slow_order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn unsettled_signals_are_redelivered_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("signals.json");
    let wf = ExecutionId::new("wf-docs-1");

    // previous process: one signal delivered, one appended but never delivered,
    // one mid-delivery when the process died
    {
        let log = FileSignalLog::open(&path).await.unwrap();
        let done = log
            .append(&wf, SignalKind::StepCompleted, serde_json::json!({ "n": 1 }))
            .await
            .unwrap();
        log.update_state(done.id, DeliveryState::Handled { attempts: 1 })
            .await
            .unwrap();
        log.append(&wf, SignalKind::StepCompleted, serde_json::json!({ "n": 2 }))
            .await
            .unwrap();
        let interrupted = log
            .append(&wf, SignalKind::StepCompleted, serde_json::json!({ "n": 3 }))
            .await
            .unwrap();
        log.update_state(interrupted.id, DeliveryState::Delivering { attempts: 1 })
            .await
            .unwrap();
    }

    let router = Router::new(Arc::new(FileSignalLog::open(&path).await.unwrap()), settings(3));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    {
        let delivered = delivered.clone();
        router.subscribe(
            SignalKind::StepCompleted,
            Arc::new(FnHandler::new("recorder", move |signal| {
                let delivered = delivered.clone();
                async move {
                    delivered.lock().unwrap().push(signal.payload["n"].as_u64().unwrap_or_default());
                    Ok::<(), anyhow::Error>(())
                }
            })),
        );
    }

    assert_eq!(router.replay_unhandled().await.unwrap(), 2);
    router.flush().await;

    assert_eq!(*delivered.lock().unwrap(), vec![2, 3]);
    let states: Vec<DeliveryState> = router
        .signals(&wf)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.state)
        .collect();
    assert_eq!(
        states,
        vec![
            DeliveryState::Handled { attempts: 1 },
            DeliveryState::Handled { attempts: 1 },
            DeliveryState::Handled { attempts: 2 },
        ]
    );
}

#[tokio::test]
async fn exhausted_signal_is_dead_lettered_and_lane_moves_on() {
    let router = Router::new(Arc::new(beads_bridge::router::MemorySignalLog::new()), settings(3));
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        router.subscribe(
            SignalKind::AgentHandoff,
            Arc::new(FnHandler::new("broken", move |_signal| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("registry unreachable"))
                }
            })),
        );
    }
    let wf = ExecutionId::new("wf-poc-1");
    router
        .emit(&wf, SignalKind::AgentHandoff, serde_json::json!({}))
        .await
        .unwrap();
    router
        .emit(&wf, SignalKind::StepCompleted, serde_json::json!({}))
        .await
        .unwrap();
    router.flush().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = router.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(matches!(
        &dead[0].state,
        DeliveryState::DeadLettered { attempts: 3, error } if error.contains("registry unreachable")
    ));

    let signals = router.signals(&wf).await.unwrap();
    assert!(signals[1].state.is_settled());
}
