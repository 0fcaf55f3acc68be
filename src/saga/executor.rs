use async_trait::async_trait;
use chrono::Utc;
use statig::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::lifecycle::{LifecycleEvent, SagaLifecycle, SagaPhase};
use super::report::{FailureCause, SagaFailure, SagaOutcome, SagaReport, StepRecord, StepState};
use super::{CancelToken, Saga, SagaContext, SagaStep};
use crate::error::BridgeError;

/// Hooks around each step. The bridge uses them to assign agents and checkpoint progress.
#[async_trait]
pub trait SagaObserver: Send + Sync {
    /// An error here fails the step before its transaction runs
    async fn before_step(
        &self,
        _position: usize,
        _step: &dyn SagaStep,
        _ctx: &SagaContext,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    /// An error here fails the saga with `CheckpointFailed`; the step is still unwound
    async fn step_committed(
        &self,
        _position: usize,
        _step: &dyn SagaStep,
        _ctx: &SagaContext,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn step_failed(&self, _position: usize, _step: &dyn SagaStep, _cause: &FailureCause) {}
}

pub struct NoopObserver;

impl SagaObserver for NoopObserver {}

#[derive(Debug, Clone, Default)]
pub struct SagaExecutor {
    step_timeout: Option<Duration>,
}

impl SagaExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        saga: &Saga,
        ctx: &mut SagaContext,
        observer: &dyn SagaObserver,
        mut cancel: CancelToken,
    ) -> SagaReport {
        let started = Instant::now();
        let mut lifecycle = SagaLifecycle::new(saga.id()).state_machine();
        lifecycle.handle(&LifecycleEvent::Start);

        let mut records: Vec<StepRecord> = saga
            .steps()
            .iter()
            .enumerate()
            .map(|(i, step)| StepRecord::pending(i + 1, step.name()))
            .collect();
        // Indices of committed steps, in commit order
        let mut committed: Vec<usize> = Vec::new();
        let mut failure: Option<SagaFailure> = None;

        info!(saga = saga.name(), saga_id = saga.id(), steps = saga.len(), "Saga started");

        for (index, step) in saga.steps().iter().enumerate() {
            let position = index + 1;

            if cancel.is_cancelled() {
                records[index].state = StepState::Cancelled;
                failure = Some(SagaFailure {
                    position,
                    step_name: step.name().to_string(),
                    cause: FailureCause::OperatorCancelled,
                });
                break;
            }

            if let Err(e) = observer.before_step(position, step.as_ref(), ctx).await {
                let cause = FailureCause::StepError {
                    message: format!("step could not be assigned: {}", e),
                };
                records[index].state = StepState::Failed {
                    error: cause.to_string(),
                };
                observer.step_failed(position, step.as_ref(), &cause).await;
                failure = Some(SagaFailure {
                    position,
                    step_name: step.name().to_string(),
                    cause,
                });
                break;
            }

            records[index].started_at = Some(Utc::now());
            let outcome = self.run_transaction(step, ctx, &mut cancel).await;
            records[index].finished_at = Some(Utc::now());

            match outcome {
                Ok(()) => {
                    records[index].state = StepState::Committed;
                    committed.push(index);
                    if let Err(e) = observer.step_committed(position, step.as_ref(), ctx).await {
                        let cause = FailureCause::CheckpointFailed {
                            message: e.to_string(),
                        };
                        error!(saga = saga.name(), step = step.name(), error = %e, "Checkpoint failed");
                        observer.step_failed(position, step.as_ref(), &cause).await;
                        failure = Some(SagaFailure {
                            position,
                            step_name: step.name().to_string(),
                            cause,
                        });
                        break;
                    }
                }
                Err(cause) => {
                    records[index].state = match cause {
                        FailureCause::OperatorCancelled => StepState::Cancelled,
                        ref other => StepState::Failed {
                            error: other.to_string(),
                        },
                    };
                    warn!(saga = saga.name(), step = step.name(), cause = %cause, "Saga step failed");
                    observer.step_failed(position, step.as_ref(), &cause).await;
                    failure = Some(SagaFailure {
                        position,
                        step_name: step.name().to_string(),
                        cause,
                    });
                    break;
                }
            }
        }

        let mut compensation_order = Vec::new();
        if failure.is_none() {
            lifecycle.handle(&LifecycleEvent::AllCommitted);
        } else {
            lifecycle.handle(&LifecycleEvent::StepFailed);
            let clean = self
                .unwind(saga, ctx, &committed, &mut records, &mut compensation_order)
                .await;
            lifecycle.handle(&LifecycleEvent::UnwindFinished { clean });
        }

        let outcome = lifecycle
            .inner()
            .phase()
            .outcome()
            .unwrap_or(SagaOutcome::PartiallyCompensated);
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            SagaOutcome::Completed => {
                info!(saga = saga.name(), duration_ms, "Saga completed")
            }
            SagaOutcome::Compensated => {
                warn!(saga = saga.name(), duration_ms, "Saga failed and was compensated")
            }
            SagaOutcome::PartiallyCompensated => {
                error!(saga = saga.name(), duration_ms, "Saga partially compensated, operator action required")
            }
        }
        debug_assert!(lifecycle.inner().phase() != SagaPhase::Executing);

        SagaReport {
            saga_id: saga.id().to_string(),
            saga_name: saga.name().to_string(),
            outcome,
            failure,
            steps: records,
            compensation_order,
            duration_ms,
        }
    }

    async fn run_transaction(
        &self,
        step: &Arc<dyn SagaStep>,
        ctx: &mut SagaContext,
        cancel: &mut CancelToken,
    ) -> Result<(), FailureCause> {
        let work = async {
            match self.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, step.transact(ctx)).await {
                    Ok(result) => result.map_err(|e| FailureCause::StepError {
                        message: format!("{:#}", e),
                    }),
                    Err(_) => Err(FailureCause::Timeout {
                        after_ms: limit.as_millis() as u64,
                    }),
                },
                None => step.transact(ctx).await.map_err(|e| FailureCause::StepError {
                    message: format!("{:#}", e),
                }),
            }
        };

        tokio::select! {
            result = work => result,
            _ = cancel.cancelled() => Err(FailureCause::OperatorCancelled),
        }
    }

    /// Compensates committed steps in reverse commit order. Returns false if any compensation failed.
    async fn unwind(
        &self,
        saga: &Saga,
        ctx: &mut SagaContext,
        committed: &[usize],
        records: &mut [StepRecord],
        order: &mut Vec<String>,
    ) -> bool {
        let mut clean = true;
        for &index in committed.iter().rev() {
            let step = &saga.steps()[index];
            let result = match self.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, step.compensate(ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "compensation timed out after {}ms",
                        limit.as_millis()
                    )),
                },
                None => step.compensate(ctx).await,
            };
            order.push(step.name().to_string());
            match result {
                Ok(()) => {
                    info!(saga = saga.name(), step = step.name(), "Step compensated");
                    records[index].state = StepState::Compensated;
                }
                Err(e) => {
                    error!(saga = saga.name(), step = step.name(), error = %format!("{:#}", e), "Compensation failed");
                    records[index].state = StepState::CompensationFailed {
                        error: format!("{:#}", e),
                    };
                    clean = false;
                }
            }
        }
        clean
    }
}
