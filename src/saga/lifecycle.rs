use serde::{Deserialize, Serialize};
use statig::prelude::*;

use super::report::SagaOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaPhase {
    Pending,
    Executing,
    Compensating,
    Completed,
    Compensated,
    PartiallyCompensated,
}

impl SagaPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaPhase::Completed | SagaPhase::Compensated | SagaPhase::PartiallyCompensated
        )
    }

    pub fn outcome(self) -> Option<SagaOutcome> {
        match self {
            SagaPhase::Completed => Some(SagaOutcome::Completed),
            SagaPhase::Compensated => Some(SagaOutcome::Compensated),
            SagaPhase::PartiallyCompensated => Some(SagaOutcome::PartiallyCompensated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    AllCommitted,
    StepFailed,
    UnwindFinished { clean: bool },
}

/// Pending -> Executing -> Completed | Compensating -> Compensated | PartiallyCompensated
pub struct SagaLifecycle {
    saga_id: String,
    phase: SagaPhase,
}

impl SagaLifecycle {
    pub fn new(saga_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            phase: SagaPhase::Pending,
        }
    }

    pub fn phase(&self) -> SagaPhase {
        self.phase
    }

    fn enter(&mut self, phase: SagaPhase) {
        tracing::debug!(saga_id = %self.saga_id, from = ?self.phase, to = ?phase, "Saga phase change");
        self.phase = phase;
    }
}

#[state_machine(initial = "State::pending()")]
impl SagaLifecycle {
    #[state]
    fn pending(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => {
                self.enter(SagaPhase::Executing);
                Transition(State::executing())
            }
            _ => Handled,
        }
    }

    #[state]
    fn executing(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::AllCommitted => {
                self.enter(SagaPhase::Completed);
                Transition(State::completed())
            }
            LifecycleEvent::StepFailed => {
                self.enter(SagaPhase::Compensating);
                Transition(State::compensating())
            }
            _ => Handled,
        }
    }

    #[state]
    fn compensating(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::UnwindFinished { clean: true } => {
                self.enter(SagaPhase::Compensated);
                Transition(State::compensated())
            }
            LifecycleEvent::UnwindFinished { clean: false } => {
                self.enter(SagaPhase::PartiallyCompensated);
                Transition(State::partially_compensated())
            }
            _ => Handled,
        }
    }

    #[state]
    fn completed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        tracing::warn!(saga_id = %self.saga_id, ?event, "Event ignored, saga completed");
        Handled
    }

    #[state]
    fn compensated(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        tracing::warn!(saga_id = %self.saga_id, ?event, "Event ignored, saga compensated");
        Handled
    }

    #[state]
    fn partially_compensated(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        tracing::warn!(saga_id = %self.saga_id, ?event, "Event ignored, saga partially compensated");
        Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = SagaLifecycle::new("s1").state_machine();
        sm.handle(&LifecycleEvent::Start);
        assert_eq!(sm.inner().phase(), SagaPhase::Executing);
        sm.handle(&LifecycleEvent::AllCommitted);
        assert_eq!(sm.inner().phase(), SagaPhase::Completed);
        assert_eq!(sm.inner().phase().outcome(), Some(SagaOutcome::Completed));
    }

    #[test]
    fn test_unwind_paths() {
        let mut clean = SagaLifecycle::new("s2").state_machine();
        clean.handle(&LifecycleEvent::Start);
        clean.handle(&LifecycleEvent::StepFailed);
        assert_eq!(clean.inner().phase(), SagaPhase::Compensating);
        clean.handle(&LifecycleEvent::UnwindFinished { clean: true });
        assert_eq!(clean.inner().phase(), SagaPhase::Compensated);

        let mut partial = SagaLifecycle::new("s3").state_machine();
        partial.handle(&LifecycleEvent::Start);
        partial.handle(&LifecycleEvent::StepFailed);
        partial.handle(&LifecycleEvent::UnwindFinished { clean: false });
        assert_eq!(partial.inner().phase(), SagaPhase::PartiallyCompensated);
    }

    #[test]
    fn test_terminal_states_ignore_events() {
        let mut sm = SagaLifecycle::new("s4").state_machine();
        sm.handle(&LifecycleEvent::AllCommitted);
        assert_eq!(sm.inner().phase(), SagaPhase::Pending);
        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::AllCommitted);
        sm.handle(&LifecycleEvent::StepFailed);
        assert_eq!(sm.inner().phase(), SagaPhase::Completed);
        assert!(sm.inner().phase().is_terminal());
    }
}
