use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use super::signal::{DeliveryState, Signal, SignalKind};
use crate::models::ExecutionId;
use crate::persistence::{SnapshotFile, StoreError};

/// Durable record of emitted signals and their delivery state
#[async_trait]
pub trait SignalLog: Send + Sync {
    /// Persist a new signal in `Pending` state and return it with its id
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<Signal, StoreError>;

    async fn update_state(&self, id: u64, state: DeliveryState) -> Result<(), StoreError>;

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError>;

    /// Signals in emission order, optionally for one mapping
    async fn list(&self, execution_id: Option<&ExecutionId>) -> Result<Vec<Signal>, StoreError>;

    /// Pending or in-delivery signals in emission order
    async fn unsettled(&self) -> Result<Vec<Signal>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SignalLogState {
    next_id: u64,
    signals: Vec<Signal>,
}

impl SignalLogState {
    fn append(
        &mut self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Signal {
        self.next_id += 1;
        let now = Utc::now();
        let signal = Signal {
            id: self.next_id,
            execution_id: execution_id.clone(),
            kind,
            payload,
            state: DeliveryState::Pending,
            emitted_at: now,
            updated_at: now,
        };
        self.signals.push(signal.clone());
        signal
    }

    fn update_state(&mut self, id: u64, state: DeliveryState) -> Result<(), StoreError> {
        // ids are allocated in order, so the vector stays sorted
        let index = self
            .signals
            .binary_search_by_key(&id, |s| s.id)
            .map_err(|_| StoreError::NotFound(format!("signal {}", id)))?;
        let signal = &mut self.signals[index];
        signal.state = state;
        signal.updated_at = Utc::now();
        Ok(())
    }

    fn get(&self, id: u64) -> Option<Signal> {
        self.signals
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|i| self.signals[i].clone())
    }

    fn list(&self, execution_id: Option<&ExecutionId>) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|s| execution_id.map_or(true, |id| &s.execution_id == id))
            .cloned()
            .collect()
    }

    fn unsettled(&self) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|s| !s.state.is_settled())
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct MemorySignalLog {
    state: Mutex<SignalLogState>,
}

impl MemorySignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SignalLogState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SignalLog for MemorySignalLog {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<Signal, StoreError> {
        Ok(self.lock().append(execution_id, kind, payload))
    }

    async fn update_state(&self, id: u64, state: DeliveryState) -> Result<(), StoreError> {
        self.lock().update_state(id, state)
    }

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError> {
        Ok(self.lock().get(id))
    }

    async fn list(&self, execution_id: Option<&ExecutionId>) -> Result<Vec<Signal>, StoreError> {
        Ok(self.lock().list(execution_id))
    }

    async fn unsettled(&self) -> Result<Vec<Signal>, StoreError> {
        Ok(self.lock().unsettled())
    }
}

/// Signal log persisted as a JSON document, written through on every change
pub struct FileSignalLog {
    state: tokio::sync::Mutex<SignalLogState>,
    file: SnapshotFile,
}

impl FileSignalLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = SnapshotFile::open(path)?;
        let state: SignalLogState = file.load().await?.unwrap_or_default();
        info!(
            path = %file.path().display(),
            signals = state.signals.len(),
            unsettled = state.unsettled().len(),
            "Opened signal log"
        );
        Ok(Self {
            state: tokio::sync::Mutex::new(state),
            file,
        })
    }

    async fn write<T>(
        &self,
        apply: impl FnOnce(&mut SignalLogState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = apply(&mut next)?;
        self.file.save(&next).await?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl SignalLog for FileSignalLog {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<Signal, StoreError> {
        self.write(|s| Ok(s.append(execution_id, kind, payload))).await
    }

    async fn update_state(&self, id: u64, state: DeliveryState) -> Result<(), StoreError> {
        self.write(|s| s.update_state(id, state)).await
    }

    async fn get(&self, id: u64) -> Result<Option<Signal>, StoreError> {
        Ok(self.state.lock().await.get(id))
    }

    async fn list(&self, execution_id: Option<&ExecutionId>) -> Result<Vec<Signal>, StoreError> {
        Ok(self.state.lock().await.list(execution_id))
    }

    async fn unsettled(&self) -> Result<Vec<Signal>, StoreError> {
        Ok(self.state.lock().await.unsettled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_log_tracks_delivery_state() {
        let log = MemorySignalLog::new();
        let wf = ExecutionId::new("wf-1");
        let first = log
            .append(&wf, SignalKind::StepCompleted, serde_json::json!({}))
            .await
            .unwrap();
        let second = log
            .append(&wf, SignalKind::AgentHandoff, serde_json::json!({}))
            .await
            .unwrap();
        assert!(second.id > first.id);

        log.update_state(first.id, DeliveryState::Handled { attempts: 1 })
            .await
            .unwrap();
        let unsettled = log.unsettled().await.unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].id, second.id);

        assert!(matches!(
            log.update_state(99, DeliveryState::Pending).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signals.json");
        let wf = ExecutionId::new("wf-2");

        {
            let log = FileSignalLog::open(&path).await.unwrap();
            let signal = log
                .append(&wf, SignalKind::StepFailed, serde_json::json!({"step_number": 1}))
                .await
                .unwrap();
            log.update_state(signal.id, DeliveryState::Delivering { attempts: 1 })
                .await
                .unwrap();
        }

        let log = FileSignalLog::open(&path).await.unwrap();
        let unsettled = log.unsettled().await.unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].state, DeliveryState::Delivering { attempts: 1 });
        let next = log
            .append(&wf, SignalKind::StepCompleted, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(log.list(Some(&wf)).await.unwrap().len(), 2);
    }
}
