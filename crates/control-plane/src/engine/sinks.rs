//! Where settled runs go: the archive and the event stream.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::RunSnapshot;
use crate::ids::RunId;

/// Errors from archive or publisher backends. Never change run state.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("archive error: {0}")]
    Archive(String),

    #[error("publish error: {0}")]
    Publish(String),
}

/// Durable record of settled runs.
#[async_trait]
pub trait RunArchive: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Insert or replace the record of a run.
    async fn store(&self, snapshot: &RunSnapshot) -> Result<(), SinkError>;

    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SinkError>;

    /// Most recently created runs first.
    async fn recent(&self, limit: usize) -> Result<Vec<RunSnapshot>, SinkError>;

    async fn healthy(&self) -> bool;
}

/// Receives run state changes.
#[async_trait]
pub trait RunEventPublisher: Send + Sync {
    async fn publish(&self, snapshot: &RunSnapshot) -> Result<(), SinkError>;
}

/// Archive kept in process memory.
#[derive(Default)]
pub struct MemoryArchive {
    runs: RwLock<HashMap<RunId, RunSnapshot>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunArchive for MemoryArchive {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn store(&self, snapshot: &RunSnapshot) -> Result<(), SinkError> {
        self.runs
            .write()
            .await
            .insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SinkError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RunSnapshot>, SinkError> {
        let mut runs: Vec<RunSnapshot> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn healthy(&self) -> bool {
        true
    }
}
