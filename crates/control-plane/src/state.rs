//! Application state for the pg-dd control plane.
//!
//! Shared by every handler through Axum's state management.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::contract::WorkerContract;
use crate::engine::Coordinator;
use crate::store::BucketPolicy;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Run registry and supervisor
    pub coordinator: Coordinator,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Contract used when a dispatch request carries none
    pub default_contract: Option<Arc<WorkerContract>>,

    /// Policy applied to the output bucket
    pub store_policy: BucketPolicy,

    /// Whether run notifications go to NATS
    pub nats_enabled: bool,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(coordinator: Coordinator, config: AppConfig) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
            default_contract: None,
            store_policy: BucketPolicy::default(),
            nats_enabled: false,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_default_contract(mut self, contract: WorkerContract) -> Self {
        self.default_contract = Some(Arc::new(contract));
        self
    }

    pub fn with_nats(mut self, enabled: bool) -> Self {
        self.nats_enabled = enabled;
        self
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn has_nats(&self) -> bool {
        self.nats_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchSettings, ProcessLauncher};
    use crate::engine::Sinks;

    fn state() -> AppState {
        let coordinator = Coordinator::new(
            Arc::new(ProcessLauncher::new("/bin/true")),
            DispatchSettings::default(),
            Sinks::default(),
        );
        AppState::new(coordinator, AppConfig::default())
    }

    #[tokio::test]
    async fn test_uptime_starts_near_zero() {
        assert!(state().uptime_seconds() < 5);
    }

    #[tokio::test]
    async fn test_builder_flags() {
        let state = state()
            .with_nats(true)
            .with_default_contract(WorkerContract::default());
        assert!(state.has_nats());
        assert!(state.default_contract.is_some());
    }
}
