//! Compute launcher abstraction.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DispatchError;
use crate::contract::{env, WorkerDescriptor};
use crate::ids::RunId;
use crate::provisioner::CapabilityGrant;

/// Everything needed to start one worker instance.
#[derive(Clone)]
pub struct LaunchSpec {
    pub run_id: RunId,
    /// Rendered container command.
    pub commands: Vec<String>,
    /// Full worker environment, including the callback token.
    pub env: BTreeMap<String, String>,
    pub descriptor: Arc<WorkerDescriptor>,
    pub grant: Arc<CapabilityGrant>,
    /// Hard ceiling on the worker's lifetime.
    pub timeout: Duration,
}

impl LaunchSpec {
    /// Environment without the callback token.
    pub fn public_env(&self) -> impl Iterator<Item = (&String, &String)> {
        self.env.iter().filter(|(k, _)| k.as_str() != env::TASK_TOKEN)
    }

    pub fn task_token(&self) -> Option<&str> {
        self.env.get(env::TASK_TOKEN).map(String::as_str)
    }
}

impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("run_id", &self.run_id)
            .field("commands", &self.commands)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Reference to a launched worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub run_id: RunId,
    /// Launcher-specific name (job name, process id).
    pub name: String,
}

/// How a worker instance ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerExit {
    /// The container process exited.
    Exited { code: i32 },
    /// The platform removed the instance (node pressure, preemption).
    Evicted { reason: String },
    /// The instance vanished or could not be observed any more.
    Lost { reason: String },
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with status {code}"),
            Self::Evicted { reason } => write!(f, "evicted: {reason}"),
            Self::Lost { reason } => write!(f, "lost: {reason}"),
        }
    }
}

/// Starts, observes and stops worker instances.
///
/// One `launch` call must start at most one instance; implementations never
/// retry a failed worker.
#[async_trait]
pub trait ComputeLauncher: Send + Sync {
    /// Short name used in logs and health output.
    fn kind(&self) -> &'static str;

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle, DispatchError>;

    /// Resolve once the instance has terminated.
    async fn wait(&self, handle: &WorkerHandle) -> WorkerExit;

    /// Ask the instance to stop. Stopping an instance that already ended is
    /// not an error.
    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_exit_display() {
        assert_eq!(
            WorkerExit::Exited { code: 3 }.to_string(),
            "exited with status 3"
        );
        assert_eq!(
            WorkerExit::Evicted {
                reason: "node pressure".to_string()
            }
            .to_string(),
            "evicted: node pressure"
        );
    }

    #[test]
    fn test_worker_exit_serde() {
        let exit: WorkerExit = serde_json::from_str(r#"{"kind":"exited","code":0}"#).unwrap();
        assert_eq!(exit, WorkerExit::Exited { code: 0 });
    }
}
