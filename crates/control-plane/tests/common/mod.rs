//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use pg_dd_control_plane::contract::{DatabaseExport, OutputLocation, WorkerContract};
use pg_dd_control_plane::dispatch::{
    ComputeLauncher, DispatchError, DispatchSettings, LaunchSpec, WorkerExit, WorkerHandle,
};
use pg_dd_control_plane::engine::{
    Coordinator, MemoryArchive, RunEventPublisher, RunSnapshot, RunState, SinkError, Sinks,
};
use pg_dd_control_plane::ids::RunId;

pub const SECRET_ARN: &str =
    "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:orcabus/master-rds";

/// Contract exporting `SELECT 1` into `t1`.
pub fn contract() -> WorkerContract {
    WorkerContract {
        databases: vec![DatabaseExport::new("db", "SELECT 1", "t1")],
        secret: Some(SECRET_ARN.to_string()),
        output: OutputLocation {
            bucket: Some("org-pg-dd".to_string()),
            prefix: Some("dumps".to_string()),
        },
        ..Default::default()
    }
}

pub fn commands() -> Vec<String> {
    vec!["--exists-ok".to_string()]
}

/// In-memory launcher. Workers run until the test exits them or the
/// coordinator terminates them.
#[derive(Default)]
pub struct ScriptedLauncher {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    fail_launch: AtomicBool,
    workers: Mutex<HashMap<RunId, watch::Sender<Option<WorkerExit>>>>,
    specs: Mutex<HashMap<RunId, LaunchSpec>>,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let launcher = Self::default();
        launcher.fail_launch.store(true, Ordering::SeqCst);
        Arc::new(launcher)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn spec(&self, run_id: &RunId) -> Option<LaunchSpec> {
        self.specs.lock().unwrap().get(run_id).cloned()
    }

    /// Make the worker of `run_id` exit with `code`.
    pub fn exit(&self, run_id: &RunId, code: i32) {
        if let Some(tx) = self.workers.lock().unwrap().get(run_id) {
            tx.send_replace(Some(WorkerExit::Exited { code }));
        }
    }
}

#[async_trait]
impl ComputeLauncher for ScriptedLauncher {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle, DispatchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(DispatchError::Capacity("no nodes available".to_string()));
        }
        let (tx, _) = watch::channel(None);
        self.workers.lock().unwrap().insert(spec.run_id, tx);
        self.specs.lock().unwrap().insert(spec.run_id, spec.clone());
        Ok(WorkerHandle {
            run_id: spec.run_id,
            name: format!("scripted-{}", spec.run_id),
        })
    }

    async fn wait(&self, handle: &WorkerHandle) -> WorkerExit {
        let rx = self
            .workers
            .lock()
            .unwrap()
            .get(&handle.run_id)
            .map(|tx| tx.subscribe());
        let Some(mut rx) = rx else {
            return WorkerExit::Lost {
                reason: "unknown worker".to_string(),
            };
        };
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).clone().unwrap_or(WorkerExit::Lost {
                reason: "no exit".to_string(),
            }),
            Err(_) => WorkerExit::Lost {
                reason: "closed".to_string(),
            },
        };
        exit
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), DispatchError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.workers.lock().unwrap().get(&handle.run_id) {
            tx.send_replace(Some(WorkerExit::Evicted {
                reason: "terminated".to_string(),
            }));
        }
        Ok(())
    }
}

/// Publisher that records every state it sees.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(RunId, RunState)>>,
}

impl RecordingPublisher {
    pub fn states(&self, run_id: &RunId) -> Vec<RunState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl RunEventPublisher for RecordingPublisher {
    async fn publish(&self, snapshot: &RunSnapshot) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap()
            .push((snapshot.run_id, snapshot.state));
        Ok(())
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub launcher: Arc<ScriptedLauncher>,
    pub archive: Arc<MemoryArchive>,
    pub publisher: Arc<RecordingPublisher>,
}

pub fn harness_with(launcher: Arc<ScriptedLauncher>, timeout: Duration) -> Harness {
    let archive = Arc::new(MemoryArchive::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let coordinator = Coordinator::new(
        launcher.clone(),
        DispatchSettings {
            callback_timeout: timeout,
            callback_url: Some("http://pg-dd.test:8082".to_string()),
        },
        Sinks {
            archive: Some(archive.clone()),
            publisher: Some(publisher.clone()),
        },
    );
    Harness {
        coordinator,
        launcher,
        archive,
        publisher,
    }
}

pub fn harness() -> Harness {
    harness_with(ScriptedLauncher::new(), Duration::from_secs(3600))
}
