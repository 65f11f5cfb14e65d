//! Local process launcher.
//!
//! Runs a configured worker program as a child process with the worker
//! environment. Used for development and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};

use super::{ComputeLauncher, DispatchError, LaunchSpec, WorkerExit, WorkerHandle};

struct ChildSlot {
    exit: watch::Receiver<Option<WorkerExit>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Launches workers as local child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    children: Mutex<HashMap<String, ChildSlot>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl ComputeLauncher for ProcessLauncher {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle, DispatchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&spec.commands)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let mut child = command.spawn().map_err(|e| {
            DispatchError::Launch(format!("failed to spawn {}: {e}", self.program.display()))
        })?;

        let name = match child.id() {
            Some(pid) => format!("pid-{pid}"),
            None => format!("pg-dd-{}", spec.run_id),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let worker = name.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(worker = %worker, error = %e, "Failed to kill worker process");
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => match status.code() {
                    Some(code) => WorkerExit::Exited { code },
                    None => WorkerExit::Evicted {
                        reason: "terminated by signal".to_string(),
                    },
                },
                Err(e) => WorkerExit::Lost {
                    reason: e.to_string(),
                },
            };
            tracing::debug!(worker = %worker, exit = %exit, "Worker process ended");
            let _ = exit_tx.send(Some(exit));
        });

        self.children.lock().await.insert(
            name.clone(),
            ChildSlot {
                exit: exit_rx,
                kill: Some(kill_tx),
            },
        );

        Ok(WorkerHandle {
            run_id: spec.run_id,
            name,
        })
    }

    async fn wait(&self, handle: &WorkerHandle) -> WorkerExit {
        let rx = self
            .children
            .lock()
            .await
            .get(&handle.name)
            .map(|slot| slot.exit.clone());

        let Some(mut rx) = rx else {
            return WorkerExit::Lost {
                reason: format!("unknown worker {}", handle.name),
            };
        };

        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).clone().unwrap_or(WorkerExit::Lost {
                reason: "no exit status".to_string(),
            }),
            Err(_) => WorkerExit::Lost {
                reason: "exit status channel closed".to_string(),
            },
        };

        self.children.lock().await.remove(&handle.name);
        exit
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), DispatchError> {
        let mut children = self.children.lock().await;
        if let Some(kill) = children.get_mut(&handle.name).and_then(|slot| slot.kill.take()) {
            // The child may already be gone, in which case nobody listens.
            let _ = kill.send(());
            tracing::info!(worker = %handle.name, "Killed worker process");
        }
        Ok(())
    }
}
