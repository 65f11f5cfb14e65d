//! Completion coordinator.
//!
//! Owns every run for its lifetime. Each run lives behind its own lock and
//! publishes snapshots on a `watch` channel; the registry only maps ids to
//! runs. One supervisor task per running run races the deadline, the
//! compute exit and callback/cancel notifications. Whichever trigger
//! performs the terminal transition also archives and publishes the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep_until, Instant};

use super::run::{CallbackSignal, Run, RunEvent, RunSnapshot, RunState, Transition};
use super::sinks::{RunArchive, RunEventPublisher};
use crate::contract::WorkerContract;
use crate::dispatch::{
    CallbackToken, ComputeLauncher, DispatchError, DispatchSettings, Dispatcher, WorkerHandle,
};
use crate::ids::RunId;
use crate::result_ext::ResultExt;

const SECURITY_TARGET: &str = "pg_dd::security";

/// Outcome of delivering a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The callback moved the run to a terminal state.
    Applied,
    /// Heartbeat recorded.
    Recorded,
    /// Unknown run or wrong token.
    Rejected,
    /// Valid token but the run has already settled.
    Discarded,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub run_id: RunId,
    pub token: CallbackToken,
    pub snapshot: RunSnapshot,
}

/// Optional destinations for settled runs.
#[derive(Clone, Default)]
pub struct Sinks {
    pub archive: Option<Arc<dyn RunArchive>>,
    pub publisher: Option<Arc<dyn RunEventPublisher>>,
}

struct RunSlot {
    run: Mutex<Run>,
    updates: watch::Sender<RunSnapshot>,
}

struct Inner {
    dispatcher: Dispatcher,
    runs: RwLock<HashMap<RunId, Arc<RunSlot>>>,
    sinks: Sinks,
}

/// Starts runs and drives them to exactly one terminal state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(launcher: Arc<dyn ComputeLauncher>, settings: DispatchSettings, sinks: Sinks) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(launcher, settings),
                runs: RwLock::new(HashMap::new()),
                sinks,
            }),
        }
    }

    pub fn launcher_kind(&self) -> &'static str {
        self.inner.dispatcher.launcher().kind()
    }

    pub fn archive(&self) -> Option<&Arc<dyn RunArchive>> {
        self.inner.sinks.archive.as_ref()
    }

    pub fn callback_timeout(&self) -> Duration {
        self.inner.dispatcher.settings().callback_timeout
    }

    async fn slot(&self, run_id: &RunId) -> Option<Arc<RunSlot>> {
        self.inner.runs.read().await.get(run_id).cloned()
    }

    /// Validate, launch one worker and start supervising it.
    ///
    /// Configuration errors are returned before anything is registered.
    /// A launch failure leaves the run registered and archived as aborted.
    pub async fn dispatch(
        &self,
        commands: Vec<String>,
        contract: WorkerContract,
    ) -> Result<Dispatched, DispatchError> {
        let prepared = self.inner.dispatcher.prepare(commands, contract)?;
        let run_id = prepared.run_id;

        let run = Run::new(
            run_id,
            prepared.token.clone(),
            prepared.spec.commands.clone(),
            prepared.descriptor.clone(),
            prepared.spec.timeout,
            Utc::now(),
        );
        let (updates, _) = watch::channel(run.snapshot());
        let slot = Arc::new(RunSlot {
            run: Mutex::new(run),
            updates,
        });

        // Callbacks that race the launch block on this lock until the run
        // is Running.
        let mut run = slot.run.lock().await;
        self.inner.runs.write().await.insert(run_id, slot.clone());

        match self.inner.dispatcher.launch(&prepared).await {
            Ok(handle) => {
                run.apply(
                    RunEvent::Launched {
                        worker: handle.name.clone(),
                    },
                    Utc::now(),
                );
                let snapshot = run.snapshot();
                slot.updates.send_replace(snapshot.clone());
                drop(run);

                tracing::info!(run_id = %run_id, worker = %handle.name, "Run started");
                self.publish(&snapshot).await;
                self.spawn_supervisor(slot, handle);

                Ok(Dispatched {
                    run_id,
                    token: prepared.token,
                    snapshot,
                })
            }
            Err(e) => {
                run.apply(
                    RunEvent::LaunchFailed {
                        error: e.to_string(),
                    },
                    Utc::now(),
                );
                let snapshot = run.snapshot();
                slot.updates.send_replace(snapshot.clone());
                drop(run);

                tracing::warn!(run_id = %run_id, error = %e, "Run aborted before start");
                self.finalize(&snapshot).await;
                Err(e)
            }
        }
    }

    /// Apply one event under the run's lock and fan out the result.
    async fn apply(&self, slot: &RunSlot, event: RunEvent) -> Transition {
        let mut run = slot.run.lock().await;
        let transition = run.apply(event, Utc::now());

        match transition {
            Transition::Finished(_) | Transition::Aborted => {
                let snapshot = run.snapshot();
                slot.updates.send_replace(snapshot.clone());
                drop(run);
                self.finalize(&snapshot).await;
            }
            Transition::Started | Transition::Recorded => {
                slot.updates.send_replace(run.snapshot());
            }
            Transition::Rejected(_) | Transition::Discarded | Transition::Ignored => {}
        }

        transition
    }

    async fn finalize(&self, snapshot: &RunSnapshot) {
        match &snapshot.failure {
            Some(failure) => tracing::info!(
                run_id = %snapshot.run_id,
                state = %snapshot.state,
                error = %failure.error,
                "Run finished"
            ),
            None => tracing::info!(
                run_id = %snapshot.run_id,
                state = %snapshot.state,
                "Run finished"
            ),
        }

        if let Some(archive) = &self.inner.sinks.archive {
            let _ = archive
                .store(snapshot)
                .await
                .log(format!("archiving run {}", snapshot.run_id));
        }
        self.publish(snapshot).await;
    }

    async fn publish(&self, snapshot: &RunSnapshot) {
        if let Some(publisher) = &self.inner.sinks.publisher {
            let _ = publisher
                .publish(snapshot)
                .await
                .log_warn(format!("publishing run {} ({})", snapshot.run_id, snapshot.state));
        }
    }

    fn spawn_supervisor(&self, slot: Arc<RunSlot>, handle: WorkerHandle) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.supervise(slot, handle).await });
    }

    async fn supervise(&self, slot: Arc<RunSlot>, handle: WorkerHandle) {
        let launcher = self.inner.dispatcher.launcher().clone();
        let deadline = Instant::now() + self.callback_timeout();
        let mut updates = slot.updates.subscribe();

        let exit = launcher.wait(&handle);
        tokio::pin!(exit);
        let mut compute_alive = true;

        loop {
            if updates.borrow_and_update().is_settled() {
                break;
            }

            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.apply(&slot, RunEvent::DeadlineElapsed).await;
                }
                exit = &mut exit, if compute_alive => {
                    compute_alive = false;
                    tracing::debug!(run_id = %handle.run_id, exit = %exit, "Worker compute ended");
                    self.apply(&slot, RunEvent::ComputeExited(exit)).await;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if !compute_alive {
            return;
        }

        let (state, cancelled) = {
            let run = slot.run.lock().await;
            (run.state(), run.is_cancelled())
        };
        let grace = self.stop_grace(&slot).await;

        // A worker that reported its outcome gets the stop grace to exit on
        // its own; timed out or cancelled workers are stopped at once.
        let stop_now = state == RunState::TimedOut || cancelled;
        if !stop_now && tokio::time::timeout(grace, &mut exit).await.is_ok() {
            return;
        }

        tracing::info!(run_id = %handle.run_id, worker = %handle.name, state = %state, "Stopping worker");
        if let Err(e) = launcher.terminate(&handle).await {
            tracing::error!(run_id = %handle.run_id, error = %e, "Failed to stop worker");
            return;
        }
        if tokio::time::timeout(grace, &mut exit).await.is_err() {
            tracing::warn!(run_id = %handle.run_id, worker = %handle.name, "Worker did not exit after stop");
        }
    }

    async fn stop_grace(&self, slot: &RunSlot) -> Duration {
        slot.run.lock().await.stop_timeout()
    }

    /// Deliver a worker callback.
    pub async fn signal(&self, run_id: &RunId, token: &str, signal: CallbackSignal) -> SignalOutcome {
        let kind = signal.kind();
        let Some(slot) = self.slot(run_id).await else {
            tracing::warn!(target: SECURITY_TARGET, run_id = %run_id, kind, "Callback for unknown run rejected");
            return SignalOutcome::Rejected;
        };

        let transition = self
            .apply(
                &slot,
                RunEvent::Callback {
                    token: token.to_string(),
                    signal,
                },
            )
            .await;

        match transition {
            Transition::Finished(state) => {
                tracing::debug!(run_id = %run_id, kind, state = %state, "Callback applied");
                SignalOutcome::Applied
            }
            Transition::Recorded => SignalOutcome::Recorded,
            Transition::Rejected(reason) => {
                tracing::warn!(
                    target: SECURITY_TARGET,
                    run_id = %run_id,
                    kind,
                    reason = ?reason,
                    "Callback rejected"
                );
                SignalOutcome::Rejected
            }
            Transition::Discarded | Transition::Ignored | Transition::Started | Transition::Aborted => {
                tracing::warn!(
                    target: SECURITY_TARGET,
                    run_id = %run_id,
                    kind,
                    "Callback for settled run discarded"
                );
                SignalOutcome::Discarded
            }
        }
    }

    /// Force a run to `Failed`. Idempotent; settled runs are returned as-is.
    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> Option<RunSnapshot> {
        let Some(slot) = self.slot(run_id).await else {
            return self.archived(run_id).await;
        };
        let transition = self
            .apply(
                &slot,
                RunEvent::Cancelled {
                    reason: reason.to_string(),
                },
            )
            .await;
        if transition == Transition::Finished(RunState::Failed) {
            tracing::info!(run_id = %run_id, reason = %reason, "Run cancelled");
        }
        let snapshot = slot.updates.borrow().clone();
        Some(snapshot)
    }

    pub async fn snapshot(&self, run_id: &RunId) -> Option<RunSnapshot> {
        match self.slot(run_id).await {
            Some(slot) => Some(slot.updates.borrow().clone()),
            None => self.archived(run_id).await,
        }
    }

    async fn archived(&self, run_id: &RunId) -> Option<RunSnapshot> {
        let archive = self.inner.sinks.archive.as_ref()?;
        match archive.load(run_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Failed to load archived run");
                None
            }
        }
    }

    /// Runs held in memory, newest first.
    pub async fn list(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self
            .inner
            .runs
            .read()
            .await
            .values()
            .map(|slot| slot.updates.borrow().clone())
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    /// Wait until the run settles or `timeout` elapses; returns the latest
    /// snapshot either way.
    pub async fn wait(&self, run_id: &RunId, timeout: Duration) -> Option<RunSnapshot> {
        let Some(slot) = self.slot(run_id).await else {
            return self.archived(run_id).await;
        };
        let mut rx = slot.updates.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            rx.wait_for(RunSnapshot::is_settled).await.is_ok()
        })
        .await;
        if matches!(settled, Err(_) | Ok(false)) {
            tracing::debug!(run_id = %run_id, "Wait returned before the run settled");
        }
        let snapshot = rx.borrow().clone();
        Some(snapshot)
    }

    /// Drop settled runs that finished more than `older_than` ago from
    /// memory. Returns how many were removed.
    pub async fn prune_terminal(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let mut runs = self.inner.runs.write().await;
        let before = runs.len();
        runs.retain(|_, slot| {
            let snapshot = slot.updates.borrow();
            !(snapshot.is_settled() && snapshot.finished_at.is_some_and(|t| t <= cutoff))
        });
        let removed = before - runs.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = runs.len(), "Pruned settled runs");
        }
        removed
    }

    /// Number of in-memory runs per state.
    pub async fn state_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for slot in self.inner.runs.read().await.values() {
            let state = slot.updates.borrow().state;
            *counts.entry(state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

