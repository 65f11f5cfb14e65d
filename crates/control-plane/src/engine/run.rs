//! Run state machine.
//!
//! Every trigger that can move a run (launch, callbacks, compute exit,
//! deadline, cancellation) is expressed as a [`RunEvent`] and applied through
//! [`Run::apply`]. The caller holds the run's lock while applying, so exactly
//! one event can perform the terminal transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::WorkerDescriptor;
use crate::dispatch::{CallbackToken, WorkerExit};
use crate::ids::RunId;
use crate::sanitize::sanitize_sensitive_data;
use crate::store::OutputLayout;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal carried by a worker callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackSignal {
    Success { output: Value },
    Failure { error: String, cause: Option<String> },
    Heartbeat,
}

impl CallbackSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Something that happened to a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Launched { worker: String },
    LaunchFailed { error: String },
    Callback { token: String, signal: CallbackSignal },
    ComputeExited(WorkerExit),
    DeadlineElapsed,
    Cancelled { reason: String },
}

/// Why a callback was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TokenMismatch,
    NotStarted,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `Pending -> Running`.
    Started,
    /// The run stays `Pending` for good: compute could not be acquired.
    Aborted,
    /// A terminal state was entered by this event.
    Finished(RunState),
    /// Heartbeat recorded; state unchanged.
    Recorded,
    Rejected(Rejection),
    /// Valid but too late: the run has already settled.
    Discarded,
    /// Event has no effect in the current state.
    Ignored,
}

/// Who or what caused a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    /// The worker reported the failure.
    Worker,
    /// Inferred from how the compute ended.
    Compute,
    Timeout,
    Operator,
    Dispatch,
}

/// Failure details kept on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub source: FailureSource,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Read-only view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub state: RunState,
    pub commands: Vec<String>,
    pub bucket: String,
    /// Key partition the run writes to.
    pub output_prefix: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default)]
    pub cancelled: bool,
    /// Set when dispatch failed and the run never left `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl RunSnapshot {
    /// Terminal, or aborted before it ever ran.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() || self.aborted.is_some()
    }
}

/// One export run. Owned by the coordinator.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    token: CallbackToken,
    token_consumed: bool,
    commands: Vec<String>,
    descriptor: Arc<WorkerDescriptor>,
    timeout: Duration,
    state: RunState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    heartbeats: u64,
    worker: Option<String>,
    output: Option<Value>,
    failure: Option<FailureDetail>,
    cancelled: bool,
    aborted: Option<String>,
}

impl Run {
    pub fn new(
        id: RunId,
        token: CallbackToken,
        commands: Vec<String>,
        descriptor: Arc<WorkerDescriptor>,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            token,
            token_consumed: false,
            commands,
            descriptor,
            timeout,
            state: RunState::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            deadline: None,
            last_heartbeat_at: None,
            heartbeats: 0,
            worker: None,
            output: None,
            failure: None,
            cancelled: false,
            aborted: None,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() || self.aborted.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Grace period between a stop request and a forced kill.
    pub fn stop_timeout(&self) -> Duration {
        self.descriptor.stop_timeout()
    }

    /// Apply one event at time `now`.
    pub fn apply(&mut self, event: RunEvent, now: DateTime<Utc>) -> Transition {
        match event {
            RunEvent::Launched { worker } => self.on_launched(worker, now),
            RunEvent::LaunchFailed { error } => self.on_launch_failed(error, now),
            RunEvent::Callback { token, signal } => self.on_callback(&token, signal, now),
            RunEvent::ComputeExited(exit) => self.on_compute_exited(exit, now),
            RunEvent::DeadlineElapsed => {
                if self.state != RunState::Running {
                    return Transition::Ignored;
                }
                let failure = FailureDetail {
                    source: FailureSource::Timeout,
                    error: format!(
                        "no completion callback within {}s",
                        self.timeout.as_secs()
                    ),
                    cause: None,
                };
                self.finish(RunState::TimedOut, None, Some(failure), now)
            }
            RunEvent::Cancelled { reason } => {
                if self.is_settled() {
                    return Transition::Ignored;
                }
                self.cancelled = true;
                let failure = FailureDetail {
                    source: FailureSource::Operator,
                    error: format!("cancelled: {reason}"),
                    cause: None,
                };
                self.finish(RunState::Failed, None, Some(failure), now)
            }
        }
    }

    fn on_launched(&mut self, worker: String, now: DateTime<Utc>) -> Transition {
        if self.state != RunState::Pending || self.aborted.is_some() {
            return Transition::Ignored;
        }
        self.state = RunState::Running;
        self.started_at = Some(now);
        self.deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        self.worker = Some(worker);
        Transition::Started
    }

    fn on_launch_failed(&mut self, error: String, now: DateTime<Utc>) -> Transition {
        if self.state != RunState::Pending || self.aborted.is_some() {
            return Transition::Ignored;
        }
        self.token_consumed = true;
        self.finished_at = Some(now);
        self.failure = Some(FailureDetail {
            source: FailureSource::Dispatch,
            error: error.clone(),
            cause: None,
        });
        self.aborted = Some(error);
        Transition::Aborted
    }

    fn on_callback(&mut self, token: &str, signal: CallbackSignal, now: DateTime<Utc>) -> Transition {
        if !self.token.matches(token) {
            return Transition::Rejected(Rejection::TokenMismatch);
        }
        if self.token_consumed || self.is_settled() {
            return Transition::Discarded;
        }
        if self.state == RunState::Pending {
            return Transition::Rejected(Rejection::NotStarted);
        }

        match signal {
            CallbackSignal::Heartbeat => {
                self.last_heartbeat_at = Some(now);
                self.heartbeats += 1;
                Transition::Recorded
            }
            CallbackSignal::Success { output } => {
                let output = sanitize_sensitive_data(&output);
                self.finish(RunState::Succeeded, Some(output), None, now)
            }
            CallbackSignal::Failure { error, cause } => {
                let failure = FailureDetail {
                    source: FailureSource::Worker,
                    error,
                    cause,
                };
                self.finish(RunState::Failed, None, Some(failure), now)
            }
        }
    }

    fn on_compute_exited(&mut self, exit: WorkerExit, now: DateTime<Utc>) -> Transition {
        if self.state != RunState::Running {
            return Transition::Ignored;
        }
        let error = match &exit {
            WorkerExit::Exited { code: 0 } => {
                "worker exited without reporting completion".to_string()
            }
            other => format!("worker {other}"),
        };
        let failure = FailureDetail {
            source: FailureSource::Compute,
            error,
            cause: None,
        };
        self.finish(RunState::Failed, None, Some(failure), now)
    }

    fn finish(
        &mut self,
        state: RunState,
        output: Option<Value>,
        failure: Option<FailureDetail>,
        now: DateTime<Utc>,
    ) -> Transition {
        self.state = state;
        self.token_consumed = true;
        self.finished_at = Some(now);
        self.output = output;
        self.failure = failure;
        Transition::Finished(state)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let layout = OutputLayout::for_descriptor(&self.descriptor);
        RunSnapshot {
            run_id: self.id,
            state: self.state,
            commands: self.commands.clone(),
            bucket: layout.bucket().to_string(),
            output_prefix: layout.run_prefix(&self.id),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            deadline: self.deadline,
            last_heartbeat_at: self.last_heartbeat_at,
            heartbeats: self.heartbeats,
            worker: self.worker.clone(),
            output: self.output.clone(),
            failure: self.failure.clone(),
            cancelled: self.cancelled,
            aborted: self.aborted.clone(),
        }
    }
}
