//! NATS run event publisher.
//!
//! Every run state change is published to `<subject>.<state>` on a
//! JetStream stream so downstream consumers (loaders, notifiers) can react
//! to finished exports without polling the API.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{FailureDetail, RunEventPublisher, RunSnapshot, RunState, SinkError};
use crate::ids::RunId;

/// Default subject prefix for run notifications.
pub const DEFAULT_SUBJECT: &str = "pg_dd.runs";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "pg_dd_runs";

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

/// Run notification published to NATS.
///
/// Carries the location of the run's output but never the callback token
/// or the raw command list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNotification {
    pub run_id: RunId,
    pub state: RunState,
    pub bucket: String,
    pub output_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub server_name: String,
}

impl RunNotification {
    pub fn from_snapshot(snapshot: &RunSnapshot, server_name: &str) -> Self {
        Self {
            run_id: snapshot.run_id,
            state: snapshot.state,
            bucket: snapshot.bucket.clone(),
            output_prefix: snapshot.output_prefix.clone(),
            finished_at: snapshot.finished_at,
            failure: snapshot.failure.clone(),
            aborted: snapshot.aborted.clone(),
            server_name: server_name.to_string(),
        }
    }
}

/// Subject a notification is published on.
///
/// Aborted dispatches never leave `pending`, so they get their own leaf.
pub fn subject_for(prefix: &str, snapshot: &RunSnapshot) -> String {
    if snapshot.aborted.is_some() {
        format!("{prefix}.aborted")
    } else {
        format!("{prefix}.{}", snapshot.state)
    }
}

/// NATS JetStream publisher for run notifications.
///
/// Optional: the server runs without NATS and consumers poll the API.
#[derive(Clone)]
pub struct NatsPublisher {
    js: Context,
    subject: String,
    server_name: String,
}

impl NatsPublisher {
    /// Connect to NATS and make sure the stream exists.
    pub async fn connect(
        url: &str,
        subject: Option<&str>,
        stream_name: Option<&str>,
        server_name: &str,
    ) -> Result<Self, NatsError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| NatsError::Connection(e.to_string()))?;
        tracing::info!(url = %url, "Connected to NATS");
        Self::new(client, subject, stream_name, server_name).await
    }

    /// Create a publisher from an existing client.
    pub async fn new(
        client: async_nats::Client,
        subject: Option<&str>,
        stream_name: Option<&str>,
        server_name: &str,
    ) -> Result<Self, NatsError> {
        let subject = subject.unwrap_or(DEFAULT_SUBJECT).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);

        let js = jetstream::new(client);
        Self::ensure_stream(&js, stream, &subject).await?;

        Ok(Self {
            js,
            subject,
            server_name: server_name.to_string(),
        })
    }

    /// Ensure the JetStream stream exists.
    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![format!("{subject}.>")],
                    // Runs may take up to a day; keep a week of history.
                    max_age: std::time::Duration::from_secs(7 * 24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish a notification and wait for the JetStream ack.
    pub async fn publish_notification(
        &self,
        subject: String,
        notification: &RunNotification,
    ) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(notification)
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        self.js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            run_id = %notification.run_id,
            state = %notification.state,
            subject = %subject,
            "Published run notification"
        );

        Ok(())
    }
}

#[async_trait]
impl RunEventPublisher for NatsPublisher {
    async fn publish(&self, snapshot: &RunSnapshot) -> Result<(), SinkError> {
        let notification = RunNotification::from_snapshot(snapshot, &self.server_name);
        self.publish_notification(subject_for(&self.subject, snapshot), &notification)
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FailureSource;
    use chrono::Utc;

    fn snapshot(state: RunState) -> RunSnapshot {
        RunSnapshot {
            run_id: RunId::new(),
            state,
            commands: vec!["SELECT 1".to_string()],
            bucket: "org-pg-dd".to_string(),
            output_prefix: "dumps/run".to_string(),
            created_at: Utc::now(),
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

    #[test]
    fn test_subject_per_state() {
        assert_eq!(
            subject_for(DEFAULT_SUBJECT, &snapshot(RunState::Succeeded)),
            "pg_dd.runs.succeeded"
        );
        assert_eq!(
            subject_for(DEFAULT_SUBJECT, &snapshot(RunState::TimedOut)),
            "pg_dd.runs.timed_out"
        );

        let mut aborted = snapshot(RunState::Pending);
        aborted.aborted = Some("capacity exhausted".to_string());
        assert_eq!(subject_for("x", &aborted), "x.aborted");
    }

    #[test]
    fn test_notification_omits_commands() {
        let mut snap = snapshot(RunState::Failed);
        snap.failure = Some(FailureDetail {
            source: FailureSource::Worker,
            error: "connection refused".to_string(),
            cause: None,
        });

        let notification = RunNotification::from_snapshot(&snap, "pg-dd-control-plane");
        let json = serde_json::to_string(&notification).unwrap();
        assert!(json.contains("connection refused"));
        assert!(json.contains("\"state\":\"failed\""));
        assert!(!json.contains("SELECT 1"));
    }

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_SUBJECT, "pg_dd.runs");
        assert_eq!(DEFAULT_STREAM, "pg_dd_runs");
    }
}
