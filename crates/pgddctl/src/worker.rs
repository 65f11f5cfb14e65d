//! Worker-side callbacks.
//!
//! A worker learns where and how to report from its environment. Without a
//! task token there is nobody to report to and every signal is skipped.

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::client::ControlPlane;

pub const RUN_ID: &str = "PG_DD_RUN_ID";
pub const TASK_TOKEN: &str = "PG_DD_TASK_TOKEN";
pub const CALLBACK_URL: &str = "PG_DD_CALLBACK_URL";
pub const BUCKET: &str = "PG_DD_BUCKET";
pub const PREFIX: &str = "PG_DD_PREFIX";
pub const OUTPUT_PREFIX: &str = "PG_DD_OUTPUT_PREFIX";

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Callback settings read from the worker environment.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub run_id: String,
    pub token: String,
    pub callback_url: String,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
}

impl WorkerEnv {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `None` when there is no task token, or nowhere to send it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let token = lookup(TASK_TOKEN).filter(|t| !t.is_empty())?;
        let Some(callback_url) = lookup(CALLBACK_URL) else {
            tracing::warn!("{TASK_TOKEN} is set but {CALLBACK_URL} is not, skipping callbacks");
            return None;
        };
        let Some(run_id) = lookup(RUN_ID) else {
            tracing::warn!("{TASK_TOKEN} is set but {RUN_ID} is not, skipping callbacks");
            return None;
        };
        Some(Self {
            run_id,
            token,
            callback_url,
            bucket: lookup(BUCKET),
            prefix: lookup(OUTPUT_PREFIX).or_else(|| lookup(PREFIX)),
        })
    }

    /// Output reported on success: where the artifacts were written.
    pub fn output(&self) -> Value {
        json!({
            "bucket": self.bucket,
            "prefix": self.prefix,
        })
    }
}

#[derive(Serialize)]
struct SuccessBody<'a> {
    run_id: &'a str,
    token: &'a str,
    output: Value,
}

#[derive(Serialize)]
struct FailureBody<'a> {
    run_id: &'a str,
    token: &'a str,
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<&'a str>,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    run_id: &'a str,
    token: &'a str,
}

/// Reports a single worker's outcome.
pub struct Reporter {
    env: WorkerEnv,
    api: ControlPlane,
}

impl Reporter {
    pub fn new(env: WorkerEnv) -> Self {
        let api = ControlPlane::new(&env.callback_url);
        Self { env, api }
    }

    pub fn env(&self) -> &WorkerEnv {
        &self.env
    }

    pub async fn success(&self, output: Option<Value>) -> Result<String> {
        let body = SuccessBody {
            run_id: &self.env.run_id,
            token: &self.env.token,
            output: output.unwrap_or_else(|| self.env.output()),
        };
        self.api.callback("success", &body).await
    }

    pub async fn failure(&self, error: &str, cause: Option<&str>) -> Result<String> {
        let body = FailureBody {
            run_id: &self.env.run_id,
            token: &self.env.token,
            error,
            cause,
        };
        self.api.callback("failure", &body).await
    }

    pub async fn heartbeat(&self) -> Result<String> {
        let body = HeartbeatBody {
            run_id: &self.env.run_id,
            token: &self.env.token,
        };
        self.api.callback("heartbeat", &body).await
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Run `program`, heartbeat while it runs and report how it ended.
///
/// Returns the exit code to propagate.
pub async fn exec(
    program: &str,
    args: &[String],
    reporter: Option<Reporter>,
    heartbeat_every: Duration,
) -> Result<i32> {
    let mut child = Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to start {program}"))?;

    let mut ticker = tokio::time::interval(heartbeat_every.max(MIN_HEARTBEAT));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = ticker.tick() => {
                if let Some(reporter) = &reporter {
                    if let Err(e) = reporter.heartbeat().await {
                        tracing::warn!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    };

    let Some(reporter) = reporter else {
        tracing::debug!("No task token, outcome not reported");
        return Ok(match &status {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        });
    };

    match status {
        Ok(status) if status.success() => {
            let answer = reporter.success(None).await?;
            tracing::info!(status = %answer, "Reported success");
            Ok(0)
        }
        Ok(status) => {
            let error = format!("{program} {}", describe_exit(&status));
            let answer = reporter.failure(&error, None).await?;
            tracing::info!(status = %answer, error = %error, "Reported failure");
            Ok(status.code().unwrap_or(1))
        }
        Err(e) => {
            let error = format!("waiting for {program} failed");
            let cause = e.to_string();
            reporter.failure(&error, Some(&cause)).await?;
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_no_token_skips() {
        let env = WorkerEnv::from_lookup(lookup(&[(CALLBACK_URL, "http://cp"), (RUN_ID, "r")]));
        assert!(env.is_none());
    }

    #[test]
    fn test_empty_token_skips() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (TASK_TOKEN, ""),
            (CALLBACK_URL, "http://cp"),
            (RUN_ID, "r"),
        ]));
        assert!(env.is_none());
    }

    #[test]
    fn test_output_prefers_run_partition() {
        let env = WorkerEnv::from_lookup(lookup(&[
            (TASK_TOKEN, "t"),
            (CALLBACK_URL, "http://cp"),
            (RUN_ID, "r"),
            (BUCKET, "org-pg-dd"),
            (PREFIX, "dumps"),
            (OUTPUT_PREFIX, "dumps/r"),
        ]))
        .unwrap();
        assert_eq!(env.output(), json!({"bucket": "org-pg-dd", "prefix": "dumps/r"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_without_reporter_propagates_code() {
        let code = exec(
            "/bin/sh",
            &["-c".to_string(), "exit 4".to_string()],
            None,
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(code, 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_with_zero_heartbeat_interval() {
        let code = tokio_test::assert_ok!(
            exec(
                "/bin/sh",
                &["-c".to_string(), "exit 0".to_string()],
                None,
                Duration::ZERO,
            )
            .await
        );
        assert_eq!(code, 0);
    }
}
