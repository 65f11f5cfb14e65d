//! HTTP client for the control plane API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::{json, Value};

/// Thin wrapper over the control plane REST API.
#[derive(Clone)]
pub struct ControlPlane {
    client: Client,
    base_url: String,
}

impl ControlPlane {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read(response: Response, what: &str) -> Result<Value> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .with_context(|| format!("Failed to parse {what} response"));
        }
        let text = response.text().await.unwrap_or_default();
        bail!("{what} failed: {status} - {text}")
    }

    pub async fn dispatch(&self, commands: &[String], contract: Option<Value>) -> Result<Value> {
        let mut body = json!({ "commands": commands });
        if let Some(contract) = contract {
            body["contract"] = contract;
        }
        let response = self
            .client
            .post(self.url("/api/runs"))
            .json(&body)
            .send()
            .await
            .context("Failed to send dispatch request")?;
        Self::read(response, "dispatch").await
    }

    pub async fn status(&self, run_id: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{run_id}")))
            .send()
            .await
            .context("Failed to send status request")?;
        Self::read(response, "status").await
    }

    pub async fn list(&self, state: Option<&str>, limit: Option<usize>) -> Result<Value> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(state) = state {
            query.push(("state", state.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let response = self
            .client
            .get(self.url("/api/runs"))
            .query(&query)
            .send()
            .await
            .context("Failed to send list request")?;
        Self::read(response, "list").await
    }

    /// One long-poll round; the server caps it at a few minutes.
    pub async fn wait_once(&self, run_id: &str, timeout: Duration) -> Result<Value> {
        let response = self
            .client
            .get(self.url(&format!("/api/runs/{run_id}/wait")))
            .query(&[("timeout_secs", timeout.as_secs())])
            .timeout(timeout + Duration::from_secs(30))
            .send()
            .await
            .context("Failed to send wait request")?;
        Self::read(response, "wait").await
    }

    pub async fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<Value> {
        let response = self
            .client
            .post(self.url(&format!("/api/runs/{run_id}/cancel")))
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .context("Failed to send cancel request")?;
        Self::read(response, "cancel").await
    }

    /// Post a worker callback and return the server's `status` field.
    pub async fn callback<T: Serialize>(&self, kind: &str, body: &T) -> Result<String> {
        let response = self
            .client
            .post(self.url(&format!("/api/callbacks/{kind}")))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send {kind} callback"))?;
        let value = Self::read(response, kind).await?;
        Ok(value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

/// True once the run will not change any more.
pub fn is_settled(run: &Value) -> bool {
    let terminal = matches!(
        run.get("state").and_then(Value::as_str),
        Some("succeeded" | "failed" | "timed_out")
    );
    terminal || run.get("aborted").is_some_and(|a| !a.is_null())
}
