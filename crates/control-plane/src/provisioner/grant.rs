//! Per-run capability grants.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::contract::{normalize_prefix, validate_bucket, WorkerDescriptor};
use crate::ids::RunId;
use crate::store::OutputLayout;

pub const PUT_OBJECT: &str = "s3:PutObject";
pub const GET_SECRET_VALUE: &str = "secretsmanager:GetSecretValue";
pub const SEND_TASK_SUCCESS: &str = "states:SendTaskSuccess";
pub const SEND_TASK_FAILURE: &str = "states:SendTaskFailure";
pub const SEND_TASK_HEARTBEAT: &str = "states:SendTaskHeartbeat";

/// Errors raised while deriving a grant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("malformed output location: {0}")]
    MalformedOutput(String),

    #[error("malformed secret reference: {0}")]
    MalformedSecret(String),

    #[error("resource '{0}' is not scoped to a single run")]
    UnscopedResource(String),
}

/// One allow statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantStatement {
    pub sid: &'static str,
    pub actions: Vec<&'static str>,
    pub resources: Vec<String>,
}

/// Permissions attached to a run's worker identity.
///
/// Write access is limited to the run's output partition, read access to one
/// secret version family, and the callback signals to this run only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityGrant {
    run_id: RunId,
    statements: Vec<GrantStatement>,
}

/// Resource identifying the callback channel of one run.
pub fn callback_resource(run_id: &RunId) -> String {
    format!("callback:{run_id}")
}

/// Derive the capability grant of a run. Pure.
pub fn grant_for(
    run_id: &RunId,
    descriptor: &WorkerDescriptor,
) -> Result<CapabilityGrant, ProvisionError> {
    validate_bucket(descriptor.bucket())
        .map_err(|e| ProvisionError::MalformedOutput(e.to_string()))?;
    if let Some(prefix) = descriptor.prefix() {
        match normalize_prefix(Some(prefix)) {
            Ok(Some(normalized)) if normalized == prefix => {}
            _ => return Err(ProvisionError::MalformedOutput(format!("prefix '{prefix}'"))),
        }
    }

    let secret = descriptor.secret();
    if secret.name().contains('*') {
        return Err(ProvisionError::MalformedSecret(secret.to_string()));
    }

    let layout = OutputLayout::for_descriptor(descriptor);
    let statements = vec![
        GrantStatement {
            sid: "WriteRunOutput",
            actions: vec![PUT_OBJECT],
            resources: vec![layout.run_objects_arn(secret.partition(), run_id)],
        },
        GrantStatement {
            sid: "ReadDatabaseSecret",
            actions: vec![GET_SECRET_VALUE],
            resources: vec![secret.version_family()],
        },
        GrantStatement {
            sid: "SendRunCallbacks",
            actions: vec![SEND_TASK_SUCCESS, SEND_TASK_FAILURE, SEND_TASK_HEARTBEAT],
            resources: vec![callback_resource(run_id)],
        },
    ];

    for resource in statements.iter().flat_map(|s| &s.resources) {
        check_scoped(resource)?;
    }

    Ok(CapabilityGrant {
        run_id: *run_id,
        statements,
    })
}

/// Reject bare wildcards, bucket-wide object patterns, a `*` anywhere but
/// the final character and `?` outside the trailing run of wildcards.
fn check_scoped(resource: &str) -> Result<(), ProvisionError> {
    let unscoped = || ProvisionError::UnscopedResource(resource.to_string());

    if resource == "*" {
        return Err(unscoped());
    }
    if let Some(pos) = resource.find('*') {
        if pos != resource.len() - 1 {
            return Err(unscoped());
        }
    }
    let literal = resource.trim_end_matches(['?', '*']);
    if literal.is_empty() || literal.contains('?') {
        return Err(unscoped());
    }
    if let Some(path) = resource.split(":::").nth(1) {
        // arn:<partition>:s3:::<bucket>/<key pattern>
        match path.split_once('/') {
            Some((_, key)) if key != "*" && !key.is_empty() => {}
            _ => return Err(unscoped()),
        }
    }
    Ok(())
}

impl CapabilityGrant {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn statements(&self) -> &[GrantStatement] {
        &self.statements
    }

    /// Every resource pattern named by the grant.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.statements
            .iter()
            .flat_map(|s| s.resources.iter().map(String::as_str))
    }

    /// Whether the grant allows `action` on `resource`.
    ///
    /// In resource patterns `?` matches exactly one character and a trailing
    /// `*` matches any remainder.
    pub fn permits(&self, action: &str, resource: &str) -> bool {
        self.statements.iter().any(|s| {
            s.actions.iter().any(|a| *a == action)
                && s.resources.iter().any(|pattern| resource_matches(pattern, resource))
        })
    }

    /// IAM-style policy document.
    pub fn policy_document(&self) -> Value {
        let statements: Vec<Value> = self
            .statements
            .iter()
            .map(|s| {
                json!({
                    "Sid": s.sid,
                    "Effect": "Allow",
                    "Action": s.actions,
                    "Resource": s.resources,
                })
            })
            .collect();
        json!({ "Version": "2012-10-17", "Statement": statements })
    }
}

fn resource_matches(pattern: &str, resource: &str) -> bool {
    let (pattern, open_ended) = match pattern.strip_suffix('*') {
        Some(head) => (head, true),
        None => (pattern, false),
    };

    let mut rest = resource.chars();
    for p in pattern.chars() {
        match rest.next() {
            Some(c) if p == '?' || p == c => {}
            _ => return false,
        }
    }
    open_ended || rest.next().is_none()
}
