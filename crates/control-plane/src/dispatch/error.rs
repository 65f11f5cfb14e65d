//! Dispatch errors.

use thiserror::Error;

use crate::contract::ContractError;
use crate::provisioner::ProvisionError;

/// Errors raised while starting or stopping a worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The contract or command list was rejected before compute was requested.
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// No capacity to place the worker (quota, throttling, scheduling).
    #[error("no compute capacity: {0}")]
    Capacity(String),

    /// The compute API could not be reached.
    #[error("network failure: {0}")]
    Network(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("terminate failed: {0}")]
    Terminate(String),
}

impl DispatchError {
    /// True when the request itself is at fault, not the infrastructure.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Contract(_) | Self::Provision(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors() {
        assert!(DispatchError::from(ContractError::NoDatabases).is_configuration());
        assert!(!DispatchError::Capacity("quota".to_string()).is_configuration());
    }

    #[test]
    fn test_contract_error_message_is_transparent() {
        let err = DispatchError::from(ContractError::MissingSecret);
        assert_eq!(err.to_string(), "secret reference is missing");
    }
}
