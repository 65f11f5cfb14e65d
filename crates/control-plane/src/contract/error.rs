//! Contract validation errors.

use thiserror::Error;

/// Reasons a worker contract is rejected before dispatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("contract declares no databases")]
    NoDatabases,

    #[error("database name must not be empty")]
    EmptyDatabaseName,

    #[error("invalid database name '{0}': only letters, digits and '_' are allowed")]
    InvalidDatabaseName(String),

    #[error("database name '{0}' ends in a reserved suffix (_sql_dump, _sql_load)")]
    ReservedDatabaseName(String),

    #[error("database '{0}' is declared more than once")]
    DuplicateDatabase(String),

    #[error("database '{database}' has no export query")]
    MissingQuery { database: String },

    #[error("database '{database}' has no destination")]
    MissingDestination { database: String },

    #[error("database '{database}' has an invalid destination '{destination}'")]
    InvalidDestination {
        database: String,
        destination: String,
    },

    #[error("secret reference is missing")]
    MissingSecret,

    #[error("invalid secret reference '{0}'")]
    InvalidSecret(String),

    #[error("output bucket is missing")]
    MissingBucket,

    #[error("invalid output bucket '{0}'")]
    InvalidBucket(String),

    #[error("invalid key prefix '{0}'")]
    InvalidPrefix(String),

    #[error("invalid scratch storage: {0}")]
    InvalidScratch(String),

    #[error("invalid compute shape: {0}")]
    InvalidCompute(String),

    #[error("command list is empty")]
    NoCommands,

    #[error("command template error: {0}")]
    Template(String),
}
