//! Configuration for the pg-dd control plane.
//!
//! Server settings come from `PG_DD_` environment variables through
//! `envy`; the default worker contract comes from a YAML file.

mod app;
mod contract;
mod database;

pub use app::{AppConfig, ArchiveKind, LauncherKind};
pub use contract::{load_contract, parse_contract};
pub use database::DatabaseConfig;
