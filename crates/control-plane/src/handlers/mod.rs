//! HTTP handlers for the pg-dd control plane API.

pub mod callbacks;
pub mod health;
pub mod runs;
pub mod store;

pub use health::{api_health, health_check};
