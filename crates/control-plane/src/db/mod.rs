//! Run archive storage in PostgreSQL using SQLx.

pub mod archive;
pub mod models;
pub mod pool;
pub mod queries;

pub use archive::PgRunArchive;
pub use pool::{create_pool, health_check, DbPool};
