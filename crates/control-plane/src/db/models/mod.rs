//! Database models.

pub mod run;

pub use run::RunRecord;
