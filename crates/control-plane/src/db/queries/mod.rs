//! Database queries.

pub mod run;
