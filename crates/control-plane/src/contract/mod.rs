//! Worker environment contract.
//!
//! A [`WorkerContract`] is what callers submit; [`WorkerContract::freeze`]
//! validates it into an immutable [`WorkerDescriptor`] that drives the
//! worker environment, the capability grant and the compute request.

mod descriptor;
mod error;
mod types;
mod validate;

pub use descriptor::{env, FrozenDatabase, WorkerDescriptor};
pub use error::ContractError;
pub use types::{
    ComputeShape, CpuArchitecture, DatabaseExport, ExportMode, NetworkPlacement, OutputLocation,
    ScratchStorage, SubnetKind, WorkerContract,
};
pub use validate::{normalize_prefix, validate_bucket, SecretArn};
