//! Output store: bucket policy, run-partitioned layout and a versioned
//! in-memory model of the bucket semantics.

mod layout;
mod policy;
mod versioned;

pub use layout::OutputLayout;
pub use policy::{BucketPolicy, Encryption, LifecycleRules};
pub use versioned::{SweepReport, VersionedStore};
