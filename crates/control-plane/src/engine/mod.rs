//! Completion coordination.
//!
//! - [`run`]: the run state machine
//! - [`coordinator`]: run registry, supervision and callback delivery
//! - [`sinks`]: archive and event publishing seams

pub mod coordinator;
pub mod run;
pub mod sinks;

pub use coordinator::{Coordinator, Dispatched, SignalOutcome, Sinks};
pub use run::{
    CallbackSignal, FailureDetail, FailureSource, Rejection, Run, RunEvent, RunSnapshot, RunState,
    Transition,
};
pub use sinks::{MemoryArchive, RunArchive, RunEventPublisher, SinkError};
