//! Run dispatch: callback tokens, launch specs and compute launchers.

mod dispatcher;
mod error;
mod kubernetes;
mod launcher;
mod process;
mod token;

pub use dispatcher::{DispatchSettings, Dispatcher, PreparedRun};
pub use error::DispatchError;
pub use kubernetes::{KubernetesLauncher, KubernetesSettings};
pub use launcher::{ComputeLauncher, LaunchSpec, WorkerExit, WorkerHandle};
pub use process::ProcessLauncher;
pub use token::CallbackToken;
