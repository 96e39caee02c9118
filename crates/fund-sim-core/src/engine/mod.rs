//! Run engine: context, orchestration, cancellation, and progress.

pub mod context;
pub mod control;
pub mod orchestrator;

pub use context::{ModuleTiming, SimulationContext};
pub use control::{CancelFlag, ProgressEvent, ProgressSink};
pub use orchestrator::{run, run_with_tls, RunOptions};
