// Measurement pipeline: validation, resampling, pivoting, and the runner
// that drives them per device.

pub mod pivot;
pub mod resample;
pub mod runner;
pub mod validate;

pub use runner::{CancelFlag, PipelineRunner, RunOptions, RunOutput};
