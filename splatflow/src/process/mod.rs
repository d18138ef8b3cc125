//! Process supervision: streaming execution of external commands with log
//! capture, progress extraction, timeout and cooperative cancellation.

mod progress;
mod runner;

pub use progress::{extract_progress, strip_ansi};
pub use runner::{probe_gpu_support, ProcessRunner, ProgressCallback};
