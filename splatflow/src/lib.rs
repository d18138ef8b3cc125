//! # Splatflow
//!
//! Orchestration core for multi-stage 3D reconstruction pipelines whose
//! heavy lifting (structure-from-motion, Gaussian-splat training) runs in
//! opaque external containers.
//!
//! Splatflow provides:
//!
//! - **Stage-based execution**: a small, closed set of pipeline stages with
//!   dependency validation and strictly sequential, fail-fast execution
//! - **Resumable run state**: the run directory is the single source of
//!   truth; stages are idempotent against their output artifacts
//! - **Process supervision**: streaming output capture, progress
//!   extraction, per-invocation log files, timeout and cooperative
//!   cancellation with graceful-then-forceful child termination
//! - **Metrics reporting**: per-stage metrics accumulated in the run
//!   context and rendered into a narrative report plus a raw JSON dump
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use splatflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_file("project/task.yaml")?;
//! let engine = PipelineEngine::new(
//!     config,
//!     None,
//!     None,
//!     Arc::new(TracingEventSink::default()),
//!     Arc::new(CancellationToken::new()),
//! )?;
//!
//! let success = engine.run(None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adapters;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod stage;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{AlgorithmConfig, PipelineConfig};
    pub use crate::context::RunContext;
    pub use crate::errors::SplatflowError;
    pub use crate::events::{
        CollectingEventSink, EventLevel, EventSink, NoOpEventSink, TracingEventSink,
    };
    pub use crate::pipeline::PipelineEngine;
    pub use crate::process::{probe_gpu_support, ProcessRunner};
    pub use crate::report::MetricsReportEngine;
    pub use crate::stage::{Stage, StageKind};
    pub use crate::utils::{iso_timestamp, run_timestamp, slug};
}
