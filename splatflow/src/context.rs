//! Resumable, filesystem-rooted execution state shared by all stages.
//!
//! Each pipeline invocation owns one [`RunContext`] rooted at
//! `working_dir/runs/<run_id>/`. The run directory is the single source of
//! truth for resume decisions: no other state is persisted, and stages are
//! idempotent against the artifacts they leave there.

use crate::config::PipelineConfig;
use crate::errors::SplatflowError;
use crate::events::{EventLevel, EventSink};
use crate::utils::run_timestamp;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Image extensions recognized when counting input photos.
const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "tif", "tiff"];

#[derive(Debug, Default)]
struct RunTiming {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

/// Context object passed between stages.
///
/// Holds configuration, paths to intermediate data and the accumulated
/// per-stage metrics. Created once per pipeline invocation and never
/// deleted by this system - the run directory is retained for audit and
/// resume.
pub struct RunContext {
    /// The configuration this run was created from.
    pub config: PipelineConfig,
    /// Run identifier: a fresh timestamp, or the supplied resume id.
    pub run_id: String,
    /// Root directory for everything this run produces.
    pub run_dir: PathBuf,
    /// Per-invocation process log files live here.
    pub log_dir: PathBuf,
    /// Number of input photos, counted once at construction.
    pub photo_count: usize,

    metrics: RwLock<serde_json::Map<String, serde_json::Value>>,
    timing: RwLock<RunTiming>,
}

impl RunContext {
    /// Creates the context for a new or resumed run.
    ///
    /// With a resume identifier the existing run directory is reused and
    /// must already exist; otherwise a fresh timestamped directory is
    /// created. Required subdirectories are created idempotently. When a
    /// config file path is given, a copy is archived into the run
    /// directory for reproducibility (failure to copy is a warning).
    pub fn new(
        config: PipelineConfig,
        resume_id: Option<&str>,
        config_file: Option<&Path>,
        sink: &Arc<dyn EventSink>,
    ) -> Result<Self, SplatflowError> {
        let (run_id, run_dir) = match resume_id {
            Some(id) => {
                let dir = config.runs_dir().join(id);
                if !dir.is_dir() {
                    return Err(SplatflowError::Resume {
                        id: id.to_string(),
                        dir,
                    });
                }
                sink.emit(
                    EventLevel::Info,
                    "Pipeline",
                    &format!("Resuming from existing directory: {}", dir.display()),
                    None,
                );
                (id.to_string(), dir)
            }
            None => {
                let id = run_timestamp();
                let dir = config.runs_dir().join(&id);
                sink.emit(
                    EventLevel::Info,
                    "Pipeline",
                    &format!("Creating new run directory: {}", dir.display()),
                    None,
                );
                (id, dir)
            }
        };

        let log_dir = run_dir.join("logs");
        std::fs::create_dir_all(&run_dir)?;
        std::fs::create_dir_all(&log_dir)?;

        let photo_count = count_photos(&config.input_images_dir());

        if let Some(src) = config_file {
            if let Some(name) = src.file_name() {
                let dest = run_dir.join(name);
                match std::fs::copy(src, &dest) {
                    Ok(_) => sink.emit(
                        EventLevel::Info,
                        "Pipeline",
                        &format!("Config saved: {}", dest.display()),
                        None,
                    ),
                    Err(e) => sink.emit(
                        EventLevel::Warn,
                        "Pipeline",
                        &format!("Could not archive config file: {e}"),
                        None,
                    ),
                }
            }
        }

        Ok(Self {
            config,
            run_id,
            run_dir,
            log_dir,
            photo_count,
            metrics: RwLock::new(serde_json::Map::new()),
            timing: RwLock::new(RunTiming::default()),
        })
    }

    /// SfM working directory inside the run (`opensfm/`).
    #[must_use]
    pub fn opensfm_dir(&self) -> PathBuf {
        self.run_dir.join("opensfm")
    }

    /// Gaussian-splat output directory inside the run (`3d_gsl/`).
    #[must_use]
    pub fn gsl_dir(&self) -> PathBuf {
        self.run_dir.join("3d_gsl")
    }

    /// Merges an object patch into the metrics record for a stage key.
    ///
    /// Non-object patches replace the stage entry wholesale.
    pub fn record_metrics(&self, stage_key: &str, patch: serde_json::Value) {
        let mut metrics = self.metrics.write();
        match (metrics.get_mut(stage_key), patch) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) => {
                for (k, v) in new {
                    existing.insert(k, v);
                }
            }
            (_, patch) => {
                metrics.insert(stage_key.to_string(), patch);
            }
        }
    }

    /// Sets a single metric value under a stage key.
    pub fn set_metric(&self, stage_key: &str, key: &str, value: serde_json::Value) {
        self.record_metrics(stage_key, serde_json::json!({ key: value }));
    }

    /// Returns a snapshot of the full metrics mapping.
    #[must_use]
    pub fn metrics_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.metrics.read().clone()
    }

    /// Returns the metrics record for one stage key, if present.
    #[must_use]
    pub fn stage_metrics(&self, stage_key: &str) -> Option<serde_json::Value> {
        self.metrics.read().get(stage_key).cloned()
    }

    /// Records the overall start timestamp.
    pub fn mark_started(&self) {
        self.timing.write().start = Some(Utc::now());
    }

    /// Records the overall end timestamp.
    pub fn mark_finished(&self) {
        self.timing.write().end = Some(Utc::now());
    }

    /// Overall start timestamp, if the run has started.
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.timing.read().start
    }

    /// Overall end timestamp, if the run has finished.
    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timing.read().end
    }

    /// Total wall-clock duration in seconds, when both timestamps exist.
    #[must_use]
    pub fn total_duration(&self) -> Option<f64> {
        let timing = self.timing.read();
        match (timing.start, timing.end) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("run_dir", &self.run_dir)
            .field("photo_count", &self.photo_count)
            .finish_non_exhaustive()
    }
}

/// Counts files in the input directory with a recognized image extension.
fn count_photos(images_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(images_dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    PHOTO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
                })
        })
        .count()
}
