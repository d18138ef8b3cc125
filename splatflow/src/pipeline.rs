//! Pipeline orchestration.
//!
//! The engine validates stage dependencies up front, builds the run
//! context, executes the configured stages in their fixed order and
//! always finishes with a report, even after a failure.

use crate::adapters::{GsToPcStage, OdmSfmStage, OpenSplatStage};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::errors::SplatflowError;
use crate::events::{EventLevel, EventSink};
use crate::report::MetricsReportEngine;
use crate::stage::{Stage, StageKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const STEP_NAME: &str = "Pipeline";

/// Orchestrates stage execution against one run context.
pub struct PipelineEngine {
    context: Arc<RunContext>,
    stages: Vec<Box<dyn Stage>>,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl PipelineEngine {
    /// Builds the engine for a new or resumed run.
    ///
    /// Dependency validation happens before any filesystem side effect,
    /// so an inconsistent configuration never leaves a run directory
    /// behind.
    pub fn new(
        config: PipelineConfig,
        resume_id: Option<&str>,
        config_file: Option<&Path>,
        sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Result<Self, SplatflowError> {
        validate_dependencies(&config)?;

        let context = Arc::new(RunContext::new(config, resume_id, config_file, &sink)?);

        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        let config = &context.config;
        if config.run_sparse || config.run_mesh {
            stages.push(Box::new(OdmSfmStage::new(
                config,
                sink.clone(),
                cancel.clone(),
            )));
        }
        if config.run_gaussian {
            stages.push(Box::new(OpenSplatStage::new(
                config,
                sink.clone(),
                cancel.clone(),
            )));
        }
        if config.run_gs_to_pc {
            stages.push(Box::new(GsToPcStage::new(
                config,
                sink.clone(),
                cancel.clone(),
            )));
        }

        Ok(Self {
            context,
            stages,
            sink,
            cancel,
        })
    }

    /// Replaces the configured stages. Intended for tests that substitute
    /// mock stages for the container-backed ones.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<Box<dyn Stage>>) -> Self {
        self.stages = stages;
        self
    }

    /// The run context backing this engine.
    #[must_use]
    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Executes the pipeline and returns whether every stage succeeded.
    ///
    /// `requested` restricts execution to a subset of stage keys; the
    /// configured order is preserved regardless of the order of the
    /// request. An unknown key is an error before anything runs. A known
    /// key whose stage is not configured is skipped with a warning.
    ///
    /// The report is generated on every path that executed at least one
    /// stage, including failures.
    pub async fn run(&self, requested: Option<&[&str]>) -> Result<bool, SplatflowError> {
        let selected = self.select_stages(requested)?;

        if selected.is_empty() {
            self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                "No stages selected; nothing to do",
                None,
            );
            return Ok(true);
        }

        self.sink.emit(
            EventLevel::Info,
            STEP_NAME,
            &format!(
                "Run {} with {} photo(s); stages: {}",
                self.context.run_id,
                self.context.photo_count,
                selected
                    .iter()
                    .map(|s| s.kind().as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None,
        );

        self.context.mark_started();
        let mut all_ok = true;

        for stage in &selected {
            if self.cancel.is_cancelled() {
                self.sink.emit(
                    EventLevel::Warn,
                    STEP_NAME,
                    &format!(
                        "Cancelled before step {}: {}",
                        stage.display_name(),
                        self.cancel.reason().unwrap_or_default()
                    ),
                    None,
                );
                all_ok = false;
                break;
            }

            self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!("--- Starting step: {} ---", stage.display_name()),
                None,
            );

            let started = Instant::now();
            let success = stage.execute(&self.context).await;
            let duration = started.elapsed().as_secs_f64();
            self.context.set_metric(
                stage.kind().as_str(),
                "duration_seconds",
                serde_json::json!(duration),
            );

            if success {
                self.sink.emit(
                    EventLevel::Info,
                    STEP_NAME,
                    &format!(
                        "--- Finished step: {} ({:.1}s) ---",
                        stage.display_name(),
                        duration
                    ),
                    None,
                );
            } else {
                self.context.set_metric(
                    stage.kind().as_str(),
                    "status",
                    serde_json::json!("Failed"),
                );
                self.sink.emit(
                    EventLevel::Error,
                    STEP_NAME,
                    &format!(
                        "--- Step failed: {} ({:.1}s) - aborting pipeline ---",
                        stage.display_name(),
                        duration
                    ),
                    None,
                );
                all_ok = false;
                break;
            }
        }

        self.context.mark_finished();

        // Failed runs still get a report for post-mortem inspection.
        MetricsReportEngine::new(self.sink.clone()).generate(&self.context);

        Ok(all_ok)
    }

    /// Resolves a stage-key request against the configured stages.
    fn select_stages(&self, requested: Option<&[&str]>) -> Result<Vec<&dyn Stage>, SplatflowError> {
        let Some(names) = requested else {
            return Ok(self.stages.iter().map(AsRef::as_ref).collect());
        };

        let mut kinds = Vec::new();
        for name in names {
            let kind = StageKind::from_key(name)
                .ok_or_else(|| SplatflowError::UnknownStage {
                    name: (*name).to_string(),
                })?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        for kind in &kinds {
            if !self.stages.iter().any(|s| s.kind() == *kind) {
                self.sink.emit(
                    EventLevel::Warn,
                    STEP_NAME,
                    &format!(
                        "Stage '{kind}' requested but not enabled in the configuration; skipping"
                    ),
                    None,
                );
            }
        }

        Ok(self
            .stages
            .iter()
            .filter(|s| kinds.contains(&s.kind()))
            .map(AsRef::as_ref)
            .collect())
    }
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("run_id", &self.context.run_id)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Rejects configurations whose enabled stages cannot produce their
/// required inputs.
fn validate_dependencies(config: &PipelineConfig) -> Result<(), SplatflowError> {
    if config.run_gaussian && !config.run_sparse {
        return Err(SplatflowError::config(
            "Gaussian Splatting requires sparse reconstruction. Please set 'run_sparse' to true.",
        ));
    }
    if config.run_mesh && !config.run_sparse {
        return Err(SplatflowError::config(
            "Mesh generation requires sparse reconstruction. Please set 'run_sparse' to true.",
        ));
    }
    if config.run_gs_to_pc && !config.run_gaussian {
        return Err(SplatflowError::config(
            "Point cloud conversion requires Gaussian Splatting. Please set 'run_gaussian' to true.",
        ));
    }
    Ok(())
}
