//! Conversion of a trained splat model into a dense point cloud.
//!
//! Wraps the gs2pc container; input is `3d_gsl/splat.ply`, output is
//! `3d_gsl/dense_pc.ply`.

use super::{docker_run_prefix, host_path, ply_vertex_count};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::events::{EventLevel, EventSink};
use crate::process::{probe_gpu_support, ProcessRunner};
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

const STEP_NAME: &str = "GS2PC";

/// Splat-to-point-cloud stage backed by the gs2pc container image.
pub struct GsToPcStage {
    docker_image: String,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl GsToPcStage {
    /// Creates the stage from the pipeline configuration.
    #[must_use]
    pub fn new(
        config: &crate::config::PipelineConfig,
        sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            docker_image: config.algorithms.gs_to_pc_docker_image.clone(),
            sink,
            cancel,
        }
    }

    fn output_ply(ctx: &RunContext) -> PathBuf {
        ctx.gsl_dir().join("dense_pc.ply")
    }

    fn build_command(&self, ctx: &RunContext, use_gpu: bool) -> Vec<String> {
        let host_run = host_path(&ctx.config, &ctx.run_dir);

        let mut command = docker_run_prefix(use_gpu);
        command.extend([
            "-v".to_string(),
            format!("{}:/project", host_run.display()),
            self.docker_image.clone(),
            "gs2pc".to_string(),
            "/project/3d_gsl/splat.ply".to_string(),
            "/project/3d_gsl/dense_pc.ply".to_string(),
        ]);
        command
    }

    fn extract_metrics(&self, ctx: &RunContext) {
        let mut metrics = serde_json::json!({ "status": "Success" });

        match ply_vertex_count(&Self::output_ply(ctx)) {
            Some(count) => metrics["point_count"] = serde_json::json!(count),
            None => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                "Could not read point count from dense_pc.ply header",
                None,
            ),
        }

        ctx.record_metrics(StageKind::GsToPc.as_str(), metrics);
    }
}

#[async_trait]
impl Stage for GsToPcStage {
    fn kind(&self) -> StageKind {
        StageKind::GsToPc
    }

    fn output_ready(&self, ctx: &RunContext) -> bool {
        Self::output_ply(ctx).is_file()
    }

    async fn execute(&self, ctx: &RunContext) -> bool {
        if self.output_ready(ctx) {
            self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!(
                    "Found existing point cloud at {}. Skipping conversion.",
                    Self::output_ply(ctx).display()
                ),
                None,
            );
            self.extract_metrics(ctx);
            return true;
        }

        if !ctx.gsl_dir().join("splat.ply").is_file() {
            self.sink.emit(
                EventLevel::Error,
                STEP_NAME,
                "No splat.ply found; run the reconstruction stage first",
                None,
            );
            return false;
        }

        let use_gpu = probe_gpu_support(self.sink.as_ref()).await;

        let runner = ProcessRunner::new(
            Some(ctx.log_dir.clone()),
            self.sink.clone(),
            self.cancel.clone(),
        );
        let command = self.build_command(ctx, use_gpu);
        let success = runner.execute(&command, STEP_NAME, None).await;

        if success {
            self.extract_metrics(ctx);
        }
        success
    }
}

impl std::fmt::Debug for GsToPcStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsToPcStage")
            .field("docker_image", &self.docker_image)
            .finish_non_exhaustive()
    }
}
