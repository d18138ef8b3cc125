//! Gaussian-splat training via the OpenSplat container.
//!
//! Consumes the OpenSfM output directly; the trained model lands at
//! `<run_dir>/3d_gsl/splat.ply`.

use super::{docker_run_prefix, host_path, ply_vertex_count};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::events::{EventLevel, EventSink};
use crate::process::{probe_gpu_support, ProcessRunner};
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

const STEP_NAME: &str = "OpenSplat";

/// Training iteration counts per quality preset: `(iterations, save_every)`.
fn preset_iterations(quality_preset: &str) -> (u32, u32) {
    match quality_preset {
        "high" => (30_000, 5_000),
        "low" => (7_000, 1_000),
        _ => (15_000, 2_000),
    }
}

/// Reconstruction stage backed by the OpenSplat container image.
pub struct OpenSplatStage {
    docker_image: String,
    quality_preset: String,
    sh_degree: u32,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl OpenSplatStage {
    /// Creates the stage from the pipeline configuration.
    #[must_use]
    pub fn new(
        config: &crate::config::PipelineConfig,
        sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            docker_image: config.algorithms.reconstruction_docker_image.clone(),
            quality_preset: config.quality_preset.clone(),
            sh_degree: config.sh_degree,
            sink,
            cancel,
        }
    }

    fn output_ply(ctx: &RunContext) -> PathBuf {
        ctx.gsl_dir().join("splat.ply")
    }

    fn build_command(&self, ctx: &RunContext, use_gpu: bool) -> Vec<String> {
        let host_run = host_path(&ctx.config, &ctx.run_dir);
        let host_images = host_path(&ctx.config, &ctx.config.input_images_dir());
        let (iterations, save_every) = preset_iterations(&self.quality_preset);

        let mut command = docker_run_prefix(use_gpu);
        command.extend([
            "-v".to_string(),
            format!("{}:/project", host_run.display()),
            "-v".to_string(),
            format!("{}:/images:ro", host_images.display()),
            self.docker_image.clone(),
            "opensplat".to_string(),
            "/project".to_string(),
            "-o".to_string(),
            "/project/3d_gsl/splat.ply".to_string(),
            "--opensfm-image-path".to_string(),
            "/images".to_string(),
            "-n".to_string(),
            iterations.to_string(),
            "-s".to_string(),
            save_every.to_string(),
            "--sh-degree".to_string(),
            self.sh_degree.to_string(),
        ]);
        command
    }

    fn extract_metrics(&self, ctx: &RunContext) {
        let mut metrics = serde_json::json!({ "status": "Success" });

        match ply_vertex_count(&Self::output_ply(ctx)) {
            Some(count) => metrics["gaussian_count"] = serde_json::json!(count),
            None => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                "Could not read gaussian count from splat.ply header",
                None,
            ),
        }

        if let Some(loss) = final_loss_from_logs(ctx) {
            metrics["final_loss"] = serde_json::json!(loss);
        }

        ctx.record_metrics(StageKind::Reconstruction.as_str(), metrics);
    }
}

#[async_trait]
impl Stage for OpenSplatStage {
    fn kind(&self) -> StageKind {
        StageKind::Reconstruction
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
                    "Found existing result at {}. Skipping reconstruction.",
                    Self::output_ply(ctx).display()
                ),
                None,
            );
            self.extract_metrics(ctx);
            return true;
        }

        if let Err(e) = std::fs::create_dir_all(ctx.gsl_dir()) {
            self.sink.emit(
                EventLevel::Error,
                STEP_NAME,
                &format!("Could not create output directory: {e}"),
                None,
            );
            return false;
        }

        let use_gpu = probe_gpu_support(self.sink.as_ref()).await;
        if !use_gpu {
            self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                "Gaussian Splatting is extremely slow on CPU. Use an NVIDIA GPU for better performance.",
                None,
            );
        }

        let runner = ProcessRunner::new(
            Some(ctx.log_dir.clone()),
            self.sink.clone(),
            self.cancel.clone(),
        );
        let command = self.build_command(ctx, use_gpu);
        let success = runner.execute(&command, STEP_NAME, None).await;

        if success {
            self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!(
                    "Reconstruction finished. Result at {}",
                    Self::output_ply(ctx).display()
                ),
                None,
            );
            self.extract_metrics(ctx);
        }
        success
    }
}

impl std::fmt::Debug for OpenSplatStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSplatStage")
            .field("docker_image", &self.docker_image)
            .field("quality_preset", &self.quality_preset)
            .field("sh_degree", &self.sh_degree)
            .finish_non_exhaustive()
    }
}

/// Scans the newest OpenSplat process log for the last reported loss.
fn final_loss_from_logs(ctx: &RunContext) -> Option<f64> {
    let re = Regex::new(r"(?i)loss[=:\s]+([0-9]*\.?[0-9]+)").ok()?;

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(&ctx.log_dir).ok()?.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("opensplat_") || !name.ends_with(".log") {
            continue;
        }
        let modified = entry.metadata().ok()?.modified().ok()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    let content = std::fs::read_to_string(newest?.1).ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| re.captures(line).and_then(|c| c[1].parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use std::path::Path;

    fn context_in(dir: &Path) -> RunContext {
        std::fs::create_dir_all(dir.join("images")).expect("mkdir images");
        let config = PipelineConfig {
            working_dir: Some(dir.to_path_buf()),
            ..PipelineConfig::default()
        };
        let sink: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        RunContext::new(config, None, None, &sink).expect("context")
    }

    fn stage(ctx: &RunContext, sink: Arc<dyn EventSink>) -> OpenSplatStage {
        OpenSplatStage::new(&ctx.config, sink, Arc::new(CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_existing_splat_short_circuits_and_extracts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());

        std::fs::create_dir_all(ctx.gsl_dir()).expect("mkdir gsl");
        std::fs::write(
            ctx.gsl_dir().join("splat.ply"),
            "ply\nformat binary_little_endian 1.0\nelement vertex 4321\nend_header\n",
        )
        .expect("write ply");

        let sink = Arc::new(CollectingEventSink::new());
        let stage = stage(&ctx, sink.clone());

        assert!(stage.output_ready(&ctx));
        assert!(stage.execute(&ctx).await);
        assert_eq!(sink.events_matching("Starting: docker").len(), 0);

        let metrics = ctx.stage_metrics("reconstruction").expect("metrics");
        assert_eq!(metrics["gaussian_count"], 4321);
    }

    #[test]
    fn test_preset_iterations() {
        assert_eq!(preset_iterations("high"), (30_000, 5_000));
        assert_eq!(preset_iterations("medium"), (15_000, 2_000));
        assert_eq!(preset_iterations("low"), (7_000, 1_000));
        assert_eq!(preset_iterations("unknown"), (15_000, 2_000));
    }

    #[test]
    fn test_command_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        let stage = stage(&ctx, Arc::new(NoOpEventSink));

        let command = stage.build_command(&ctx, true);
        assert!(command.contains(&"--gpus".to_string()));
        assert!(command.contains(&"opensplat".to_string()));
        assert!(command.contains(&"--sh-degree".to_string()));
        assert!(command.contains(&"15000".to_string()));
    }

    #[test]
    fn test_final_loss_from_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());

        std::fs::write(
            ctx.log_dir.join("opensplat_20240101_120000.log"),
            "# Log started\nIteration 100/15000 loss=0.231\nIteration 15000/15000 loss=0.042\n",
        )
        .expect("write log");

        assert_eq!(final_loss_from_logs(&ctx), Some(0.042));
    }

    #[test]
    fn test_final_loss_no_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        assert_eq!(final_loss_from_logs(&ctx), None);
    }
}
