//! Sparse reconstruction (SfM) via OpenDroneMap, which bundles OpenSfM.
//!
//! ODM project structure inside the run directory:
//!
//! ```text
//! <run_dir>/
//! ├── images/          # mounted input images
//! ├── opensfm/         # OpenSfM working directory (auto-created)
//! │   ├── reconstruction.json
//! │   └── stats/stats.json
//! └── odm_*/           # mesh / orthophoto / georeferencing products
//! ```

use super::{docker_run_prefix, host_path};
use crate::cancellation::CancellationToken;
use crate::context::RunContext;
use crate::events::{EventLevel, EventSink};
use crate::process::{probe_gpu_support, ProcessRunner};
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use std::sync::Arc;

const STEP_NAME: &str = "ODM/OpenSfM";

/// SfM stage backed by the ODM container image.
pub struct OdmSfmStage {
    docker_image: String,
    run_mesh: bool,
    feature_type: String,
    use_gps: bool,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl OdmSfmStage {
    /// Creates the stage from the pipeline configuration.
    #[must_use]
    pub fn new(
        config: &crate::config::PipelineConfig,
        sink: Arc<dyn EventSink>,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            docker_image: config.algorithms.sfm_docker_image.clone(),
            run_mesh: config.run_mesh,
            feature_type: config.feature_type.clone(),
            use_gps: config.use_gps,
            sink,
            cancel,
        }
    }

    fn build_command(&self, ctx: &RunContext, use_gpu: bool) -> Vec<String> {
        let host_run = host_path(&ctx.config, &ctx.run_dir);
        let host_images = host_path(&ctx.config, &ctx.config.input_images_dir());

        let mut command = docker_run_prefix(use_gpu);
        command.extend([
            "-v".to_string(),
            "/etc/localtime:/etc/localtime:ro".to_string(),
            "-v".to_string(),
            format!("{}:/datasets/project", host_run.display()),
            "-v".to_string(),
            format!("{}:/datasets/project/images:ro", host_images.display()),
            self.docker_image.clone(),
            "--project-path".to_string(),
            "/datasets".to_string(),
            "--ignore-gsd".to_string(),
        ]);

        // Without mesh generation, stop ODM after the SfM step.
        if !self.run_mesh {
            command.push("--end-with".to_string());
            command.push("opensfm".to_string());
        }

        if !self.feature_type.eq_ignore_ascii_case("sift") {
            command.push("--feature-type".to_string());
            command.push(self.feature_type.to_uppercase());
        }

        // Pair images by EXIF GPS proximity when location data is trusted.
        if self.use_gps {
            command.push("--matcher-neighbors".to_string());
            command.push("8".to_string());
        }

        command.push("project".to_string());
        command
    }

    /// Pulls alignment metrics out of the OpenSfM artifacts.
    ///
    /// Malformed or missing files downgrade to warnings with absent
    /// values; they never fail the stage.
    fn extract_metrics(&self, ctx: &RunContext) {
        let mut metrics = serde_json::json!({
            "status": "Success",
            "total_images": ctx.photo_count,
        });

        let reconstruction_path = ctx.opensfm_dir().join("reconstruction.json");
        match std::fs::read_to_string(&reconstruction_path)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| e.to_string())
            }) {
            Ok(serde_json::Value::Array(reconstructions)) => {
                let mut registered = 0;
                let mut sparse_points = 0;
                for rec in &reconstructions {
                    registered += rec
                        .get("shots")
                        .and_then(serde_json::Value::as_object)
                        .map_or(0, serde_json::Map::len);
                    sparse_points += rec
                        .get("points")
                        .and_then(serde_json::Value::as_object)
                        .map_or(0, serde_json::Map::len);
                }
                metrics["registered_images"] = serde_json::json!(registered);
                metrics["sparse_points"] = serde_json::json!(sparse_points);
            }
            Ok(_) => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                "reconstruction.json is not an array of reconstructions",
                None,
            ),
            Err(e) => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                &format!("Could not read reconstruction.json: {e}"),
                None,
            ),
        }

        if let Some(error) = read_reprojection_error(ctx) {
            metrics["reprojection_error"] = serde_json::json!(error);
        }

        ctx.record_metrics(StageKind::Sfm.as_str(), metrics);
    }
}

#[async_trait]
impl Stage for OdmSfmStage {
    fn kind(&self) -> StageKind {
        StageKind::Sfm
    }

    fn output_ready(&self, ctx: &RunContext) -> bool {
        ctx.opensfm_dir().join("reconstruction.json").is_file()
    }

    async fn execute(&self, ctx: &RunContext) -> bool {
        if self.output_ready(ctx) {
            self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!(
                    "Found existing reconstruction at {}. Skipping SfM step.",
                    ctx.opensfm_dir().join("reconstruction.json").display()
                ),
                None,
            );
            self.extract_metrics(ctx);
            return true;
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

impl std::fmt::Debug for OdmSfmStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdmSfmStage")
            .field("docker_image", &self.docker_image)
            .field("run_mesh", &self.run_mesh)
            .finish_non_exhaustive()
    }
}

/// Best-effort lookup of the reprojection RMSE in OpenSfM's stats dump.
fn read_reprojection_error(ctx: &RunContext) -> Option<f64> {
    let stats_path = ctx.opensfm_dir().join("stats").join("stats.json");
    let raw = std::fs::read_to_string(stats_path).ok()?;
    let stats: serde_json::Value = serde_json::from_str(&raw).ok()?;
    stats
        .get("reconstruction_statistics")?
        .get("reprojection_error_pixels")?
        .as_f64()
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

    fn write_reconstruction(ctx: &RunContext, shots: usize, points: usize) {
        let shots_map: serde_json::Map<String, serde_json::Value> = (0..shots)
            .map(|i| (format!("img_{i}.jpg"), serde_json::json!({})))
            .collect();
        let points_map: serde_json::Map<String, serde_json::Value> = (0..points)
            .map(|i| (i.to_string(), serde_json::json!({})))
            .collect();
        let rec = serde_json::json!([{ "shots": shots_map, "points": points_map }]);

        std::fs::create_dir_all(ctx.opensfm_dir()).expect("mkdir opensfm");
        std::fs::write(
            ctx.opensfm_dir().join("reconstruction.json"),
            serde_json::to_string(&rec).expect("serialize"),
        )
        .expect("write reconstruction");
    }

    fn stage(ctx: &RunContext, sink: Arc<dyn EventSink>) -> OdmSfmStage {
        OdmSfmStage::new(&ctx.config, sink, Arc::new(CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_existing_artifact_short_circuits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        write_reconstruction(&ctx, 2, 5);

        let sink = Arc::new(CollectingEventSink::new());
        let stage = stage(&ctx, sink.clone());

        assert!(stage.output_ready(&ctx));
        assert!(stage.execute(&ctx).await);
        // The skip path never spawned a process
        assert_eq!(sink.events_matching("Starting: docker").len(), 0);
        assert_eq!(sink.events_matching("Skipping SfM step").len(), 1);

        let metrics = ctx.stage_metrics("sfm").expect("sfm metrics");
        assert_eq!(metrics["registered_images"], 2);
        assert_eq!(metrics["sparse_points"], 5);
    }

    #[tokio::test]
    async fn test_malformed_reconstruction_is_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        std::fs::create_dir_all(ctx.opensfm_dir()).expect("mkdir");
        std::fs::write(ctx.opensfm_dir().join("reconstruction.json"), b"{not json")
            .expect("write");

        let sink = Arc::new(CollectingEventSink::new());
        let stage = stage(&ctx, sink.clone());

        // Still succeeds through the skip path; extraction degrades
        assert!(stage.execute(&ctx).await);
        assert!(!sink
            .events_matching("Could not read reconstruction.json")
            .is_empty());

        let metrics = ctx.stage_metrics("sfm").expect("sfm metrics");
        assert_eq!(metrics["status"], "Success");
        assert!(metrics.get("registered_images").is_none());
    }

    #[test]
    fn test_command_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        let stage = stage(&ctx, Arc::new(NoOpEventSink));

        let command = stage.build_command(&ctx, false);
        assert_eq!(command[0], "docker");
        assert!(command.contains(&"--end-with".to_string()));
        assert!(command.contains(&"opensfm".to_string()));
        assert!(command.contains(&"--matcher-neighbors".to_string()));
        assert_eq!(command.last(), Some(&"project".to_string()));

        let gpu_command = stage.build_command(&ctx, true);
        assert!(gpu_command.contains(&"--gpus".to_string()));
    }

    #[test]
    fn test_mesh_runs_full_odm_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        let config = PipelineConfig {
            run_mesh: true,
            ..ctx.config.clone()
        };
        let stage = OdmSfmStage::new(
            &config,
            Arc::new(NoOpEventSink),
            Arc::new(CancellationToken::new()),
        );

        let command = stage.build_command(&ctx, false);
        assert!(!command.contains(&"--end-with".to_string()));
    }

    #[test]
    fn test_gps_matching_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(dir.path());
        let config = PipelineConfig {
            use_gps: false,
            ..ctx.config.clone()
        };
        let stage = OdmSfmStage::new(
            &config,
            Arc::new(NoOpEventSink),
            Arc::new(CancellationToken::new()),
        );

        let command = stage.build_command(&ctx, false);
        assert!(!command.contains(&"--matcher-neighbors".to_string()));
    }
}
