//! Run report generation.
//!
//! After every pipeline run, two artifacts land in the run directory:
//! `metrics.json` with the raw per-stage metrics, and `quality_report.md`,
//! a human-readable English summary with quality advisories. Report
//! generation is best effort; any failure downgrades to a warning event
//! and never fails the run.

use crate::context::RunContext;
use crate::events::{EventLevel, EventSink};
use crate::stage::StageKind;
use crate::utils::{format_duration, report_timestamp};
use std::fmt::Write as _;
use std::sync::Arc;

const STEP_NAME: &str = "Report";

/// Alignment rates below this fraction of registered images trigger an
/// advisory.
const ALIGNMENT_ADVISORY_THRESHOLD: f64 = 80.0;

/// Training losses above this value trigger an advisory.
const LOSS_ADVISORY_THRESHOLD: f64 = 0.1;

/// Writes the metrics dump and the markdown quality report for a run.
pub struct MetricsReportEngine {
    sink: Arc<dyn EventSink>,
}

impl MetricsReportEngine {
    /// Creates the engine with the given event sink.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Generates both report artifacts into the run directory.
    pub fn generate(&self, ctx: &RunContext) {
        self.write_metrics_json(ctx);
        self.write_markdown_report(ctx);
    }

    fn write_metrics_json(&self, ctx: &RunContext) {
        let snapshot = serde_json::Value::Object(ctx.metrics_snapshot());
        let path = ctx.run_dir.join("metrics.json");

        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|raw| std::fs::write(&path, raw).map_err(|e| e.to_string()));

        match result {
            Ok(()) => self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!("Metrics saved: {}", path.display()),
                None,
            ),
            Err(e) => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                &format!("Could not write metrics.json: {e}"),
                None,
            ),
        }
    }

    fn write_markdown_report(&self, ctx: &RunContext) {
        let report = render_report(ctx);
        let path = ctx.run_dir.join("quality_report.md");

        match std::fs::write(&path, report) {
            Ok(()) => self.sink.emit(
                EventLevel::Info,
                STEP_NAME,
                &format!("Quality report saved: {}", path.display()),
                None,
            ),
            Err(e) => self.sink.emit(
                EventLevel::Warn,
                STEP_NAME,
                &format!("Could not write quality report: {e}"),
                None,
            ),
        }
    }
}

impl std::fmt::Debug for MetricsReportEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsReportEngine").finish_non_exhaustive()
    }
}

/// Renders the full markdown report. Infallible: missing or malformed
/// metric values simply leave their lines out.
fn render_report(ctx: &RunContext) -> String {
    let metrics = ctx.metrics_snapshot();
    let mut out = String::new();
    let mut advisories: Vec<String> = Vec::new();

    let _ = writeln!(out, "# Reconstruction Quality Report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- **Run:** {}", ctx.run_id);
    if let Some(start) = ctx.start_time() {
        let _ = writeln!(out, "- **Started:** {}", report_timestamp(&start));
    }
    if let Some(end) = ctx.end_time() {
        let _ = writeln!(out, "- **Finished:** {}", report_timestamp(&end));
    }
    if let Some(total) = ctx.total_duration() {
        let _ = writeln!(out, "- **Total duration:** {}", format_duration(total));
    }
    let _ = writeln!(out, "- **Input photos:** {}", ctx.photo_count);

    if let Some(sfm) = metrics.get(StageKind::Sfm.as_str()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", StageKind::Sfm.display_name());
        let _ = writeln!(out);
        write_common_lines(&mut out, sfm);

        // Missing or malformed values render as N/A; the line is always
        // present once the stage section exists.
        let alignment = match (
            sfm.get("registered_images").and_then(serde_json::Value::as_u64),
            sfm.get("total_images").and_then(serde_json::Value::as_u64),
        ) {
            (Some(registered), Some(total)) if total > 0 => {
                let rate = registered as f64 / total as f64 * 100.0;
                if rate < ALIGNMENT_ADVISORY_THRESHOLD {
                    advisories.push(format!(
                        "Only {rate:.1}% of input images were aligned. Consider more \
                         overlap between photos or a different feature type."
                    ));
                }
                format!("{registered} / {total} ({rate:.1}%)")
            }
            _ => "N/A".to_string(),
        };
        let _ = writeln!(out, "- **Aligned images:** {alignment}");

        let sparse = sfm
            .get("sparse_points")
            .and_then(serde_json::Value::as_u64)
            .map_or_else(|| "N/A".to_string(), |points| points.to_string());
        let _ = writeln!(out, "- **Sparse points:** {sparse}");

        match sfm
            .get("reprojection_error")
            .and_then(serde_json::Value::as_f64)
        {
            Some(error) => {
                let _ = writeln!(out, "- **Reprojection error:** {error:.3} px");
            }
            None => {
                let _ = writeln!(
                    out,
                    "- **Reprojection error:** N/A (could not be extracted; the step \
                     may not have completed)"
                );
            }
        }

        if ctx.config.run_mesh {
            out.push_str(&render_mesh_subsection(ctx));
        }
    }

    if let Some(splat) = metrics.get(StageKind::Reconstruction.as_str()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", StageKind::Reconstruction.display_name());
        let _ = writeln!(out);
        write_common_lines(&mut out, splat);

        let count = splat
            .get("gaussian_count")
            .and_then(serde_json::Value::as_u64)
            .map_or_else(|| "N/A".to_string(), |count| count.to_string());
        let _ = writeln!(out, "- **Gaussians:** {count}");

        match splat.get("final_loss").and_then(serde_json::Value::as_f64) {
            Some(loss) => {
                let _ = writeln!(out, "- **Training loss:** {loss:.4}");
                if loss > LOSS_ADVISORY_THRESHOLD {
                    advisories.push(format!(
                        "Final training loss ({loss:.4}) is high. The model may be \
                         under-trained; consider a higher quality preset."
                    ));
                }
            }
            None => {
                let _ = writeln!(out, "- **Training loss:** N/A");
            }
        }
    }

    if let Some(pc) = metrics.get(StageKind::GsToPc.as_str()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", StageKind::GsToPc.display_name());
        let _ = writeln!(out);
        write_common_lines(&mut out, pc);
        let count = pc
            .get("point_count")
            .and_then(serde_json::Value::as_u64)
            .map_or_else(|| "N/A".to_string(), |count| count.to_string());
        let _ = writeln!(out, "- **Points:** {count}");
    }

    // Metrics recorded under keys with no known stage kind still surface.
    for (key, value) in &metrics {
        if StageKind::from_key(key).is_some() {
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "## {key}");
        let _ = writeln!(out);
        write_common_lines(&mut out, value);
        if let Some(object) = value.as_object() {
            for (k, v) in object {
                if k == "status" || k == "duration_seconds" {
                    continue;
                }
                let _ = writeln!(out, "- **{k}:** {v}");
            }
        }
    }

    if !advisories.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Advisories");
        let _ = writeln!(out);
        for advisory in &advisories {
            let _ = writeln!(out, "- {advisory}");
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Artifacts");
    let _ = writeln!(out);
    if ctx.config.run_sparse {
        let _ = writeln!(out, "- Sparse reconstruction: `opensfm/reconstruction.json`");
    }
    if ctx.config.run_mesh {
        let _ = writeln!(out, "- Mesh: `odm_meshing/odm_mesh.ply`");
        let _ = writeln!(out, "- Orthophoto: `odm_orthophoto/odm_orthophoto.tif`");
        let _ = writeln!(
            out,
            "- Dense point cloud (LAZ): `odm_georeferencing/odm_georeferenced_model.laz`"
        );
        let _ = writeln!(
            out,
            "- Dense point cloud (PLY): `odm_georeferencing/odm_georeferenced_model.ply`"
        );
    }
    if ctx.config.run_gaussian {
        let _ = writeln!(out, "- Splat model: `3d_gsl/splat.ply`");
    }
    if ctx.config.run_gs_to_pc {
        let _ = writeln!(out, "- Dense point cloud: `3d_gsl/dense_pc.ply`");
    }
    let _ = writeln!(out, "- Metrics: `metrics.json`");
    let _ = writeln!(out, "- Process logs: `logs/`");

    out
}

/// Renders the ODM mesh/orthophoto subsection, checking which products
/// actually exist in the run directory.
fn render_mesh_subsection(ctx: &RunContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "### Mesh / Orthophoto");
    let _ = writeln!(out);

    let mesh = ctx.run_dir.join("odm_meshing").join("odm_mesh.ply");
    let orthophoto = ctx.run_dir.join("odm_orthophoto").join("odm_orthophoto.tif");
    let dense = ctx
        .run_dir
        .join("odm_georeferencing")
        .join("odm_georeferenced_model.laz");

    let status = if mesh.exists() || orthophoto.exists() || dense.exists() {
        "Generated"
    } else {
        "Not generated"
    };
    let _ = writeln!(out, "- **Status:** {status}");
    if mesh.exists() {
        let _ = writeln!(out, "- **Mesh:** `odm_meshing/odm_mesh.ply`");
    }
    if orthophoto.exists() {
        let _ = writeln!(out, "- **Orthophoto:** `odm_orthophoto/odm_orthophoto.tif`");
    }
    if dense.exists() {
        let _ = writeln!(
            out,
            "- **Georeferenced point cloud:** `odm_georeferencing/odm_georeferenced_model.laz`"
        );
    }
    out
}

/// Writes the status and duration lines shared by every stage section.
fn write_common_lines(out: &mut String, stage: &serde_json::Value) {
    if let Some(status) = stage.get("status").and_then(serde_json::Value::as_str) {
        let _ = writeln!(out, "- **Status:** {status}");
    }
    if let Some(duration) = stage
        .get("duration_seconds")
        .and_then(serde_json::Value::as_f64)
    {
        let _ = writeln!(out, "- **Duration:** {}", format_duration(duration));
    }
}
