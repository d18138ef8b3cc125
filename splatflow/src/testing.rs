//! Test doubles for exercising the engine without containers.

use crate::context::RunContext;
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// A scriptable stage for engine tests.
///
/// Records its invocations (by stage key) into an optional shared vector
/// so tests can assert on execution order.
#[derive(Debug, Default)]
pub struct MockStage {
    kind: Option<StageKind>,
    result: bool,
    metrics: Option<serde_json::Value>,
    artifact_ready: bool,
    recorder: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockStage {
    /// A mock stage whose `execute` succeeds.
    #[must_use]
    pub fn succeeding(kind: StageKind) -> Self {
        Self {
            kind: Some(kind),
            result: true,
            ..Self::default()
        }
    }

    /// A mock stage whose `execute` fails.
    #[must_use]
    pub fn failing(kind: StageKind) -> Self {
        Self {
            kind: Some(kind),
            result: false,
            ..Self::default()
        }
    }

    /// Metrics patch recorded on execution, successful or not.
    #[must_use]
    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Makes `output_ready` report an existing artifact.
    #[must_use]
    pub fn with_artifact_ready(mut self) -> Self {
        self.artifact_ready = true;
        self
    }

    /// Shares an invocation recorder with the test.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<Mutex<Vec<String>>>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

#[async_trait]
impl Stage for MockStage {
    fn kind(&self) -> StageKind {
        self.kind.unwrap_or(StageKind::Sfm)
    }

    fn output_ready(&self, _ctx: &RunContext) -> bool {
        self.artifact_ready
    }

    async fn execute(&self, ctx: &RunContext) -> bool {
        if let Some(recorder) = &self.recorder {
            recorder.lock().push(self.kind().as_str().to_string());
        }
        if let Some(metrics) = &self.metrics {
            ctx.record_metrics(self.kind().as_str(), metrics.clone());
        }
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::events::{EventSink, NoOpEventSink};

    #[tokio::test]
    async fn test_mock_stage_records_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("images")).expect("mkdir");
        let config = PipelineConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..PipelineConfig::default()
        };
        let sink: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        let ctx = RunContext::new(config, None, None, &sink).expect("context");

        let calls = Arc::new(Mutex::new(Vec::new()));
        let stage = MockStage::succeeding(StageKind::Reconstruction)
            .with_metrics(serde_json::json!({"gaussian_count": 9}))
            .with_recorder(calls.clone());

        assert!(stage.execute(&ctx).await);
        assert_eq!(*calls.lock(), vec!["reconstruction".to_string()]);
        assert_eq!(
            ctx.stage_metrics("reconstruction").expect("metrics")["gaussian_count"],
            9
        );
    }
}
