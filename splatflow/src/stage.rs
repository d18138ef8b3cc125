//! Stage contract and the closed set of known stage kinds.
//!
//! Stages are the polymorphic units of pipeline work. Failure is a normal
//! boolean outcome, not an error: a stage that returns `false` aborts the
//! pipeline without unwinding.

use crate::context::RunContext;
use async_trait::async_trait;
use std::fmt::Debug;

/// The closed enumeration of known stage kinds.
///
/// New stage kinds are added here as new variants together with a report
/// section mapping in [`crate::report`]; metrics recorded under a key with
/// no variant still reach the raw dump and the generic report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Sparse reconstruction (structure from motion), mesh included when
    /// mesh generation is enabled.
    Sfm,
    /// Gaussian-splat training.
    Reconstruction,
    /// Splat model to dense point cloud conversion.
    GsToPc,
}

impl StageKind {
    /// All known stage kinds in their canonical execution order.
    pub const ALL: [Self; 3] = [Self::Sfm, Self::Reconstruction, Self::GsToPc];

    /// The stable metrics/report key for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sfm => "sfm",
            Self::Reconstruction => "reconstruction",
            Self::GsToPc => "gs_to_pc",
        }
    }

    /// Human-readable name used in log events and the report.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Sfm => "Structure from Motion",
            Self::Reconstruction => "Reconstruction / Splatting",
            Self::GsToPc => "Gaussian to Point Cloud",
        }
    }

    /// Parses a stage key. Returns `None` for unrecognized names.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == key)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for pipeline stages.
///
/// Concrete implementations live in [`crate::adapters`]; the engine
/// depends only on this contract.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// The kind of this stage.
    fn kind(&self) -> StageKind;

    /// Human-readable name for logging.
    fn display_name(&self) -> &'static str {
        self.kind().display_name()
    }

    /// Returns true when the stage's expected output artifact already
    /// exists in the run directory.
    ///
    /// This is the explicit idempotence predicate: when it holds,
    /// [`Self::execute`] must return success without launching any
    /// external process.
    fn output_ready(&self, ctx: &RunContext) -> bool;

    /// Executes the stage against the run context.
    ///
    /// Returns `true` on success. Failure (nonzero external exit,
    /// cancellation, probe failure) is the `false` outcome.
    async fn execute(&self, ctx: &RunContext) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_keys_round_trip() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_key(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_unknown_key() {
        assert_eq!(StageKind::from_key("texturing"), None);
        assert_eq!(StageKind::from_key(""), None);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(StageKind::Sfm.display_name(), "Structure from Motion");
        assert_eq!(StageKind::Sfm.to_string(), "sfm");
    }
}
