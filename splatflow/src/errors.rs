//! Error types for the splatflow orchestration core.
//!
//! The taxonomy is deliberately small: configuration and resume problems
//! are fatal errors raised before any external process spawns, while stage
//! execution failures are represented as boolean outcomes, never as
//! errors (see [`crate::stage::Stage`]).

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for splatflow operations.
#[derive(Debug, Error)]
pub enum SplatflowError {
    /// A configuration error: an unmet stage dependency, a missing or
    /// invalid configuration value. Raised before any stage executes.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the unmet requirement.
        message: String,
    },

    /// A stage name that is not a recognized stage key at all.
    #[error("Unknown stage: {name}")]
    UnknownStage {
        /// The unrecognized name as requested.
        name: String,
    },

    /// A resume identifier was supplied but its run directory is absent.
    #[error("Resume ID {id} specified, but directory {dir} does not exist")]
    Resume {
        /// The resume identifier.
        id: String,
        /// The directory that was expected to exist.
        dir: PathBuf,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be decoded.
    #[error("Config parse error: {0}")]
    Parse(String),
}

impl SplatflowError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SplatflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for SplatflowError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = SplatflowError::config("Gaussian Splatting requires sparse reconstruction");
        assert!(err
            .to_string()
            .contains("Gaussian Splatting requires sparse reconstruction"));
    }

    #[test]
    fn test_resume_error_message() {
        let err = SplatflowError::Resume {
            id: "20240101_120000".to_string(),
            dir: PathBuf::from("/data/runs/20240101_120000"),
        };
        assert!(err.to_string().contains("20240101_120000"));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_unknown_stage_error() {
        let err = SplatflowError::UnknownStage {
            name: "texturing".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown stage: texturing");
    }
}
