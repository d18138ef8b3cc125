//! Pipeline configuration.
//!
//! A task is described by a JSON or YAML file rooted at a working
//! directory that contains the input images and receives all run output.
//! `DATA_DIR` overrides the working directory; when neither is given the
//! config file's parent directory is used.

use crate::errors::SplatflowError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_quality_preset() -> String {
    "medium".to_string()
}

fn default_feature_type() -> String {
    "sift".to_string()
}

fn default_sh_degree() -> u32 {
    3
}

fn default_sfm_image() -> String {
    "opendronemap/odm:latest".to_string()
}

fn default_reconstruction_image() -> String {
    "opensplat:latest".to_string()
}

fn default_gs_to_pc_image() -> String {
    "gs2pc-tool:latest".to_string()
}

/// Container images for the external reconstruction tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Docker image providing the SfM toolchain (ODM includes OpenSfM).
    #[serde(default = "default_sfm_image")]
    pub sfm_docker_image: String,
    /// Docker image providing Gaussian-splat training.
    #[serde(default = "default_reconstruction_image")]
    pub reconstruction_docker_image: String,
    /// Docker image providing splat-to-point-cloud conversion.
    #[serde(default = "default_gs_to_pc_image")]
    pub gs_to_pc_docker_image: String,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            sfm_docker_image: default_sfm_image(),
            reconstruction_docker_image: default_reconstruction_image(),
            gs_to_pc_docker_image: default_gs_to_pc_image(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Project directory. Structure: `working_dir/images/` for input,
    /// `working_dir/runs/<run_id>/` for every output. If not set, inferred
    /// from the config file location or the `DATA_DIR` environment variable.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// External tool images.
    #[serde(default)]
    pub algorithms: AlgorithmConfig,

    /// Run sparse reconstruction (SfM).
    #[serde(default = "default_true")]
    pub run_sparse: bool,
    /// Generate a 3D mesh (via ODM, requires sparse).
    #[serde(default)]
    pub run_mesh: bool,
    /// Run Gaussian-splat training (requires sparse).
    #[serde(default = "default_true")]
    pub run_gaussian: bool,
    /// Convert the splat model to a dense point cloud (requires gaussian).
    #[serde(default)]
    pub run_gs_to_pc: bool,

    /// Quality preset: "high", "medium" or "low".
    #[serde(default = "default_quality_preset")]
    pub quality_preset: String,
    /// SfM feature type (sift, akaze, ...).
    #[serde(default = "default_feature_type")]
    pub feature_type: String,
    /// Gaussian Splatting spherical-harmonics degree (1-3).
    #[serde(default = "default_sh_degree")]
    pub sh_degree: u32,
    /// Use GPS data from image EXIF if available.
    #[serde(default = "default_true")]
    pub use_gps: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            algorithms: AlgorithmConfig::default(),
            run_sparse: true,
            run_mesh: false,
            run_gaussian: true,
            run_gs_to_pc: false,
            quality_preset: default_quality_preset(),
            feature_type: default_feature_type(),
            sh_degree: default_sh_degree(),
            use_gps: true,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration file, auto-detecting JSON vs YAML by extension.
    ///
    /// Resolution order for the working directory: `DATA_DIR` environment
    /// variable, then the `working_dir` field, then the config file's
    /// parent directory. The images directory must exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SplatflowError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        let mut config: Self = if ext == "yaml" || ext == "yml" {
            serde_yaml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw)?
        };

        if let Ok(env_dir) = std::env::var("DATA_DIR") {
            config.working_dir = Some(PathBuf::from(env_dir));
        } else if config.working_dir.is_none() {
            config.working_dir = path.parent().map(Path::to_path_buf);
        }

        config.validate_paths()?;
        Ok(config)
    }

    /// Verifies that the working directory and its images directory exist.
    pub fn validate_paths(&self) -> Result<(), SplatflowError> {
        let Some(working_dir) = &self.working_dir else {
            return Err(SplatflowError::config(
                "working_dir is not set. Use from_file() to auto-infer from the config path.",
            ));
        };

        let images = working_dir.join("images");
        if !images.is_dir() {
            return Err(SplatflowError::config(format!(
                "Input images directory not found: {}. Place your images in {}/images/",
                images.display(),
                working_dir.display()
            )));
        }
        Ok(())
    }

    /// The resolved working directory.
    ///
    /// Callers must have run [`Self::validate_paths`] first; an unset
    /// working directory here is a programming error.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.working_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
    }

    /// Input images directory - always `working_dir/images`.
    #[must_use]
    pub fn input_images_dir(&self) -> PathBuf {
        self.working_dir().join("images")
    }

    /// Parent directory of all run directories - `working_dir/runs`.
    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.working_dir().join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.run_sparse);
        assert!(config.run_gaussian);
        assert!(!config.run_mesh);
        assert!(!config.run_gs_to_pc);
        assert_eq!(config.quality_preset, "medium");
        assert_eq!(config.sh_degree, 3);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"run_gaussian": false, "quality_preset": "high"}"#)
                .expect("valid json");
        assert!(!config.run_gaussian);
        assert!(config.run_sparse);
        assert_eq!(config.quality_preset, "high");
        assert_eq!(
            config.algorithms.sfm_docker_image,
            "opendronemap/odm:latest"
        );
    }

    #[test]
    fn test_deserialize_yaml() {
        let config: PipelineConfig =
            serde_yaml::from_str("run_mesh: true\nsh_degree: 2\n").expect("valid yaml");
        assert!(config.run_mesh);
        assert_eq!(config.sh_degree, 2);
    }

    #[test]
    fn test_from_file_infers_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("images")).expect("mkdir");
        let config_path = dir.path().join("task.json");
        std::fs::write(&config_path, r#"{"run_gaussian": true}"#).expect("write");

        let config = PipelineConfig::from_file(&config_path).expect("load");
        assert_eq!(config.working_dir(), dir.path());
        assert_eq!(config.input_images_dir(), dir.path().join("images"));
    }

    #[test]
    fn test_missing_images_dir_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("task.yaml");
        std::fs::write(&config_path, "run_sparse: true\n").expect("write");

        let err = PipelineConfig::from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("images"));
    }
}
