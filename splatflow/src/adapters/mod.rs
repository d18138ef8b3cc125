//! Concrete stage implementations wrapping the external containerized
//! tools.
//!
//! Each adapter owns three things: the idempotence predicate over its
//! output artifact, the docker command construction, and best-effort
//! metrics extraction from the artifacts it leaves behind. The
//! reconstruction algorithms themselves stay opaque behind the process
//! boundary.

mod gs_to_pc;
mod odm;
mod opensplat;

pub use gs_to_pc::GsToPcStage;
pub use odm::OdmSfmStage;
pub use opensplat::OpenSplatStage;

use crate::config::PipelineConfig;
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Remaps a path under the working directory to its host equivalent when
/// running docker-outside-of-docker.
///
/// `HOST_DATA_DIR` names the host path of the working directory; without
/// it, paths are used as-is (direct host execution).
pub(crate) fn host_path(config: &PipelineConfig, path: &Path) -> PathBuf {
    match std::env::var("HOST_DATA_DIR") {
        Ok(host_root) => match path.strip_prefix(config.working_dir()) {
            Ok(rel) => PathBuf::from(host_root).join(rel),
            Err(_) => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Reads the vertex count from a PLY header (`element vertex N`).
///
/// Only the ASCII header is scanned; the (possibly binary) body is never
/// touched. Returns `None` for missing or malformed files.
pub(crate) fn ply_vertex_count(path: &Path) -> Option<u64> {
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);

    for line in reader.lines().take(200) {
        let line = line.ok()?;
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("element vertex ") {
            return rest.trim().parse().ok();
        }
        if trimmed == "end_header" {
            break;
        }
    }
    None
}

/// Shared prefix for every adapter's container invocation.
pub(crate) fn docker_run_prefix(use_gpu: bool) -> Vec<String> {
    let mut cmd: Vec<String> = ["docker", "run", "--rm"]
        .iter()
        .map(ToString::to_string)
        .collect();
    if use_gpu {
        cmd.push("--gpus".to_string());
        cmd.push("all".to_string());
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ply_vertex_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("splat.ply");
        std::fs::write(
            &path,
            "ply\nformat binary_little_endian 1.0\nelement vertex 123456\nproperty float x\nend_header\n",
        )
        .expect("write");

        assert_eq!(ply_vertex_count(&path), Some(123_456));
    }

    #[test]
    fn test_ply_vertex_count_missing_file() {
        assert_eq!(ply_vertex_count(Path::new("/nonexistent/splat.ply")), None);
    }

    #[test]
    fn test_ply_vertex_count_no_vertex_element() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("odd.ply");
        std::fs::write(&path, "ply\nformat ascii 1.0\nend_header\n").expect("write");

        assert_eq!(ply_vertex_count(&path), None);
    }

    #[test]
    fn test_docker_run_prefix() {
        assert_eq!(docker_run_prefix(false), vec!["docker", "run", "--rm"]);
        assert_eq!(
            docker_run_prefix(true),
            vec!["docker", "run", "--rm", "--gpus", "all"]
        );
    }
}
