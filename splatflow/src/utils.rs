//! Small shared utilities: timestamps, log-file slugs, duration formatting.

use chrono::{DateTime, Local, Utc};

/// Returns the current local time formatted for run identifiers and
/// per-invocation log file names: `YYYYMMDD_HHMMSS`.
#[must_use]
pub fn run_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Returns the current UTC time as an ISO 8601 formatted string.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Formats a timestamp for human-readable report output.
#[must_use]
pub fn report_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Converts a step name into a file-system-safe slug.
///
/// Lowercases and replaces every character outside `[a-z0-9_-]` with `_`,
/// so `"ODM/OpenSfM"` becomes `"odm_opensfm"`.
#[must_use]
pub fn slug(step_name: &str) -> String {
    step_name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Formats a duration in seconds as `1h 2m 3s`, omitting zero leading units.
#[must_use]
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;

    let mut parts = Vec::new();
    if h > 0 {
        parts.push(format!("{h}h"));
    }
    if m > 0 {
        parts.push(format!("{m}m"));
    }
    parts.push(format!("{s}s"));
    parts.join(" ")
}
