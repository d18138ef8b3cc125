//! Progress-signal extraction from free-text process output.

use regex::Regex;
use std::sync::OnceLock;

fn percent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid percent regex"))
}

fn fraction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d+)\s*(?:of|/)\s*(\d+)").expect("valid fraction regex"))
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("valid ansi regex")
    })
}

/// Extracts a progress percentage from one output line.
///
/// Two patterns are tried in order, first match wins:
///
/// 1. an explicit percentage token (`"50%"`, `"Progress: 75.5%"`)
/// 2. a fraction (`"50/100"`, `"Processing 25 of 50"`), converted to percent
///
/// Lines without either pattern yield `None`.
#[must_use]
pub fn extract_progress(line: &str) -> Option<f64> {
    if let Some(caps) = percent_re().captures(line) {
        if let Ok(pct) = caps[1].parse::<f64>() {
            return Some(pct);
        }
    }

    if let Some(caps) = fraction_re().captures(line) {
        let current = caps[1].parse::<f64>().ok()?;
        let total = caps[2].parse::<f64>().ok()?;
        if total > 0.0 {
            return Some(current / total * 100.0);
        }
    }

    None
}

/// Removes ANSI escape sequences (colors, cursor movement) from a line.
#[must_use]
pub fn strip_ansi(line: &str) -> String {
    ansi_re().replace_all(line, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_percent_pattern() {
        assert_eq!(extract_progress("50%"), Some(50.0));
        assert_eq!(extract_progress("Progress: 75.5%"), Some(75.5));
        assert_eq!(extract_progress("[=====>    ] 30 %"), Some(30.0));
    }

    #[test]
    fn test_fraction_pattern() {
        assert_eq!(extract_progress("Processing 25 of 50"), Some(50.0));
        assert_eq!(extract_progress("frame 50/100"), Some(50.0));
        assert_eq!(extract_progress("Matched 3 OF 4 images"), Some(75.0));
    }

    #[test]
    fn test_percent_wins_over_fraction() {
        // "10/20 (50%)" carries both signals; the explicit percent wins.
        assert_eq!(extract_progress("10/20 (50%)"), Some(50.0));
    }

    #[test]
    fn test_zero_denominator() {
        assert_eq!(extract_progress("0 of 0 done"), None);
    }

    #[test]
    fn test_no_pattern() {
        assert_eq!(extract_progress("loading features"), None);
        assert_eq!(extract_progress(""), None);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[32mOK\x1b[0m"), "OK");
        assert_eq!(strip_ansi("plain text"), "plain text");
        assert_eq!(strip_ansi("\x1b[1;31merror\x1b[0m: 50%"), "error: 50%");
    }

    #[test]
    fn test_progress_survives_color_codes() {
        let line = strip_ansi("\x1b[36mIteration 150 of 300\x1b[0m");
        assert_eq!(extract_progress(&line), Some(50.0));
    }
}
