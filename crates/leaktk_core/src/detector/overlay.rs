//! Source-tree overlay files.
//!
//! Repositories carry their own detector adjustments: `.gitleaks.toml`
//! appends allowlists, `.gitleaksbaseline` suppresses previously accepted
//! findings, and `.gitleaksignore` suppresses individual fingerprints. All
//! three are best-effort; a broken overlay never fails a scan.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, error};

use super::Detector;
use crate::pattern;

#[derive(Deserialize)]
struct BaselineFinding {
    #[serde(rename = "Fingerprint", alias = "fingerprint")]
    fingerprint: String,
}

impl Detector {
    /// Applies the overlay files found in `source_path`, when it is a
    /// directory. Read and parse failures are logged and skipped.
    pub fn apply_source_overlay(&mut self, source_path: &Path) {
        if !source_path.is_dir() {
            return;
        }

        self.apply_additional_config(source_path);
        self.apply_baseline(source_path);
        self.apply_ignore_file(source_path);
    }

    fn apply_additional_config(&mut self, source_path: &Path) {
        let config_path = source_path.join(".gitleaks.toml");
        let raw = match fs::read_to_string(&config_path) {
            Ok(raw) if !raw.is_empty() => raw,
            _ => {
                debug!("no additional config");
                return;
            }
        };

        debug!(path = %config_path.display(), "applying additional config");
        match pattern::parse_config(&raw) {
            // Only allowlists merge; a repository cannot add rules to the
            // operator's pattern set.
            Ok(additional) => self.extend_allowlists(additional.allowlists),
            Err(err) => error!(error = %err, "could not parse additional config"),
        }
    }

    fn apply_baseline(&mut self, source_path: &Path) {
        let baseline_path = source_path.join(".gitleaksbaseline");
        let Ok(raw) = fs::read_to_string(&baseline_path) else {
            return;
        };

        debug!(path = %baseline_path.display(), "applying .gitleaksbaseline");
        match serde_json::from_str::<Vec<BaselineFinding>>(&raw) {
            Ok(findings) => {
                self.ignore_fingerprints(findings.into_iter().map(|f| f.fingerprint));
            }
            Err(err) => error!(error = %err, "could not add baseline"),
        }
    }

    fn apply_ignore_file(&mut self, source_path: &Path) {
        let ignore_path = source_path.join(".gitleaksignore");
        let Ok(raw) = fs::read_to_string(&ignore_path) else {
            return;
        };

        debug!(path = %ignore_path.display(), "applying .gitleaksignore");
        let fingerprints = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string);
        self.ignore_fingerprints(fingerprints);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pattern::parse_config;
    use crate::sources::Fragment;

    const CONFIG: &str = r#"
[[rules]]
id = "generic-secret"
regex = '''secret\s*=\s*"([0-9A-Za-z]{8,})"'''
secretGroup = 1
keywords = ["secret"]
"#;

    fn scan_one(detector: &Detector, path: &str) -> usize {
        let mut out = Vec::new();
        detector.scan_fragment(
            &Fragment {
                path: path.to_string(),
                text: r#"secret = "I6gHcCmvAbCdEf01""#.to_string(),
                commit: None,
            },
            &mut out,
        );
        out.len()
    }

    fn fresh_detector() -> Detector {
        Detector::new(Arc::new(parse_config(CONFIG).unwrap()), 0)
    }

    #[test]
    fn gitleaks_toml_allowlists_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".gitleaks.toml"),
            "[[allowlists]]\npaths = ['''^generated/''']\n",
        )
        .unwrap();

        let mut detector = fresh_detector();
        detector.apply_source_overlay(dir.path());

        assert_eq!(scan_one(&detector, "generated/code.py"), 0);
        assert_eq!(scan_one(&detector, "src/code.py"), 1);
    }

    #[test]
    fn gitleaksignore_fingerprints_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".gitleaksignore"),
            "# comment\napp.py:generic-secret:1\n\n",
        )
        .unwrap();

        let mut detector = fresh_detector();
        detector.apply_source_overlay(dir.path());

        assert_eq!(scan_one(&detector, "app.py"), 0);
        assert_eq!(scan_one(&detector, "other.py"), 1);
    }

    #[test]
    fn baseline_findings_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".gitleaksbaseline"),
            r#"[{"Fingerprint":"app.py:generic-secret:1"}]"#,
        )
        .unwrap();

        let mut detector = fresh_detector();
        detector.apply_source_overlay(dir.path());

        assert_eq!(scan_one(&detector, "app.py"), 0);
    }

    #[test]
    fn broken_overlays_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitleaks.toml"), "not [valid toml").unwrap();
        fs::write(dir.path().join(".gitleaksbaseline"), "not json").unwrap();

        let mut detector = fresh_detector();
        detector.apply_source_overlay(dir.path());

        assert_eq!(scan_one(&detector, "app.py"), 1);
    }

    #[test]
    fn missing_directory_is_a_no_op() {
        let mut detector = fresh_detector();
        detector.apply_source_overlay(Path::new("/nonexistent/leaktk-test"));
        assert_eq!(scan_one(&detector, "app.py"), 1);
    }
}
