//! Engine configuration.
//!
//! Loaded once from TOML (plus a couple of environment overrides) and handed
//! to the engine as an immutable snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{PATTERN_SERVER_AUTH_TOKEN_ENV, PATTERN_SERVER_URL_ENV};

const DEFAULT_PATTERN_SERVER_URL: &str = "https://raw.githubusercontent.com/leaktk/patterns/main/target";
const DEFAULT_GITLEAKS_VERSION: &str = "8.18.2";
const DEFAULT_REFRESH_AFTER_SECS: u64 = 60 * 60 * 12;
const DEFAULT_EXPIRED_AFTER_SECS: u64 = 60 * 60 * 24 * 7;

/// Errors from loading the engine configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config: path={path:?}: {source}")]
    Io {
        /// Location of the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("could not parse config: {0}")]
    Parse(#[from] Box<toml::de::Error>),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings read by the CLI bootstrap.
    pub logger: LoggerConfig,
    /// Engine settings.
    pub scanner: ScannerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Whether requests may scan local paths in place.
    pub allow_local: bool,
    /// Scratch directory; clones land under `{workdir}/clones`.
    pub workdir: PathBuf,
    /// Per-request timeout in seconds. Zero disables the deadline.
    pub scan_timeout: u64,
    /// Number of scan worker threads.
    pub scan_workers: usize,
    /// Request queue bound. Zero is unbounded.
    pub max_scan_queue_size: usize,
    /// Response queue bound. Zero is unbounded.
    pub max_response_queue_size: usize,
    /// Nested archive recursion budget for container layers.
    pub max_archive_depth: u32,
    /// Nested base64 decode budget for the detector.
    pub max_decode_depth: u32,
    /// Cap applied to requested git history depth. Zero means uncapped.
    pub max_scan_depth: u32,
    /// Pattern cache settings.
    pub patterns: PatternConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            allow_local: true,
            workdir: std::env::temp_dir().join("leaktk"),
            scan_timeout: 0,
            scan_workers: 1,
            max_scan_queue_size: 0,
            max_response_queue_size: 0,
            max_archive_depth: 8,
            max_decode_depth: 8,
            max_scan_depth: 0,
            patterns: PatternConfig::default(),
        }
    }
}

/// Pattern cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Remote pattern server.
    pub server: PatternServerConfig,
    /// Which gitleaks pattern release to fetch and where to cache it.
    pub gitleaks: GitleaksPatternConfig,
    /// Whether stale patterns are refreshed from the server.
    pub autofetch: bool,
    /// Seconds after which the cached file counts as stale. Zero disables
    /// refreshing.
    pub refresh_after: u64,
    /// Seconds after which the cached file may no longer be used when
    /// autofetch is disabled. Zero disables expiry.
    pub expired_after: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            server: PatternServerConfig::default(),
            gitleaks: GitleaksPatternConfig::default(),
            autofetch: true,
            refresh_after: DEFAULT_REFRESH_AFTER_SECS,
            expired_after: DEFAULT_EXPIRED_AFTER_SECS,
        }
    }
}

/// Remote pattern server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternServerConfig {
    /// Base URL; patterns are fetched from
    /// `{url}/patterns/gitleaks/{version}`.
    pub url: String,
    /// Bearer token sent when non-empty.
    pub auth_token: String,
}

impl Default for PatternServerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PATTERN_SERVER_URL.to_string(),
            auth_token: String::new(),
        }
    }
}

/// Gitleaks pattern release settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GitleaksPatternConfig {
    /// Pattern release to request from the server.
    pub version: String,
    /// On-disk cache file. Defaults to a path under the workdir.
    pub local_path: PathBuf,
}

impl Config {
    /// Loads configuration from `path`, or defaults when `path` is `None`,
    /// then applies environment overrides and derived defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(Box::new)?
            }
            None => Self::default(),
        };

        config.apply_env();
        config.normalize();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(PATTERN_SERVER_URL_ENV)
            && !url.is_empty()
        {
            self.scanner.patterns.server.url = url;
        }

        if let Ok(token) = std::env::var(PATTERN_SERVER_AUTH_TOKEN_ENV)
            && !token.is_empty()
        {
            self.scanner.patterns.server.auth_token = token;
        }
    }

    fn normalize(&mut self) {
        let patterns = &mut self.scanner.patterns;

        if patterns.gitleaks.version.is_empty() {
            patterns.gitleaks.version = DEFAULT_GITLEAKS_VERSION.to_string();
        }

        if patterns.gitleaks.local_path.as_os_str().is_empty() {
            patterns.gitleaks.local_path = self
                .scanner
                .workdir
                .join("patterns")
                .join("gitleaks")
                .join(&patterns.gitleaks.version);
        }
    }
}
