//! The remote-refreshed pattern cache.
//!
//! Workers call [`PatternCache::load`] once per request. The cache refreshes
//! from the pattern server when the on-disk copy goes stale, keeps serving
//! the prior config if a refresh fails, and never persists bytes that did not
//! parse - a bad remote deploy cannot poison the durable cache.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::PatternConfig;
use crate::deadline::Deadline;
use crate::fs_util;

use super::{GitleaksConfig, PatternError, parse_config};

const FETCH_FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CacheState {
    config: Option<Arc<GitleaksConfig>>,
    hash: Option<[u8; 32]>,
}

/// Fetches, validates, persists, and serves detection pattern configuration.
///
/// All of [`PatternCache::load`] runs under one mutex: concurrent loads
/// serialise, exactly one refresh is in flight at a time, and the others
/// observe its result.
pub struct PatternCache {
    client: reqwest::blocking::Client,
    config: PatternConfig,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for PatternCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternCache")
            .field("server_url", &self.config.server.url)
            .field("local_path", &self.config.gitleaks.local_path)
            .field("autofetch", &self.config.autofetch)
            .finish_non_exhaustive()
    }
}

impl PatternCache {
    /// Creates a cache using the given HTTP client.
    #[must_use]
    pub fn new(config: PatternConfig, client: reqwest::blocking::Client) -> Self {
        Self {
            client,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Returns the current pattern configuration, refreshing it first when
    /// the cached file is stale and autofetch is enabled.
    ///
    /// A failed refresh leaves both the in-memory config and the on-disk
    /// bytes untouched and surfaces the error to the caller.
    pub fn load(&self, deadline: &Deadline) -> Result<Arc<GitleaksConfig>, PatternError> {
        let mut state = self.lock_state();

        let local_path = &self.config.gitleaks.local_path;
        let stale = mod_time_exceeds(local_path, self.config.refresh_after);

        if self.config.autofetch && stale {
            info!("fetching gitleaks patterns");
            return self.refresh(&mut state, deadline);
        }

        if let Some(config) = &state.config {
            return Ok(Arc::clone(config));
        }

        if !self.config.autofetch && mod_time_exceeds(local_path, self.config.expired_after) {
            return Err(PatternError::Expired {
                path: local_path.clone(),
            });
        }

        let raw = fs::read_to_string(local_path).map_err(|source| PatternError::Io {
            path: local_path.clone(),
            source,
        })?;
        let parsed = parse_config(&raw).inspect_err(|_| debug!("loaded config did not parse"))?;

        let config = Arc::new(parsed);
        state.config = Some(Arc::clone(&config));
        state.hash = Some(Sha256::digest(raw.as_bytes()).into());

        Ok(config)
    }

    /// Hex SHA-256 of the raw bytes behind the current config, when loaded.
    #[must_use]
    pub fn config_hash(&self) -> Option<String> {
        self.lock_state().hash.map(hex::encode)
    }

    fn refresh(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
        deadline: &Deadline,
    ) -> Result<Arc<GitleaksConfig>, PatternError> {
        let raw = self.fetch(deadline)?;

        // Parse before any write so invalid remote bytes can never replace a
        // valid durable cache.
        let parsed = parse_config(&raw).inspect_err(|_| debug!("fetched config did not parse"))?;

        let config = Arc::new(parsed);
        state.config = Some(Arc::clone(&config));

        let local_path = &self.config.gitleaks.local_path;
        fs_util::write_private(local_path, raw.as_bytes()).map_err(|source| PatternError::Io {
            path: local_path.clone(),
            source,
        })?;

        let hash: [u8; 32] = Sha256::digest(raw.as_bytes()).into();
        if state.hash != Some(hash) {
            state.hash = Some(hash);
            info!(hash = %hex::encode(hash), "updated gitleaks patterns");
        }

        Ok(config)
    }

    fn fetch(&self, deadline: &Deadline) -> Result<String, PatternError> {
        let url = format!(
            "{}/patterns/gitleaks/{}",
            self.config.server.url.trim_end_matches('/'),
            self.config.gitleaks.version,
        );
        debug!(url = %url, "fetching pattern config");

        let mut request = self
            .client
            .get(&url)
            .timeout(deadline.remaining().unwrap_or(FETCH_FALLBACK_TIMEOUT));

        if !self.config.server.auth_token.is_empty() {
            debug!("setting authorization header");
            request = request.header("Authorization", format!("Bearer {}", self.config.server.auth_token));
        }

        let response = request.send()?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PatternError::Status(status.as_u16()));
        }

        Ok(response.text()?)
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn mod_time_exceeds(path: &Path, limit_secs: u64) -> bool {
    // A zero limit disables the check entirely.
    if limit_secs == 0 {
        return false;
    }

    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified
            .elapsed()
            .map(|age| age.as_secs() > limit_secs)
            .unwrap_or(false),
        // Missing file: needs fetching.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GitleaksPatternConfig, PatternServerConfig};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::thread;

    const VALID_CONFIG: &str = r#"
[[rules]]
id = "generic-secret"
regex = '''secret\s*=\s*"([0-9A-Za-z]{8,})"'''
secretGroup = 1
"#;

    fn cache_config(local_path: PathBuf, url: &str, autofetch: bool) -> PatternConfig {
        PatternConfig {
            server: PatternServerConfig {
                url: url.to_string(),
                auth_token: String::new(),
            },
            gitleaks: GitleaksPatternConfig {
                version: "test-1".to_string(),
                local_path,
            },
            autofetch,
            refresh_after: 3600,
            expired_after: 7200,
        }
    }

    fn cache(config: PatternConfig) -> PatternCache {
        PatternCache::new(config, reqwest::blocking::Client::new())
    }

    /// Serves one canned HTTP response per expected request and reports the
    /// request head (for header assertions) over a channel.
    fn serve_once(body: String, status: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = [0u8; 4096];
            let read = stream.read(&mut head).unwrap_or(0);
            let _ = tx.send(String::from_utf8_lossy(&head[..read]).into_owned());

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len(),
            );
            let _ = stream.write_all(response.as_bytes());
        });

        (format!("http://{addr}"), rx)
    }

    #[test]
    fn loads_from_fresh_local_file_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("patterns");
        fs::write(&local_path, VALID_CONFIG).unwrap();

        let cache = cache(cache_config(local_path, "http://127.0.0.1:1", true));
        let config = cache.load(&Deadline::none()).unwrap();

        assert_eq!(config.rules.len(), 1);
        assert!(cache.config_hash().is_some());
    }

    #[test]
    fn second_load_serves_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("patterns");
        fs::write(&local_path, VALID_CONFIG).unwrap();

        let cache = cache(cache_config(local_path.clone(), "http://127.0.0.1:1", true));
        let first = cache.load(&Deadline::none()).unwrap();

        // Remove the file; the in-memory config keeps serving.
        fs::remove_file(&local_path).unwrap();
        let second = cache.load(&Deadline::none()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_file_with_autofetch_disabled_expires() {
        let dir = tempfile::tempdir().unwrap();
        let config = cache_config(dir.path().join("patterns"), "http://127.0.0.1:1", false);
        let cache = cache(config);

        assert!(matches!(
            cache.load(&Deadline::none()),
            Err(PatternError::Expired { .. })
        ));
    }

    #[test]
    fn missing_file_without_expiry_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = cache_config(dir.path().join("patterns"), "http://127.0.0.1:1", false);
        config.expired_after = 0;
        let cache = cache(config);

        assert!(matches!(cache.load(&Deadline::none()), Err(PatternError::Io { .. })));
    }

    #[test]
    fn stale_cache_fetches_persists_and_sends_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("nested").join("patterns");
        let (url, requests) = serve_once(VALID_CONFIG.to_string(), "200 OK");

        let mut config = cache_config(local_path.clone(), &url, true);
        config.server.auth_token = "sekrit-token".to_string();
        let cache = cache(config);

        let loaded = cache.load(&Deadline::none()).unwrap();
        assert_eq!(loaded.rules.len(), 1);

        let request_head = requests.recv().unwrap();
        assert!(request_head.starts_with("GET /patterns/gitleaks/test-1 "));
        assert!(
            request_head
                .to_lowercase()
                .contains("authorization: bearer sekrit-token")
        );

        assert_eq!(fs::read_to_string(&local_path).unwrap(), VALID_CONFIG);
        assert!(cache.config_hash().is_some());
    }

    #[test]
    fn non_200_status_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _requests) = serve_once("gone".to_string(), "404 Not Found");

        let cache = cache(cache_config(dir.path().join("patterns"), &url, true));
        assert!(matches!(cache.load(&Deadline::none()), Err(PatternError::Status(404))));
    }

    #[test]
    fn invalid_remote_config_never_touches_the_durable_cache() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("patterns");
        fs::write(&local_path, VALID_CONFIG).unwrap();

        // Stale file forces a refresh; the server returns garbage.
        let (url, _requests) = serve_once("rules = \"not really\"".to_string(), "200 OK");
        let mut config = cache_config(local_path.clone(), &url, true);
        config.refresh_after = 1;
        let cache = cache(config);

        std::thread::sleep(Duration::from_millis(1100));
        let result = cache.load(&Deadline::none());

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&local_path).unwrap(), VALID_CONFIG);
    }

    #[test]
    fn mod_time_limit_zero_never_exceeds() {
        assert!(!mod_time_exceeds(Path::new("/nonexistent/leaktk"), 0));
        assert!(mod_time_exceeds(Path::new("/nonexistent/leaktk"), 1));
    }
}
