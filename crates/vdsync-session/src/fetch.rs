//! Download and cache of the auxiliary resolution tool.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use vdsync_config::{write_atomic, ToolConfig};
use vdsync_provision::{sha256_hex, RetryPolicy};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("reading download failed: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("{file} is not cached and no download url is configured")]
    NoSource { file: String },
}

/// Trait for fetching a URL's body.
pub trait ToolFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP(S) fetch through a `ureq` agent.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl ToolFetcher for HttpFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.agent.get(url).call().map_err(|e| FetchError::Http {
            url: url.to_string(),
            source: Box::new(e),
        })?;
        let mut body = Vec::new();
        response.into_reader().read_to_end(&mut body)?;
        Ok(body)
    }
}

/// Directory of downloaded tools, shared by every session.
#[derive(Debug, Clone)]
pub struct ToolCache {
    dir: PathBuf,
}

impl ToolCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where `tool` lives once cached.
    pub fn path_for(&self, tool: &ToolConfig) -> PathBuf {
        self.dir.join(&tool.file_name)
    }

    /// Return a local copy of the tool, downloading it if needed.
    ///
    /// A cached copy is reused when it matches the configured checksum, or
    /// by file name alone when no checksum is configured.
    pub fn ensure(
        &self,
        fetcher: &mut dyn ToolFetcher,
        tool: &ToolConfig,
        policy: &RetryPolicy,
    ) -> Result<PathBuf, FetchError> {
        let path = self.path_for(tool);
        if cached_copy_is_valid(&path, tool.sha256.as_deref()) {
            info!(?path, "Using cached resolution tool");
            return Ok(path);
        }

        let Some(url) = tool.url.as_deref() else {
            return Err(FetchError::NoSource {
                file: tool.file_name.clone(),
            });
        };

        let body = policy.run("tool download", |attempt| {
            info!(url, attempt, "Downloading resolution tool");
            let body = fetcher.fetch(url)?;
            if let Some(expected) = &tool.sha256 {
                let actual = sha256_hex(&body);
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(FetchError::Checksum {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            Ok(body)
        })?;

        fs::create_dir_all(&self.dir)?;
        write_atomic(&path, &body)?;
        make_executable(&path)?;
        info!(?path, bytes = body.len(), "Resolution tool cached");
        Ok(path)
    }
}

fn cached_copy_is_valid(path: &Path, expected: Option<&str>) -> bool {
    let Ok(bytes) = fs::read(path) else {
        return false;
    };
    match expected {
        None => true,
        Some(expected) => {
            let actual = sha256_hex(&bytes);
            let valid = actual.eq_ignore_ascii_case(expected);
            if !valid {
                warn!(?path, expected, %actual, "Cached tool checksum mismatch, refetching");
            }
            valid
        }
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        responses: Vec<Result<Vec<u8>, FetchError>>,
        calls: u32,
    }

    impl Scripted {
        fn new(responses: Vec<Result<Vec<u8>, FetchError>>) -> Self {
            Self { responses, calls: 0 }
        }
    }

    impl ToolFetcher for Scripted {
        fn fetch(&mut self, _url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls += 1;
            if self.responses.is_empty() {
                return Err(FetchError::Io(io::Error::new(io::ErrorKind::Other, "exhausted")));
            }
            self.responses.remove(0)
        }
    }

    fn tool(url: Option<&str>, sha256: Option<String>) -> ToolConfig {
        ToolConfig {
            url: url.map(str::to_string),
            sha256,
            ..ToolConfig::default()
        }
    }

    fn unreachable() -> FetchError {
        FetchError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    const POLICY: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::ZERO,
        backoff: vdsync_provision::Backoff::Fixed,
    };

    #[test]
    fn retries_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::new(dir.path());
        let mut fetcher = Scripted::new(vec![Err(unreachable()), Ok(b"tool".to_vec())]);

        let path = cache
            .ensure(&mut fetcher, &tool(Some("https://example.invalid/q.exe"), None), &POLICY)
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"tool");
        assert_eq!(fetcher.calls, 2);

        // Second session hits the cache.
        cache
            .ensure(&mut fetcher, &tool(Some("https://example.invalid/q.exe"), None), &POLICY)
            .unwrap();
        assert_eq!(fetcher.calls, 2);
    }

    #[test]
    fn gives_up_after_attempt_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::new(dir.path());
        let mut fetcher = Scripted::new(vec![Err(unreachable()), Err(unreachable()), Err(unreachable())]);

        let err = cache
            .ensure(&mut fetcher, &tool(Some("https://example.invalid/q.exe"), None), &POLICY)
            .unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
        assert_eq!(fetcher.calls, 3);
        assert!(!cache.path_for(&ToolConfig::default()).exists());
    }

    #[test]
    fn checksum_mismatch_is_rejected_and_stale_cache_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::new(dir.path());
        let good = sha256_hex(b"good");
        fs::write(cache.path_for(&ToolConfig::default()), b"stale").unwrap();

        let mut fetcher = Scripted::new(vec![Ok(b"evil".to_vec()), Ok(b"good".to_vec())]);
        let path = cache
            .ensure(&mut fetcher, &tool(Some("https://example.invalid/q.exe"), Some(good)), &POLICY)
            .unwrap();
        assert_eq!(fs::read(path).unwrap(), b"good");
        assert_eq!(fetcher.calls, 2);
    }

    #[test]
    fn no_url_and_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ToolCache::new(dir.path());
        let mut fetcher = Scripted::new(Vec::new());
        let err = cache.ensure(&mut fetcher, &tool(None, None), &POLICY).unwrap_err();
        assert!(matches!(err, FetchError::NoSource { .. }));
        assert_eq!(fetcher.calls, 0);
    }
}
