// src/kitchen/fetch.rs

//! Fetching and verifying source artifacts
//!
//! The fetcher tries the primary URL, then each mirror in order. A URL that
//! cannot be reached is skipped; a URL that delivers bytes with the wrong
//! checksum ends the fetch (unless the mirror policy says otherwise), since a
//! mismatch points at a corrupt or tampered source rather than a flaky
//! network.
//!
//! Verified artifacts land in a content-addressed cache keyed by checksum.
//! Downloads stream into a temporary file inside the cache directory and are
//! renamed into place only after verification, so concurrent fetchers of
//! the same artifact never observe a torn file and failures leave nothing
//! behind.

use crate::config::MismatchPolicy;
use crate::hash::{Hash, HashError, HashingWriter, hash_file};
use crate::recipe::Recipe;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Failure of a single transfer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("{0}")]
    Unreachable(String),

    /// The local sink rejected the data
    #[error("failed to write download: {0}")]
    Write(io::Error),
}

/// Moves bytes from a URL into a sink
///
/// Implementations must not buffer the whole artifact in memory.
pub trait Transport: Send + Sync {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransportError>;
}

fn copy_stream(reader: &mut dyn Read, sink: &mut dyn Write) -> Result<u64, TransportError> {
    let mut buffer = [0u8; STREAM_BUFFER_SIZE];
    let mut copied: u64 = 0;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(TransportError::Timeout),
            Err(e) => {
                return Err(TransportError::Unreachable(format!(
                    "Failed to read response: {e}"
                )));
            }
        };
        sink.write_all(&buffer[..n]).map_err(TransportError::Write)?;
        copied += n as u64;
    }

    Ok(copied)
}

/// HTTP(S) transport backed by reqwest, with `file://` support for local mirrors
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("galley/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| crate::Error::ConfigError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn download_file_url(&self, url: &url::Url, sink: &mut dyn Write) -> Result<u64, TransportError> {
        let path = url
            .to_file_path()
            .map_err(|_| TransportError::Unreachable(format!("Invalid file URL: {url}")))?;
        let mut file = File::open(&path).map_err(|e| {
            TransportError::Unreachable(format!("Failed to open {}: {e}", path.display()))
        })?;
        copy_stream(&mut file, sink)
    }
}

impl Transport for HttpTransport {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| TransportError::Unreachable(format!("Invalid URL {url}: {e}")))?;
        if parsed.scheme() == "file" {
            return self.download_file_url(&parsed, sink);
        }

        let mut response = self.client.get(parsed).send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Unreachable(format!("Failed to fetch {url}: {e}"))
            }
        })?;

        if !response.status().is_success() {
            return Err(TransportError::Unreachable(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        copy_stream(&mut response, sink)
    }
}

/// Fetch failure, attributed to the reason the artifact could not be obtained
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("all source URLs unreachable: {}", .attempts.join("; "))]
    Unreachable { attempts: Vec<String> },

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("timed out fetching {}", .urls.join(", "))]
    Timeout { urls: Vec<String> },

    #[error("invalid checksum {checksum:?}: {source}")]
    InvalidChecksum { checksum: String, source: HashError },

    #[error("failed to store artifact: {0}")]
    Storage(#[from] io::Error),
}

/// Where a fetched artifact came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// Already present and verified in the cache
    Cache,
    Primary(String),
    Mirror { index: usize, url: String },
}

impl FetchSource {
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Cache => None,
            Self::Primary(url) | Self::Mirror { url, .. } => Some(url),
        }
    }
}

/// A verified artifact
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Location of the artifact in the cache
    pub path: PathBuf,
    /// Checksum of the bytes on disk (equal to the declared one)
    pub hash: Hash,
    pub source: FetchSource,
}

/// Downloads artifacts into the verified cache
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache_dir: PathBuf,
    policy: MismatchPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            cache_dir: cache_dir.into(),
            policy: MismatchPolicy::Abort,
        }
    }

    pub fn with_policy(mut self, policy: MismatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path an artifact with this checksum occupies in the cache
    pub fn cache_path(&self, hash: &Hash) -> PathBuf {
        self.cache_dir.join(hash.cache_key())
    }

    /// Check whether a verified copy of the artifact is cached
    pub fn is_cached(&self, checksum: &str) -> bool {
        Hash::parse_prefixed(checksum)
            .ok()
            .map(|hash| self.cache_path(&hash))
            .is_some_and(|path| path.exists())
    }

    /// Fetch a recipe's source archive from its primary URL or mirrors
    pub fn fetch_source(&self, recipe: &Recipe) -> Result<FetchResult, FetchError> {
        let urls: Vec<&str> = recipe.source_urls().collect();
        self.fetch(&urls, &recipe.sha256)
    }

    /// Fetch the first of `urls` that delivers content matching `checksum`
    pub fn fetch(&self, urls: &[&str], checksum: &str) -> Result<FetchResult, FetchError> {
        let expected = Hash::parse_prefixed(checksum).map_err(|source| {
            FetchError::InvalidChecksum {
                checksum: checksum.to_string(),
                source,
            }
        })?;

        fs::create_dir_all(&self.cache_dir)?;
        let cached_path = self.cache_path(&expected);

        if cached_path.exists() {
            debug!("Using cached artifact: {}", cached_path.display());
            if hash_file(expected.algorithm, &cached_path)? == expected {
                return Ok(FetchResult {
                    path: cached_path,
                    hash: expected,
                    source: FetchSource::Cache,
                });
            }
            warn!(
                "Cached artifact {} is corrupt, re-downloading",
                cached_path.display()
            );
            fs::remove_file(&cached_path)?;
        }

        let mut attempts = Vec::new();
        let mut timed_out = Vec::new();
        let mut first_mismatch = None;

        for (index, url) in urls.iter().enumerate() {
            info!("Downloading: {}", url);

            // A fresh temp file per attempt; dropping it removes partial data
            let mut tmp = NamedTempFile::new_in(&self.cache_dir)?;
            let mut writer =
                HashingWriter::new(BufWriter::new(tmp.as_file_mut()), expected.algorithm);

            match self.transport.download(url, &mut writer) {
                Ok(_) => {}
                Err(TransportError::Write(e)) => return Err(FetchError::Storage(e)),
                Err(TransportError::Timeout) => {
                    warn!("Timed out fetching {}", url);
                    attempts.push(format!("{url}: timed out"));
                    timed_out.push(url.to_string());
                    continue;
                }
                Err(TransportError::Unreachable(reason)) => {
                    warn!("Failed to fetch {}: {}", url, reason);
                    attempts.push(format!("{url}: {reason}"));
                    continue;
                }
            }

            let (buffered, actual, size) = writer.finish();
            buffered.into_inner().map_err(|e| e.into_error())?;

            if actual != expected {
                warn!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    url, expected, actual
                );
                let mismatch = FetchError::HashMismatch {
                    url: url.to_string(),
                    expected: expected.to_prefixed_string(),
                    actual: actual.to_prefixed_string(),
                };
                match self.policy {
                    MismatchPolicy::Abort => return Err(mismatch),
                    MismatchPolicy::TryMirrors => {
                        first_mismatch.get_or_insert(mismatch);
                        continue;
                    }
                }
            }

            tmp.as_file().sync_all()?;
            tmp.persist(&cached_path).map_err(|e| e.error)?;
            debug!("Stored {} bytes at {}", size, cached_path.display());

            let source = if index == 0 {
                FetchSource::Primary(url.to_string())
            } else {
                FetchSource::Mirror {
                    index: index - 1,
                    url: url.to_string(),
                }
            };
            return Ok(FetchResult {
                path: cached_path,
                hash: expected,
                source,
            });
        }

        if let Some(mismatch) = first_mismatch {
            return Err(mismatch);
        }
        if !timed_out.is_empty() && timed_out.len() == urls.len() {
            return Err(FetchError::Timeout { urls: timed_out });
        }
        Err(FetchError::Unreachable { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    enum Response {
        Body(Vec<u8>),
        Fail,
        Timeout,
    }

    /// In-memory transport that records every URL it is asked for
    struct MockTransport {
        responses: HashMap<String, Response>,
        requested: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new(responses: Vec<(&str, Response)>) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .into_iter()
                    .map(|(url, r)| (url.to_string(), r))
                    .collect(),
                requested: Mutex::new(Vec::new()),
            })
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, TransportError> {
            self.requested.lock().unwrap().push(url.to_string());
            match self.responses.get(url) {
                Some(Response::Body(body)) => {
                    sink.write_all(body).map_err(TransportError::Write)?;
                    Ok(body.len() as u64)
                }
                Some(Response::Timeout) => Err(TransportError::Timeout),
                Some(Response::Fail) | None => {
                    Err(TransportError::Unreachable("connection refused".to_string()))
                }
            }
        }
    }

    const GOOD: &[u8] = b"good source archive";
    const BAD: &[u8] = b"tampered source archive";

    fn leftover_temp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .count()
    }

    #[test]
    fn test_primary_success() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![("https://a/x.tgz", Response::Body(GOOD.to_vec()))]);
        let fetcher = Fetcher::new(transport, cache.path());

        let result = fetcher.fetch(&["https://a/x.tgz"], &sha256(GOOD)).unwrap();
        assert_eq!(result.source, FetchSource::Primary("https://a/x.tgz".to_string()));
        assert_eq!(fs::read(&result.path).unwrap(), GOOD);
        assert!(fetcher.is_cached(&sha256(GOOD)));
    }

    #[test]
    fn test_unreachable_primary_falls_back_to_mirror() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![
            ("https://a/x.tgz", Response::Fail),
            ("https://b/x.tgz", Response::Timeout),
            ("https://c/x.tgz", Response::Body(GOOD.to_vec())),
        ]);
        let fetcher = Fetcher::new(transport.clone(), cache.path());

        let result = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz", "https://c/x.tgz"], &sha256(GOOD))
            .unwrap();
        assert_eq!(
            result.source,
            FetchSource::Mirror {
                index: 1,
                url: "https://c/x.tgz".to_string()
            }
        );
        assert_eq!(transport.requested().len(), 3);
    }

    #[test]
    fn test_hash_mismatch_on_primary_does_not_try_mirrors() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![
            ("https://a/x.tgz", Response::Body(BAD.to_vec())),
            ("https://b/x.tgz", Response::Body(GOOD.to_vec())),
        ]);
        let fetcher = Fetcher::new(transport.clone(), cache.path());

        let err = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz"], &sha256(GOOD))
            .unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { ref url, .. } if url == "https://a/x.tgz"));
        assert_eq!(transport.requested(), vec!["https://a/x.tgz"]);
        assert!(!fetcher.is_cached(&sha256(GOOD)));
        assert_eq!(leftover_temp_files(cache.path()), 0);
    }

    #[test]
    fn test_hash_mismatch_on_mirror_is_mismatch() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![
            ("https://a/x.tgz", Response::Fail),
            ("https://b/x.tgz", Response::Body(BAD.to_vec())),
        ]);
        let fetcher = Fetcher::new(transport, cache.path());

        let err = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz"], &sha256(GOOD))
            .unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { ref url, .. } if url == "https://b/x.tgz"));
    }

    #[test]
    fn test_try_mirrors_policy_recovers_from_bad_primary() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![
            ("https://a/x.tgz", Response::Body(BAD.to_vec())),
            ("https://b/x.tgz", Response::Body(GOOD.to_vec())),
        ]);
        let fetcher =
            Fetcher::new(transport, cache.path()).with_policy(MismatchPolicy::TryMirrors);

        let result = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz"], &sha256(GOOD))
            .unwrap();
        assert_eq!(result.source.url(), Some("https://b/x.tgz"));
    }

    #[test]
    fn test_try_mirrors_policy_still_reports_mismatch() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![
            ("https://a/x.tgz", Response::Body(BAD.to_vec())),
            ("https://b/x.tgz", Response::Fail),
        ]);
        let fetcher =
            Fetcher::new(transport, cache.path()).with_policy(MismatchPolicy::TryMirrors);

        let err = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz"], &sha256(GOOD))
            .unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { .. }));
    }

    #[test]
    fn test_all_unreachable() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![("https://b/x.tgz", Response::Timeout)]);
        let fetcher = Fetcher::new(transport, cache.path());

        let err = fetcher
            .fetch(&["https://a/x.tgz", "https://b/x.tgz"], &sha256(GOOD))
            .unwrap_err();
        match err {
            FetchError::Unreachable { attempts } => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_all_timed_out() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![("https://a/x.tgz", Response::Timeout)]);
        let fetcher = Fetcher::new(transport, cache.path());

        let err = fetcher.fetch(&["https://a/x.tgz"], &sha256(GOOD)).unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[test]
    fn test_cache_hit_skips_transport() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![("https://a/x.tgz", Response::Body(GOOD.to_vec()))]);
        let fetcher = Fetcher::new(transport.clone(), cache.path());

        fetcher.fetch(&["https://a/x.tgz"], &sha256(GOOD)).unwrap();
        let second = fetcher.fetch(&["https://a/x.tgz"], &sha256(GOOD)).unwrap();

        assert_eq!(second.source, FetchSource::Cache);
        assert_eq!(transport.requested().len(), 1);
    }

    #[test]
    fn test_corrupt_cache_entry_is_refetched() {
        let cache = TempDir::new().unwrap();
        let transport = MockTransport::new(vec![("https://a/x.tgz", Response::Body(GOOD.to_vec()))]);
        let fetcher = Fetcher::new(transport, cache.path());

        let hash = Hash::parse_prefixed(&sha256(GOOD)).unwrap();
        fs::write(fetcher.cache_path(&hash), BAD).unwrap();

        let result = fetcher.fetch(&["https://a/x.tgz"], &sha256(GOOD)).unwrap();
        assert!(matches!(result.source, FetchSource::Primary(_)));
        assert_eq!(fs::read(&result.path).unwrap(), GOOD);
    }

    #[test]
    fn test_invalid_checksum() {
        let cache = TempDir::new().unwrap();
        let fetcher = Fetcher::new(MockTransport::new(vec![]), cache.path());
        let err = fetcher.fetch(&["https://a/x.tgz"], "md5:abc").unwrap_err();
        assert!(matches!(err, FetchError::InvalidChecksum { .. }));
    }

    #[test]
    fn test_http_transport_reads_file_urls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("src.tar.gz");
        fs::write(&path, GOOD).unwrap();
        let url = url::Url::from_file_path(&path).unwrap();

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let mut sink = Vec::new();
        transport.download(url.as_str(), &mut sink).unwrap();
        assert_eq!(sink, GOOD);

        let missing = url::Url::from_file_path(dir.path().join("missing")).unwrap();
        assert!(matches!(
            transport.download(missing.as_str(), &mut sink),
            Err(TransportError::Unreachable(_))
        ));
    }
}
