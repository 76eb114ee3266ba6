//! Mirrors: where buildcache objects live.
//!
//! A mirror is addressed by URL; `file://` (or a bare path) is served
//! directly from the filesystem, `http(s)://` through a retrying
//! client. All paths are mirror-relative and slash separated.

use std::path::{Path, PathBuf};

use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use thiserror::Error;
use tracing::{instrument, trace};
use url::Url;

use crate::error::BuildcacheError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("`{0}` was not found on the mirror")]
    NotFound(String),
    #[error("request for `{url}` failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),
    #[error("http body read failed: {0}")]
    Body(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

/// Result of a conditional GET.
#[derive(Debug)]
pub enum Conditional {
    NotModified,
    Fetched { data: Vec<u8>, etag: Option<String> },
}

/// Bounded retries with exponential backoff for transient failures,
/// the same policy the install pipeline uses for package downloads.
fn construct_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    ClientBuilder::new(reqwest::Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

pub enum Mirror {
    Local(LocalMirror),
    Http(HttpMirror),
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Mirror").field(&self.describe()).finish()
    }
}

impl Mirror {
    /// Parses a mirror URL; bare paths are treated as local mirrors.
    pub fn from_url(url: &str) -> Result<Mirror, BuildcacheError> {
        if let Ok(parsed) = Url::parse(url) {
            return match parsed.scheme() {
                "file" => {
                    let path = parsed
                        .to_file_path()
                        .map_err(|_| BuildcacheError::UnsupportedMirrorUrl(url.to_owned()))?;
                    Ok(Mirror::Local(LocalMirror::new(path)))
                }
                "http" | "https" => Ok(Mirror::Http(HttpMirror::new(parsed))),
                _ => Err(BuildcacheError::UnsupportedMirrorUrl(url.to_owned())),
            };
        }
        Ok(Mirror::Local(LocalMirror::new(PathBuf::from(url))))
    }

    pub fn local(root: impl Into<PathBuf>) -> Mirror {
        Mirror::Local(LocalMirror::new(root.into()))
    }

    /// A human-readable identity for progress and error reports.
    pub fn describe(&self) -> String {
        match self {
            Mirror::Local(local) => local.root.display().to_string(),
            Mirror::Http(http) => http.base.to_string(),
        }
    }

    #[instrument(level = "trace", skip(self), fields(mirror = %self.describe()))]
    pub async fn get(&self, rel: &str) -> Result<Vec<u8>, FetchError> {
        match self {
            Mirror::Local(local) => local.get(rel),
            Mirror::Http(http) => http.get(rel).await,
        }
    }

    /// Does the object exist? Uses a HEAD request on HTTP mirrors.
    pub async fn exists(&self, rel: &str) -> Result<bool, FetchError> {
        match self {
            Mirror::Local(local) => Ok(local.path(rel).is_file()),
            Mirror::Http(http) => http.exists(rel).await,
        }
    }

    pub async fn put(&self, rel: &str, data: &[u8]) -> Result<(), FetchError> {
        trace!(rel, len = data.len(), "uploading object");
        match self {
            Mirror::Local(local) => local.put(rel, data),
            Mirror::Http(http) => http.put(rel, data.to_vec()).await,
        }
    }

    pub async fn put_file(&self, rel: &str, path: &Path) -> Result<(), FetchError> {
        match self {
            Mirror::Local(local) => local.put_file(rel, path),
            Mirror::Http(http) => {
                let data = tokio::fs::read(path).await?;
                http.put(rel, data).await
            }
        }
    }

    /// Conditional GET with `If-None-Match`.
    pub async fn get_conditional(
        &self,
        rel: &str,
        etag: Option<&str>,
    ) -> Result<Conditional, FetchError> {
        match self {
            // The filesystem has no etags; always refetch.
            Mirror::Local(local) => {
                Ok(Conditional::Fetched { data: local.get(rel)?, etag: None })
            }
            Mirror::Http(http) => http.get_conditional(rel, etag).await,
        }
    }

    /// Enumerates object names under a relative prefix. Only local
    /// mirrors can list; index generation runs against those (or via
    /// a mirror-side listing service, which is out of scope).
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, FetchError> {
        match self {
            Mirror::Local(local) => local.list(prefix),
            Mirror::Http(_) => Err(FetchError::Status {
                url: format!("{}/{prefix}", self.describe()),
                status: 501,
            }),
        }
    }
}

#[derive(Debug)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: PathBuf) -> Self {
        LocalMirror { root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn get(&self, rel: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.path(rel);
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FetchError::NotFound(rel.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, rel: &str, data: &[u8]) -> Result<(), FetchError> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so concurrent readers never see a torn
        // object.
        let mut tmp = tempfile::NamedTempFile::new_in(
            path.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        std::io::Write::write_all(&mut tmp, data)?;
        tmp.persist(&path).map_err(|e| FetchError::Io(e.error))?;
        Ok(())
    }

    fn put_file(&self, rel: &str, source: &Path) -> Result<(), FetchError> {
        let data = std::fs::read(source)?;
        self.put(rel, &data)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, FetchError> {
        let root = self.path(prefix);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&root).min_depth(1) {
            let entry = entry.map_err(|e| {
                FetchError::Io(
                    e.into_io_error().unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "walkdir error")
                    }),
                )
            })?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .expect("listing stays under the mirror root");
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        out.sort();
        Ok(out)
    }
}

pub struct HttpMirror {
    base: Url,
    client: ClientWithMiddleware,
}

impl std::fmt::Debug for HttpMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMirror").field("base", &self.base).finish_non_exhaustive()
    }
}

impl HttpMirror {
    pub fn new(base: Url) -> Self {
        HttpMirror { base, client: construct_client() }
    }

    fn url(&self, rel: &str) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        format!("{base}/{rel}")
    }

    async fn get(&self, rel: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url(rel);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(rel.to_owned())),
            status if !status.is_success() => {
                Err(FetchError::Status { url, status: status.as_u16() })
            }
            _ => Ok(response.bytes().await?.to_vec()),
        }
    }

    async fn exists(&self, rel: &str) -> Result<bool, FetchError> {
        let url = self.url(rel);
        let response = self.client.head(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(FetchError::Status { url, status: status.as_u16() }),
        }
    }

    async fn put(&self, rel: &str, data: Vec<u8>) -> Result<(), FetchError> {
        let url = self.url(rel);
        let response = self.client.put(&url).body(data).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url, status: status.as_u16() });
        }
        Ok(())
    }

    async fn get_conditional(
        &self,
        rel: &str,
        etag: Option<&str>,
    ) -> Result<Conditional, FetchError> {
        let url = self.url(rel);
        let mut request = self.client.get(&url);
        if let Some(etag) = etag {
            request = request.header("If-None-Match", format!("\"{}\"", etag.trim_matches('"')));
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Conditional::NotModified),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(rel.to_owned())),
            status if !status.is_success() => {
                Err(FetchError::Status { url, status: status.as_u16() })
            }
            _ => {
                let etag = response
                    .headers()
                    .get("etag")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_owned());
                Ok(Conditional::Fetched { data: response.bytes().await?.to_vec(), etag })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn local_mirror_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::local(dir.path());
        assert!(!mirror.exists("v3/blobs/sha256/ab/abcd").await.unwrap());
        mirror.put("v3/blobs/sha256/ab/abcd", b"payload").await.unwrap();
        assert!(mirror.exists("v3/blobs/sha256/ab/abcd").await.unwrap());
        assert_eq!(mirror.get("v3/blobs/sha256/ab/abcd").await.unwrap(), b"payload");

        assert!(mirror.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn local_listing_is_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::local(dir.path());
        mirror.put("v3/manifests/spec/zlib/b.spec.manifest.json", b"{}").await.unwrap();
        mirror.put("v3/manifests/spec/apr/a.spec.manifest.json", b"{}").await.unwrap();
        let listed = mirror.list("v3/manifests/spec").await.unwrap();
        assert_eq!(
            listed,
            [
                "v3/manifests/spec/apr/a.spec.manifest.json",
                "v3/manifests/spec/zlib/b.spec.manifest.json"
            ]
        );
    }

    #[test]
    fn mirror_urls() {
        assert!(matches!(Mirror::from_url("/some/path").unwrap(), Mirror::Local(_)));
        assert!(matches!(
            Mirror::from_url("file:///some/path").unwrap(),
            Mirror::Local(_)
        ));
        assert!(matches!(
            Mirror::from_url("https://cache.example.com/mirror").unwrap(),
            Mirror::Http(_)
        ));
        assert!(Mirror::from_url("ftp://x").is_err());
    }
}
