//! Fetching buildcache objects: spec metadata, tarballs and the index.
//!
//! Every blob read is verified against the size and checksum its
//! manifest records. The index is fetched conditionally: an ETag (via
//! `If-None-Match`) or the cached blob digest short-circuits the
//! download when nothing changed.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::BuildcacheError;
use crate::layout::{self, BuildcacheComponent};
use crate::manifest::{BlobRecord, BuildcacheManifest};
use crate::mirror::{Conditional, FetchError, Mirror};
use spack_spec::Spec;

/// Outcome of a conditional index fetch.
#[derive(Debug, Default)]
pub struct FetchIndexResult {
    pub etag: Option<String>,
    pub hash: Option<String>,
    pub data: Option<String>,
    pub fresh: bool,
}

impl FetchIndexResult {
    fn fresh() -> Self {
        FetchIndexResult { fresh: true, ..Default::default() }
    }
}

/// What the caller already has cached.
#[derive(Debug, Default, Clone)]
pub struct CachedIndex {
    pub digest: Option<String>,
    pub etag: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchIndexError {
    #[error("failed to fetch the buildcache index: {0}")]
    Fetch(#[from] FetchError),
    #[error("the cached index is stale")]
    StaleCache,
    #[error("invalid index metadata: {0}")]
    Invalid(String),
}

/// Conditionally fetches the v3 index of a mirror.
///
/// Returns `fresh = true` when the remote answered `304 Not Modified`
/// or when the manifest still references the cached blob digest; only
/// a changed digest causes the blob itself to be transferred. A 404
/// received on a conditional request means the cache is stale, and one
/// unconditional retry is made before giving up.
#[instrument(level = "debug", skip_all, fields(mirror = %mirror.describe()))]
pub async fn conditional_fetch_index(
    mirror: &Mirror,
    cached: &CachedIndex,
) -> Result<FetchIndexResult, FetchIndexError> {
    let rel = layout::index_manifest_path();
    let conditional = mirror.get_conditional(&rel, cached.etag.as_deref()).await;
    let (manifest_bytes, etag) = match conditional {
        Ok(Conditional::NotModified) => {
            debug!("index manifest not modified");
            return Ok(FetchIndexResult::fresh());
        }
        Ok(Conditional::Fetched { data, etag }) => (data, etag),
        Err(error) if error.is_not_found() && cached.etag.is_some() => {
            // Stale cache: the object the etag referred to is gone.
            debug!("conditional fetch returned 404, refetching unconditionally");
            match mirror.get_conditional(&rel, None).await? {
                Conditional::Fetched { data, etag } => (data, etag),
                Conditional::NotModified => return Err(FetchIndexError::StaleCache),
            }
        }
        Err(error) => return Err(error.into()),
    };

    let manifest = BuildcacheManifest::from_slice(&manifest_bytes)
        .map_err(|e| FetchIndexError::Invalid(e.to_string()))?;
    let record = manifest
        .find(BuildcacheComponent::Index)
        .ok_or_else(|| FetchIndexError::Invalid("manifest names no index blob".to_owned()))?;

    // Unchanged blob digest: cache is fresh, do not touch the blob.
    if cached.digest.as_deref() == Some(record.checksum.as_str()) {
        return Ok(FetchIndexResult { etag, ..FetchIndexResult::fresh() });
    }

    let blob = match mirror.get(&layout::blob_path(&record.checksum)).await {
        Ok(blob) => blob,
        // Manifest updated underneath us; a refetch will see a
        // consistent pair.
        Err(error) if error.is_not_found() => return Err(FetchIndexError::StaleCache),
        Err(error) => return Err(error.into()),
    };
    verify_blob(record, &blob, "buildcache index")
        .map_err(|e| FetchIndexError::Invalid(e.to_string()))?;
    Ok(FetchIndexResult {
        etag,
        hash: Some(record.checksum.clone()),
        data: Some(String::from_utf8_lossy(&blob).into_owned()),
        fresh: false,
    })
}

/// Conditional fetch against a legacy v2 mirror: `index.json` with a
/// sibling `index.json.hash`.
pub async fn conditional_fetch_index_v2(
    mirror: &Mirror,
    cached: &CachedIndex,
) -> Result<FetchIndexResult, FetchIndexError> {
    let remote_hash = match mirror.get(layout::v2::index_hash_path()).await {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).trim().to_owned()),
        Err(error) if error.is_not_found() => None,
        Err(error) => return Err(error.into()),
    };
    if remote_hash.is_some() && remote_hash == cached.digest {
        return Ok(FetchIndexResult::fresh());
    }
    let data = mirror.get(layout::v2::index_path()).await?;
    let computed = spack_digest::sha256_hex(&data);
    if cached.digest.as_deref() == Some(computed.as_str()) {
        return Ok(FetchIndexResult::fresh());
    }
    Ok(FetchIndexResult {
        etag: None,
        hash: Some(computed),
        data: Some(String::from_utf8_lossy(&data).into_owned()),
        fresh: false,
    })
}

/// Fetches and verifies the spec metadata of a buildcache entry.
pub async fn fetch_metadata(
    mirror: &Mirror,
    name: &str,
    dag_hash: &str,
) -> Result<(Spec, BuildcacheManifest), BuildcacheError> {
    fetch_metadata_with_policy(mirror, name, dag_hash, false).await
}

/// As [`fetch_metadata`], optionally insisting that the spec manifest
/// carry a clear-sign envelope (mirrors configured `signed: true`).
pub async fn fetch_metadata_with_policy(
    mirror: &Mirror,
    name: &str,
    dag_hash: &str,
    require_signature: bool,
) -> Result<(Spec, BuildcacheManifest), BuildcacheError> {
    let manifest_bytes = mirror.get(&layout::spec_manifest_path(name, dag_hash)).await?;
    if require_signature {
        let text = std::str::from_utf8(&manifest_bytes)
            .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
        if !spack_spec::specfile::is_clearsigned(text) {
            return Err(BuildcacheError::NoSignatureButSignatureRequired);
        }
    }
    let manifest = BuildcacheManifest::from_slice(&manifest_bytes)?;
    let record = manifest
        .find(BuildcacheComponent::Spec)
        .ok_or_else(|| BuildcacheError::InvalidMetadataFile("no spec blob in manifest".into()))?;
    let blob = fetch_blob(mirror, record, "spec metadata").await?;
    let text = String::from_utf8(blob)
        .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
    let spec = Spec::from_specfile_str(&text)?;
    Ok((spec, manifest))
}

/// Fetches and verifies the tarball of a buildcache entry, staging it
/// in `stage_dir`.
pub async fn fetch_archive(
    mirror: &Mirror,
    name: &str,
    dag_hash: &str,
    stage_dir: &Path,
) -> Result<(PathBuf, BuildcacheManifest), BuildcacheError> {
    let manifest_bytes = mirror.get(&layout::tarball_manifest_path(name, dag_hash)).await?;
    let manifest = BuildcacheManifest::from_slice(&manifest_bytes)?;
    let record = manifest.find(BuildcacheComponent::Tarball).ok_or_else(|| {
        BuildcacheError::InvalidMetadataFile("no tarball blob in manifest".into())
    })?;
    let blob = fetch_blob(mirror, record, "tarball").await?;
    let staged = stage_dir.join(format!("{dag_hash}.tar.gz"));
    tokio::fs::write(&staged, &blob).await?;
    Ok((staged, manifest))
}

/// Reads spec metadata from a legacy v2 mirror: a flat
/// `build_cache/<hash>.spec.json`, possibly clear-signed.
pub async fn fetch_metadata_v2(
    mirror: &Mirror,
    dag_hash: &str,
) -> Result<Spec, BuildcacheError> {
    let bytes = match mirror.get(&layout::v2::signed_spec_path(dag_hash)).await {
        Ok(bytes) => bytes,
        Err(error) if error.is_not_found() => {
            mirror.get(&layout::v2::spec_path(dag_hash)).await?
        }
        Err(error) => return Err(error.into()),
    };
    let text = String::from_utf8(bytes)
        .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
    Ok(Spec::from_specfile_str(&text)?)
}

async fn fetch_blob(
    mirror: &Mirror,
    record: &BlobRecord,
    what: &str,
) -> Result<Vec<u8>, BuildcacheError> {
    let blob = match mirror.get(&layout::blob_path(&record.checksum)).await {
        Ok(blob) => blob,
        Err(error) if error.is_not_found() => {
            return Err(BuildcacheError::EntryMissingBlob(record.checksum.clone()));
        }
        Err(error) => return Err(error.into()),
    };
    verify_blob(record, &blob, what)?;
    Ok(blob)
}

/// Size and checksum verification of a fetched blob.
pub fn verify_blob(record: &BlobRecord, data: &[u8], what: &str) -> Result<(), BuildcacheError> {
    if data.len() as u64 != record.content_length {
        return Err(BuildcacheError::InvalidMetadataFile(format!(
            "{what}: expected {} bytes, got {}",
            record.content_length,
            data.len()
        )));
    }
    let actual = spack_digest::sha256_hex(data);
    if actual != record.checksum {
        return Err(BuildcacheError::ChecksumMismatch {
            path: what.to_owned(),
            expected: record.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_verification() {
        let data = b"index contents";
        let record = BlobRecord::new(
            BuildcacheComponent::Index,
            "none",
            data.len() as u64,
            spack_digest::sha256_hex(data),
        );
        verify_blob(&record, data, "x").unwrap();

        let mut wrong_len = record.clone();
        wrong_len.content_length += 1;
        assert_matches::assert_matches!(
            verify_blob(&wrong_len, data, "x"),
            Err(BuildcacheError::InvalidMetadataFile(_))
        );

        let mut wrong_sum = record;
        wrong_sum.checksum = "00".repeat(32);
        assert_matches::assert_matches!(
            verify_blob(&wrong_sum, data, "x"),
            Err(BuildcacheError::ChecksumMismatch { .. })
        );
    }

    #[tokio::test]
    async fn conditional_fetch_against_local_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Mirror::local(dir.path());

        // No index yet.
        assert_matches::assert_matches!(
            conditional_fetch_index(&mirror, &CachedIndex::default()).await,
            Err(FetchIndexError::Fetch(e)) if e.is_not_found()
        );

        // Publish an index blob + manifest pair by hand.
        let body = br#"{"database": {"version": "8", "installs": {}}}"#;
        let digest = spack_digest::sha256_hex(body);
        mirror.put(&layout::blob_path(&digest), body).await.unwrap();
        let manifest = BuildcacheManifest::new(vec![BlobRecord::new(
            BuildcacheComponent::Index,
            "none",
            body.len() as u64,
            digest.clone(),
        )]);
        mirror
            .put(&layout::index_manifest_path(), manifest.to_json().as_bytes())
            .await
            .unwrap();

        // Cold cache: data comes back with its digest.
        let result = conditional_fetch_index(&mirror, &CachedIndex::default()).await.unwrap();
        assert!(!result.fresh);
        assert_eq!(result.hash.as_deref(), Some(digest.as_str()));
        assert!(result.data.unwrap().contains("installs"));

        // Warm cache with the same digest: fresh, no blob read.
        let cached = CachedIndex { digest: Some(digest), etag: None };
        let result = conditional_fetch_index(&mirror, &cached).await.unwrap();
        assert!(result.fresh);
        assert!(result.data.is_none());
    }
}
