//! The buildcache index: a serialized database of all specs on a
//! mirror, plus the locally cached copies of remote indexes.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use fxhash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::error::BuildcacheError;
use crate::fetch::{conditional_fetch_index, CachedIndex, FetchIndexError};
use crate::layout::{self, BuildcacheComponent};
use crate::manifest::{BlobRecord, BuildcacheManifest};
use crate::mirror::Mirror;
use crate::push::maybe_push_layout_sentinel;
use spack_spec::Spec;

/// Version of the database format the index serializes.
pub const INDEX_DATABASE_VERSION: &str = "8";

/// How a database tolerates concurrent access. The buildcache only
/// ever builds throwaway in-memory databases (`NoLock`); legacy read
/// paths open on-disk databases `ReadOnly`. Real file locking belongs
/// to the install database, an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    NoLock,
    ReadOnly,
}

/// An in-memory database of buildcache specs, keyed by dag hash.
#[derive(Debug)]
pub struct BuildCacheDatabase {
    mode: AccessMode,
    installs: BTreeMap<String, Value>,
}

impl BuildCacheDatabase {
    pub fn new(mode: AccessMode) -> Self {
        BuildCacheDatabase { mode, installs: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.installs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installs.is_empty()
    }

    /// Records a concrete spec. Read-only databases reject this.
    pub fn insert(&mut self, spec: &Spec) -> Result<(), BuildcacheError> {
        if self.mode == AccessMode::ReadOnly {
            return Err(BuildcacheError::InvalidMetadataFile(
                "cannot insert into a read-only database".to_owned(),
            ));
        }
        let hash = spec.dag_hash()?.to_owned();
        let record = json!({
            "spec": spec.to_specfile()?,
            "in_buildcache": true,
        });
        self.installs.insert(hash, record);
        Ok(())
    }

    pub fn to_json(&self) -> String {
        let value = json!({
            "database": {
                "version": INDEX_DATABASE_VERSION,
                "installs": self.installs,
            }
        });
        serde_json::to_string_pretty(&value).expect("database serialization")
    }

    pub fn from_json(text: &str) -> Result<Self, BuildcacheError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
        let database = value
            .get("database")
            .ok_or_else(|| BuildcacheError::InvalidMetadataFile("missing `database`".into()))?;
        let version = database.get("version").and_then(Value::as_str).unwrap_or("");
        if version != INDEX_DATABASE_VERSION {
            return Err(BuildcacheError::InvalidMetadataFile(format!(
                "unsupported database version `{version}`"
            )));
        }
        let installs = database
            .get("installs")
            .and_then(Value::as_object)
            .ok_or_else(|| BuildcacheError::InvalidMetadataFile("missing `installs`".into()))?;
        Ok(BuildCacheDatabase {
            mode: AccessMode::ReadOnly,
            installs: installs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// Decodes the spec stored under a dag hash.
    pub fn get(&self, dag_hash: &str) -> Option<Result<Spec, BuildcacheError>> {
        self.installs.get(dag_hash).map(|record| {
            let spec_value = record
                .get("spec")
                .ok_or_else(|| BuildcacheError::InvalidMetadataFile("install without spec".into()))?;
            Ok(Spec::from_specfile_value(spec_value)?)
        })
    }

    /// Hashes matching an abstract hash prefix.
    pub fn find_by_hash_prefix(&self, prefix: &str) -> Vec<&str> {
        self.installs
            .keys()
            .filter(|hash| hash.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.installs.keys().map(String::as_str)
    }

    /// Resolves an abstract hash prefix (the `/deadbeef` clause of a
    /// spec string) to the one spec it names.
    pub fn resolve_hash_prefix(&self, prefix: &str) -> Result<Spec, BuildcacheError> {
        let matches = self.find_by_hash_prefix(prefix);
        match matches.as_slice() {
            [] => Err(spack_spec::SpecError::InvalidHash(prefix.to_owned()).into()),
            [hash] => self.get(hash).expect("matched hash is present"),
            _ => Err(spack_spec::SpecError::AmbiguousHash(prefix.to_owned()).into()),
        }
    }
}

/// Enumerates the spec manifests of a mirror, reads and verifies each,
/// and pushes a fresh index (blob first, manifest after).
#[instrument(level = "debug", skip_all, fields(mirror = %mirror.describe()))]
pub async fn generate_index(mirror: &Mirror) -> Result<(), BuildcacheError> {
    let mut database = BuildCacheDatabase::new(AccessMode::NoLock);
    for rel in mirror.list(layout::SPEC_MANIFEST_PREFIX).await? {
        if !rel.ends_with(".spec.manifest.json") {
            continue;
        }
        match read_spec_from_manifest(mirror, &rel).await {
            Ok(spec) => database.insert(&spec)?,
            // A broken entry keeps the rest of the mirror indexable.
            Err(error) => warn!(manifest = %rel, %error, "skipping unreadable entry"),
        }
    }
    debug!(specs = database.len(), "generated index");

    let body = database.to_json();
    let digest = spack_digest::sha256_hex(body.as_bytes());
    mirror.put(&layout::blob_path(&digest), body.as_bytes()).await?;
    let manifest = BuildcacheManifest::new(vec![BlobRecord::new(
        BuildcacheComponent::Index,
        "none",
        body.len() as u64,
        digest,
    )]);
    mirror.put(&layout::index_manifest_path(), manifest.to_json().as_bytes()).await?;
    maybe_push_layout_sentinel(mirror).await?;
    Ok(())
}

async fn read_spec_from_manifest(mirror: &Mirror, rel: &str) -> Result<Spec, BuildcacheError> {
    let manifest = BuildcacheManifest::from_slice(&mirror.get(rel).await?)?;
    let record = manifest
        .find(BuildcacheComponent::Spec)
        .ok_or_else(|| BuildcacheError::InvalidMetadataFile("no spec blob in manifest".into()))?;
    let blob = mirror.get(&layout::blob_path(&record.checksum)).await.map_err(|e| {
        if e.is_not_found() {
            BuildcacheError::EntryMissingBlob(record.checksum.clone())
        } else {
            e.into()
        }
    })?;
    crate::fetch::verify_blob(record, &blob, rel)?;
    let text = String::from_utf8(blob)
        .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
    Ok(Spec::from_specfile_str(&text)?)
}

/// Locally cached copies of mirror indexes.
///
/// `update` refetches a mirror's index only when it changed (by ETag
/// or blob digest) and replaces the cached file atomically; lookups
/// run against the decoded in-memory databases.
pub struct BinaryCacheIndex {
    cache_dir: PathBuf,
    databases: FxHashMap<String, BuildCacheDatabase>,
}

impl BinaryCacheIndex {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        BinaryCacheIndex { cache_dir: cache_dir.into(), databases: FxHashMap::default() }
    }

    fn cache_basename(mirror: &Mirror) -> String {
        let digest = spack_digest::sha256_hex(mirror.describe().as_bytes());
        digest[..24].to_owned()
    }

    fn index_path(&self, mirror: &Mirror) -> PathBuf {
        self.cache_dir.join(format!("{}.index.json", Self::cache_basename(mirror)))
    }

    fn meta_path(&self, mirror: &Mirror) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", Self::cache_basename(mirror)))
    }

    fn cached_meta(&self, mirror: &Mirror) -> CachedIndex {
        std::fs::read_to_string(self.meta_path(mirror))
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .map(|meta| CachedIndex {
                digest: meta.get("digest").and_then(Value::as_str).map(str::to_owned),
                etag: meta.get("etag").and_then(Value::as_str).map(str::to_owned),
            })
            .unwrap_or_default()
    }

    /// Refreshes the cached index of one mirror. Returns whether the
    /// local copy changed.
    pub async fn update(&mut self, mirror: &Mirror) -> Result<bool, FetchIndexError> {
        let cached = self.cached_meta(mirror);
        let result = conditional_fetch_index(mirror, &cached).await?;
        let key = mirror.describe();
        if result.fresh {
            // Make sure the in-memory copy is loaded even on a fresh
            // cache hit.
            if !self.databases.contains_key(&key) {
                if let Ok(text) = std::fs::read_to_string(self.index_path(mirror)) {
                    if let Ok(database) = BuildCacheDatabase::from_json(&text) {
                        self.databases.insert(key, database);
                    }
                }
            }
            return Ok(false);
        }
        let data = result.data.unwrap_or_default();
        let database = BuildCacheDatabase::from_json(&data)
            .map_err(|e| FetchIndexError::Invalid(e.to_string()))?;

        // Atomic replace: write to a tempfile, then rename over the
        // cached copy, then drop the stale in-memory database.
        std::fs::create_dir_all(&self.cache_dir).map_err(FetchIndexError::from_io)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)
            .map_err(FetchIndexError::from_io)?;
        tmp.write_all(data.as_bytes()).map_err(FetchIndexError::from_io)?;
        tmp.persist(self.index_path(mirror))
            .map_err(|e| FetchIndexError::from_io(e.error))?;
        let meta = json!({ "digest": result.hash, "etag": result.etag });
        std::fs::write(self.meta_path(mirror), serde_json::to_vec(&meta).expect("meta json"))
            .map_err(FetchIndexError::from_io)?;

        self.databases.insert(key, database);
        Ok(true)
    }

    /// Finds specs by full dag hash or unambiguous prefix across all
    /// cached mirrors, returning `(mirror, spec)` pairs.
    pub fn find_built_spec(&self, hash_prefix: &str) -> Vec<(String, Spec)> {
        let mut out = Vec::new();
        for (mirror, database) in &self.databases {
            for hash in database.find_by_hash_prefix(hash_prefix) {
                if let Some(Ok(spec)) = database.get(hash) {
                    out.push((mirror.clone(), spec));
                }
            }
        }
        out
    }
}

impl FetchIndexError {
    fn from_io(error: std::io::Error) -> Self {
        FetchIndexError::Fetch(crate::mirror::FetchError::Io(error))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use spack_spec::testing;

    #[test]
    fn database_round_trip() {
        let mut database = BuildCacheDatabase::new(AccessMode::NoLock);
        let spec = testing::concretize("zlib@=1.3");
        database.insert(&spec).unwrap();

        let decoded = BuildCacheDatabase::from_json(&database.to_json()).unwrap();
        assert_eq!(decoded.len(), 1);
        let hash = spec.dag_hash().unwrap();
        let restored = decoded.get(hash).unwrap().unwrap();
        assert_eq!(restored.dag_hash().unwrap(), hash);
        assert_eq!(decoded.find_by_hash_prefix(&hash[..6]), vec![hash]);
    }

    #[test]
    fn read_only_database_rejects_inserts() {
        let mut database = BuildCacheDatabase::from_json(
            r#"{"database": {"version": "8", "installs": {}}}"#,
        )
        .unwrap();
        let spec = testing::concretize("zlib@=1.3");
        assert!(database.insert(&spec).is_err());
    }

    #[test]
    fn unsupported_database_version() {
        assert_matches::assert_matches!(
            BuildCacheDatabase::from_json(r#"{"database": {"version": "5", "installs": {}}}"#),
            Err(BuildcacheError::InvalidMetadataFile(_))
        );
    }
}
