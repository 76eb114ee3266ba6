//! The parallel push pipeline.
//!
//! Pushing N specs: bounded-parallel existence probes against the
//! tarball manifests (answers remembered in a per-mirror cache), then
//! one build-and-upload task per missing spec. Each task materializes
//! its tarball in a private temporary directory, uploads the blobs and
//! only then the manifests that reference them. Failures are collected
//! rather than raised, so one bad spec does not sink the batch; the
//! caller receives `(pushed, skipped, failed)`.

use std::sync::Mutex;

use futures::StreamExt;
use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::buildinfo::BuildInfo;
use crate::error::BuildcacheError;
use crate::index::generate_index;
use crate::layout::{self, BuildcacheComponent, LayoutSentinel, LAYOUT_SENTINEL};
use crate::manifest::{BlobRecord, BuildcacheManifest, Signer};
use crate::mirror::Mirror;
use crate::tarball::create_tarball;
use spack_spec::{Context, Spec};

pub struct PushOptions {
    /// Re-upload tarballs that already exist on the mirror.
    pub force: bool,
    /// Regenerate the mirror index after the last spec.
    pub update_index: bool,
    /// Concurrent existence probes and uploads.
    pub concurrency: usize,
    /// Clear-signs spec manifests before upload.
    pub signer: Option<Signer>,
}

impl Default for PushOptions {
    fn default() -> Self {
        PushOptions { force: false, update_index: false, concurrency: 8, signer: None }
    }
}

/// Progress events, reported per completed task.
#[derive(Debug, Clone)]
pub enum PushProgress {
    Checked { spec: String, present: bool },
    Skipped { spec: String },
    Uploaded { spec: String, bytes: u64 },
    Failed { spec: String },
    IndexUpdated,
}

pub type ProgressCallback = Box<dyn Fn(PushProgress) + Send + Sync>;

#[derive(Debug, Default)]
pub struct PushResult {
    pub pushed: Vec<String>,
    pub skipped: Vec<String>,
    /// Spec and the error that sank it.
    pub failed: Vec<(String, String)>,
}

impl PushResult {
    fn report(&self, progress: &Option<ProgressCallback>, event: PushProgress) {
        if let Some(callback) = progress {
            callback(event);
        }
    }
}

/// Answers of previous existence probes for one mirror, keyed by dag
/// hash. Append only.
#[derive(Default)]
pub struct ExistenceCache {
    entries: Mutex<FxHashMap<String, bool>>,
}

impl ExistenceCache {
    pub fn get(&self, dag_hash: &str) -> Option<bool> {
        self.entries.lock().expect("existence cache poisoned").get(dag_hash).copied()
    }

    pub fn put(&self, dag_hash: &str, present: bool) {
        self.entries
            .lock()
            .expect("existence cache poisoned")
            .insert(dag_hash.to_owned(), present);
    }
}

/// Writes the layout sentinel if the mirror does not have one yet.
pub async fn maybe_push_layout_sentinel(mirror: &Mirror) -> Result<bool, BuildcacheError> {
    if mirror.exists(LAYOUT_SENTINEL).await? {
        return Ok(false);
    }
    let sentinel = serde_json::to_vec(&LayoutSentinel::default()).expect("sentinel serialization");
    mirror.put(LAYOUT_SENTINEL, &sentinel).await?;
    debug!(mirror = %mirror.describe(), "wrote layout.json");
    Ok(true)
}

/// Pushes the given concrete specs to a mirror.
pub async fn push_binaries(
    ctx: &Context,
    mirror: &Mirror,
    specs: &[Spec],
    options: &PushOptions,
    progress: Option<ProgressCallback>,
) -> Result<PushResult, BuildcacheError> {
    maybe_push_layout_sentinel(mirror).await?;
    let cache = ExistenceCache::default();
    let mut result = PushResult::default();

    // Phase 1: which tarballs are already present?
    let checks = futures::stream::iter(specs.iter().map(|spec| {
        let cache = &cache;
        async move {
            let label = spec.to_string();
            let dag_hash = match spec.dag_hash() {
                Ok(hash) => hash.to_owned(),
                Err(e) => return (spec, label, Err(BuildcacheError::from(e))),
            };
            if let Some(present) = cache.get(&dag_hash) {
                return (spec, label, Ok(present));
            }
            let name = spec.name().unwrap_or_default().to_owned();
            let present = mirror
                .exists(&layout::tarball_manifest_path(&name, &dag_hash))
                .await
                .map_err(BuildcacheError::from);
            if let Ok(present) = &present {
                cache.put(&dag_hash, *present);
            }
            (spec, label, present)
        }
    }))
    .buffer_unordered(options.concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut to_push: Vec<&Spec> = Vec::new();
    for (spec, label, present) in checks {
        match present {
            Ok(present) => {
                result.report(&progress, PushProgress::Checked {
                    spec: label.clone(),
                    present,
                });
                if present && !options.force {
                    result.report(&progress, PushProgress::Skipped { spec: label.clone() });
                    result.skipped.push(label);
                } else {
                    to_push.push(spec);
                }
            }
            Err(error) => {
                warn!(spec = %label, %error, "existence check failed");
                result.report(&progress, PushProgress::Failed { spec: label.clone() });
                result.failed.push((label, error.to_string()));
            }
        }
    }

    // Phase 2: build and upload.
    let uploads = futures::stream::iter(to_push.into_iter().map(|spec| async move {
        let label = spec.to_string();
        (label.clone(), push_one(ctx, mirror, spec, options).await)
    }))
    .buffer_unordered(options.concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

    for (label, outcome) in uploads {
        match outcome {
            Ok(bytes) => {
                result.report(&progress, PushProgress::Uploaded { spec: label.clone(), bytes });
                result.pushed.push(label);
            }
            Err(error) => {
                warn!(spec = %label, %error, "push failed");
                result.report(&progress, PushProgress::Failed { spec: label.clone() });
                result.failed.push((label, error.to_string()));
            }
        }
    }

    // Phase 3: one index regeneration after the last spec task.
    if options.update_index {
        generate_index(mirror).await?;
        result.report(&progress, PushProgress::IndexUpdated);
    }
    Ok(result)
}

/// Publishes armored public keys: one blob + manifest per key and a
/// key-index manifest naming them all.
pub async fn push_keys(
    mirror: &Mirror,
    keys: &[(String, String)],
) -> Result<(), BuildcacheError> {
    let mut index_entries: Vec<serde_json::Value> = Vec::new();
    for (fingerprint, armored) in keys {
        let digest = spack_digest::sha256_hex(armored.as_bytes());
        mirror.put(&layout::blob_path(&digest), armored.as_bytes()).await?;
        let manifest = BuildcacheManifest::new(vec![BlobRecord::new(
            BuildcacheComponent::Key,
            "none",
            armored.len() as u64,
            digest,
        )]);
        mirror
            .put(&layout::key_manifest_path(fingerprint), manifest.to_json().as_bytes())
            .await?;
        index_entries.push(serde_json::json!(fingerprint));
    }
    let index_body =
        serde_json::to_string_pretty(&serde_json::json!({ "keys": index_entries }))
            .expect("key index serialization");
    let digest = spack_digest::sha256_hex(index_body.as_bytes());
    mirror.put(&layout::blob_path(&digest), index_body.as_bytes()).await?;
    let manifest = BuildcacheManifest::new(vec![BlobRecord::new(
        BuildcacheComponent::KeyIndex,
        "none",
        index_body.len() as u64,
        digest,
    )]);
    mirror
        .put(&layout::key_index_manifest_path(), manifest.to_json().as_bytes())
        .await?;
    Ok(())
}

/// Pushes a single spec: tarball blob, tarball manifest, spec metadata
/// blob, spec manifest, in that order.
async fn push_one(
    ctx: &Context,
    mirror: &Mirror,
    spec: &Spec,
    options: &PushOptions,
) -> Result<u64, BuildcacheError> {
    let dag_hash = spec.dag_hash()?.to_owned();
    let name = spec.name().unwrap_or_default().to_owned();
    let prefix = ctx.store.prefix_for(spec)?;
    let buildinfo = BuildInfo::for_spec(ctx, spec)?;

    // Each task stages in its own private directory.
    let stage = tempfile::tempdir()?;
    let tarball_path = stage.path().join(format!("{dag_hash}.tar.gz"));
    let summary = {
        let tarball_path = tarball_path.clone();
        tokio::task::spawn_blocking(move || create_tarball(&tarball_path, &prefix, buildinfo))
            .await
            .map_err(|e| BuildcacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??
    };

    mirror
        .put_file(&layout::blob_path(&summary.compressed_sha256), &tarball_path)
        .await?;
    let tarball_record = BlobRecord::new(
        BuildcacheComponent::Tarball,
        "gzip",
        summary.content_length,
        summary.compressed_sha256.clone(),
    );
    let tarball_manifest = BuildcacheManifest::new(vec![tarball_record.clone()]);
    mirror
        .put(
            &layout::tarball_manifest_path(&name, &dag_hash),
            tarball_manifest.to_json().as_bytes(),
        )
        .await?;

    let spec_json = spec.to_specfile_string()?;
    let spec_digest = spack_digest::sha256_hex(spec_json.as_bytes());
    mirror.put(&layout::blob_path(&spec_digest), spec_json.as_bytes()).await?;
    let spec_manifest = BuildcacheManifest::new(vec![
        BlobRecord::new(
            BuildcacheComponent::Spec,
            "none",
            spec_json.len() as u64,
            spec_digest,
        ),
        tarball_record,
    ]);
    let mut manifest_text = spec_manifest.to_json();
    if let Some(signer) = &options.signer {
        manifest_text = signer(&manifest_text)?;
    }
    mirror
        .put(&layout::spec_manifest_path(&name, &dag_hash), manifest_text.as_bytes())
        .await?;
    Ok(summary.content_length)
}
