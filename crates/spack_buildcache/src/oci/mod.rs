//! The OCI adapter: the buildcache model mapped onto the Distribution
//! Spec.
//!
//! Blobs stay blobs; each spec's manifest becomes an OCI image manifest
//! whose single layer is the tarball (the uncompressed digest is the
//! rootfs diff id) and whose config blob is the spec metadata JSON.
//! Tags default to `<name>-<version>-<dag-hash>.spack`; the index is a
//! manifest tagged `index.spack` whose layer is the index blob.

use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::fetch::{CachedIndex, FetchIndexResult};
use spack_spec::{Spec, SpecError};

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Tag under which the buildcache index is published.
pub const INDEX_TAG: &str = "index.spack";

#[derive(Debug, Error)]
pub enum OciError {
    #[error("invalid oci reference `{0}`")]
    InvalidReference(String),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest_middleware::Error),
    #[error("registry body read failed: {0}")]
    Body(#[from] reqwest::Error),
    #[error("registry returned status {status} for `{url}`")]
    Status { url: String, status: u16 },
    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// `oci://registry/repository`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<ImageReference, OciError> {
        let rest = reference
            .strip_prefix("oci://")
            .ok_or_else(|| OciError::InvalidReference(reference.to_owned()))?;
        let (registry, repository) = rest
            .split_once('/')
            .ok_or_else(|| OciError::InvalidReference(reference.to_owned()))?;
        if registry.is_empty() || repository.is_empty() {
            return Err(OciError::InvalidReference(reference.to_owned()));
        }
        Ok(ImageReference {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
        })
    }

    pub fn manifest_url(&self, tag_or_digest: &str) -> String {
        format!("https://{}/v2/{}/manifests/{}", self.registry, self.repository, tag_or_digest)
    }

    pub fn blob_url(&self, digest: &str) -> String {
        format!("https://{}/v2/{}/blobs/{}", self.registry, self.repository, digest)
    }

    pub fn upload_url(&self) -> String {
        format!("https://{}/v2/{}/blobs/uploads/", self.registry, self.repository)
    }
}

/// A blob as OCI names it: media type, `sha256:`-prefixed digest, size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

impl OciDescriptor {
    pub fn new(media_type: &str, sha256_hex: &str, size: u64) -> Self {
        OciDescriptor {
            media_type: media_type.to_owned(),
            digest: format!("sha256:{sha256_hex}"),
            size,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "mediaType": self.media_type,
            "digest": self.digest,
            "size": self.size,
        })
    }
}

/// The default tag of a spec's image.
pub fn default_tag(spec: &Spec) -> Result<String, SpecError> {
    let name = spec.format("{name}")?;
    let version = spec.format("{version}")?;
    let hash = spec.dag_hash()?;
    // OCI tags are limited to [A-Za-z0-9_.-]; spec versions already
    // are, but be conservative about anything else.
    let sanitize = |s: &str| {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
            .collect::<String>()
    };
    Ok(format!("{}-{}-{}.spack", sanitize(&name), sanitize(&version), hash))
}

/// The image manifest of one buildcache entry: config = spec metadata,
/// single layer = tarball.
pub fn image_manifest(config: &OciDescriptor, layer: &OciDescriptor) -> Value {
    json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST_MEDIA_TYPE,
        "config": config.to_json(),
        "layers": [layer.to_json()],
    })
}

/// The synthetic config blob: an image config whose rootfs diff id is
/// the uncompressed tarball digest, carrying the spec itself under an
/// annotation-like key.
pub fn image_config(spec: &Spec, uncompressed_sha256: &str) -> Result<Value, SpecError> {
    let specfile = spec
        .to_specfile()
        .map_err(|_| SpecError::SpecNotConcrete(spec.to_string()))?;
    Ok(json!({
        "architecture": spec.format("{architecture.target}")?,
        "os": spec.format("{architecture.platform}")?,
        "rootfs": {
            "type": "layers",
            "diff_ids": [format!("sha256:{uncompressed_sha256}")],
        },
        "config": {},
        "spack.spec": specfile,
    }))
}

/// A thin client for the Distribution Spec endpoints the buildcache
/// needs. Authentication is ambient (anonymous or a credential helper
/// in front of the registry).
pub struct OciClient {
    pub reference: ImageReference,
    client: ClientWithMiddleware,
}

impl OciClient {
    pub fn new(reference: ImageReference, client: ClientWithMiddleware) -> Self {
        OciClient { reference, client }
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<bool, OciError> {
        let url = self.reference.blob_url(digest);
        let response = self.client.head(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(OciError::Status { url, status: status.as_u16() }),
        }
    }

    /// Monolithic blob upload: POST an upload session, PUT the bytes.
    #[instrument(level = "debug", skip(self, data))]
    pub async fn push_blob(&self, digest: &str, data: Vec<u8>) -> Result<(), OciError> {
        if self.blob_exists(digest).await? {
            debug!(digest, "blob already present");
            return Ok(());
        }
        let start = self.reference.upload_url();
        let response = self.client.post(&start).send().await?;
        let status = response.status();
        if status != StatusCode::ACCEPTED {
            return Err(OciError::Status { url: start, status: status.as_u16() });
        }
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OciError::Status { url: start.clone(), status: status.as_u16() })?
            .to_owned();
        let separator = if location.contains('?') { '&' } else { '?' };
        let upload = if location.starts_with("http") {
            format!("{location}{separator}digest={digest}")
        } else {
            format!("https://{}{location}{separator}digest={digest}", self.reference.registry)
        };
        let response = self
            .client
            .put(&upload)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::Status { url: upload, status: status.as_u16() });
        }
        Ok(())
    }

    pub async fn put_manifest(&self, tag: &str, manifest: &Value) -> Result<(), OciError> {
        let url = self.reference.manifest_url(tag);
        let response = self
            .client
            .put(&url)
            .header("content-type", OCI_MANIFEST_MEDIA_TYPE)
            .body(serde_json::to_vec(manifest).expect("manifest serialization"))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::Status { url, status: status.as_u16() });
        }
        Ok(())
    }

    pub async fn get_manifest(&self, tag: &str) -> Result<(Value, Option<String>), OciError> {
        let url = self.reference.manifest_url(tag);
        let response = self
            .client
            .get(&url)
            .header("accept", OCI_MANIFEST_MEDIA_TYPE)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::Status { url, status: status.as_u16() });
        }
        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok((response.json().await?, digest))
    }

    pub async fn get_blob(&self, digest: &str) -> Result<Vec<u8>, OciError> {
        let url = self.reference.blob_url(digest);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OciError::Status { url, status: status.as_u16() });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Conditional index fetch keyed by the `index.spack` manifest
    /// digest: the blob is only transferred when the manifest moved.
    pub async fn conditional_fetch_index(
        &self,
        cached: &CachedIndex,
    ) -> Result<FetchIndexResult, OciError> {
        let (manifest, manifest_digest) = self.get_manifest(INDEX_TAG).await?;
        if let (Some(cached_digest), Some(remote_digest)) = (&cached.digest, &manifest_digest) {
            if cached_digest == remote_digest {
                return Ok(FetchIndexResult {
                    fresh: true,
                    hash: manifest_digest,
                    ..Default::default()
                });
            }
        }
        let layer_digest = manifest
            .get("layers")
            .and_then(Value::as_array)
            .and_then(|layers| layers.first())
            .and_then(|layer| layer.get("digest"))
            .and_then(Value::as_str)
            .ok_or_else(|| OciError::Status {
                url: self.reference.manifest_url(INDEX_TAG),
                status: 0,
            })?
            .to_owned();
        let blob = self.get_blob(&layer_digest).await?;
        Ok(FetchIndexResult {
            etag: None,
            hash: manifest_digest,
            data: Some(String::from_utf8_lossy(&blob).into_owned()),
            fresh: false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use spack_spec::testing;

    #[test]
    fn reference_parsing() {
        let r = ImageReference::parse("oci://ghcr.io/myorg/buildcache").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "myorg/buildcache");
        assert_eq!(
            r.manifest_url("index.spack"),
            "https://ghcr.io/v2/myorg/buildcache/manifests/index.spack"
        );
        assert!(ImageReference::parse("https://not-oci").is_err());
    }

    #[test]
    fn tags_and_manifests() {
        let spec = testing::concretize("zlib@=1.3");
        let tag = default_tag(&spec).unwrap();
        assert!(tag.starts_with("zlib-1.3-"));
        assert!(tag.ends_with(".spack"));

        let config = OciDescriptor::new(OCI_CONFIG_MEDIA_TYPE, &"ab".repeat(32), 42);
        let layer = OciDescriptor::new(OCI_LAYER_MEDIA_TYPE, &"cd".repeat(32), 123);
        let manifest = image_manifest(&config, &layer);
        assert_eq!(manifest["schemaVersion"], 2);
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 1);
        assert!(manifest["layers"][0]["digest"]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
    }

    #[test]
    fn config_carries_diff_id_and_spec() {
        let spec = testing::concretize("zlib@=1.3");
        let config = image_config(&spec, &"ef".repeat(32)).unwrap();
        assert_eq!(
            config["rootfs"]["diff_ids"][0],
            format!("sha256:{}", "ef".repeat(32))
        );
        assert!(config["spack.spec"]["spec"]["_meta"]["version"].is_number());
    }
}
