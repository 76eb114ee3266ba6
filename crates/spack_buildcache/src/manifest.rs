//! Buildcache manifests: small JSON documents naming blobs by digest.

use serde::{Deserialize, Serialize};

use crate::error::BuildcacheError;
use crate::layout::{BuildcacheComponent, CURRENT_BUILD_CACHE_LAYOUT_VERSION, LayoutVersion};

/// One blob named by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub content_length: u64,
    pub media_type: String,
    pub compression: String,
    pub checksum_algorithm: String,
    pub checksum: String,
}

impl BlobRecord {
    pub fn new(
        component: BuildcacheComponent,
        compression: &str,
        content_length: u64,
        sha256: impl Into<String>,
    ) -> Self {
        BlobRecord {
            content_length,
            media_type: component.media_type().to_owned(),
            compression: compression.to_owned(),
            checksum_algorithm: "sha256".to_owned(),
            checksum: sha256.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildcacheManifest {
    pub version: u32,
    pub data: Vec<BlobRecord>,
}

impl BuildcacheManifest {
    pub fn new(data: Vec<BlobRecord>) -> Self {
        BuildcacheManifest { version: CURRENT_BUILD_CACHE_LAYOUT_VERSION, data }
    }

    /// Parses a manifest, transparently unwrapping a clear-signed
    /// envelope, and checks that its declared layout version is one
    /// this reader supports.
    pub fn from_slice(bytes: &[u8]) -> Result<BuildcacheManifest, BuildcacheError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
        let payload = spack_spec::specfile::extract_clearsigned(text);
        let manifest: BuildcacheManifest = serde_json::from_str(payload)
            .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))?;
        LayoutVersion::from_version(manifest.version)?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("manifest serialization")
    }

    /// The blob with the given media type, if any.
    pub fn find(&self, component: BuildcacheComponent) -> Option<&BlobRecord> {
        self.data.iter().find(|record| record.media_type == component.media_type())
    }

    /// The single blob of a one-blob manifest (e.g. the index).
    pub fn sole_blob(&self) -> Result<&BlobRecord, BuildcacheError> {
        match self.data.as_slice() {
            [record] => Ok(record),
            other => Err(BuildcacheError::InvalidMetadataFile(format!(
                "expected exactly one blob, found {}",
                other.len()
            ))),
        }
    }
}

/// Hook used to clear-sign manifests before upload. The actual signing
/// tool (gpg) is an external collaborator.
pub type Signer = Box<dyn Fn(&str) -> std::io::Result<String> + Send + Sync>;

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> BuildcacheManifest {
        BuildcacheManifest::new(vec![
            BlobRecord::new(BuildcacheComponent::Spec, "none", 123, "aa".repeat(32)),
            BlobRecord::new(BuildcacheComponent::Tarball, "gzip", 4567, "bb".repeat(32)),
        ])
    }

    #[test]
    fn round_trip() {
        let manifest = sample();
        let parsed = BuildcacheManifest::from_slice(manifest.to_json().as_bytes()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(
            parsed.find(BuildcacheComponent::Tarball).unwrap().compression,
            "gzip"
        );
        assert!(parsed.find(BuildcacheComponent::Index).is_none());
    }

    #[test]
    fn clearsigned_manifest_is_unwrapped() {
        let manifest = sample();
        let signed = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\n{}\n-----BEGIN PGP SIGNATURE-----\nabc\n-----END PGP SIGNATURE-----\n",
            manifest.to_json()
        );
        let parsed = BuildcacheManifest::from_slice(signed.as_bytes()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn unsupported_layout_version_is_rejected() {
        let mut manifest = sample();
        manifest.version = 9;
        assert_matches::assert_matches!(
            BuildcacheManifest::from_slice(manifest.to_json().as_bytes()),
            Err(BuildcacheError::LayoutVersionUnsupported(_))
        );
    }
}
