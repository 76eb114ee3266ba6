//! The on-mirror layout of a buildcache.
//!
//! Layout v3 is content addressed: opaque blobs under
//! `v3/blobs/sha256/<xx>/<digest>` and small JSON manifests naming them
//! by digest and media type. Layout v2 (flat `build_cache/` files) is
//! supported read-only; pushes always write v3. A `layout.json`
//! sentinel at the mirror root declares the active version.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The layout version written by pushes.
pub const CURRENT_BUILD_CACHE_LAYOUT_VERSION: u32 = 3;

/// Name of the sentinel file declaring the mirror's layout version.
pub const LAYOUT_SENTINEL: &str = "layout.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buildcache layout version {0} is not supported by this reader")]
pub struct LayoutVersionUnsupported(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutVersion {
    V2,
    V3,
}

impl LayoutVersion {
    pub fn from_version(version: u32) -> Result<LayoutVersion, LayoutVersionUnsupported> {
        match version {
            2 => Ok(LayoutVersion::V2),
            3 => Ok(LayoutVersion::V3),
            other => Err(LayoutVersionUnsupported(other)),
        }
    }

    pub fn version(self) -> u32 {
        match self {
            LayoutVersion::V2 => 2,
            LayoutVersion::V3 => 3,
        }
    }
}

/// Content of `layout.json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayoutSentinel {
    pub version: u32,
}

impl Default for LayoutSentinel {
    fn default() -> Self {
        LayoutSentinel { version: CURRENT_BUILD_CACHE_LAYOUT_VERSION }
    }
}

/// The kinds of objects a buildcache stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildcacheComponent {
    Spec,
    Tarball,
    Index,
    Key,
    KeyIndex,
}

impl BuildcacheComponent {
    /// The media type recorded in manifests for this component.
    pub fn media_type(self) -> &'static str {
        match self {
            BuildcacheComponent::Spec => "application/vnd.spack.spec",
            BuildcacheComponent::Tarball => "application/vnd.spack.tarball",
            BuildcacheComponent::Index => "application/vnd.spack.buildcache-index",
            BuildcacheComponent::Key => "application/vnd.spack.key",
            BuildcacheComponent::KeyIndex => "application/vnd.spack.key-index",
        }
    }
}

/// Mirror-relative path of a content-addressed blob.
pub fn blob_path(sha256: &str) -> String {
    let shard = &sha256[..2.min(sha256.len())];
    format!("v3/blobs/sha256/{shard}/{sha256}")
}

pub fn spec_manifest_path(name: &str, dag_hash: &str) -> String {
    format!("v3/manifests/spec/{name}/{dag_hash}.spec.manifest.json")
}

pub fn tarball_manifest_path(name: &str, dag_hash: &str) -> String {
    format!("v3/manifests/tarball/{name}/{dag_hash}.tarball.manifest.json")
}

pub fn index_manifest_path() -> String {
    "v3/manifests/index/index.manifest.json".to_owned()
}

pub fn key_manifest_path(fingerprint: &str) -> String {
    format!("v3/manifests/keys/{fingerprint}.key.manifest.json")
}

pub fn key_index_manifest_path() -> String {
    "v3/manifests/keys/keys.manifest.json".to_owned()
}

/// Prefix under which all spec manifests of a v3 mirror live; used to
/// enumerate a mirror when regenerating the index.
pub const SPEC_MANIFEST_PREFIX: &str = "v3/manifests/spec";

/// Legacy (v2) locations, read-only.
pub mod v2 {
    pub fn spec_path(dag_hash: &str) -> String {
        format!("build_cache/{dag_hash}.spec.json")
    }

    pub fn signed_spec_path(dag_hash: &str) -> String {
        format!("build_cache/{dag_hash}.spec.json.sig")
    }

    pub fn index_path() -> &'static str {
        "build_cache/index.json"
    }

    pub fn index_hash_path() -> &'static str {
        "build_cache/index.json.hash"
    }

    pub fn key_index_path() -> &'static str {
        "build_cache/_pgp/index.json"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blob_paths_are_sharded_by_digest_head() {
        let digest = "deadbeef00112233445566778899aabbccddeeff00112233445566778899aabb";
        assert_eq!(
            blob_path(digest),
            format!("v3/blobs/sha256/de/{digest}")
        );
    }

    #[test]
    fn manifest_paths() {
        assert_eq!(
            spec_manifest_path("zlib", "abc123"),
            "v3/manifests/spec/zlib/abc123.spec.manifest.json"
        );
        assert_eq!(
            tarball_manifest_path("zlib", "abc123"),
            "v3/manifests/tarball/zlib/abc123.tarball.manifest.json"
        );
        assert_eq!(index_manifest_path(), "v3/manifests/index/index.manifest.json");
    }

    #[test]
    fn layout_negotiation() {
        assert_eq!(LayoutVersion::from_version(3).unwrap(), LayoutVersion::V3);
        assert_eq!(LayoutVersion::from_version(2).unwrap(), LayoutVersion::V2);
        assert_matches::assert_matches!(
            LayoutVersion::from_version(7),
            Err(LayoutVersionUnsupported(7))
        );
    }
}
