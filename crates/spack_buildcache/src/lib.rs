//! The content-addressed buildcache.
//!
//! A buildcache entry for a concrete spec is a tarball blob, a spec
//! metadata blob and the manifests naming them by digest, laid out on
//! a mirror under `v3/`. This crate implements the layout, reproducible
//! tarball creation and safe extraction, the parallel push pipeline,
//! verified fetches with ETag-conditional index refresh, index
//! generation, and the OCI registry adapter.

pub mod buildinfo;
pub mod error;
pub mod fetch;
pub mod index;
pub mod install;
pub mod layout;
pub mod manifest;
pub mod mirror;
pub mod oci;
pub mod push;
pub mod tarball;

pub use buildinfo::{BuildInfo, BUILDINFO_FILE};
pub use error::BuildcacheError;
pub use fetch::{
    conditional_fetch_index, conditional_fetch_index_v2, fetch_archive, fetch_metadata,
    fetch_metadata_v2, fetch_metadata_with_policy, CachedIndex, FetchIndexError,
    FetchIndexResult,
};
pub use index::{generate_index, AccessMode, BinaryCacheIndex, BuildCacheDatabase};
pub use install::install_from_cache;
pub use layout::{BuildcacheComponent, LayoutVersion, CURRENT_BUILD_CACHE_LAYOUT_VERSION};
pub use manifest::{BlobRecord, BuildcacheManifest, Signer};
pub use mirror::{FetchError, Mirror};
pub use push::{
    maybe_push_layout_sentinel, push_binaries, push_keys, ExistenceCache, PushOptions,
    PushProgress, PushResult,
};
pub use tarball::{create_tarball, extract_tarball, TarballSummary};
