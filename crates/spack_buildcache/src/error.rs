//! Buildcache error types.

use thiserror::Error;

use crate::layout::LayoutVersionUnsupported;
use crate::mirror::FetchError;
use spack_spec::{SpecError, SpecfileError};

#[derive(Debug, Error)]
pub enum BuildcacheError {
    #[error("invalid metadata file: {0}")]
    InvalidMetadataFile(String),
    #[error("buildcache entry references blob `{0}` which is missing from the mirror")]
    EntryMissingBlob(String),
    #[error("checksum mismatch for `{path}`: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: String, actual: String },
    #[error("the mirror requires signed specs but no signature was found")]
    NoSignatureButSignatureRequired,
    #[error(transparent)]
    LayoutVersionUnsupported(#[from] LayoutVersionUnsupported),
    #[error("archive has no .spack/binary_distribution record")]
    MissingBuildinfo,
    #[error("archive has multiple top-level prefixes")]
    MultiplePrefixes,
    #[error("archive member `{0}` escapes the destination")]
    EntryEscapesPrefix(String),
    #[error("unsupported mirror url `{0}`")]
    UnsupportedMirrorUrl(String),
    #[error(transparent)]
    Specfile(#[from] SpecfileError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Relocate(#[from] spack_relocate::RelocateError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
