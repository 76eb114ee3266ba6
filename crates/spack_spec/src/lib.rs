//! Data types and algebra for spack specs.
//!
//! A spec is a labeled dependency DAG: nodes carry version constraints,
//! variants, compiler flags and architecture tuples; edges carry
//! dependency types, provided virtuals and conditions. This crate
//! implements the spec data model, the surface-syntax parser, the
//! algebra (`satisfies`, `intersects`, `constrain`, `splice`), format
//! templates, DAG hashing and the versioned specfile codec.

pub mod arch;
pub mod context;
pub mod spec;
pub mod specfile;
pub mod testing;
pub mod variant;
pub mod version;

pub use arch::{ArchSpec, ParseArchError, Platform, TargetSpec};
pub use context::{Context, NullRepository, PackageRepository, StoreLayout};
pub use spec::format::DEFAULT_FORMAT;
pub use spec::parse::ParseSpecError;
pub use spec::traverse::{Cover, Direction, Order, TraverseItem, TraverseOptions};
pub use spec::{CopyDeps, DepFlags, Edge, EdgeId, External, NodeId, Spec, SpecError, SpecNode};
pub use specfile::{SpecfileError, SPECFILE_FORMAT_VERSION};
pub use variant::{Flag, FlagKind, FlagMap, Variant, VariantError, VariantMap, VariantValue};
pub use version::{
    GitVersion, ParseVersionError, ParseVersionErrorKind, Prerelease, StandardVersion, Version,
    VersionList, VersionRange,
};
