//! Explicit context threaded through operations that consult the
//! package repository or the install store.
//!
//! There are no process-wide singletons here: every consumer takes a
//! [`Context`] value, and tests construct a fresh one per case.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::spec::{Spec, SpecError};
use crate::version::StandardVersion;

/// The facts the spec algebra needs from a package repository. The real
/// repository (package recipes, variant definitions, providers) is an
/// external collaborator; only this interface is visible to the core.
pub trait PackageRepository: Send + Sync {
    /// Variant names a package declares, or `None` for unknown packages.
    fn variant_names(&self, package: &str) -> Option<Vec<String>> {
        let _ = package;
        None
    }

    /// The hash of the package recipe source at concretization time.
    fn package_hash(&self, package: &str) -> Option<String> {
        let _ = package;
        None
    }

    /// Resolves a git ref to `(nearest reachable tag, commit distance)`.
    fn resolve_git_ref(&self, package: &str, git_ref: &str) -> Option<(StandardVersion, u64)> {
        let _ = (package, git_ref);
        None
    }

    /// Packages known to provide a virtual.
    fn providers_of(&self, virtual_name: &str) -> Vec<String> {
        let _ = virtual_name;
        Vec::new()
    }
}

/// A repository that knows nothing. Useful wherever only the
/// self-contained parts of the algebra are exercised.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRepository;

impl PackageRepository for NullRepository {}

/// Layout of the install store: where concrete specs get their
/// prefixes.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    /// A format template projecting a concrete spec to a relative path.
    projection: String,
}

/// The default projection of concrete specs into the store.
pub const DEFAULT_PROJECTION: &str = "{architecture}/{name}-{version}-{hash}";

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreLayout { root: root.into(), projection: DEFAULT_PROJECTION.to_owned() }
    }

    pub fn with_projection(root: impl Into<PathBuf>, projection: impl Into<String>) -> Self {
        StoreLayout { root: root.into(), projection: projection.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the sbang shim of this store lives.
    pub fn sbang_install_path(&self) -> PathBuf {
        self.root.join("bin").join("sbang")
    }

    /// The install prefix of a concrete spec.
    pub fn prefix_for(&self, spec: &Spec) -> Result<PathBuf, SpecError> {
        let relative = spec.format(&self.projection)?;
        Ok(self.root.join(relative))
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        StoreLayout::new("/opt/spack/store")
    }
}

#[derive(Clone)]
pub struct Context {
    pub repo: Arc<dyn PackageRepository>,
    pub store: StoreLayout,
}

impl Context {
    pub fn new(repo: Arc<dyn PackageRepository>, store: StoreLayout) -> Self {
        Context { repo, store }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context { repo: Arc::new(NullRepository), store: StoreLayout::default() }
    }
}
