//! Installing a spec from a buildcache: fetch, extract, relocate.

use std::path::PathBuf;

use tracing::{debug, instrument};

use crate::buildinfo::BuildInfo;
use crate::error::BuildcacheError;
use crate::fetch::fetch_archive;
use crate::mirror::Mirror;
use crate::tarball::extract_tarball;
use spack_spec::{Context, Spec};

/// Downloads, extracts and relocates a concrete spec into the store of
/// `ctx`. The staged tarball lives in a private temporary directory; a
/// failed relocation removes the partially installed prefix before the
/// error propagates.
#[instrument(level = "debug", skip_all, fields(spec = %spec))]
pub async fn install_from_cache(
    ctx: &Context,
    mirror: &Mirror,
    spec: &Spec,
) -> Result<PathBuf, BuildcacheError> {
    let dag_hash = spec.dag_hash()?.to_owned();
    let name = spec.name().unwrap_or_default().to_owned();
    let stage = tempfile::tempdir()?;
    let (archive, _manifest) = fetch_archive(mirror, &name, &dag_hash, stage.path()).await?;

    let prefix = ctx.store.prefix_for(spec)?;
    let buildinfo = {
        let prefix = prefix.clone();
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || extract_tarball(&archive, &prefix))
            .await
            .map_err(|e| BuildcacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??
    };
    debug!(prefix = %prefix.display(), "extracted, relocating");

    relocate_extracted(ctx, spec, &buildinfo, &prefix)?;
    Ok(prefix)
}

/// Applies the relocation plan of an extracted prefix.
pub fn relocate_extracted(
    ctx: &Context,
    spec: &Spec,
    buildinfo: &BuildInfo,
    prefix: &std::path::Path,
) -> Result<(), BuildcacheError> {
    let plan = match buildinfo.relocation_plan(ctx, spec) {
        Ok(plan) => plan,
        Err(error) => {
            // An unusable plan must not leave a broken prefix behind.
            let _ = std::fs::remove_dir_all(prefix);
            return Err(error);
        }
    };
    spack_relocate::relocate(prefix, &plan)?;
    Ok(())
}
