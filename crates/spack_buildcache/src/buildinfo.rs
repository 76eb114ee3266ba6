//! The buildinfo record embedded in every tarball.
//!
//! `.spack/binary_distribution` is a YAML mapping telling the
//! relocation engine which paths were baked into which files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BuildcacheError;
use spack_relocate::{PrefixMap, RelocationPlan};
use spack_spec::spec::traverse::{Order, TraverseOptions};
use spack_spec::{Context, DepFlags, Spec};

/// Path of the buildinfo record inside the package prefix.
pub const BUILDINFO_FILE: &str = ".spack/binary_distribution";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// The store root the package was built into.
    pub buildpath: String,
    /// The spack installation that produced the package.
    pub spackprefix: String,
    pub sbang_install_path: String,
    /// Install prefix relative to the store root.
    pub relative_prefix: String,
    pub hardlinks_deduped: bool,
    /// dag_hash -> install prefix for the spec and everything it may
    /// reference at run time.
    #[serde(default)]
    pub hash_to_prefix: BTreeMap<String, String>,
    #[serde(default)]
    pub relocate_binaries: Vec<String>,
    #[serde(default)]
    pub relocate_textfiles: Vec<String>,
    #[serde(default)]
    pub relocate_links: Vec<String>,
}

impl BuildInfo {
    /// The metadata for a tarball of `spec`, with empty relocation
    /// lists; the tarball engine fills those while walking the prefix.
    pub fn for_spec(ctx: &Context, spec: &Spec) -> Result<BuildInfo, BuildcacheError> {
        let store_root = ctx.store.root().to_string_lossy().into_owned();
        let prefix = ctx.store.prefix_for(spec)?;
        let relative_prefix = prefix
            .strip_prefix(ctx.store.root())
            .unwrap_or(&prefix)
            .to_string_lossy()
            .into_owned();

        let mut hash_to_prefix = BTreeMap::new();
        for target in specs_to_relocate(spec) {
            let sub = spec.subspec(target);
            let hash = sub.dag_hash()?.to_owned();
            hash_to_prefix.insert(hash, ctx.store.prefix_for(&sub)?.to_string_lossy().into_owned());
        }

        Ok(BuildInfo {
            buildpath: store_root.clone(),
            spackprefix: store_root,
            sbang_install_path: ctx.store.sbang_install_path().to_string_lossy().into_owned(),
            relative_prefix,
            hardlinks_deduped: true,
            hash_to_prefix,
            relocate_binaries: Vec::new(),
            relocate_textfiles: Vec::new(),
            relocate_links: Vec::new(),
        })
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).expect("buildinfo serialization")
    }

    pub fn from_yaml(text: &str) -> Result<BuildInfo, BuildcacheError> {
        serde_yaml::from_str(text)
            .map_err(|e| BuildcacheError::InvalidMetadataFile(e.to_string()))
    }

    /// Reads the buildinfo of an extracted prefix.
    pub fn read(prefix: &Path) -> Result<BuildInfo, BuildcacheError> {
        let path = prefix.join(BUILDINFO_FILE);
        if !path.is_file() {
            return Err(BuildcacheError::MissingBuildinfo);
        }
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Every absolute prefix that may appear inside package files.
    pub fn prefixes_to_relocate(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.hash_to_prefix.values().cloned().collect();
        for extra in [&self.buildpath, &self.spackprefix, &self.sbang_install_path] {
            if !extra.is_empty() && !prefixes.contains(extra) {
                prefixes.push(extra.clone());
            }
        }
        // Longest first, so nested prefixes match most specifically.
        prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));
        prefixes
    }

    /// Builds the relocation plan for installing into `ctx`'s store.
    ///
    /// A tarball without `hash_to_prefix` predates the current layout
    /// and cannot be relocated safely.
    pub fn relocation_plan(
        &self,
        ctx: &Context,
        receiving: &Spec,
    ) -> Result<RelocationPlan, BuildcacheError> {
        if self.hash_to_prefix.is_empty() {
            return Err(BuildcacheError::Relocate(
                spack_relocate::RelocateError::NewLayoutIncompatible(
                    "buildinfo has no hash_to_prefix".to_owned(),
                ),
            ));
        }
        let mut prefix_map = PrefixMap::new();
        for (hash, old_prefix) in &self.hash_to_prefix {
            // Match the recorded node against the receiving spec, by
            // hash, falling back to build provenance for spliced specs.
            if let Some(node) = node_by_hash(receiving, hash) {
                let sub = receiving.subspec(node);
                let new_prefix = ctx.store.prefix_for(&sub)?;
                prefix_map.insert(old_prefix.clone(), new_prefix.to_string_lossy().into_owned());
            }
        }
        // Spliced specs: prefixes recorded for the build_spec map onto
        // the nodes that replaced its closure, matched by name.
        if let Some(build_spec) = &receiving.root_node().build_spec {
            for item in build_spec.traverse(TraverseOptions::default()) {
                let node = build_spec.node(item.node);
                let (Some(name), Some(hash)) = (&node.name, &node.dag_hash) else { continue };
                let Some(old_prefix) = self.hash_to_prefix.get(hash) else { continue };
                if let Some(target) = receiving.find_by_name(name) {
                    let sub = receiving.subspec(target);
                    let new_prefix = ctx.store.prefix_for(&sub)?;
                    prefix_map
                        .insert(old_prefix.clone(), new_prefix.to_string_lossy().into_owned());
                }
            }
        }
        prefix_map.insert(
            self.sbang_install_path.clone(),
            ctx.store.sbang_install_path().to_string_lossy().into_owned(),
        );
        prefix_map
            .insert(self.buildpath.clone(), ctx.store.root().to_string_lossy().into_owned());

        Ok(RelocationPlan {
            prefix_map,
            binaries: self.relocate_binaries.iter().map(PathBuf::from).collect(),
            textfiles: self.relocate_textfiles.iter().map(PathBuf::from).collect(),
            links: self.relocate_links.iter().map(PathBuf::from).collect(),
            hardlinks_deduped: self.hardlinks_deduped,
        })
    }
}

/// The specs whose prefixes may be referenced from this spec's install:
/// the link closure plus direct run dependencies, externals excluded.
pub fn specs_to_relocate(spec: &Spec) -> Vec<spack_spec::NodeId> {
    let mut nodes: Vec<spack_spec::NodeId> = Vec::new();
    for item in spec.traverse(TraverseOptions {
        order: Order::Breadth,
        depflag: DepFlags::LINK,
        ..Default::default()
    }) {
        if spec.node(item.node).external.is_none() && !nodes.contains(&item.node) {
            nodes.push(item.node);
        }
    }
    for eid in spec.dependencies(spec.root()) {
        let edge = spec.edge(eid);
        if edge.depflag.contains(DepFlags::RUN)
            && spec.node(edge.child).external.is_none()
            && !nodes.contains(&edge.child)
        {
            nodes.push(edge.child);
        }
    }
    nodes
}

fn node_by_hash(spec: &Spec, hash: &str) -> Option<spack_spec::NodeId> {
    spec.reachable_nodes()
        .into_iter()
        .find(|id| spec.node(*id).dag_hash.as_deref() == Some(hash))
}

#[cfg(test)]
mod test {
    use super::*;
    use spack_spec::testing;

    #[test]
    fn buildinfo_for_spec_records_link_closure() {
        let ctx = Context::default();
        let spec = testing::concretize("mpileaks@=2.3^mpich@=3.2");
        let info = BuildInfo::for_spec(&ctx, &spec).unwrap();
        assert_eq!(info.hash_to_prefix.len(), 2);
        assert!(info.hardlinks_deduped);
        assert!(info.relative_prefix.contains("mpileaks"));

        let yaml = info.to_yaml();
        assert_eq!(BuildInfo::from_yaml(&yaml).unwrap(), info);
    }

    #[test]
    fn relocation_plan_maps_old_to_new_store() {
        let spec = testing::concretize("zlib@=1.3");
        let old_ctx = Context {
            store: spack_spec::StoreLayout::new("/orig/opt/store"),
            ..Context::default()
        };
        let new_ctx = Context {
            store: spack_spec::StoreLayout::new("/new/opt/store"),
            ..Context::default()
        };
        let info = BuildInfo::for_spec(&old_ctx, &spec).unwrap();
        let plan = info.relocation_plan(&new_ctx, &spec).unwrap();
        let (old, new) = plan.prefix_map.iter().next().unwrap();
        assert!(old.starts_with("/orig/opt/store"));
        assert!(new.starts_with("/new/opt/store"));
    }

    #[test]
    fn missing_hash_to_prefix_is_incompatible() {
        let spec = testing::concretize("zlib@=1.3");
        let info = BuildInfo::default();
        assert_matches::assert_matches!(
            info.relocation_plan(&Context::default(), &spec),
            Err(BuildcacheError::Relocate(
                spack_relocate::RelocateError::NewLayoutIncompatible(_)
            ))
        );
    }
}
