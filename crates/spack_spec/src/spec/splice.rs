//! Splicing: replacing a node (and optionally its closure) of a
//! concrete spec with another concrete spec.
//!
//! The replaced node's ancestors record where they came from: their
//! `build_spec` points at a copy of their pre-splice form, their
//! build-only edges are detached, and their recomputed hash keeps the
//! last seven characters of the provenance hash so relocation stays
//! compatible with the original binaries.

use fxhash::FxHashMap;

use super::{DepFlags, Edge, NodeId, Spec, SpecError};
use crate::context::Context;
use crate::spec::traverse::{Direction, TraverseOptions};

impl Spec {
    /// A standalone spec rooted at one of this spec's nodes.
    pub fn subspec(&self, root: NodeId) -> Spec {
        let mut out = Spec::default();
        let mut map = FxHashMap::default();
        out.root = out.graft(self, root, Some(DepFlags::ALL), &mut map);
        out
    }

    /// Produces a new concrete spec in which every node matching
    /// `other`'s root (by name, or by a virtual `other` provides) is
    /// replaced by `other`.
    ///
    /// With `transitive`, `other`'s link/run closure replaces the
    /// corresponding closure of `self`; otherwise only the matched node
    /// is replaced and `self`'s transitive link/run dependencies are
    /// kept.
    pub fn splice(
        &self,
        other: &Spec,
        transitive: bool,
        ctx: &Context,
    ) -> Result<Spec, SpecError> {
        let splice_error = |reason: &str| SpecError::SpliceError {
            target: self.to_string(),
            other: other.to_string(),
            reason: reason.to_owned(),
        };
        if !self.is_concrete() || !other.is_concrete() {
            return Err(splice_error("both specs must be concrete"));
        }
        let other_name = other.name().ok_or_else(|| splice_error("anonymous replacement"))?;

        // Copy ourselves into a fresh arena, remembering provenance ids.
        let mut result = Spec::default();
        let mut forward: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        result.root = result.graft(self, self.root, Some(DepFlags::ALL), &mut forward);
        let original_of: FxHashMap<NodeId, NodeId> =
            forward.iter().map(|(original, copy)| (*copy, *original)).collect();

        // The root is replaced outright when it matches.
        if node_matches(&result, result.root, other_name, ctx) {
            let mut replacement = other.copy(super::CopyDeps::All);
            replacement.root_node_mut().build_spec = Some(Box::new(self.clone()));
            replacement.compute_dag_hashes();
            return Ok(replacement);
        }

        // Matches are sought among link/run descendants only.
        let link_run = DepFlags::LINK.union(DepFlags::RUN);
        let matches: Vec<NodeId> = result
            .traverse(TraverseOptions { depflag: link_run, root: false, ..Default::default() })
            .into_iter()
            .map(|item| item.node)
            .filter(|id| node_matches(&result, *id, other_name, ctx))
            .collect();
        if matches.is_empty() {
            return Err(splice_error("no node with a matching name or virtual"));
        }

        let mut ancestors: Vec<NodeId> = Vec::new();
        let mut graft_map = FxHashMap::default();
        let replacement_root = result.graft(other, other.root, Some(DepFlags::ALL), &mut graft_map);

        for matched in matches {
            // Ancestors recorded before rewiring, while the matched
            // node is still reachable from them.
            for item in result.traverse_from(
                matched,
                TraverseOptions { direction: Direction::Parents, root: false, ..Default::default() },
            ) {
                if !ancestors.contains(&item.node) {
                    ancestors.push(item.node);
                }
            }
            // Point every dependent of the matched node at the
            // replacement instead.
            for eid in result.nodes[matched].in_edges.clone() {
                let Some(edge) = result.edges[eid].as_ref() else { continue };
                let rewired = Edge {
                    parent: edge.parent,
                    child: replacement_root,
                    depflag: edge.depflag,
                    virtuals: edge.virtuals.clone(),
                    direct: edge.direct,
                    when: edge.when.clone(),
                };
                result.detach_edge(eid);
                result.push_edge(rewired);
            }
        }

        if !transitive {
            // Keep our own transitive link/run dependencies: rewire the
            // replacement's link/run edges onto same-named nodes we
            // already have.
            for eid in result.nodes[replacement_root].out_edges.clone() {
                let Some(edge) = result.edges[eid].as_ref() else { continue };
                if !edge.depflag.intersects(link_run) {
                    continue;
                }
                let child_name = result.nodes[edge.child].name.clone();
                let Some(child_name) = child_name else { continue };
                let existing = result
                    .traverse(TraverseOptions { root: false, ..Default::default() })
                    .into_iter()
                    .map(|item| item.node)
                    .find(|id| {
                        *id != edge.child
                            && !graft_map.values().any(|g| g == id)
                            && result.nodes[*id].name.as_deref() == Some(child_name.as_str())
                    });
                if let Some(existing) = existing {
                    let rewired = Edge { child: existing, ..result.edge(eid).clone() };
                    result.detach_edge(eid);
                    result.push_edge(rewired);
                }
            }
        }

        // Stamp provenance on every ancestor of a replaced node and
        // drop their build-only edges.
        for ancestor in ancestors {
            if let Some(&original) = original_of.get(&ancestor) {
                result.nodes[ancestor].build_spec = Some(Box::new(self.subspec(original)));
            }
            for eid in result.nodes[ancestor].out_edges.clone() {
                let Some(edge) = result.edges[eid].as_ref() else { continue };
                if !edge.depflag.intersects(link_run.union(DepFlags::TEST)) {
                    result.detach_edge(eid);
                }
            }
        }

        result.compact();
        result.compute_dag_hashes();
        tracing::debug!(original = %self, replacement = %other, "spliced spec");
        Ok(result)
    }
}

fn node_matches(spec: &Spec, id: NodeId, other_name: &str, ctx: &Context) -> bool {
    let node = spec.node(id);
    if node.name.as_deref() == Some(other_name) {
        return true;
    }
    // A node matched through a virtual it provides, when the
    // replacement is a known provider of that virtual.
    node.in_edges.iter().any(|eid| {
        spec.edges[*eid].as_ref().map_or(false, |edge| {
            edge.virtuals
                .iter()
                .any(|v| ctx.repo.providers_of(v).iter().any(|p| p == other_name))
        })
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::hash::SPLICED_HASH_SUFFIX_LEN;
    use crate::testing;

    fn last7(hash: &str) -> &str {
        &hash[hash.len() - SPLICED_HASH_SUFFIX_LEN..]
    }

    #[test]
    fn splice_preserves_hash_tails() {
        // S4: splice mpich@=4.0 into mpileaks^mpich@=3.2.
        let ctx = Context::default();
        let target = testing::concretize("mpileaks@=2.3^mpich@=3.2");
        let replacement = testing::concretize("mpich@=4.0");
        let h1 = target.dag_hash().unwrap().to_owned();
        let h2 = replacement.dag_hash().unwrap().to_owned();

        let spliced = target.splice(&replacement, true, &ctx).unwrap();
        let root_hash = spliced.dag_hash().unwrap();
        assert_ne!(root_hash, h1);
        assert_eq!(last7(root_hash), last7(&h1));

        let mpich = spliced.find_by_name("mpich").unwrap();
        let mpich_hash = spliced.node(mpich).dag_hash.as_deref().unwrap();
        assert_eq!(mpich_hash, h2);

        // Provenance points at the original unspliced root.
        let build_spec = spliced.root_node().build_spec.as_deref().unwrap();
        assert_eq!(build_spec.dag_hash().unwrap(), h1);
        assert!(spliced.is_concrete());
    }

    #[test]
    fn splice_requires_a_match() {
        let ctx = Context::default();
        let target = testing::concretize("mpileaks@=2.3^mpich@=3.2");
        let unrelated = testing::concretize("zlib@=1.3");
        assert!(matches!(
            target.splice(&unrelated, true, &ctx),
            Err(SpecError::SpliceError { .. })
        ));
    }

    #[test]
    fn splice_replaces_the_version() {
        let ctx = Context::default();
        let target = testing::concretize("mpileaks@=2.3^mpich@=3.2");
        let replacement = testing::concretize("mpich@=4.0");
        let spliced = target.splice(&replacement, false, &ctx).unwrap();
        let mpich = spliced.find_by_name("mpich").unwrap();
        assert_eq!(spliced.node(mpich).versions.to_string(), "=4.0");
    }

    #[test]
    fn splice_detaches_ancestor_build_edges() {
        let ctx = Context::default();
        let target = testing::concretize("mpileaks@=2.3%gcc@=12.3^mpich@=3.2");
        let replacement = testing::concretize("mpich@=4.0");
        let spliced = target.splice(&replacement, true, &ctx).unwrap();
        // The direct build dependency on gcc is gone from the root.
        assert!(spliced.find_by_name("gcc").is_none());
        assert!(spliced.find_by_name("mpich").is_some());
    }
}
