//! `satisfies`, `intersects` and `constrain` over whole specs.
//!
//! `satisfies` asks whether every concrete spec reachable from `self`
//! also satisfies `other`; `intersects` whether the two admit a common
//! concrete spec; `constrain` computes the intersection in place,
//! reporting which axis was responsible when it comes up empty.

use fxhash::{FxHashMap, FxHashSet};

use super::traverse::TraverseOptions;
use super::{DepFlags, Edge, EdgeId, NodeId, Spec, SpecError, SpecNode};
use crate::version::VersionList;

impl Spec {
    /// Does every concrete spec satisfying `self` also satisfy `other`?
    pub fn satisfies(&self, other: &Spec) -> bool {
        if other.is_concrete() {
            // Concrete specs are identified by their hash.
            return match (&self.root_node().dag_hash, &other.root_node().dag_hash) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            };
        }
        let mut visited = FxHashSet::default();
        self.satisfies_node(self.root, other, other.root, &mut visited)
    }

    /// Is there a concrete spec satisfying both?
    pub fn intersects(&self, other: &Spec) -> bool {
        if self.is_concrete() && other.is_concrete() {
            return self.root_node().dag_hash == other.root_node().dag_hash;
        }
        // A concrete spec is a single point: it intersects whatever it
        // satisfies.
        if self.is_concrete() {
            return self.satisfies(other);
        }
        if other.is_concrete() {
            return other.satisfies(self);
        }
        if !node_axes_intersect(self.root_node(), other.root_node()) {
            return false;
        }
        // Same-named packages anywhere in the two closures must agree.
        let mine = self.reachable_nodes();
        let theirs = other.reachable_nodes();
        for &a in &mine {
            let node_a = self.node(a);
            let Some(name) = node_a.name.as_deref() else { continue };
            for &b in &theirs {
                let node_b = other.node(b);
                if node_b.name.as_deref() == Some(name) && !node_axes_intersect(node_a, node_b) {
                    return false;
                }
            }
        }
        // Virtual-provider matches: a dependency requested through a
        // virtual must agree with the node providing that virtual, in
        // both directions.
        virtual_providers_intersect(self, other) && virtual_providers_intersect(other, self)
    }

    /// Intersects `other` into `self` in place. Returns whether `self`
    /// changed, or the axis that failed.
    pub fn constrain(&mut self, other: &Spec) -> Result<bool, SpecError> {
        let mut map = FxHashMap::default();
        self.constrain_node(self.root, other, other.root, &mut map)
    }

    fn satisfies_node(
        &self,
        mine: NodeId,
        other: &Spec,
        theirs: NodeId,
        visited: &mut FxHashSet<(NodeId, NodeId)>,
    ) -> bool {
        if !visited.insert((mine, theirs)) {
            return true;
        }
        if !self.node_axes_satisfy(mine, other.node(theirs)) {
            return false;
        }
        // Propagated variants reach every descendant that declares a
        // variant of the same name.
        for required in other.node(theirs).variants.propagated() {
            for item in self.traverse_from(mine, TraverseOptions::default()) {
                if item.node == mine {
                    continue;
                }
                let node = self.node(item.node);
                if let Some(declared) = node.variants.get(required.name()) {
                    if !declared.value_satisfies(required) {
                        return false;
                    }
                }
            }
        }
        // Every dependency constraint in `other` must be discharged by
        // some node in our closure.
        for eid in other.node(theirs).out_edges.iter() {
            let Some(oedge) = other.edges[*eid].as_ref() else { continue };
            if !self.edge_constraint_satisfied(mine, other, oedge, visited) {
                return false;
            }
        }
        true
    }

    fn edge_constraint_satisfied(
        &self,
        mine: NodeId,
        other: &Spec,
        oedge: &Edge,
        visited: &mut FxHashSet<(NodeId, NodeId)>,
    ) -> bool {
        let required_child = other.node(oedge.child);
        let closure = self.traverse_from(mine, TraverseOptions::default());
        for item in closure {
            if item.node == mine {
                continue;
            }
            let candidate = self.node(item.node);
            let name_matches = match (&candidate.name, &required_child.name) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            };
            let provides_virtuals = oedge
                .virtuals
                .iter()
                .all(|v| self.node_provides(item.node, v));
            if !name_matches && !(!oedge.virtuals.is_empty() && provides_virtuals) {
                continue;
            }
            if !oedge.virtuals.is_empty() && !provides_virtuals {
                continue;
            }
            // Some incoming edge of the candidate must be at least as
            // strong as the requirement.
            let edge_ok = candidate.in_edges.iter().any(|my_eid| {
                let Some(my_edge) = self.edges[*my_eid].as_ref() else {
                    return false;
                };
                my_edge.depflag.contains(oedge.depflag)
                    && oedge.virtuals.iter().all(|v| my_edge.virtuals.contains(v))
                    && (!oedge.direct || my_edge.direct)
                    && when_contained(my_edge, oedge)
            });
            if edge_ok && self.satisfies_node(item.node, other, oedge.child, visited) {
                return true;
            }
        }
        false
    }

    fn node_provides(&self, node: NodeId, virtual_name: &str) -> bool {
        self.nodes[node].in_edges.iter().any(|eid| {
            self.edges[*eid]
                .as_ref()
                .map(|e| e.virtuals.iter().any(|v| v == virtual_name))
                .unwrap_or(false)
        })
    }

    fn node_axes_satisfy(&self, mine: NodeId, required: &SpecNode) -> bool {
        let node = self.node(mine);
        match (&node.name, &required.name) {
            (_, None) => {}
            (None, Some(_)) => return false,
            (Some(a), Some(b)) => {
                if a != b {
                    return false;
                }
            }
        }
        match (&node.namespace, &required.namespace) {
            (_, None) => {}
            (None, Some(_)) => return false,
            (Some(a), Some(b)) => {
                if a != b {
                    return false;
                }
            }
        }
        if let Some(prefix) = &required.abstract_hash {
            let known = node.dag_hash.as_deref().or(node.abstract_hash.as_deref());
            match known {
                Some(hash) => {
                    if !hash.starts_with(prefix.as_str()) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if !required.versions.is_empty() {
            if node.versions.is_empty() {
                return false;
            }
            if !node.versions.satisfies(&required.versions) {
                return false;
            }
        }
        if !node.variants.satisfies_with(&required.variants, !node.concrete) {
            return false;
        }
        if !node.flags.satisfies(&required.flags) {
            return false;
        }
        node.arch.satisfies(&required.arch)
    }

    fn constrain_node(
        &mut self,
        mine: NodeId,
        other: &Spec,
        theirs: NodeId,
        map: &mut FxHashMap<NodeId, NodeId>,
    ) -> Result<bool, SpecError> {
        if map.contains_key(&theirs) {
            return Ok(false);
        }
        map.insert(theirs, mine);
        let mut changed = self.constrain_axes(mine, other.node(theirs))?;
        for eid in other.node(theirs).out_edges.clone() {
            let Some(oedge) = other.edges[eid].as_ref() else { continue };
            changed |= self.constrain_edge(mine, other, oedge, map)?;
        }
        Ok(changed)
    }

    fn constrain_edge(
        &mut self,
        mine: NodeId,
        other: &Spec,
        oedge: &Edge,
        map: &mut FxHashMap<NodeId, NodeId>,
    ) -> Result<bool, SpecError> {
        // A conditional edge only constrains once the parent is known
        // to satisfy its condition; while the condition is still open
        // the edge is carried along verbatim.
        let applies = match &oedge.when {
            None => true,
            Some(when) => self.node_when_satisfied(mine, when),
        };
        let child_name = other.node(oedge.child).name.clone();

        let candidate = self.nodes[mine].out_edges.iter().copied().find(|my_eid| {
            let Some(my_edge) = self.edges[*my_eid].as_ref() else {
                return false;
            };
            let my_child = &self.nodes[my_edge.child];
            let name_match = match (&my_child.name, &child_name) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            let virtual_match = !oedge.virtuals.is_empty()
                && oedge.virtuals.iter().any(|v| my_edge.virtuals.contains(v));
            name_match || virtual_match
        });

        match candidate {
            Some(my_eid) if applies => {
                let mut changed = self.merge_edge_attributes(my_eid, oedge);
                let my_child = self.edge(my_eid).child;
                changed |= self.constrain_node(my_child, other, oedge.child, map)?;
                Ok(changed)
            }
            Some(_) => Ok(false),
            None => {
                // No such dependency yet: adopt the constraint's
                // subtree wholesale.
                let child = self.graft(other, oedge.child, Some(DepFlags::ALL), map);
                self.add_edge(
                    mine,
                    child,
                    oedge.depflag,
                    oedge.virtuals.clone(),
                    oedge.direct,
                    oedge.when.clone(),
                )?;
                Ok(true)
            }
        }
    }

    fn merge_edge_attributes(&mut self, my_eid: EdgeId, oedge: &Edge) -> bool {
        let my_edge = self.edges[my_eid].as_mut().expect("edge was detached");
        let mut changed = false;
        let merged_flags = my_edge.depflag.union(oedge.depflag);
        if merged_flags != my_edge.depflag {
            my_edge.depflag = merged_flags;
            changed = true;
        }
        for v in &oedge.virtuals {
            if !my_edge.virtuals.contains(v) {
                my_edge.virtuals.push(v.clone());
                changed = true;
            }
        }
        my_edge.virtuals.sort();
        if oedge.direct && !my_edge.direct {
            my_edge.direct = true;
            changed = true;
        }
        changed
    }

    /// Evaluates an edge condition against one of our nodes.
    pub(crate) fn node_when_satisfied(&self, node: NodeId, when: &Spec) -> bool {
        let mut visited = FxHashSet::default();
        self.satisfies_node(node, when, when.root, &mut visited)
    }

    fn constrain_axes(&mut self, mine: NodeId, required: &SpecNode) -> Result<bool, SpecError> {
        let package = self.nodes[mine].name_or_empty().to_owned();
        let node = &mut self.nodes[mine];
        let mut changed = false;

        match (&node.name, &required.name) {
            (None, Some(name)) => {
                node.name = Some(name.clone());
                changed = true;
            }
            (Some(a), Some(b)) if a != b => {
                return Err(SpecError::UnsatisfiableName { left: a.clone(), right: b.clone() });
            }
            _ => {}
        }
        match (&node.namespace, &required.namespace) {
            (None, Some(ns)) => {
                node.namespace = Some(ns.clone());
                changed = true;
            }
            (Some(a), Some(b)) if a != b => {
                return Err(SpecError::UnsatisfiableNamespace {
                    left: a.clone(),
                    right: b.clone(),
                });
            }
            _ => {}
        }
        match (&node.abstract_hash, &required.abstract_hash) {
            (None, Some(prefix)) => {
                node.abstract_hash = Some(prefix.clone());
                changed = true;
            }
            (Some(mine_hash), Some(theirs)) => {
                if theirs.starts_with(mine_hash.as_str()) {
                    if theirs.len() > mine_hash.len() {
                        node.abstract_hash = Some(theirs.clone());
                        changed = true;
                    }
                } else if !mine_hash.starts_with(theirs.as_str()) {
                    return Err(SpecError::InvalidHash(theirs.clone()));
                }
            }
            _ => {}
        }
        if !required.versions.is_empty() {
            if node.versions.is_empty() {
                node.versions = required.versions.clone();
                changed = true;
            } else {
                let common: VersionList = node.versions.intersection(&required.versions);
                if common.is_empty() {
                    return Err(SpecError::UnsatisfiableVersion {
                        package,
                        left: node.versions.to_string(),
                        right: required.versions.to_string(),
                    });
                }
                if common != node.versions {
                    node.versions = common;
                    changed = true;
                }
            }
        }
        changed |= node
            .variants
            .constrain(&required.variants)
            .map_err(|conflict| SpecError::UnsatisfiableVariant { package: package.clone(), conflict })?;
        changed |= node.flags.constrain(&required.flags);
        if !required.arch.is_empty() {
            match node.arch.constrain(&required.arch) {
                Some(arch_changed) => changed |= arch_changed,
                None => {
                    return Err(SpecError::UnsatisfiableArchitecture {
                        package,
                        left: node.arch.to_string(),
                        right: required.arch.to_string(),
                    });
                }
            }
        }
        if node.external.is_none() && required.external.is_some() {
            node.external = required.external.clone();
            changed = true;
        }
        // Concrete nodes are immutable outside of splicing; a change
        // here would invalidate the cached hash.
        debug_assert!(
            !(node.concrete && changed),
            "constrain mutated concrete node `{package}`"
        );
        Ok(changed)
    }
}

fn virtual_providers_intersect(provider_side: &Spec, requirer_side: &Spec) -> bool {
    for b in requirer_side.reachable_nodes() {
        for eid in requirer_side.node(b).out_edges.iter() {
            let Some(oedge) = requirer_side.edges[*eid].as_ref() else { continue };
            for virtual_name in &oedge.virtuals {
                if let Some(provider) = provider_side.find_provider(virtual_name) {
                    if !node_axes_intersect(
                        provider_side.node(provider),
                        requirer_side.node(oedge.child),
                    ) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn when_contained(my_edge: &Edge, other_edge: &Edge) -> bool {
    match (&my_edge.when, &other_edge.when) {
        // An unconditional requirement contains everything; our
        // unconditional edge is contained only by an unconditional one.
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(mine), Some(theirs)) => mine.satisfies(theirs),
    }
}

fn node_axes_intersect(a: &SpecNode, b: &SpecNode) -> bool {
    if let (Some(na), Some(nb)) = (&a.name, &b.name) {
        if na != nb {
            return false;
        }
    }
    if let (Some(na), Some(nb)) = (&a.namespace, &b.namespace) {
        if na != nb {
            return false;
        }
    }
    if let (Some(ha), Some(hb)) = (&a.abstract_hash, &b.abstract_hash) {
        if !ha.starts_with(hb.as_str()) && !hb.starts_with(ha.as_str()) {
            return false;
        }
    }
    if !a.versions.is_empty() && !b.versions.is_empty() && !a.versions.intersects(&b.versions) {
        return false;
    }
    if !a.variants.intersects(&b.variants) || !b.variants.intersects(&a.variants) {
        return false;
    }
    a.arch.intersects(&b.arch)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn spec(text: &str) -> Spec {
        text.parse().unwrap_or_else(|e| panic!("bad test spec `{text}`: {e}"))
    }

    #[test]
    fn variant_constrain_scenario() {
        // S2: hdf5+mpi+shared constrained by hdf5 foo=bar.
        let mut hdf5 = spec("hdf5+mpi+shared");
        let changed = hdf5.constrain(&spec("hdf5 foo=bar")).unwrap();
        assert!(changed);
        assert!(hdf5.satisfies(&spec("hdf5+mpi+shared foo=bar")));

        let conflict = hdf5.constrain(&spec("hdf5~mpi"));
        assert_matches!(conflict, Err(SpecError::UnsatisfiableVariant { .. }));
    }

    #[test]
    fn version_range_constrain_scenario() {
        // S3: libelf@0:2.5 %gcc@2:4.6 with libelf@2.1:3 %gcc@4.5:4.7.
        let mut libelf = spec("libelf@0:2.5%gcc@2:4.6");
        libelf.constrain(&spec("libelf@2.1:3%gcc@4.5:4.7")).unwrap();
        let expected = spec("libelf@2.1:2.5%gcc@4.5:4.6");
        assert_eq!(libelf, expected);
    }

    #[test]
    fn unsatisfiable_version_reports_both_sides() {
        let mut libelf = spec("libelf@0:1");
        let err = libelf.constrain(&spec("libelf@2:")).unwrap_err();
        assert_matches!(err, SpecError::UnsatisfiableVersion { package, .. } if package == "libelf");
    }

    #[test]
    fn name_mismatch_fails() {
        let mut a = spec("libelf");
        assert_matches!(
            a.constrain(&spec("mpich")),
            Err(SpecError::UnsatisfiableName { .. })
        );
        assert!(!spec("libelf").intersects(&spec("mpich")));
    }

    #[test]
    fn anonymous_constraints_apply_to_any_name(){
        assert!(spec("zlib@1.2").satisfies(&spec("@1.0:")));
        assert!(spec("zlib@1.2").intersects(&spec("+shared")) );
        let mut z = spec("zlib@1.2");
        z.constrain(&spec("+shared")).unwrap();
        assert!(z.satisfies(&spec("zlib@1.2+shared")));
    }

    #[test]
    fn dependency_satisfaction_is_transitive() {
        let parent = spec("mpileaks^callpath@1.0^mpich@3.2");
        assert!(parent.satisfies(&spec("mpileaks^mpich@3:")));
        assert!(!parent.satisfies(&spec("mpileaks^mpich@4:")));
        assert!(parent.satisfies(&spec("^callpath")));
    }

    #[test]
    fn virtual_dependency_matching() {
        let concrete_ish = spec("mpileaks^[virtuals=mpi]mpich@3.2");
        assert!(concrete_ish.satisfies(&spec("mpileaks^[virtuals=mpi]mpich")));
        // The virtual must be provided by the matching edge.
        assert!(!spec("mpileaks^mpich@3.2").satisfies(&spec("mpileaks^[virtuals=mpi]mpich")));
    }

    #[test]
    fn constrain_adds_missing_dependencies() {
        let mut mpileaks = spec("mpileaks");
        let changed = mpileaks.constrain(&spec("mpileaks^zlib@1.2")).unwrap();
        assert!(changed);
        assert!(mpileaks.find_by_name("zlib").is_some());
        assert!(mpileaks.satisfies(&spec("mpileaks^zlib@1.2")));
    }

    #[test]
    fn constrain_merges_dependency_constraints() {
        let mut a = spec("mpileaks^mpich@3:");
        a.constrain(&spec("mpileaks^mpich@:3.4")).unwrap();
        assert!(a.satisfies(&spec("mpileaks^mpich@3:3.4")));

        let mut conflicting = spec("mpileaks^mpich@3:");
        assert_matches!(
            conflicting.constrain(&spec("mpileaks^mpich@:2")),
            Err(SpecError::UnsatisfiableVersion { .. })
        );
    }

    #[test]
    fn satisfies_implies_intersects() {
        let pairs = [
            ("hdf5@1.10+mpi", "hdf5@1.8:1.12"),
            ("mpileaks^mpich@3.2", "mpileaks^mpich"),
            ("libelf cflags=-O2", "libelf"),
        ];
        for (a, b) in pairs {
            let a = spec(a);
            let b = spec(b);
            if a.satisfies(&b) {
                assert!(a.intersects(&b), "satisfies implies intersects");
                assert!(b.intersects(&a), "intersects is symmetric");
            }
        }
    }

    #[test]
    fn propagated_variant_must_not_be_contradicted() {
        // The dependency declares the variant with a different value.
        let parent = spec("dray+cuda^ascent~cuda");
        assert!(!parent.satisfies(&spec("dray++cuda")));

        let agreeing = spec("dray+cuda^ascent+cuda");
        // Abstract parent lacks the propagate marker itself.
        assert!(!agreeing.satisfies(&spec("dray++cuda")));
        let propagating = spec("dray++cuda^ascent+cuda");
        assert!(propagating.satisfies(&spec("dray++cuda")));
        // Propagation reaches dependencies declaring the variant.
        assert!(!spec("dray++cuda^ascent~cuda").satisfies(&spec("dray++cuda")));
    }
}
