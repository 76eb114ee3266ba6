//! The spec dependency graph.
//!
//! A [`Spec`] owns an arena of nodes and edges; the root node is the
//! package the spec describes and edges carry dependency types,
//! provided virtuals and optional `when` conditions. Algebra operations
//! (`satisfies`, `intersects`, `constrain`, `splice`) live in the
//! sibling modules and operate on this arena representation, which
//! sidesteps the parent/child ownership cycle: an edge is an index
//! known to both endpoints, and [`Spec::detach_edge`] unlinks it from
//! both in one call.

use std::fmt;
use std::str::FromStr;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::arch::ArchSpec;
use crate::variant::{FlagMap, VariantConflict, VariantMap};
use crate::version::VersionList;

pub mod format;
pub mod hash;
pub mod parse;
pub mod satisfy;
pub mod splice;
pub mod traverse;

pub type NodeId = usize;
pub type EdgeId = usize;

/// Errors of the spec algebra.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpecError {
    #[error("`{left}` and `{right}` are different packages")]
    UnsatisfiableName { left: String, right: String },
    #[error("namespaces `{left}` and `{right}` are incompatible")]
    UnsatisfiableNamespace { left: String, right: String },
    #[error("package `{package}`: versions `{left}` and `{right}` do not intersect")]
    UnsatisfiableVersion { package: String, left: String, right: String },
    #[error("package `{package}`: {conflict}")]
    UnsatisfiableVariant { package: String, conflict: VariantConflict },
    #[error("package `{package}`: architectures `{left}` and `{right}` do not intersect")]
    UnsatisfiableArchitecture { package: String, left: String, right: String },
    #[error("package `{package}` has no dependency compatible with `{constraint}`")]
    UnsatisfiableDependency { package: String, constraint: String },
    #[error("package `{package}` depends on `{child}` twice with overlapping dependency types")]
    DuplicateDependency { package: String, child: String },
    #[error("architecture constraint appears twice on `{0}`")]
    DuplicateArchitecture(String),
    #[error("hash prefix `{0}` matches multiple known specs")]
    AmbiguousHash(String),
    #[error("no known spec matches the hash prefix `{0}`")]
    InvalidHash(String),
    #[error("spec `{0}` is deprecated")]
    SpecDeprecated(String),
    #[error("cannot splice `{other}` into `{target}`: {reason}")]
    SpliceError { target: String, other: String, reason: String },
    #[error("`{0}` is not concrete")]
    SpecNotConcrete(String),
    #[error("bad format template: {0}")]
    BadFormatTemplate(String),
}

/// The dependency-type flag set: a subset of build, link, run, test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DepFlags(u8);

impl DepFlags {
    pub const NONE: DepFlags = DepFlags(0);
    pub const BUILD: DepFlags = DepFlags(1);
    pub const LINK: DepFlags = DepFlags(2);
    pub const RUN: DepFlags = DepFlags(4);
    pub const TEST: DepFlags = DepFlags(8);
    pub const ALL: DepFlags = DepFlags(15);
    /// The default for a bare `^dep`.
    pub const DEFAULT: DepFlags = DepFlags(1 | 2);

    pub fn union(self, other: DepFlags) -> DepFlags {
        DepFlags(self.0 | other.0)
    }

    pub fn intersects(self, other: DepFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Does `self` include every flag of `other`?
    pub fn contains(self, other: DepFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        [
            (DepFlags::BUILD, "build"),
            (DepFlags::LINK, "link"),
            (DepFlags::RUN, "run"),
            (DepFlags::TEST, "test"),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
    }

    /// Parses a comma-separated flag list such as `build,link`.
    pub fn parse_list(text: &str) -> Result<DepFlags, ParseDepFlagError> {
        let mut flags = DepFlags::NONE;
        for name in text.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            flags = flags.union(name.parse()?);
        }
        Ok(flags)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown dependency type `{0}`")]
pub struct ParseDepFlagError(String);

impl FromStr for DepFlags {
    type Err = ParseDepFlagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(DepFlags::BUILD),
            "link" => Ok(DepFlags::LINK),
            "run" => Ok(DepFlags::RUN),
            "test" => Ok(DepFlags::TEST),
            "all" => Ok(DepFlags::ALL),
            other => Err(ParseDepFlagError(other.to_owned())),
        }
    }
}

impl fmt::Display for DepFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.names().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}")?;
        }
        Ok(())
    }
}

/// Description of an externally installed package.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct External {
    pub path: Option<String>,
    pub modules: Vec<String>,
}

/// A dependency edge. Both endpoints know the edge by its id.
#[derive(Debug, Clone)]
pub struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
    pub depflag: DepFlags,
    /// Virtuals provided by the child along this edge, kept sorted.
    pub virtuals: SmallVec<[String; 2]>,
    /// True for dependencies written with `%`.
    pub direct: bool,
    /// The edge only applies when the parent satisfies this spec.
    pub when: Option<Box<Spec>>,
}

impl Edge {
    fn when_eq(&self, other: &Edge) -> bool {
        match (&self.when, &other.when) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// One node of the graph: a package plus all its constrained axes.
#[derive(Debug, Clone, Default)]
pub struct SpecNode {
    pub name: Option<String>,
    pub namespace: Option<String>,
    /// Empty means unconstrained.
    pub versions: VersionList,
    pub variants: VariantMap,
    pub flags: FlagMap,
    pub arch: ArchSpec,
    /// A `/hash` prefix referring to an already-concretized spec.
    pub abstract_hash: Option<String>,
    pub external: Option<External>,
    pub concrete: bool,
    pub dag_hash: Option<String>,
    pub package_hash: Option<String>,
    /// Provenance of a spliced node: the spec this node was built as.
    pub build_spec: Option<Box<Spec>>,
    /// Annotations carried through the specfile codec: the format
    /// version the node was read from, and the legacy compiler string
    /// of pre-v5 files.
    pub original_specfile_version: Option<u64>,
    pub legacy_compiler: Option<String>,
    pub(crate) out_edges: Vec<EdgeId>,
    pub(crate) in_edges: Vec<EdgeId>,
}

impl SpecNode {
    pub fn named(name: impl Into<String>) -> Self {
        SpecNode { name: Some(name.into()), ..Default::default() }
    }

    /// The node's display name; anonymous nodes print nothing.
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// A spec: a dependency graph with a distinguished root.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub(crate) nodes: Vec<SpecNode>,
    pub(crate) edges: Vec<Option<Edge>>,
    pub(crate) root: NodeId,
}

impl Spec {
    /// A new single-node spec; `None` makes an anonymous spec.
    pub fn new(name: Option<&str>) -> Spec {
        let node = match name {
            Some(name) => SpecNode::named(name),
            None => SpecNode::default(),
        };
        Spec { nodes: vec![node], edges: Vec::new(), root: 0 }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &SpecNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut SpecNode {
        &mut self.nodes[id]
    }

    pub fn root_node(&self) -> &SpecNode {
        &self.nodes[self.root]
    }

    pub fn root_node_mut(&mut self) -> &mut SpecNode {
        let root = self.root;
        &mut self.nodes[root]
    }

    pub fn name(&self) -> Option<&str> {
        self.root_node().name.as_deref()
    }

    pub fn add_node(&mut self, node: SpecNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// The edge with the given id. Panics on a detached edge; edge ids
    /// are only valid as long as the edge is attached.
    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges[id].as_ref().expect("edge was detached")
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges[id].as_mut().expect("edge was detached")
    }

    /// Outgoing (dependency) edge ids of a node.
    pub fn dependencies(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[node].out_edges.iter().copied()
    }

    /// Incoming (dependent) edge ids of a node.
    pub fn dependents(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[node].in_edges.iter().copied()
    }

    /// Adds a dependency edge, enforcing the duplicate-dependency rule:
    /// two edges between the same pair may not have overlapping type
    /// flags unless their `when` conditions differ.
    pub fn add_edge(
        &mut self,
        parent: NodeId,
        child: NodeId,
        depflag: DepFlags,
        virtuals: SmallVec<[String; 2]>,
        direct: bool,
        when: Option<Box<Spec>>,
    ) -> Result<EdgeId, SpecError> {
        let candidate =
            Edge { parent, child, depflag, virtuals, direct, when };
        for &existing_id in &self.nodes[parent].out_edges {
            let existing = self.edge(existing_id);
            if existing.child == candidate.child
                && existing.depflag.intersects(candidate.depflag)
                && existing.when_eq(&candidate)
            {
                return Err(SpecError::DuplicateDependency {
                    package: self.nodes[parent].name_or_empty().to_owned(),
                    child: self.nodes[candidate.child].name_or_empty().to_owned(),
                });
            }
        }
        Ok(self.push_edge(candidate))
    }

    pub(crate) fn push_edge(&mut self, edge: Edge) -> EdgeId {
        let parent = edge.parent;
        let child = edge.child;
        self.edges.push(Some(edge));
        let id = self.edges.len() - 1;
        self.nodes[parent].out_edges.push(id);
        self.nodes[child].in_edges.push(id);
        id
    }

    /// Removes an edge from both endpoints in one operation.
    pub fn detach_edge(&mut self, id: EdgeId) {
        if let Some(edge) = self.edges[id].take() {
            self.nodes[edge.parent].out_edges.retain(|e| *e != id);
            self.nodes[edge.child].in_edges.retain(|e| *e != id);
        }
    }

    /// Every node fully pinned and stamped.
    pub fn is_concrete(&self) -> bool {
        self.reachable_nodes().into_iter().all(|id| self.nodes[id].concrete)
    }

    /// The stamped hash of a concrete spec.
    pub fn dag_hash(&self) -> Result<&str, SpecError> {
        self.root_node()
            .dag_hash
            .as_deref()
            .ok_or_else(|| SpecError::SpecNotConcrete(self.to_string()))
    }

    /// Node ids reachable from the root, preorder.
    pub fn reachable_nodes(&self) -> Vec<NodeId> {
        let mut seen: Vec<NodeId> = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            for eid in &self.nodes[id].out_edges {
                if let Some(edge) = &self.edges[*eid] {
                    stack.push(edge.child);
                }
            }
        }
        seen
    }

    /// Finds the first reachable node with the given package name.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.reachable_nodes()
            .into_iter()
            .find(|id| self.nodes[*id].name.as_deref() == Some(name))
    }

    /// Finds a reachable node that provides `virtual_name` along some
    /// incoming edge.
    pub fn find_provider(&self, virtual_name: &str) -> Option<NodeId> {
        self.reachable_nodes().into_iter().find(|id| {
            self.nodes[*id].in_edges.iter().any(|eid| {
                self.edges[*eid]
                    .as_ref()
                    .map(|e| e.virtuals.iter().any(|v| v == virtual_name))
                    .unwrap_or(false)
            })
        })
    }

    /// Deep-copies the subgraph of `other` rooted at `other_root` into
    /// this arena, preserving DAG sharing through the id `map`. Edges
    /// are filtered by `mask` when given.
    pub(crate) fn graft(
        &mut self,
        other: &Spec,
        other_root: NodeId,
        mask: Option<DepFlags>,
        map: &mut FxHashMap<NodeId, NodeId>,
    ) -> NodeId {
        if let Some(&done) = map.get(&other_root) {
            return done;
        }
        let mut node = other.nodes[other_root].clone();
        node.in_edges.clear();
        node.out_edges.clear();
        let new_id = self.add_node(node);
        map.insert(other_root, new_id);
        for eid in &other.nodes[other_root].out_edges {
            let Some(edge) = &other.edges[*eid] else { continue };
            if let Some(mask) = mask {
                if !edge.depflag.intersects(mask) {
                    continue;
                }
            }
            let child = self.graft(other, edge.child, mask, map);
            self.push_edge(Edge {
                parent: new_id,
                child,
                depflag: edge.depflag,
                virtuals: edge.virtuals.clone(),
                direct: edge.direct,
                when: edge.when.clone(),
            });
        }
        new_id
    }

    /// Deep copy with the requested dependency coverage.
    pub fn copy(&self, deps: CopyDeps) -> Spec {
        let mask = match deps {
            CopyDeps::All => Some(DepFlags::ALL),
            CopyDeps::None => None,
            CopyDeps::Types(mask) => Some(mask),
        };
        let mut out = Spec { nodes: Vec::new(), edges: Vec::new(), root: 0 };
        match mask {
            Some(mask) => {
                let mut map = FxHashMap::default();
                out.root = out.graft(self, self.root, Some(mask), &mut map);
            }
            None => {
                let mut node = self.root_node().clone();
                node.in_edges.clear();
                node.out_edges.clear();
                out.root = out.add_node(node);
            }
        }
        out
    }

    /// Drops unreachable nodes and detached edge slots, renumbering the
    /// arena. Used after operations that rewire the graph.
    pub(crate) fn compact(&mut self) {
        let mut out = Spec { nodes: Vec::new(), edges: Vec::new(), root: 0 };
        let mut map = FxHashMap::default();
        out.root = out.graft(self, self.root, Some(DepFlags::ALL), &mut map);
        *self = out;
    }
}

/// Dependency coverage of [`Spec::copy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDeps {
    All,
    None,
    Types(DepFlags),
}

impl PartialEq for Spec {
    fn eq(&self, other: &Spec) -> bool {
        let mut visited = FxHashMap::default();
        self.eq_nodes(self.root, other, other.root, &mut visited)
    }
}

impl Eq for Spec {}

impl Spec {
    fn eq_nodes(
        &self,
        mine: NodeId,
        other: &Spec,
        theirs: NodeId,
        visited: &mut FxHashMap<(NodeId, NodeId), bool>,
    ) -> bool {
        if let Some(&answer) = visited.get(&(mine, theirs)) {
            return answer;
        }
        // Optimistically mark equal to terminate on shared diamonds.
        visited.insert((mine, theirs), true);

        let a = &self.nodes[mine];
        let b = &other.nodes[theirs];
        if a.concrete && b.concrete {
            let answer = a.dag_hash == b.dag_hash;
            visited.insert((mine, theirs), answer);
            return answer;
        }
        let axes_equal = a.name == b.name
            && a.namespace == b.namespace
            && a.versions == b.versions
            && a.variants == b.variants
            && a.flags == b.flags
            && a.arch == b.arch
            && a.abstract_hash == b.abstract_hash
            && a.concrete == b.concrete;
        if !axes_equal {
            visited.insert((mine, theirs), false);
            return false;
        }

        let mut my_edges: Vec<&Edge> =
            a.out_edges.iter().filter_map(|e| self.edges[*e].as_ref()).collect();
        let mut their_edges: Vec<&Edge> =
            b.out_edges.iter().filter_map(|e| other.edges[*e].as_ref()).collect();
        if my_edges.len() != their_edges.len() {
            visited.insert((mine, theirs), false);
            return false;
        }
        let edge_key = |spec: &Spec, e: &Edge| {
            (
                spec.nodes[e.child].name.clone(),
                e.depflag,
                e.virtuals.clone(),
                e.direct,
            )
        };
        my_edges.sort_by_key(|e| edge_key(self, e));
        their_edges.sort_by_key(|e| edge_key(other, e));
        let answer = my_edges.iter().zip(their_edges.iter()).all(|(ea, eb)| {
            edge_key(self, ea) == edge_key(other, eb)
                && ea.when_eq(eb)
                && self.eq_nodes(ea.child, other, eb.child, visited)
        });
        visited.insert((mine, theirs), answer);
        answer
    }
}

impl FromStr for Spec {
    type Err = parse::ParseSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_spec(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn depflag_list_round_trip() {
        let flags = DepFlags::parse_list("build,link,test").unwrap();
        assert!(flags.contains(DepFlags::BUILD));
        assert!(!flags.contains(DepFlags::RUN));
        assert_eq!(flags.to_string(), "build,link,test");
    }

    #[test]
    fn duplicate_dependency_with_overlapping_types_is_rejected() {
        let mut spec = Spec::new(Some("mpileaks"));
        let child = spec.add_node(SpecNode::named("mpich"));
        spec.add_edge(0, child, DepFlags::DEFAULT, smallvec![], false, None).unwrap();
        let duplicate =
            spec.add_edge(0, child, DepFlags::LINK, smallvec![], false, None);
        assert!(matches!(duplicate, Err(SpecError::DuplicateDependency { .. })));
        // Disjoint types are compatible.
        spec.add_edge(0, child, DepFlags::TEST, smallvec![], false, None).unwrap();
    }

    #[test]
    fn detach_edge_unlinks_both_endpoints() {
        let mut spec = Spec::new(Some("root"));
        let child = spec.add_node(SpecNode::named("dep"));
        let edge = spec
            .add_edge(0, child, DepFlags::DEFAULT, smallvec![], false, None)
            .unwrap();
        spec.detach_edge(edge);
        assert!(spec.dependencies(0).next().is_none());
        assert!(spec.dependents(child).next().is_none());
        assert_eq!(spec.reachable_nodes(), vec![0]);
    }

    #[test]
    fn copy_preserves_dag_sharing() {
        // root -> a -> c, root -> b -> c: c must stay shared.
        let mut spec = Spec::new(Some("root"));
        let a = spec.add_node(SpecNode::named("a"));
        let b = spec.add_node(SpecNode::named("b"));
        let c = spec.add_node(SpecNode::named("c"));
        spec.add_edge(0, a, DepFlags::DEFAULT, smallvec![], false, None).unwrap();
        spec.add_edge(0, b, DepFlags::DEFAULT, smallvec![], false, None).unwrap();
        spec.add_edge(a, c, DepFlags::LINK, smallvec![], false, None).unwrap();
        spec.add_edge(b, c, DepFlags::LINK, smallvec![], false, None).unwrap();

        let copy = spec.copy(CopyDeps::All);
        assert_eq!(copy.reachable_nodes().len(), 4);
        let c_new = copy.find_by_name("c").unwrap();
        assert_eq!(copy.dependents(c_new).count(), 2);
        assert_eq!(copy, spec);

        let shallow = spec.copy(CopyDeps::None);
        assert_eq!(shallow.reachable_nodes().len(), 1);
    }

    #[test]
    fn provider_lookup_uses_edge_virtuals() {
        let mut spec = Spec::new(Some("mpileaks"));
        let mpich = spec.add_node(SpecNode::named("mpich"));
        spec.add_edge(0, mpich, DepFlags::DEFAULT, smallvec!["mpi".to_owned()], false, None)
            .unwrap();
        assert_eq!(spec.find_provider("mpi"), Some(mpich));
        assert_eq!(spec.find_provider("blas"), None);
    }
}
