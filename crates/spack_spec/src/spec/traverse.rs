//! Graph traversal over specs.
//!
//! Traversal is parameterized by order (pre, post, topological,
//! breadth-first), coverage (each node once, or each edge once),
//! direction (dependencies or dependents) and a dependency-type mask.
//! Topological order never yields a node before any of its selected
//! predecessors.

use super::{DepFlags, EdgeId, NodeId, Spec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Pre,
    Post,
    Topo,
    Breadth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cover {
    #[default]
    Nodes,
    Edges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Children,
    Parents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraverseOptions {
    pub order: Order,
    pub cover: Cover,
    pub direction: Direction,
    pub depflag: DepFlags,
    /// Yield the starting node itself?
    pub root: bool,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        TraverseOptions {
            order: Order::Pre,
            cover: Cover::Nodes,
            direction: Direction::Children,
            depflag: DepFlags::ALL,
            root: true,
        }
    }
}

impl TraverseOptions {
    pub fn with_deptypes(depflag: DepFlags) -> Self {
        TraverseOptions { depflag, ..Default::default() }
    }
}

/// One visited element: the node, the edge it was reached through (the
/// root has none) and the depth at which it was first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraverseItem {
    pub node: NodeId,
    pub edge: Option<EdgeId>,
    pub depth: usize,
}

impl Spec {
    /// Traverses from the root with the given options.
    pub fn traverse(&self, options: TraverseOptions) -> Vec<TraverseItem> {
        self.traverse_from(self.root, options)
    }

    /// Traverses from an arbitrary start node.
    pub fn traverse_from(&self, start: NodeId, options: TraverseOptions) -> Vec<TraverseItem> {
        let mut items = match options.order {
            Order::Pre => self.walk_depth_first(start, options, false),
            Order::Post => self.walk_depth_first(start, options, true),
            Order::Breadth => self.walk_breadth_first(start, options),
            Order::Topo => self.walk_topological(start, options),
        };
        if !options.root {
            items.retain(|item| item.node != start || item.edge.is_some());
        }
        items
    }

    /// Selected neighbor edges of a node, in insertion order.
    fn selected_edges(&self, node: NodeId, options: &TraverseOptions) -> Vec<EdgeId> {
        let node = &self.nodes[node];
        let edge_list = match options.direction {
            Direction::Children => &node.out_edges,
            Direction::Parents => &node.in_edges,
        };
        edge_list
            .iter()
            .copied()
            .filter(|eid| {
                self.edges[*eid]
                    .as_ref()
                    .map(|e| e.depflag.intersects(options.depflag))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn edge_endpoint(&self, eid: EdgeId, options: &TraverseOptions) -> NodeId {
        let edge = self.edge(eid);
        match options.direction {
            Direction::Children => edge.child,
            Direction::Parents => edge.parent,
        }
    }

    fn walk_depth_first(
        &self,
        start: NodeId,
        options: TraverseOptions,
        postorder: bool,
    ) -> Vec<TraverseItem> {
        let mut items = Vec::new();
        let mut visited_nodes: Vec<NodeId> = Vec::new();
        let mut visited_edges: Vec<EdgeId> = Vec::new();
        self.dfs(start, None, 0, &options, postorder, &mut visited_nodes, &mut visited_edges, &mut items);
        items
    }

    #[allow(clippy::too_many_arguments)]
    fn dfs(
        &self,
        node: NodeId,
        via: Option<EdgeId>,
        depth: usize,
        options: &TraverseOptions,
        postorder: bool,
        visited_nodes: &mut Vec<NodeId>,
        visited_edges: &mut Vec<EdgeId>,
        items: &mut Vec<TraverseItem>,
    ) {
        let first_visit = !visited_nodes.contains(&node);
        match options.cover {
            Cover::Nodes => {
                if !first_visit {
                    return;
                }
            }
            Cover::Edges => {
                if let Some(eid) = via {
                    if visited_edges.contains(&eid) {
                        return;
                    }
                    visited_edges.push(eid);
                }
            }
        }
        if first_visit {
            visited_nodes.push(node);
        }
        let item = TraverseItem { node, edge: via, depth };
        if !postorder {
            items.push(item);
        }
        // Under edge cover a revisited node's subtree is only descended
        // the first time; its edges were already covered.
        if first_visit || options.cover == Cover::Nodes {
            for eid in self.selected_edges(node, options) {
                let next = self.edge_endpoint(eid, options);
                self.dfs(
                    next,
                    Some(eid),
                    depth + 1,
                    options,
                    postorder,
                    visited_nodes,
                    visited_edges,
                    items,
                );
            }
        }
        if postorder {
            items.push(item);
        }
    }

    fn walk_breadth_first(&self, start: NodeId, options: TraverseOptions) -> Vec<TraverseItem> {
        let mut items = Vec::new();
        let mut visited_nodes = vec![start];
        let mut visited_edges: Vec<EdgeId> = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(TraverseItem { node: start, edge: None, depth: 0 });
        while let Some(item) = queue.pop_front() {
            items.push(item);
            for eid in self.selected_edges(item.node, &options) {
                let next = self.edge_endpoint(eid, &options);
                match options.cover {
                    Cover::Nodes => {
                        if visited_nodes.contains(&next) {
                            continue;
                        }
                        visited_nodes.push(next);
                    }
                    Cover::Edges => {
                        if visited_edges.contains(&eid) {
                            continue;
                        }
                        visited_edges.push(eid);
                        if visited_nodes.contains(&next) {
                            // Edge newly covered, but do not re-expand.
                            items.push(TraverseItem {
                                node: next,
                                edge: Some(eid),
                                depth: item.depth + 1,
                            });
                            continue;
                        }
                        visited_nodes.push(next);
                    }
                }
                queue.push_back(TraverseItem { node: next, edge: Some(eid), depth: item.depth + 1 });
            }
        }
        items
    }

    /// Reverse postorder: every node appears before the nodes its
    /// selected edges lead to, i.e. after all its predecessors.
    fn walk_topological(&self, start: NodeId, options: TraverseOptions) -> Vec<TraverseItem> {
        let post = self.walk_depth_first(
            start,
            TraverseOptions { order: Order::Post, cover: Cover::Nodes, ..options },
            true,
        );
        let mut nodes: Vec<TraverseItem> = post.into_iter().rev().collect();
        match options.cover {
            Cover::Nodes => nodes,
            Cover::Edges => {
                // Emit each node's selected edges in topological order
                // of their source node; each edge exactly once.
                let mut items = Vec::new();
                for item in &nodes {
                    if item.edge.is_none() {
                        items.push(*item);
                    }
                }
                for item in nodes.drain(..) {
                    for eid in self.selected_edges(item.node, &options) {
                        items.push(TraverseItem {
                            node: self.edge_endpoint(eid, &options),
                            edge: Some(eid),
                            depth: item.depth + 1,
                        });
                    }
                }
                items
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::SpecNode;
    use smallvec::smallvec;

    /// Builds the diamond root -> (a, b) -> c with link edges.
    fn diamond() -> Spec {
        let mut spec = Spec::new(Some("root"));
        let a = spec.add_node(SpecNode::named("a"));
        let b = spec.add_node(SpecNode::named("b"));
        let c = spec.add_node(SpecNode::named("c"));
        spec.add_edge(0, a, DepFlags::LINK, smallvec![], false, None).unwrap();
        spec.add_edge(0, b, DepFlags::LINK, smallvec![], false, None).unwrap();
        spec.add_edge(a, c, DepFlags::LINK, smallvec![], false, None).unwrap();
        spec.add_edge(b, c, DepFlags::LINK, smallvec![], false, None).unwrap();
        spec
    }

    fn names(spec: &Spec, items: &[TraverseItem]) -> Vec<String> {
        items.iter().map(|i| spec.node(i.node).name_or_empty().to_owned()).collect()
    }

    #[test]
    fn preorder_covers_each_node_once() {
        let spec = diamond();
        let items = spec.traverse(TraverseOptions::default());
        assert_eq!(names(&spec, &items), ["root", "a", "c", "b"]);
    }

    #[test]
    fn edge_cover_yields_each_edge_once() {
        let spec = diamond();
        let items = spec.traverse(TraverseOptions { cover: Cover::Edges, ..Default::default() });
        // Four edges plus the root item; `c` shows up twice.
        assert_eq!(items.len(), 5);
        assert_eq!(items.iter().filter(|i| spec.node(i.node).name.as_deref() == Some("c")).count(), 2);
    }

    #[test]
    fn topological_order_respects_predecessors() {
        let spec = diamond();
        let items = spec.traverse(TraverseOptions { order: Order::Topo, ..Default::default() });
        let order = names(&spec, &items);
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(position("root"), 0);
        assert!(position("a") < position("c"));
        assert!(position("b") < position("c"));
    }

    #[test]
    fn parents_direction_walks_dependents() {
        let spec = diamond();
        let c = spec.find_by_name("c").unwrap();
        let items = spec.traverse_from(
            c,
            TraverseOptions { direction: Direction::Parents, ..Default::default() },
        );
        let order = names(&spec, &items);
        assert_eq!(order.first().map(String::as_str), Some("c"));
        assert!(order.contains(&"root".to_owned()));
    }

    #[test]
    fn depflag_mask_filters_edges() {
        let mut spec = Spec::new(Some("root"));
        let build_only = spec.add_node(SpecNode::named("cmake"));
        let linked = spec.add_node(SpecNode::named("zlib"));
        spec.add_edge(0, build_only, DepFlags::BUILD, smallvec![], false, None).unwrap();
        spec.add_edge(0, linked, DepFlags::LINK, smallvec![], false, None).unwrap();

        let items = spec.traverse(TraverseOptions::with_deptypes(DepFlags::LINK));
        assert_eq!(names(&spec, &items), ["root", "zlib"]);
    }

    #[test]
    fn breadth_first_orders_by_depth() {
        let spec = diamond();
        let items =
            spec.traverse(TraverseOptions { order: Order::Breadth, ..Default::default() });
        let depths: Vec<usize> = items.iter().map(|i| i.depth).collect();
        assert_eq!(depths, [0, 1, 1, 2]);
    }
}
