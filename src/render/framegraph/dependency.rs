use std::fmt;

use smallvec::SmallVec;

use crate::error::FrameGraphError;

/// High bit of a node's reference count. A node carrying it is a cull root.
pub const TARGET: u32 = 0x8000_0000;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct EdgeId(u32);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// `from` has to run before `to` because `to` consumes something `from` produces.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Default, Debug, Clone)]
struct Node {
    ref_count: u32,
}

/// Arena of nodes and edges. Nodes live as long as the graph; edges are
/// rebuilt every frame through [`DependencyGraph::clear_edges`].
#[derive(Default, Debug)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::default());
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<EdgeId, FrameGraphError> {
        self.check(from)?;
        self.check(to)?;

        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge { from, to });
        log::trace!("edge {:?}: {} -> {}", id, from, to);
        Ok(id)
    }

    pub fn make_target(&mut self, node: NodeId) -> Result<(), FrameGraphError> {
        self.check(node)?;
        self.nodes[node.index()].ref_count = TARGET;
        Ok(())
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.nodes.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index())
    }

    pub fn incoming_edges(&self, node: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.to == node)
    }

    pub fn outgoing_edges(&self, node: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.from == node)
    }

    pub fn ref_count(&self, node: NodeId) -> u32 {
        self.nodes.get(node.index()).map_or(0, |n| n.ref_count)
    }

    pub fn is_target(&self, node: NodeId) -> bool {
        self.ref_count(node) >= TARGET
    }

    pub fn is_culled(&self, node: NodeId) -> bool {
        self.ref_count(node) == 0
    }

    /// Recounts every node's consumers, then walks back from the nodes nobody
    /// consumes, releasing their producers. Targets never reach zero.
    pub fn cull(&mut self) {
        for node in &mut self.nodes {
            node.ref_count &= TARGET;
        }
        for edge in &self.edges {
            self.nodes[edge.from.index()].ref_count += 1;
        }

        let mut stack: Vec<NodeId> = self
            .node_ids()
            .filter(|&id| self.nodes[id.index()].ref_count == 0)
            .collect();

        while let Some(node) = stack.pop() {
            for edge in self.edges.iter().filter(|e| e.to == node) {
                let producer = &mut self.nodes[edge.from.index()];
                producer.ref_count = producer.ref_count.saturating_sub(1);
                if producer.ref_count == 0 {
                    stack.push(edge.from);
                }
            }
        }
    }

    /// Three-colour depth-first search over the outgoing edges.
    pub fn is_acyclic(&self) -> bool {
        #[derive(Copy, Clone, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut adjacency: Vec<SmallVec<[NodeId; 4]>> = vec![SmallVec::new(); self.nodes.len()];
        for edge in &self.edges {
            adjacency[edge.from.index()].push(edge.to);
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack: Vec<(NodeId, usize)> = Vec::new();

        for root in self.node_ids() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            marks[root.index()] = Mark::InProgress;
            stack.push((root, 0));

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let next = adjacency[node.index()].get(top.1).copied();
                top.1 += 1;

                match next {
                    Some(child) => match marks[child.index()] {
                        Mark::InProgress => return false,
                        Mark::Unvisited => {
                            marks[child.index()] = Mark::InProgress;
                            stack.push((child, 0));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                    }
                }
            }
        }

        true
    }

    /// Drops every edge and zeroes the counts of non-target nodes.
    pub fn clear_edges(&mut self) {
        self.edges.clear();
        for node in &mut self.nodes {
            node.ref_count &= TARGET;
        }
    }

    fn check(&self, node: NodeId) -> Result<(), FrameGraphError> {
        if self.contains(node) {
            Ok(())
        } else {
            Err(FrameGraphError::UnknownNode(node))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> (DependencyGraph, Vec<NodeId>) {
        let mut graph = DependencyGraph::default();
        let ids: Vec<_> = (0..len).map(|_| graph.add_node()).collect();
        for pair in ids.windows(2) {
            graph.add_edge(pair[0], pair[1]).unwrap();
        }
        (graph, ids)
    }

    #[test]
    fn ids_are_dense() {
        let mut graph = DependencyGraph::default();
        assert_eq!(graph.add_node().index(), 0);
        assert_eq!(graph.add_node().index(), 1);
        assert_eq!(graph.add_node().index(), 2);
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let mut graph = DependencyGraph::default();
        let a = graph.add_node();
        let mut other = DependencyGraph::default();
        other.add_node();
        let stranger = other.add_node();

        let err = graph.add_edge(a, stranger).unwrap_err();
        assert!(matches!(err, FrameGraphError::UnknownNode(id) if id == stranger));
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn edge_queries_filter_by_endpoint() {
        let mut graph = DependencyGraph::default();
        let a = graph.add_node();
        let b = graph.add_node();
        let c = graph.add_node();
        graph.add_edge(a, b).unwrap();
        graph.add_edge(a, c).unwrap();
        graph.add_edge(b, c).unwrap();

        assert_eq!(graph.outgoing_edges(a).count(), 2);
        assert_eq!(graph.incoming_edges(c).count(), 2);
        assert_eq!(graph.incoming_edges(a).count(), 0);
        let into_c: Vec<_> = graph.incoming_edges(c).map(|e| e.from).collect();
        assert_eq!(into_c, vec![a, b]);
    }

    #[test]
    fn chain_without_target_is_culled_entirely() {
        let (mut graph, ids) = chain(3);
        graph.cull();
        assert!(ids.iter().all(|&id| graph.is_culled(id)));
    }

    #[test]
    fn target_keeps_its_producers_alive() {
        let (mut graph, ids) = chain(3);
        graph.make_target(ids[2]).unwrap();
        graph.cull();

        assert!(ids.iter().all(|&id| !graph.is_culled(id)));
        assert!(graph.is_target(ids[2]));
        assert!(!graph.is_target(ids[0]));
    }

    #[test]
    fn target_without_consumers_or_producers_survives() {
        let mut graph = DependencyGraph::default();
        let lonely = graph.add_node();
        graph.make_target(lonely).unwrap();
        graph.cull();
        assert!(!graph.is_culled(lonely));
        assert_eq!(graph.ref_count(lonely), TARGET);
    }

    #[test]
    fn target_with_consumers_stays_a_target() {
        let mut graph = DependencyGraph::default();
        let target = graph.add_node();
        let reader = graph.add_node();
        graph.make_target(target).unwrap();
        graph.add_edge(target, reader).unwrap();
        graph.cull();

        assert!(graph.is_culled(reader));
        assert!(graph.is_target(target));
        assert!(!graph.is_culled(target));
    }

    #[test]
    fn dead_branch_is_culled_next_to_live_one() {
        let mut graph = DependencyGraph::default();
        let shadow = graph.add_node();
        let lighting = graph.add_node();
        let debug = graph.add_node();
        let present = graph.add_node();
        graph.make_target(present).unwrap();
        graph.add_edge(shadow, lighting).unwrap();
        graph.add_edge(shadow, debug).unwrap();
        graph.add_edge(lighting, present).unwrap();
        graph.cull();

        assert!(graph.is_culled(debug));
        assert!(!graph.is_culled(shadow));
        assert_eq!(graph.ref_count(shadow), 1);
    }

    #[test]
    fn cull_is_idempotent() {
        let mut graph = DependencyGraph::default();
        let a = graph.add_node();
        let b = graph.add_node();
        let c = graph.add_node();
        graph.make_target(b).unwrap();
        graph.add_edge(a, b).unwrap();
        graph.add_edge(a, c).unwrap();

        graph.cull();
        let first: Vec<_> = graph.node_ids().map(|id| graph.ref_count(id)).collect();
        graph.cull();
        let second: Vec<_> = graph.node_ids().map(|id| graph.ref_count(id)).collect();

        assert_eq!(first, second);
        assert!(graph.is_culled(c));
    }

    #[test]
    fn clear_edges_keeps_targets() {
        let (mut graph, ids) = chain(2);
        graph.make_target(ids[1]).unwrap();
        graph.cull();
        graph.clear_edges();

        assert!(graph.edges().is_empty());
        assert!(graph.is_target(ids[1]));
        assert!(graph.is_culled(ids[0]));
    }

    #[test]
    fn acyclic_graphs_pass() {
        let (graph, _) = chain(4);
        assert!(graph.is_acyclic());

        let mut diamond = DependencyGraph::default();
        let top = diamond.add_node();
        let left = diamond.add_node();
        let right = diamond.add_node();
        let bottom = diamond.add_node();
        diamond.add_edge(top, left).unwrap();
        diamond.add_edge(top, right).unwrap();
        diamond.add_edge(left, bottom).unwrap();
        diamond.add_edge(right, bottom).unwrap();
        assert!(diamond.is_acyclic());
    }

    #[test]
    fn cycles_are_detected() {
        let (mut graph, ids) = chain(3);
        graph.add_edge(ids[2], ids[0]).unwrap();
        assert!(!graph.is_acyclic());

        let mut looped = DependencyGraph::default();
        let node = looped.add_node();
        let edge = looped.add_edge(node, node).unwrap();
        assert_eq!(looped.edge(edge).map(|e| (e.from, e.to)), Some((node, node)));
        assert!(!looped.is_acyclic());
    }

    #[test]
    fn edge_ids_resolve_until_edges_are_cleared() {
        let (mut graph, ids) = chain(2);
        let extra = graph.add_edge(ids[1], ids[0]).unwrap();
        assert_eq!(extra.index(), 1);
        assert_eq!(graph.edge(extra).map(|e| e.from), Some(ids[1]));

        graph.clear_edges();
        assert!(graph.edge(extra).is_none());
    }
}
