// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gridflow contributors

//! Pipeline graph
//!
//! Nodes live in a declaration-ordered arena; port connections induce the
//! node-level dependency edges. The topological order is cached and
//! invalidated whenever a connection is added.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};

use crate::errors::GridflowError;
use crate::pipeline::{Node, ParamMap, PortDirection, PortRef};

/// A directed port-to-port connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub from: PortRef,
    pub to: PortRef,
}

/// A collection of nodes plus the graph induced by their connections
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    connections: Vec<Connection>,
    graph: DiGraph<usize, ()>,
    topo_cache: Option<Vec<usize>>,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            connections: Vec::new(),
            graph: DiGraph::new(),
            topo_cache: None,
        }
    }

    /// Create a pipeline from nodes, in declaration order
    pub fn with_nodes(
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Result<Self, GridflowError> {
        let mut pipeline = Self::new(name);
        for node in nodes {
            pipeline.add_node(node)?;
        }
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a node; names must be unique
    pub fn add_node(&mut self, node: Node) -> Result<(), GridflowError> {
        if self.index.contains_key(node.name()) {
            return Err(GridflowError::InvalidPipeline {
                reason: format!("duplicate node name '{}'", node.name()),
                help: None,
            });
        }
        let idx = self.nodes.len();
        let graph_idx = self.graph.add_node(idx);
        debug_assert_eq!(graph_idx.index(), idx);
        self.index.insert(node.name().to_string(), idx);
        self.nodes.push(node);
        self.topo_cache = None;
        Ok(())
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Declaration index of a node
    pub fn index_of(&self, name: &str) -> Result<usize, GridflowError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GridflowError::UnknownNode {
                node: name.to_string(),
            })
    }

    pub fn node(&self, name: &str) -> Result<&Node, GridflowError> {
        Ok(&self.nodes[self.index_of(name)?])
    }

    /// Connect an output port to an input port
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<(), GridflowError> {
        if from.direction != PortDirection::Output || to.direction != PortDirection::Input {
            return Err(GridflowError::PortTypeError {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!("{} port cannot feed an {} port", from.direction, to.direction),
            });
        }

        // Ports must belong to nodes of this pipeline
        let producer = self.index_of(&from.node)?;
        let consumer = self.index_of(&to.node)?;
        self.nodes[producer].output(&from.key)?;
        self.nodes[consumer].input(&to.key)?;

        if let Some(existing) = self.source_of(&to.node, &to.key) {
            return Err(GridflowError::PortAlreadyBound {
                node: to.node.clone(),
                port: to.key.clone(),
                source_port: existing.to_string(),
            });
        }

        let (a, b) = (NodeIndex::new(producer), NodeIndex::new(consumer));
        if !self.graph.contains_edge(a, b) {
            self.graph.add_edge(a, b, ());
        }
        self.connections.push(Connection { from, to });
        self.topo_cache = None;
        Ok(())
    }

    /// Connect using dotted `node.key` names
    pub fn connect_keys(&mut self, from: &str, to: &str) -> Result<(), GridflowError> {
        let (from_node, from_key) = split_port(from)?;
        let (to_node, to_key) = split_port(to)?;
        let from = self.node(from_node)?.output(from_key)?;
        let to = self.node(to_node)?.input(to_key)?;
        self.connect(from, to)
    }

    /// The output port feeding an input port, if connected
    pub fn source_of(&self, node: &str, in_key: &str) -> Option<&PortRef> {
        self.connections
            .iter()
            .find(|c| c.to.node == node && c.to.key == in_key)
            .map(|c| &c.from)
    }

    /// Validate the graph structure and cache the topological order
    pub fn build_graph(&mut self) -> Result<(), GridflowError> {
        let order = self.compute_order()?;
        self.topo_cache = Some(order);
        Ok(())
    }

    /// Full validation: graph structure plus every input bound to a value
    pub fn build(&mut self) -> Result<(), GridflowError> {
        self.build_graph()?;

        for node in &self.nodes {
            for key in node.in_path_keys() {
                if self.source_of(node.name(), key).is_none() && node.in_path_value(key).is_none() {
                    return Err(GridflowError::UnboundInput {
                        node: node.name().to_string(),
                        port: key.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Node indices in stable topological order (declaration order breaks ties)
    pub fn topological_order(&self) -> Result<Vec<usize>, GridflowError> {
        match &self.topo_cache {
            Some(order) => Ok(order.clone()),
            None => self.compute_order(),
        }
    }

    /// Node names in topological order
    pub fn topological_order_names(&self) -> Result<Vec<String>, GridflowError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|idx| self.nodes[idx].name().to_string())
            .collect())
    }

    fn compute_order(&self) -> Result<Vec<usize>, GridflowError> {
        let n = self.nodes.len();
        let mut indegree: Vec<usize> = (0..n)
            .map(|i| {
                self.graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for next in self.graph.neighbors_directed(NodeIndex::new(idx), Direction::Outgoing) {
                let d = &mut indegree[next.index()];
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        if order.len() < n {
            return Err(GridflowError::CyclicGraph {
                cycle: self.find_cycle(),
            });
        }

        Ok(order)
    }

    /// Name the members of one cycle, closing back on the first member
    fn find_cycle(&self) -> Vec<String> {
        let component = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .min_by_key(|scc| scc.iter().map(|n| n.index()).min());

        let Some(component) = component else {
            return Vec::new();
        };

        let members: HashSet<usize> = component.iter().map(|n| n.index()).collect();
        let start = members.iter().copied().min().unwrap_or_default();

        // Shortest path from start back to itself inside the component
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;
        'search: while let Some(current) = queue.pop_front() {
            let mut nexts: Vec<usize> = self
                .graph
                .neighbors_directed(NodeIndex::new(current), Direction::Outgoing)
                .map(|n| n.index())
                .filter(|n| members.contains(n))
                .collect();
            nexts.sort_unstable();
            for next in nexts {
                if next == start {
                    closing = Some(current);
                    break 'search;
                }
                if next != start && !parent.contains_key(&next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }

        let mut path = vec![start];
        let mut cursor = closing.unwrap_or(start);
        let mut tail = Vec::new();
        while cursor != start {
            tail.push(cursor);
            cursor = parent.get(&cursor).copied().unwrap_or(start);
        }
        tail.reverse();
        path.extend(tail);
        path.push(start);

        path.into_iter()
            .map(|idx| self.nodes[idx].name().to_string())
            .collect()
    }

    /// Direct upstream nodes, in declaration order
    pub fn predecessors(&self, name: &str) -> Result<Vec<&Node>, GridflowError> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct downstream nodes, in declaration order
    pub fn successors(&self, name: &str) -> Result<Vec<&Node>, GridflowError> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Result<Vec<&Node>, GridflowError> {
        let idx = self.index_of(name)?;
        let mut found: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(idx), direction)
            .map(|n| n.index())
            .collect();
        found.sort_unstable();
        found.dedup();
        Ok(found.into_iter().map(|i| &self.nodes[i]).collect())
    }

    /// All transitive upstream nodes, in topological order
    pub fn ancestors(&self, name: &str) -> Result<Vec<&Node>, GridflowError> {
        let idx = self.index_of(name)?;
        let mut seen = HashSet::new();
        let mut stack = vec![NodeIndex::new(idx)];
        while let Some(current) = stack.pop() {
            for prev in self.graph.neighbors_directed(current, Direction::Incoming) {
                if seen.insert(prev.index()) {
                    stack.push(prev);
                }
            }
        }

        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|i| seen.contains(i))
            .map(|i| &self.nodes[i])
            .collect())
    }

    /// Check if node `a` depends (directly or transitively) on node `b`
    pub fn depends_on(&self, a: &str, b: &str) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&a), Some(&b)) => petgraph::algo::has_path_connecting(
                &self.graph,
                NodeIndex::new(b),
                NodeIndex::new(a),
                None,
            ),
            _ => false,
        }
    }

    /// Apply one configuration to every node
    ///
    /// Nodes absent from `values` fall back to their declared defaults.
    pub fn configure(
        &mut self,
        values: &BTreeMap<String, ParamMap>,
        overlays: &BTreeMap<String, ParamMap>,
    ) -> Result<(), GridflowError> {
        for (node, params) in values.iter().chain(overlays.iter()) {
            if !self.index.contains_key(node) {
                let key = params.keys().next().map(String::as_str).unwrap_or("*");
                return Err(GridflowError::GridExpansion {
                    dimension: format!("{}.{}", node, key),
                    reason: format!("pipeline '{}' has no node '{}'", self.name, node),
                });
            }
        }

        for node in &mut self.nodes {
            let params = values.get(node.name()).cloned().unwrap_or_default();
            let overlay = overlays.get(node.name()).cloned().unwrap_or_default();
            node.configure(params, overlay)?;
        }
        Ok(())
    }

    /// Text listing of the execution order
    pub fn to_text(&self) -> Result<String, GridflowError> {
        let mut out = String::new();
        for (i, idx) in self.topological_order()?.into_iter().enumerate() {
            let node = &self.nodes[idx];
            out.push_str(&format!("{}. {}", i + 1, node.name()));

            let deps: Vec<&str> = self.predecessors(node.name())?.iter().map(|n| n.name()).collect();
            if !deps.is_empty() {
                out.push_str(&format!(" [depends: {}]", deps.join(", ")));
            }
            out.push('\n');
        }
        Ok(out)
    }

    /// DOT diagram with port names on the edges
    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph \"{}\" {{\n", self.name);
        out.push_str("    rankdir=LR;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for node in &self.nodes {
            out.push_str(&format!("    \"{}\";\n", node.name()));
        }
        for conn in &self.connections {
            out.push_str(&format!(
                "    \"{}\" -> \"{}\" [label=\"{} -> {}\"];\n",
                conn.from.node, conn.to.node, conn.from.key, conn.to.key
            ));
        }

        out.push_str("}\n");
        out
    }

    /// Mermaid diagram
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph LR\n");
        for node in &self.nodes {
            out.push_str(&format!("    {}[{}]\n", node.name(), node.name()));
        }
        for conn in &self.connections {
            out.push_str(&format!(
                "    {} -->|{}| {}\n",
                conn.from.node, conn.to.key, conn.to.node
            ));
        }
        out
    }
}

/// Split `node.key` at the first dot
pub(crate) fn split_port(dotted: &str) -> Result<(&str, &str), GridflowError> {
    dotted
        .split_once('.')
        .filter(|(n, k)| !n.is_empty() && !k.is_empty())
        .ok_or_else(|| GridflowError::InvalidPipeline {
            reason: format!("'{}' is not of the form <node>.<key>", dotted),
            help: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InPaths, NodeSpec};
    use serde_json::json;

    fn node(name: &str, inputs: &[&str]) -> Node {
        let mut spec = NodeSpec::new(name, format!("run-{}", name));
        spec.in_paths = InPaths::Keys(inputs.iter().map(|s| s.to_string()).collect());
        spec.out_paths.insert("out".into(), format!("{}.json", name));
        Node::new(spec).unwrap()
    }

    fn chain() -> Pipeline {
        let mut p = Pipeline::with_nodes(
            "chain",
            vec![node("a", &["src"]), node("b", &["x"]), node("c", &["x", "y"])],
        )
        .unwrap();
        p.connect_keys("a.out", "b.x").unwrap();
        p.connect_keys("b.out", "c.x").unwrap();
        p.connect_keys("a.out", "c.y").unwrap();
        p
    }

    #[test]
    fn test_linear_order() {
        let mut p = chain();
        p.build_graph().unwrap();
        assert_eq!(p.topological_order_names().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let mut p = Pipeline::with_nodes(
            "ties",
            vec![node("z", &[]), node("y", &["i"]), node("x", &["i"])],
        )
        .unwrap();
        p.connect_keys("z.out", "x.i").unwrap();
        p.connect_keys("z.out", "y.i").unwrap();
        assert_eq!(p.topological_order_names().unwrap(), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_cycle_detection_names_cycle() {
        let mut p = Pipeline::with_nodes("loop", vec![node("a", &["i"]), node("b", &["i"])]).unwrap();
        p.connect_keys("a.out", "b.i").unwrap();
        p.connect_keys("b.out", "a.i").unwrap();

        match p.build_graph() {
            Err(GridflowError::CyclicGraph { cycle }) => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut p = Pipeline::with_nodes("self", vec![node("a", &["i"])]).unwrap();
        p.connect_keys("a.out", "a.i").unwrap();
        match p.build_graph() {
            Err(GridflowError::CyclicGraph { cycle }) => assert_eq!(cycle, vec!["a", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_input_accepts_single_source() {
        let mut p = chain();
        let err = p.connect_keys("a.out", "b.x").unwrap_err();
        assert!(matches!(err, GridflowError::PortAlreadyBound { .. }));
    }

    #[test]
    fn test_connect_requires_output_to_input() {
        let mut p = chain();
        let from = p.node("a").unwrap().input("src").unwrap();
        let to = p.node("c").unwrap().output("out").unwrap();
        assert!(matches!(p.connect(from, to), Err(GridflowError::PortTypeError { .. })));
    }

    #[test]
    fn test_unbound_root_input() {
        let mut p = chain();
        match p.build() {
            Err(GridflowError::UnboundInput { node, port }) => {
                assert_eq!(node, "a");
                assert_eq!(port, "src");
            }
            other => panic!("expected unbound input, got {:?}", other),
        }

        let mut values = BTreeMap::new();
        values.insert("a".to_string(), ParamMap::from([("src".to_string(), json!("data.json"))]));
        p.configure(&values, &BTreeMap::new()).unwrap();
        p.build().unwrap();
    }

    #[test]
    fn test_configure_rejects_unknown_node() {
        let mut p = chain();
        let mut values = BTreeMap::new();
        values.insert("ghost".to_string(), ParamMap::from([("k".to_string(), json!(1))]));
        assert!(matches!(
            p.configure(&values, &BTreeMap::new()),
            Err(GridflowError::GridExpansion { .. })
        ));
    }

    #[test]
    fn test_ancestors_and_depends_on() {
        let p = chain();
        let names: Vec<&str> = p.ancestors("c").unwrap().iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(p.depends_on("c", "a"));
        assert!(!p.depends_on("a", "c"));
    }

    #[test]
    fn test_text_rendering() {
        let p = chain();
        insta::assert_snapshot!(p.to_text().unwrap().trim_end(), @r"
        1. a
        2. b [depends: a]
        3. c [depends: a, b]
        ");
    }

    #[test]
    fn test_mermaid_output() {
        let p = chain();
        let mermaid = p.to_mermaid();
        assert!(mermaid.contains("graph LR"));
        assert!(mermaid.contains("a -->|x| b"));
    }
}
