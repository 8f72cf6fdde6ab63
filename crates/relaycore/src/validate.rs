//! Graph validation.
//!
//! Turns a submitted [`Graph`] into an immutable [`ValidGraph`] or an ordered
//! list of every violation found, each naming the offending node or edge.

use crate::config::NodeConfig;
use crate::graph::{Edge, Graph, GraphId, NodeId, NodeKind, NodeSpec, RetryPolicy};
use crate::{ValidationError, ValidationErrors};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const BRANCH_TRUE: &str = "true";
pub const BRANCH_FALSE: &str = "false";

/// Validation-time view of the node types a runtime can execute.
pub trait NodeTypeCatalog {
    /// Required config keys for `node_type`, or `None` if the type is unknown.
    fn required_keys(&self, node_type: &str) -> Option<&[&'static str]>;
}

/// A node whose configuration has been parsed and checked.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub config: NodeConfig,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl Node {
    pub fn is_conditional(&self) -> bool {
        self.kind == NodeKind::Conditional
    }
}

/// Immutable, validated graph snapshot used for exactly one or more runs.
#[derive(Debug, Clone)]
pub struct ValidGraph {
    id: GraphId,
    name: String,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
    /// Edge indices gating each node. Edges into triggers never gate.
    incoming: HashMap<NodeId, Vec<usize>>,
    outgoing: HashMap<NodeId, Vec<usize>>,
    roots: Vec<NodeId>,
    order: Vec<NodeId>,
}

impl ValidGraph {
    pub fn id(&self) -> &GraphId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Nodes that may start immediately.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Node ids in a topological order.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Edges that must be satisfied before `id` may run.
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// Edges whose satisfaction depends on `id`.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn dependency_count(&self, id: &str) -> usize {
        self.incoming.get(id).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validate `graph` against the node types known to `catalog`.
pub fn validate(
    graph: &Graph,
    catalog: &dyn NodeTypeCatalog,
) -> Result<ValidGraph, ValidationErrors> {
    let mut errors = Vec::new();
    if graph.nodes.is_empty() {
        errors.push(ValidationError::EmptyGraph);
    }

    // First occurrence wins for duplicated ids.
    let mut specs: Vec<&NodeSpec> = Vec::with_capacity(graph.nodes.len());
    let mut seen: HashSet<&str> = HashSet::new();
    for spec in &graph.nodes {
        if seen.insert(spec.id.as_str()) {
            specs.push(spec);
        } else {
            errors.push(ValidationError::DuplicateNode {
                node_id: spec.id.clone(),
            });
        }
    }
    let kinds: HashMap<&str, NodeKind> = specs.iter().map(|s| (s.id.as_str(), s.kind())).collect();

    let mut accepted: Vec<Edge> = Vec::new();
    let mut pairs: HashSet<(&str, &str)> = HashSet::new();
    for edge in &graph.edges {
        if let Some(err) = check_edge(edge, &kinds, &mut pairs) {
            errors.push(err);
        } else {
            accepted.push(edge.clone());
        }
    }

    let mut nodes = Vec::with_capacity(specs.len());
    for spec in &specs {
        let kind = &kinds[spec.id.as_str()];
        let Some(required) = catalog.required_keys(kind.type_id()) else {
            errors.push(ValidationError::UnknownNodeType {
                node_id: spec.id.clone(),
                node_type: spec.node_type.clone(),
            });
            continue;
        };
        match NodeConfig::parse(&spec.id, kind, &spec.config, required) {
            Ok(config) => nodes.push(Node {
                id: spec.id.clone(),
                kind: kind.clone(),
                label: spec.label.clone(),
                config,
                timeout: spec.timeout_ms.map(Duration::from_millis),
                retry: spec.retry.clone(),
            }),
            Err(mut config_errors) => errors.append(&mut config_errors),
        }
    }

    let (dag, indices) = build_dag(&specs, &accepted);
    for component in tarjan_scc(&dag) {
        if component.len() > 1 {
            let mut members: Vec<NodeIndex> = component;
            members.sort();
            errors.push(ValidationError::Cycle {
                nodes: members.iter().map(|&i| dag[i].clone()).collect(),
            });
        }
    }

    let targets: HashSet<&str> = accepted.iter().map(|e| e.target.as_str()).collect();
    let roots: Vec<NodeId> = specs
        .iter()
        .filter(|s| !targets.contains(s.id.as_str()) || kinds[s.id.as_str()] == NodeKind::Trigger)
        .map(|s| s.id.clone())
        .collect();
    if roots.is_empty() && !specs.is_empty() {
        errors.push(ValidationError::NoRootNodes);
    }

    if !errors.is_empty() {
        tracing::debug!(graph_id = %graph.id, errors = errors.len(), "graph rejected");
        return Err(errors.into());
    }

    let order = toposort(&dag, None)
        .map(|sorted| sorted.into_iter().map(|i| dag[i].clone()).collect())
        .unwrap_or_else(|_| indices.keys().cloned().collect());

    let index: HashMap<NodeId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    let mut incoming: HashMap<NodeId, Vec<usize>> = HashMap::new();
    let mut outgoing: HashMap<NodeId, Vec<usize>> = HashMap::new();
    for (i, edge) in accepted.iter().enumerate() {
        if kinds[edge.target.as_str()] == NodeKind::Trigger {
            continue;
        }
        incoming.entry(edge.target.clone()).or_default().push(i);
        outgoing.entry(edge.source.clone()).or_default().push(i);
    }

    Ok(ValidGraph {
        id: graph.id.clone(),
        name: graph.name.clone(),
        nodes,
        index,
        edges: accepted,
        incoming,
        outgoing,
        roots,
        order,
    })
}

fn check_edge<'g>(
    edge: &'g Edge,
    kinds: &HashMap<&str, NodeKind>,
    pairs: &mut HashSet<(&'g str, &'g str)>,
) -> Option<ValidationError> {
    for endpoint in [&edge.source, &edge.target] {
        if !kinds.contains_key(endpoint.as_str()) {
            return Some(ValidationError::DanglingEdge {
                source_id: edge.source.clone(),
                target_id: edge.target.clone(),
                missing: endpoint.clone(),
            });
        }
    }

    if edge.source == edge.target {
        return Some(ValidationError::SelfLoop {
            node_id: edge.source.clone(),
        });
    }

    if !pairs.insert((edge.source.as_str(), edge.target.as_str())) {
        return Some(ValidationError::DuplicateEdge {
            source_id: edge.source.clone(),
            target_id: edge.target.clone(),
        });
    }

    let from_conditional = kinds[edge.source.as_str()] == NodeKind::Conditional;
    match (&edge.branch, from_conditional) {
        (None, true) => Some(ValidationError::MissingBranchLabel {
            source_id: edge.source.clone(),
            target_id: edge.target.clone(),
        }),
        (Some(label), false) => Some(ValidationError::UnexpectedBranchLabel {
            source_id: edge.source.clone(),
            target_id: edge.target.clone(),
            label: label.clone(),
        }),
        (Some(label), true) if label != BRANCH_TRUE && label != BRANCH_FALSE => {
            Some(ValidationError::InvalidBranchLabel {
                source_id: edge.source.clone(),
                target_id: edge.target.clone(),
                label: label.clone(),
            })
        }
        _ => None,
    }
}

fn build_dag(
    specs: &[&NodeSpec],
    edges: &[Edge],
) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
    let mut dag = DiGraph::new();
    let mut indices = HashMap::new();
    for spec in specs {
        let idx = dag.add_node(spec.id.clone());
        indices.insert(spec.id.clone(), idx);
    }
    for edge in edges {
        dag.add_edge(indices[&edge.source], indices[&edge.target], ());
    }
    (dag, indices)
}
