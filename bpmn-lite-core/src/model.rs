//! The in-memory BPMN process graph (§3, §4.2).

use crate::types::{Edge, Vertex, VertexKind};
use petgraph::graph::{DiGraph, EdgeReference, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::sync::Arc;

pub type Graph = DiGraph<Vertex, Edge>;

/// A fully parsed and verified BPMN process, ready to be instantiated.
pub struct ProcessModel {
    pub process_id: String,
    pub name: Option<String>,
    pub is_main_in_collaboration: bool,
    pub graph: Graph,
    pub elements: HashMap<String, NodeIndex>,
    pub start_events: Vec<NodeIndex>,
    /// Nested sub-process definitions, keyed by process id (§4.2, §4.6).
    pub sub_processes: HashMap<String, Arc<ProcessModel>>,
    /// Original BPMN XML source, returned verbatim by `GET /model/{name}`.
    pub source_xml: String,
}

impl ProcessModel {
    pub fn vertex(&self, id: &str) -> Option<&Vertex> {
        self.elements.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
        self.elements.get(id).copied()
    }

    /// Outgoing sequence flows from the vertex with the given id.
    pub fn successors<'a>(&'a self, id: &str) -> Vec<EdgeReference<'a, Edge>> {
        match self.node_index(id) {
            Some(idx) => self
                .graph
                .edges_directed(idx, petgraph::Direction::Outgoing)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Incoming sequence flows to the vertex with the given id.
    pub fn predecessors<'a>(&'a self, id: &str) -> Vec<EdgeReference<'a, Edge>> {
        match self.node_index(id) {
            Some(idx) => self
                .graph
                .edges_directed(idx, petgraph::Direction::Incoming)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn target_id(&self, edge: &EdgeReference<'_, Edge>) -> &str {
        &self.graph[edge.target()].id
    }

    /// Resolve a `callActivity`'s `calledElement`: first among this
    /// model's nested sub-processes, per (I4).
    pub fn resolve_sub_process(&self, called_element: &str) -> Option<Arc<ProcessModel>> {
        self.sub_processes.get(called_element).cloned()
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.predecessors(id).len()
    }
}

impl std::fmt::Debug for ProcessModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessModel")
            .field("process_id", &self.process_id)
            .field("name", &self.name)
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// Helper matching the teacher's `find_node_by_id`/`find_start`.
pub fn find_node_by_id(graph: &Graph, element_id: &str) -> Option<NodeIndex> {
    graph.node_indices().find(|&idx| graph[idx].id == element_id)
}

pub fn is_gateway_with_single_outgoing_required(kind: &VertexKind) -> bool {
    matches!(kind, VertexKind::ExclusiveGateway { .. })
}
