//! Intermediate representation emitted by the parser, before incoming-edge
//! counts are computed and nested sub-processes are linked (§4.2).

use crate::types::{Edge, Vertex};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

pub type DraftGraph = DiGraph<Vertex, Edge>;

/// One parsed `<bpmn:process>` or `<bpmn:subProcess>` scope.
pub struct ProcessDraft {
    pub process_id: String,
    pub name: Option<String>,
    pub is_main_in_collaboration: bool,
    pub graph: DraftGraph,
    pub elements: HashMap<String, NodeIndex>,
    pub start_events: Vec<NodeIndex>,
    /// Nested `<bpmn:subProcess>` drafts, keyed by their own process id.
    pub sub_processes: HashMap<String, ProcessDraft>,
}

impl ProcessDraft {
    pub fn new(process_id: String) -> Self {
        Self {
            process_id,
            name: None,
            is_main_in_collaboration: false,
            graph: DraftGraph::new(),
            elements: HashMap::new(),
            start_events: Vec::new(),
            sub_processes: HashMap::new(),
        }
    }
}

pub fn find_node_by_id(graph: &DraftGraph, element_id: &str) -> Option<NodeIndex> {
    graph.node_indices().find(|&idx| graph[idx].id == element_id)
}
