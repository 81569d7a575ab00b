//! Structural invariants checked on a parsed [`ProcessDraft`] before it is
//! lowered into a [`crate::model::ProcessModel`] (§4.2):
//!
//! - I1: every process/sub-process scope has at least one start event.
//! - I2: every process/sub-process scope has at least one end event.
//! - I3: every vertex is reachable from some start event in its own scope.
//! - I4: a `callActivity` with `deployment = false` must name a
//!   `calledElement` present among this model's nested sub-processes
//!   (a `deployment = true` binding is resolved against the registry at
//!   runtime instead, so it is exempt here).
//!
//! Gateway edge shape is also checked: an `exclusiveGateway`/
//! `inclusiveGateway` with more than one outgoing edge may declare at most
//! one default (condition-less) edge.

use super::ir::ProcessDraft;
use crate::types::VertexKind;
use anyhow::{anyhow, Result};
use petgraph::visit::{Dfs, EdgeRef};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
    pub element_id: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "[{id}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Verify `draft` and every sub-process nested under it, collecting every
/// violation found rather than stopping at the first.
pub fn verify(draft: &ProcessDraft) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    verify_scope(draft, &mut errors);
    for child in draft.sub_processes.values() {
        errors.extend(verify(child));
    }
    errors
}

fn verify_scope(draft: &ProcessDraft, errors: &mut Vec<VerifyError>) {
    if draft.start_events.is_empty() {
        errors.push(VerifyError {
            message: format!("process '{}' has no start event", draft.process_id),
            element_id: None,
        });
    }

    let has_end = draft
        .graph
        .node_indices()
        .any(|idx| matches!(draft.graph[idx].kind, VertexKind::EndEvent));
    if !has_end {
        errors.push(VerifyError {
            message: format!("process '{}' has no end event", draft.process_id),
            element_id: None,
        });
    }

    let mut reachable = HashSet::new();
    for &start in &draft.start_events {
        let mut dfs = Dfs::new(&draft.graph, start);
        while let Some(idx) = dfs.next(&draft.graph) {
            reachable.insert(idx);
        }
    }
    for idx in draft.graph.node_indices() {
        if !reachable.contains(&idx) {
            let vertex = &draft.graph[idx];
            errors.push(VerifyError {
                message: format!("vertex '{}' is unreachable from any start event", vertex.id),
                element_id: Some(vertex.id.clone()),
            });
        }
    }

    for idx in draft.graph.node_indices() {
        let vertex = &draft.graph[idx];
        let default_edge = match &vertex.kind {
            VertexKind::ExclusiveGateway { default_edge } => Some(default_edge),
            VertexKind::InclusiveGateway { default_edge } => Some(default_edge),
            _ => None,
        };
        let Some(default_edge) = default_edge else {
            continue;
        };
        let outgoing: Vec<_> = draft
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .collect();
        if outgoing.len() > 1 {
            let without_condition = outgoing
                .iter()
                .filter(|e| e.weight().condition.is_none())
                .count();
            if without_condition > 1 && default_edge.is_none() {
                errors.push(VerifyError {
                    message: format!(
                        "gateway '{}' has {} unconditioned outgoing edges and no default",
                        vertex.id, without_condition
                    ),
                    element_id: Some(vertex.id.clone()),
                });
            }
        }

        if let VertexKind::CallActivity {
            called_element,
            deployment,
            ..
        } = &vertex.kind
        {
            if !deployment && !draft.sub_processes.contains_key(called_element) {
                errors.push(VerifyError {
                    message: format!(
                        "callActivity '{}' calledElement '{called_element}' is not a nested sub-process and deployment binding is not set",
                        vertex.id
                    ),
                    element_id: Some(vertex.id.clone()),
                });
            }
        }
    }
}

/// Verify and return a `Result`, joining every violation into one message.
pub fn verify_or_err(draft: &ProcessDraft) -> Result<()> {
    let errors = verify(draft);
    if errors.is_empty() {
        Ok(())
    } else {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        Err(anyhow!("model verification failed:\n{}", msgs.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser;

    #[test]
    fn rejects_process_with_no_start_event() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="p1">
    <bpmn:endEvent id="end"/>
  </bpmn:process>
</bpmn:definitions>"#;
        let draft = parser::parse_main_process(xml).unwrap();
        let errors = verify(&draft);
        assert!(errors.iter().any(|e| e.message.contains("no start event")));
    }

    #[test]
    fn rejects_unreachable_vertex() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="p1">
    <bpmn:startEvent id="start"/>
    <bpmn:endEvent id="end"/>
    <bpmn:task id="orphan"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;
        let draft = parser::parse_main_process(xml).unwrap();
        let errors = verify(&draft);
        assert!(errors.iter().any(|e| e.message.contains("unreachable")));
    }

    #[test]
    fn rejects_call_activity_to_unknown_sub_process() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="p1">
    <bpmn:startEvent id="start"/>
    <bpmn:callActivity id="ca1" calledElement="missing"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="ca1"/>
    <bpmn:sequenceFlow id="f2" sourceRef="ca1" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;
        let draft = parser::parse_main_process(xml).unwrap();
        let errors = verify(&draft);
        assert!(errors.iter().any(|e| e.message.contains("calledElement")));
    }

    #[test]
    fn accepts_well_formed_linear_process() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<bpmn:definitions xmlns:bpmn="http://www.omg.org/spec/BPMN/20100524/MODEL">
  <bpmn:process id="p1">
    <bpmn:startEvent id="start"/>
    <bpmn:task id="t1"/>
    <bpmn:endEvent id="end"/>
    <bpmn:sequenceFlow id="f1" sourceRef="start" targetRef="t1"/>
    <bpmn:sequenceFlow id="f2" sourceRef="t1" targetRef="end"/>
  </bpmn:process>
</bpmn:definitions>"#;
        let draft = parser::parse_main_process(xml).unwrap();
        assert!(verify_or_err(&draft).is_ok());
    }
}
