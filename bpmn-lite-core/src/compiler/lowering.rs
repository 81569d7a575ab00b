//! Turn a parsed [`ProcessDraft`] tree into an immutable [`ProcessModel`]
//! tree, wiring nested sub-processes behind `Arc` for cheap sharing across
//! instances (§4.2, §4.6).

use super::ir::ProcessDraft;
use crate::model::ProcessModel;
use std::collections::HashMap;
use std::sync::Arc;

/// Lower one draft (and everything nested under it) into a model, stamping
/// `source_xml` onto every level so `GET /model/{name}` can return the
/// original document regardless of which sub-process is looked up.
pub fn lower(draft: ProcessDraft, source_xml: &str) -> ProcessModel {
    let sub_processes = draft
        .sub_processes
        .into_iter()
        .map(|(id, child)| (id, Arc::new(lower(child, source_xml))))
        .collect::<HashMap<_, _>>();

    ProcessModel {
        process_id: draft.process_id,
        name: draft.name,
        is_main_in_collaboration: draft.is_main_in_collaboration,
        graph: draft.graph,
        elements: draft.elements,
        start_events: draft.start_events,
        sub_processes,
        source_xml: source_xml.to_string(),
    }
}
