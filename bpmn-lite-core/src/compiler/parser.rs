//! Parse BPMN 2.0 XML into [`ProcessDraft`]s (§4.2, §6).
//!
//! Accepts both prefixed (`bpmn:startEvent`) and default-namespace
//! (`startEvent`) forms, matching the teacher's parser. Camunda extension
//! hooks consumed: `camunda:property` (`is_main`), `camunda:inputOutput` /
//! `inputParameter` / `outputParameter` (with `camunda:list` / `camunda:map`;
//! `camunda:script` is parsed but ignored, per §6), `camunda:connector` /
//! `connectorId`, `camunda:formField` (`type`, `label`, `property`,
//! `constraint`), `camunda:in` / `camunda:out` (`source`, `target`),
//! `camunda:calledElementBinding="deployment"`.

use super::ir::ProcessDraft;
use crate::types::{ConnectorDescriptor, Edge, FormField, Vertex, VertexKind};
use anyhow::{anyhow, Result};
use quick_xml::events::{attributes::Attribute, BytesStart, Event};
use quick_xml::reader::Reader;
use serde_json::Value as Json;
use std::collections::BTreeMap;

const CAMUNDA_BINDING_ATTR: &str = "calledElementBinding";

/// Parse a full BPMN document and return every top-level `<bpmn:process>`
/// as a draft (usually one; more than one in a collaboration diagram).
pub fn parse_bpmn(xml: &str) -> Result<Vec<ProcessDraft>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut top_level: Vec<ProcessDraft> = Vec::new();
    let mut stack: Vec<ScopeFrame> = Vec::new();
    let mut current: Option<VertexCtx> = None;
    let mut flow_ctx: Option<FlowCtx> = None;
    let mut param_ctx: Vec<ParamCtx> = Vec::new();

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| anyhow!("XML parse error: {e}"))?;
        match event {
            Event::Start(ref e) => {
                handle_open(e, &mut stack, &mut current, &mut flow_ctx, &mut param_ctx)?;
            }
            Event::Empty(ref e) => {
                handle_open(e, &mut stack, &mut current, &mut flow_ctx, &mut param_ctx)?;
                // Self-closing elements close immediately.
                let local = local_name(e.name().as_ref());
                handle_close(
                    &local,
                    &mut stack,
                    &mut top_level,
                    &mut current,
                    &mut flow_ctx,
                    &mut param_ctx,
                )?;
            }
            Event::End(ref e) => {
                let local = local_name(e.name().as_ref());
                handle_close(
                    &local,
                    &mut stack,
                    &mut top_level,
                    &mut current,
                    &mut flow_ctx,
                    &mut param_ctx,
                )?;
            }
            Event::Text(ref e) => {
                let text = e.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(fc) = flow_ctx.as_mut() {
                    if fc.in_condition {
                        fc.condition = Some(text.clone());
                    }
                } else if let Some(v) = current.as_mut() {
                    if v.in_documentation {
                        v.documentation = text.clone();
                    }
                    if v.in_connector_id {
                        v.connector.connector_id = text.clone();
                    }
                }
                if let Some(pc) = param_ctx.last_mut() {
                    if let Some(key) = pc.map_key.take() {
                        pc.map.insert(key, text);
                    } else if pc.mode == ParamMode::List {
                        pc.list.push(text);
                    } else {
                        pc.scalar = Some(text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(anyhow!("unclosed element(s) in BPMN document"));
    }

    Ok(top_level)
}

/// Parse a document and select the single model that should be treated as
/// the entry point: the only process, or the one flagged `is_main`.
pub fn parse_main_process(xml: &str) -> Result<ProcessDraft> {
    let mut drafts = parse_bpmn(xml)?;
    if drafts.is_empty() {
        return Err(anyhow!("no <bpmn:process> found"));
    }
    if drafts.len() == 1 {
        return Ok(drafts.remove(0));
    }
    let main_idx = drafts
        .iter()
        .position(|d| d.is_main_in_collaboration)
        .ok_or_else(|| {
            anyhow!("collaboration with {} processes has no is_main flag", drafts.len())
        })?;
    Ok(drafts.remove(main_idx))
}

// ─── Parser state ──────────────────────────────────────────────

struct ScopeFrame {
    draft: ProcessDraft,
    /// Raw sequence flows local to this scope, resolved once the scope closes.
    flows: Vec<RawFlow>,
}

struct RawFlow {
    id: String,
    source: String,
    target: String,
    condition: Option<String>,
}

struct FlowCtx {
    in_condition: bool,
    condition: Option<String>,
}

#[derive(PartialEq, Eq)]
enum ParamMode {
    Scalar,
    List,
    Map,
}

struct ParamCtx {
    name: String,
    dest: ParamDest,
    mode: ParamMode,
    scalar: Option<String>,
    list: Vec<String>,
    map: BTreeMap<String, String>,
    map_key: Option<String>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum ParamDest {
    BusinessInput,
    BusinessOutput,
    ConnectorInput,
    ConnectorOutput,
}

struct VertexCtx {
    tag: String,
    id: String,
    name: Option<String>,
    documentation: String,
    in_documentation: bool,
    in_connector: bool,
    in_connector_id: bool,
    current_form_field: Option<(String, FormField)>,
    form_fields: BTreeMap<String, FormField>,
    business_input: BTreeMap<String, Json>,
    business_output: BTreeMap<String, Json>,
    connector: ConnectorDescriptor,
    connector_input: BTreeMap<String, Json>,
    default_edge: Option<String>,
    called_element: Option<String>,
    deployment: bool,
    in_mapping: Vec<(String, String)>,
    out_mapping: Vec<(String, String)>,
    ca_input_vars: Vec<String>,
    ca_output_vars: Vec<String>,
}

impl VertexCtx {
    fn new(tag: String, id: String) -> Self {
        Self {
            tag,
            id,
            name: None,
            documentation: String::new(),
            in_documentation: false,
            in_connector: false,
            in_connector_id: false,
            current_form_field: None,
            form_fields: BTreeMap::new(),
            business_input: BTreeMap::new(),
            business_output: BTreeMap::new(),
            connector: ConnectorDescriptor::default(),
            connector_input: BTreeMap::new(),
            default_edge: None,
            called_element: None,
            deployment: false,
            in_mapping: Vec::new(),
            out_mapping: Vec::new(),
            ca_input_vars: Vec::new(),
            ca_output_vars: Vec::new(),
        }
    }
}

// ─── Tag dispatch ───────────────────────────────────────────────

fn handle_open(
    e: &BytesStart,
    stack: &mut Vec<ScopeFrame>,
    current: &mut Option<VertexCtx>,
    flow_ctx: &mut Option<FlowCtx>,
    param_ctx: &mut Vec<ParamCtx>,
) -> Result<()> {
    let local = local_name(e.name().as_ref());

    match local.as_str() {
        "process" | "subProcess" => {
            let id = get_attr(e, "id")?;
            let name = get_attr_opt(e, "name");
            let mut draft = ProcessDraft::new(id);
            draft.name = name;
            stack.push(ScopeFrame {
                draft,
                flows: Vec::new(),
            });
        }
        "property" if current.is_none() => {
            // `camunda:property name="is_main" value="True"` at process scope.
            if let (Some(name), Some(value)) =
                (get_attr_opt(e, "name"), get_attr_opt(e, "value"))
            {
                if name == "is_main" && value.eq_ignore_ascii_case("true") {
                    if let Some(frame) = stack.last_mut() {
                        frame.draft.is_main_in_collaboration = true;
                    }
                }
            }
        }
        "startEvent" | "endEvent" | "task" | "manualTask" | "userTask" | "receiveTask"
        | "serviceTask" | "sendTask" | "businessRuleTask" | "callActivity"
        | "exclusiveGateway" | "parallelGateway" | "inclusiveGateway" => {
            let id = get_attr(e, "id")?;
            let mut ctx = VertexCtx::new(local.clone(), id);
            ctx.name = get_attr_opt(e, "name");
            if local == "exclusiveGateway" || local == "inclusiveGateway" {
                ctx.default_edge = get_attr_opt(e, "default");
            }
            if local == "callActivity" {
                ctx.called_element = get_attr_opt(e, "calledElement");
                ctx.deployment = get_attr_opt(e, CAMUNDA_BINDING_ATTR)
                    .map(|v| v == "deployment")
                    .unwrap_or(false);
            }
            *current = Some(ctx);
        }
        "documentation" => {
            if let Some(v) = current.as_mut() {
                v.in_documentation = true;
            }
        }
        "conditionExpression" => {
            *flow_ctx = Some(FlowCtx {
                in_condition: true,
                condition: None,
            });
        }
        "sequenceFlow" => {
            let id = get_attr(e, "id")?;
            let source = get_attr(e, "sourceRef")?;
            let target = get_attr(e, "targetRef")?;
            if let Some(frame) = stack.last_mut() {
                frame.flows.push(RawFlow {
                    id,
                    source,
                    target,
                    condition: None,
                });
            }
        }
        "connector" => {
            if let Some(v) = current.as_mut() {
                v.in_connector = true;
            }
        }
        "connectorId" => {
            if let Some(v) = current.as_mut() {
                v.in_connector_id = true;
            }
        }
        "inputParameter" | "outputParameter" => {
            let name = get_attr(e, "name")?;
            if let Some(v) = current.as_ref() {
                let dest = match (local.as_str(), v.in_connector) {
                    ("inputParameter", true) => ParamDest::ConnectorInput,
                    ("inputParameter", false) => ParamDest::BusinessInput,
                    ("outputParameter", true) => ParamDest::ConnectorOutput,
                    _ => ParamDest::BusinessOutput,
                };
                param_ctx.push(ParamCtx {
                    name,
                    dest,
                    mode: ParamMode::Scalar,
                    scalar: None,
                    list: Vec::new(),
                    map: BTreeMap::new(),
                    map_key: None,
                });
            }
        }
        "list" => {
            if let Some(pc) = param_ctx.last_mut() {
                pc.mode = ParamMode::List;
            }
        }
        "map" => {
            if let Some(pc) = param_ctx.last_mut() {
                pc.mode = ParamMode::Map;
            }
        }
        "entry" => {
            if let Some(pc) = param_ctx.last_mut() {
                if let Some(key) = get_attr_opt(e, "key") {
                    pc.map_key = Some(key);
                }
            }
        }
        "script" => {
            // camunda:script — explicitly not supported (§6).
        }
        "formField" => {
            if let Some(v) = current.as_mut() {
                let id = get_attr(e, "id")?;
                let kind = get_attr_opt(e, "type").unwrap_or_default();
                let label = get_attr_opt(e, "label").unwrap_or_default();
                v.current_form_field = Some((
                    id,
                    FormField {
                        kind,
                        label,
                        validation: BTreeMap::new(),
                        properties: BTreeMap::new(),
                    },
                ));
            }
        }
        "constraint" => {
            if let Some(v) = current.as_mut() {
                if let Some((_, field)) = v.current_form_field.as_mut() {
                    if let (Some(name), Some(config)) =
                        (get_attr_opt(e, "name"), get_attr_opt(e, "config"))
                    {
                        field.validation.insert(name, config);
                    }
                }
            }
        }
        "in" => {
            if let Some(v) = current.as_mut() {
                if let (Some(source), Some(target)) =
                    (get_attr_opt(e, "source"), get_attr_opt(e, "target"))
                {
                    v.in_mapping.push((source, target));
                }
            }
        }
        "out" => {
            if let Some(v) = current.as_mut() {
                if let (Some(source), Some(target)) =
                    (get_attr_opt(e, "source"), get_attr_opt(e, "target"))
                {
                    v.out_mapping.push((source, target));
                }
            }
        }
        _ => {}
    }

    // `camunda:property` inside a form field's own extensionElements.
    if local == "property" {
        if let Some(v) = current.as_mut() {
            if let Some((_, field)) = v.current_form_field.as_mut() {
                if let (Some(id), Some(value)) = (get_attr_opt(e, "id"), get_attr_opt(e, "value"))
                {
                    field.properties.insert(id, value);
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_close(
    local: &str,
    stack: &mut Vec<ScopeFrame>,
    top_level: &mut Vec<ProcessDraft>,
    current: &mut Option<VertexCtx>,
    flow_ctx: &mut Option<FlowCtx>,
    param_ctx: &mut Vec<ParamCtx>,
) -> Result<()> {
    match local {
        "documentation" => {
            if let Some(v) = current.as_mut() {
                v.in_documentation = false;
            }
        }
        "conditionExpression" => {
            if let Some(fc) = flow_ctx.take() {
                if let Some(frame) = stack.last_mut() {
                    if let Some(last) = frame.flows.last_mut() {
                        last.condition = fc.condition;
                    }
                }
            }
        }
        "connector" => {
            if let Some(v) = current.as_mut() {
                v.in_connector = false;
            }
        }
        "connectorId" => {
            if let Some(v) = current.as_mut() {
                v.in_connector_id = false;
            }
        }
        "inputParameter" | "outputParameter" => {
            if let Some(pc) = param_ctx.pop() {
                apply_param(current, pc);
            }
        }
        "formField" => {
            if let Some(v) = current.as_mut() {
                if let Some((id, field)) = v.current_form_field.take() {
                    v.form_fields.insert(id, field);
                }
            }
        }
        "startEvent" | "endEvent" | "task" | "manualTask" | "userTask" | "receiveTask"
        | "serviceTask" | "sendTask" | "businessRuleTask" | "callActivity"
        | "exclusiveGateway" | "parallelGateway" | "inclusiveGateway" => {
            if let Some(v) = current.take() {
                finish_vertex(stack, v)?;
            }
        }
        "process" | "subProcess" => {
            let frame = stack
                .pop()
                .ok_or_else(|| anyhow!("unbalanced </{local}>"))?;
            let draft = resolve_flows(frame)?;
            if let Some(parent) = stack.last_mut() {
                parent.draft.sub_processes.insert(draft.process_id.clone(), draft);
            } else {
                top_level.push(draft);
            }
        }
        _ => {}
    }
    Ok(())
}

fn apply_param(current: &mut Option<VertexCtx>, pc: ParamCtx) {
    let value: Json = match pc.mode {
        ParamMode::List => Json::Array(pc.list.into_iter().map(Json::String).collect()),
        ParamMode::Map => Json::Object(
            pc.map
                .into_iter()
                .map(|(k, v)| (k, Json::String(v)))
                .collect(),
        ),
        ParamMode::Scalar => Json::String(pc.scalar.unwrap_or_default()),
    };
    let Some(v) = current.as_mut() else { return };
    let is_call_activity = v.tag == "callActivity";
    match pc.dest {
        ParamDest::BusinessInput => {
            if is_call_activity {
                v.ca_input_vars.push(pc.name.clone());
            }
            v.business_input.insert(pc.name, value);
        }
        ParamDest::BusinessOutput => {
            if is_call_activity {
                v.ca_output_vars.push(pc.name.clone());
            }
            v.business_output.insert(pc.name, value);
        }
        ParamDest::ConnectorInput => {
            v.connector_input.insert(pc.name, value);
        }
        ParamDest::ConnectorOutput => {}
    }
}

fn finish_vertex(stack: &mut [ScopeFrame], v: VertexCtx) -> Result<()> {
    let frame = stack
        .last_mut()
        .ok_or_else(|| anyhow!("vertex '{}' outside any process scope", v.id))?;

    let kind = match v.tag.as_str() {
        "startEvent" => VertexKind::StartEvent,
        "endEvent" => VertexKind::EndEvent,
        "task" => VertexKind::Task,
        "manualTask" => VertexKind::ManualTask,
        "userTask" => VertexKind::UserTask {
            form_fields: v.form_fields,
            documentation: v.documentation,
        },
        "receiveTask" => VertexKind::ReceiveTask {
            input_variables: string_map(v.business_input),
            output_variables: v.business_output.into_keys().collect(),
            documentation: v.documentation,
        },
        "serviceTask" | "sendTask" | "businessRuleTask" => {
            let mut connector = v.connector;
            if let Some(Json::String(url)) = v.connector_input.get("url") {
                connector.url = Some(url.clone());
            }
            if let Some(Json::String(method)) = v.connector_input.get("method") {
                connector.method = Some(method.clone());
            }
            if let Some(Json::Object(params)) = v.connector_input.get("url_parameter") {
                for (k, val) in params {
                    if let Json::String(s) = val {
                        connector.url_params.insert(k.clone(), s.clone());
                    }
                }
            }
            let input_variables = string_map(v.business_input);
            let output_variables = string_map(v.business_output);
            match v.tag.as_str() {
                "sendTask" => VertexKind::SendTask {
                    input_variables,
                    output_variables,
                    connector,
                },
                "businessRuleTask" => VertexKind::BusinessRule {
                    input_variables,
                    output_variables,
                    connector,
                    decision_ref: None,
                },
                _ => VertexKind::ServiceTask {
                    input_variables,
                    output_variables,
                    connector,
                },
            }
        }
        "callActivity" => VertexKind::CallActivity {
            called_element: v.called_element.unwrap_or_default(),
            deployment: v.deployment,
            in_mapping: v.in_mapping,
            out_mapping: v.out_mapping,
            input_variables: v.ca_input_vars,
            output_variables: v.ca_output_vars,
        },
        "exclusiveGateway" => VertexKind::ExclusiveGateway {
            default_edge: v.default_edge,
        },
        "parallelGateway" => VertexKind::ParallelGateway { incoming_count: 0 },
        "inclusiveGateway" => VertexKind::InclusiveGateway {
            default_edge: v.default_edge,
        },
        other => return Err(anyhow!("unsupported element kind '{other}'")),
    };

    let is_start = matches!(kind, VertexKind::StartEvent);
    let vertex = Vertex {
        id: v.id.clone(),
        name: v.name,
        kind,
    };
    let idx = frame.draft.graph.add_node(vertex);
    frame.draft.elements.insert(v.id, idx);
    if is_start {
        frame.draft.start_events.push(idx);
    }
    Ok(())
}

fn string_map(map: BTreeMap<String, Json>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(k, v)| {
            let s = match v {
                Json::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect()
}

fn resolve_flows(mut frame: ScopeFrame) -> Result<ProcessDraft> {
    for flow in frame.flows.drain(..) {
        let from = *frame.draft.elements.get(&flow.source).ok_or_else(|| {
            anyhow!(
                "sequenceFlow '{}' references unknown sourceRef '{}'",
                flow.id,
                flow.source
            )
        })?;
        let to = *frame.draft.elements.get(&flow.target).ok_or_else(|| {
            anyhow!(
                "sequenceFlow '{}' references unknown targetRef '{}'",
                flow.id,
                flow.target
            )
        })?;
        frame.draft.graph.add_edge(
            from,
            to,
            Edge {
                id: flow.id,
                condition: flow.condition,
            },
        );
    }

    // Fill in parallel-gateway join counters from the assembled edges (I3).
    for idx in frame.draft.graph.node_indices().collect::<Vec<_>>() {
        let incoming = frame
            .draft
            .graph
            .edges_directed(idx, petgraph::Direction::Incoming)
            .count() as u32;
        if let VertexKind::ParallelGateway { incoming_count } = &mut frame.draft.graph[idx].kind {
            *incoming_count = incoming;
        }
    }

    Ok(frame.draft)
}

// ─── XML helpers ────────────────────────────────────────────────

fn local_name(qname: &[u8]) -> String {
    let s = std::str::from_utf8(qname).unwrap_or_default();
    match s.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => s.to_string(),
    }
}

fn get_attr(e: &BytesStart, name: &str) -> Result<String> {
    get_attr_opt(e, name).ok_or_else(|| anyhow!("missing required attribute '{name}'"))
}

fn get_attr_opt(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a: Attribute| {
        let key = local_name(a.key.as_ref());
        if key == name {
            a.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}
