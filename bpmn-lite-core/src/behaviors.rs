//! Per-element-kind execution logic (§4.3): one match arm per `VertexKind`,
//! composition over the inheritance hierarchy the source used (§9).

use crate::connector::ConnectorRunner;
use crate::error::EngineError;
use crate::expr;
use crate::model::ProcessModel;
use crate::registry::Registry;
use crate::scheduler;
use crate::types::{ConnectorDescriptor, Message, ProcessState, Vertex, VertexKind};
use crate::SystemConfig;
use serde_json::Value as Json;
use std::collections::HashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Result of stepping one vertex once.
pub enum Outcome {
    /// Advance along these chosen edge ids (by-id, in the order chosen).
    Immediate(Vec<String>),
    /// Blocks on an inbox message; re-evaluate only via `deliver_message`.
    Waiting,
    /// This arrival is absorbed (a parallel/inclusive join that hasn't
    /// reached its expected count yet).
    Done,
}

/// Everything a vertex's `run` needs besides the vertex itself. Held by
/// value across one scheduler step; `variables`/`join_counters` borrow the
/// instance's locked `RuntimeState` for the duration of the step.
pub struct StepEnv<'a> {
    pub model: &'a ProcessModel,
    pub variables: &'a mut Json,
    pub join_counters: &'a mut HashMap<String, u32>,
    pub instance_id: Uuid,
    pub connector: &'a dyn ConnectorRunner,
    pub config: &'a SystemConfig,
    pub registry: &'a Registry,
    pub cancel: &'a mut watch::Receiver<bool>,
}

/// Evaluate `vertex.kind.run()` per the behavior table in §4.3.
pub async fn run(vertex: &Vertex, env: &mut StepEnv<'_>) -> Result<Outcome, EngineError> {
    match &vertex.kind {
        VertexKind::StartEvent | VertexKind::Task | VertexKind::ManualTask => {
            Ok(Outcome::Immediate(all_outgoing(env.model, &vertex.id)))
        }
        VertexKind::EndEvent => Ok(Outcome::Immediate(Vec::new())),
        VertexKind::UserTask { .. } | VertexKind::ReceiveTask { .. } => Ok(Outcome::Waiting),
        VertexKind::ServiceTask {
            input_variables,
            output_variables,
            connector,
        }
        | VertexKind::SendTask {
            input_variables,
            output_variables,
            connector,
        }
        | VertexKind::BusinessRule {
            input_variables,
            output_variables,
            connector,
            ..
        } => {
            run_service_like(
                vertex,
                input_variables,
                output_variables,
                connector,
                env,
            )
            .await
        }
        VertexKind::CallActivity { .. } => call_activity(vertex, env).await,
        VertexKind::ExclusiveGateway { default_edge } => {
            let edges = env.model.successors(&vertex.id);
            let chosen = exclusive_route(&vertex.id, default_edge, &edges, env.variables)?;
            Ok(Outcome::Immediate(vec![chosen]))
        }
        VertexKind::ParallelGateway { incoming_count } => {
            Ok(join_and_fork(env.model, &vertex.id, *incoming_count, env.join_counters))
        }
        VertexKind::InclusiveGateway { default_edge } => {
            let capacity = env.model.incoming_count(&vertex.id).max(1) as u32;
            match join_and_fork(env.model, &vertex.id, capacity, env.join_counters) {
                Outcome::Done => Ok(Outcome::Done),
                Outcome::Immediate(_) => {
                    let edges = env.model.successors(&vertex.id);
                    let chosen = inclusive_choices(&vertex.id, default_edge, &edges, env.variables)?;
                    Ok(Outcome::Immediate(chosen))
                }
                Outcome::Waiting => unreachable!("join_and_fork never returns Waiting"),
            }
        }
    }
}

/// Apply an inbox message to a `Waiting` vertex (userTask/receiveTask),
/// per §4.3. Called only when `msg.task_id() == vertex.id`.
pub fn deliver_message(vertex: &Vertex, msg: &Message, variables: &mut Json) -> Outcome {
    match (&vertex.kind, msg) {
        (VertexKind::UserTask { form_fields, .. }, Message::UserForm { payload, .. }) => {
            if let Json::Object(fields) = payload {
                for (key, value) in fields {
                    if form_fields.contains_key(key) {
                        expr::nested_set(variables, key, value.clone());
                    }
                }
            }
            Outcome::Immediate(Vec::new()) // caller fills in outgoing edges
        }
        (VertexKind::ReceiveTask { output_variables, .. }, Message::Receive { payload, .. }) => {
            if let Json::Object(fields) = payload {
                for name in output_variables {
                    if let Some(value) = fields.get(name) {
                        expr::nested_set(variables, name, value.clone());
                    }
                }
            }
            Outcome::Immediate(Vec::new())
        }
        _ => Outcome::Waiting,
    }
}

fn all_outgoing(model: &ProcessModel, id: &str) -> Vec<String> {
    model
        .successors(id)
        .into_iter()
        .map(|e| e.weight().id.clone())
        .collect()
}

fn exclusive_route(
    vertex_id: &str,
    default_edge: &Option<String>,
    edges: &[petgraph::graph::EdgeReference<'_, crate::types::Edge>],
    variables: &Json,
) -> Result<String, EngineError> {
    for e in edges {
        let is_default = default_edge.as_deref() == Some(e.weight().id.as_str());
        if is_default {
            continue;
        }
        let matches = match &e.weight().condition {
            Some(cond) => expr::evaluate_condition(cond, variables),
            None => true,
        };
        if matches {
            return Ok(e.weight().id.clone());
        }
    }
    if let Some(def) = default_edge {
        return Ok(def.clone());
    }
    Err(EngineError::InvalidRouting {
        vertex_id: vertex_id.to_string(),
    })
}

fn inclusive_choices(
    vertex_id: &str,
    default_edge: &Option<String>,
    edges: &[petgraph::graph::EdgeReference<'_, crate::types::Edge>],
    variables: &Json,
) -> Result<Vec<String>, EngineError> {
    let mut chosen = Vec::new();
    for e in edges {
        let truthy = match &e.weight().condition {
            Some(cond) => expr::evaluate_condition(cond, variables),
            None => true,
        };
        if truthy {
            chosen.push(e.weight().id.clone());
        }
    }
    if chosen.is_empty() {
        match default_edge {
            Some(def) => chosen.push(def.clone()),
            None => {
                return Err(EngineError::InvalidRouting {
                    vertex_id: vertex_id.to_string(),
                })
            }
        }
    }
    Ok(chosen)
}

/// Shared join/fork counter logic for `parallelGateway` and
/// `inclusiveGateway`'s join side (§4.3, §9 "reset on re-entry" decision).
fn join_and_fork(
    model: &ProcessModel,
    vertex_id: &str,
    capacity: u32,
    join_counters: &mut HashMap<String, u32>,
) -> Outcome {
    let remaining = join_counters.entry(vertex_id.to_string()).or_insert(capacity);
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
        *remaining = capacity;
        Outcome::Immediate(all_outgoing(model, vertex_id))
    } else {
        Outcome::Done
    }
}

async fn run_service_like(
    vertex: &Vertex,
    input_variables: &std::collections::BTreeMap<String, String>,
    output_variables: &std::collections::BTreeMap<String, String>,
    connector: &ConnectorDescriptor,
    env: &mut StepEnv<'_>,
) -> Result<Outcome, EngineError> {
    let mut body = serde_json::Map::new();
    if let Json::Object(system_vars) = &env.config.system_vars {
        for (k, v) in system_vars {
            body.insert(k.clone(), v.clone());
        }
    }
    for (key, expression) in input_variables {
        let value = expr::evaluate_str(expression, env.variables);
        body.insert(key.clone(), Json::String(value));
    }
    body.insert(
        "id_instance".to_string(),
        Json::String(env.instance_id.to_string()),
    );

    let Some(datasource) = env.config.datasources.get(&connector.connector_id) else {
        // No resolvable datasource: succeed with no side effect (§4.3 step 3).
        return Ok(Outcome::Immediate(all_outgoing(env.model, &vertex.id)));
    };

    let path = connector.url.clone().unwrap_or_default();
    let url = format!(
        "{}{}",
        datasource.url.trim_end_matches('/'),
        if path.is_empty() || path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        }
    );
    let method = connector.method.clone().unwrap_or_else(|| "GET".to_string());

    let response = env
        .connector
        .invoke(
            &method,
            &url,
            &connector.url_params,
            &Json::Object(body),
            &Default::default(),
            env.cancel,
        )
        .await?;

    // §4.3 step 4: first evaluate the declared expression against the
    // response body, then a same-named top-level response field wins.
    for (name, expression) in output_variables {
        let evaluated = expr::evaluate(&Json::String(expression.clone()), &response);
        expr::nested_set(env.variables, name, evaluated);
        if let Some(value) = response.as_object().and_then(|m| m.get(name)) {
            expr::nested_set(env.variables, name, value.clone());
        }
    }

    Ok(Outcome::Immediate(all_outgoing(env.model, &vertex.id)))
}

/// §4.6: call a sub-process (nested or separately loaded) as a child
/// instance, wait for it to finish, then map its outputs back.
async fn call_activity(vertex: &Vertex, env: &mut StepEnv<'_>) -> Result<Outcome, EngineError> {
    let VertexKind::CallActivity {
        called_element,
        in_mapping,
        out_mapping,
        input_variables,
        output_variables,
        ..
    } = &vertex.kind
    else {
        unreachable!("call_activity invoked on a non-callActivity vertex")
    };

    let child_model = env
        .model
        .resolve_sub_process(called_element)
        .or_else(|| env.registry.find_model_by_process_id(called_element))
        .ok_or_else(|| {
            EngineError::ChildFailure(format!("calledElement '{called_element}' not found"))
        })?;

    let mut child_vars = deep_copy(env.variables);
    for (src, dst) in in_mapping {
        let value = if let Some((top, _)) = src.split_once('.') {
            let v = expr::nested_get(&child_vars, src).cloned();
            if let Json::Object(map) = &mut child_vars {
                map.remove(top);
            }
            v
        } else if let Json::Object(map) = &mut child_vars {
            map.remove(src)
        } else {
            None
        };
        if let Some(v) = value {
            expr::nested_set(&mut child_vars, dst, v);
        }
    }
    if let Json::Object(map) = &mut child_vars {
        map.retain(|k, _| input_variables.contains(k));
    }

    let child_handle = env
        .registry
        .create_child_instance(child_model, child_vars)
        .await
        .map_err(|e| EngineError::ChildFailure(e.to_string()))?;

    Box::pin(scheduler::drive(child_handle.clone())).await;

    let child_snapshot = child_handle.snapshot().await;
    if child_snapshot.state != ProcessState::Finished {
        return Err(EngineError::ChildFailure(format!(
            "child instance {} did not finish (state={:?})",
            child_handle.id, child_snapshot.state
        )));
    }

    let mut mapped = deep_copy(&child_snapshot.variables);
    for (src, dst) in out_mapping {
        let Some(value) = expr::nested_get(&mapped, src).cloned() else {
            continue;
        };
        expr::nested_set(&mut mapped, dst, value);
    }
    for name in output_variables {
        if let Some(value) = expr::nested_get(&mapped, name) {
            expr::nested_set(env.variables, name, value.clone());
        }
    }

    Ok(Outcome::Immediate(all_outgoing(env.model, &vertex.id)))
}

/// Structural deep copy preserving full depth (§9 design note): required
/// so the child cannot observe later parent mutations and vice versa.
fn deep_copy(value: &Json) -> Json {
    serde_json::from_value(serde_json::to_value(value).unwrap()).unwrap()
}
