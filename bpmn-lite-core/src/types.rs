use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ─── Vertex kinds (§3) ─────────────────────────────────────────

/// A declared user-task form field (`camunda:formField`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormField {
    pub kind: String,
    pub label: String,
    pub validation: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
}

/// A connector descriptor attached to a service/send task.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub connector_id: String,
    /// HTTP method, path template and url params, keyed out of
    /// `connector_fields.input_variables` by the parser (§6).
    pub method: Option<String>,
    pub url: Option<String>,
    pub url_params: BTreeMap<String, String>,
    pub base_url: Option<String>,
}

/// Variable mapping entry for call-activity in/out mappings (§4.6).
pub type VarMapping = Vec<(String, String)>;

/// The closed set of BPMN element kinds this engine understands (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VertexKind {
    StartEvent,
    EndEvent,
    Task,
    ManualTask,
    UserTask {
        form_fields: BTreeMap<String, FormField>,
        documentation: String,
    },
    ReceiveTask {
        input_variables: BTreeMap<String, String>,
        output_variables: Vec<String>,
        documentation: String,
    },
    ServiceTask {
        input_variables: BTreeMap<String, String>,
        /// Declared name -> output expression, evaluated against the
        /// connector response (§4.3 step 4: expression first, then a
        /// same-named top-level response field wins if present).
        output_variables: BTreeMap<String, String>,
        connector: ConnectorDescriptor,
    },
    SendTask {
        input_variables: BTreeMap<String, String>,
        output_variables: BTreeMap<String, String>,
        connector: ConnectorDescriptor,
    },
    BusinessRule {
        input_variables: BTreeMap<String, String>,
        output_variables: BTreeMap<String, String>,
        connector: ConnectorDescriptor,
        decision_ref: Option<String>,
    },
    CallActivity {
        called_element: String,
        deployment: bool,
        in_mapping: VarMapping,
        out_mapping: VarMapping,
        input_variables: Vec<String>,
        output_variables: Vec<String>,
    },
    ExclusiveGateway {
        default_edge: Option<String>,
    },
    ParallelGateway {
        incoming_count: u32,
    },
    InclusiveGateway {
        default_edge: Option<String>,
    },
}

impl VertexKind {
    pub fn label(&self) -> &'static str {
        match self {
            VertexKind::StartEvent => "startEvent",
            VertexKind::EndEvent => "endEvent",
            VertexKind::Task => "task",
            VertexKind::ManualTask => "manualTask",
            VertexKind::UserTask { .. } => "userTask",
            VertexKind::ReceiveTask { .. } => "receiveTask",
            VertexKind::ServiceTask { .. } => "serviceTask",
            VertexKind::SendTask { .. } => "sendTask",
            VertexKind::BusinessRule { .. } => "businessRule",
            VertexKind::CallActivity { .. } => "callActivity",
            VertexKind::ExclusiveGateway { .. } => "exclusiveGateway",
            VertexKind::ParallelGateway { .. } => "parallelGateway",
            VertexKind::InclusiveGateway { .. } => "inclusiveGateway",
        }
    }
}

/// One vertex (BPMN element) in the process graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vertex {
    pub id: String,
    pub name: Option<String>,
    pub kind: VertexKind,
}

/// One sequence flow (edge) in the process graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub condition: Option<String>,
}

// ─── Messages (§3) ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    UserForm { task_id: String, payload: Json },
    Receive { task_id: String, payload: Json },
}

impl Message {
    pub fn task_id(&self) -> &str {
        match self {
            Message::UserForm { task_id, .. } => task_id,
            Message::Receive { task_id, .. } => task_id,
        }
    }
}

// ─── Instance state (§3) ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Waiting,
    Finished,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Finished | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Running => "running",
            ProcessState::Waiting => "waiting",
            ProcessState::Finished => "finished",
            ProcessState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Persisted row shape for a process instance (§6 `instances` table).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub model_path: String,
    pub state: ProcessState,
    pub variables: Json,
}

/// Snapshot returned to callers (`to_json()` in the distilled spec).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: Uuid,
    pub model_path: String,
    pub state: ProcessState,
    pub variables: Json,
    pub pending: Vec<String>,
}
