use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// Durable audit trail for a process instance (§3, §4.7).
///
/// Six kinds, matching `event_kind` in the journal entry shape exactly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceCreated {
        instance_id: Uuid,
        model_path: String,
    },
    Entered {
        vertex_id: String,
    },
    Completed {
        vertex_id: String,
    },
    MessageReceived {
        message: Message,
    },
    VariablesUpdated {
        variables_snapshot: Json,
    },
    Terminated {
        state: ProcessState,
    },
}

/// One row of the append-only journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub instance_id: Uuid,
    pub seq: u64,
    pub timestamp: Timestamp,
    pub event: RuntimeEvent,
}
