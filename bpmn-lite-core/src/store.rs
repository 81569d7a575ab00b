//! Persistence trait for process instances and their event journals (§4.7,
//! §6). The engine and registry operate exclusively through this trait,
//! keeping the in-memory and Postgres backends interchangeable.

use crate::events::JournalEntry;
use crate::types::InstanceRecord;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>>;

    /// All instances, newest first — backs both the startup recovery sweep
    /// (§4.7) and `GET /search` (§4.8).
    async fn list_instances(&self) -> Result<Vec<InstanceRecord>>;

    /// Append one journal entry and return its sequence number.
    async fn append_event(&self, instance_id: Uuid, event: &crate::events::RuntimeEvent) -> Result<u64>;

    /// Full replay log for an instance, in sequence order.
    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<JournalEntry>>;
}
