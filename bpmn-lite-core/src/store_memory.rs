//! In-memory [`ProcessStore`] — the default backend, used whenever the
//! `postgres` feature is not compiled in or no `DATABASE_URL` is configured.

use crate::events::{JournalEntry, RuntimeEvent};
use crate::store::ProcessStore;
use crate::types::{now_ms, InstanceRecord};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    instances: HashMap<Uuid, InstanceRecord>,
    events: HashMap<Uuid, Vec<JournalEntry>>,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                instances: HashMap::new(),
                events: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    async fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(record.id, record.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<InstanceRecord>> {
        let r = self.inner.read().await;
        Ok(r.instances.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let r = self.inner.read().await;
        Ok(r.instances.values().cloned().collect())
    }

    async fn append_event(&self, instance_id: Uuid, event: &RuntimeEvent) -> Result<u64> {
        let mut w = self.inner.write().await;
        let log = w.events.entry(instance_id).or_default();
        let seq = log.len() as u64 + 1;
        log.push(JournalEntry {
            instance_id,
            seq,
            timestamp: now_ms(),
            event: event.clone(),
        });
        Ok(seq)
    }

    async fn read_events(&self, instance_id: Uuid) -> Result<Vec<JournalEntry>> {
        let r = self.inner.read().await;
        Ok(r.events.get(&instance_id).cloned().unwrap_or_default())
    }
}
