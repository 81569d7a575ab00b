//! Top-level facade wiring the model registry, persistence backend and
//! connector runner behind the API the server calls (§2 component map).

use crate::config::SystemConfig;
use crate::connector::{ConnectorRunner, HttpConnectorRunner};
use crate::registry::Registry;
use crate::scheduler::InstanceHandle;
use crate::store::ProcessStore;
use crate::store_memory::MemoryStore;
use crate::types::{InstanceSnapshot, Message};
use serde_json::Value as Json;
use std::sync::Arc;
use uuid::Uuid;

pub struct Engine {
    pub config: Arc<SystemConfig>,
    registry: Arc<Registry>,
}

impl Engine {
    /// Build an engine over the in-memory store. Used when the `postgres`
    /// feature is off, or when `DATABASE_URL` is unset at startup.
    pub fn with_memory_store(config: SystemConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let store: Arc<dyn ProcessStore> = Arc::new(MemoryStore::new());
        let connector: Arc<dyn ConnectorRunner> = Arc::new(HttpConnectorRunner::new()?);
        let registry = Registry::new(store, connector, config.clone());
        Ok(Self { config, registry })
    }

    /// Build an engine over an arbitrary store (the Postgres backend, a
    /// test double, ...).
    pub fn with_store(config: SystemConfig, store: Arc<dyn ProcessStore>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let connector: Arc<dyn ConnectorRunner> = Arc::new(HttpConnectorRunner::new()?);
        let registry = Registry::new(store, connector, config.clone());
        Ok(Self { config, registry })
    }

    /// Load every `.bpmn` file under `config.models_dir` (§6).
    pub async fn load_models(&self) -> anyhow::Result<usize> {
        self.registry.load_models().await
    }

    pub async fn list_models(&self) -> Vec<String> {
        self.registry.list_models().await
    }

    pub async fn model_source(&self, name: &str) -> Option<String> {
        self.registry
            .get_model(name)
            .await
            .map(|model| model.source_xml.clone())
    }

    pub async fn create_instance(
        &self,
        model_name: &str,
        id: Option<Uuid>,
        initial_variables: Json,
    ) -> anyhow::Result<Arc<InstanceHandle>> {
        self.registry
            .create_instance(model_name, id, initial_variables)
            .await
    }

    pub async fn instance_snapshot(&self, id: Uuid) -> anyhow::Result<Option<InstanceSnapshot>> {
        match self.registry.get_or_load_instance(id).await? {
            Some(handle) => Ok(Some(handle.snapshot().await)),
            None => Ok(None),
        }
    }

    pub async fn deliver_message(&self, id: Uuid, message: Message) -> anyhow::Result<bool> {
        self.registry.deliver_message(id, message).await
    }

    /// `POST /model/{name}/task/{tid}/receive` (§6): spin up a fresh
    /// instance of `model_name` and immediately enqueue a `Receive` for
    /// `task_id` on it, rather than addressing an existing instance.
    pub async fn create_instance_and_receive(
        &self,
        model_name: &str,
        task_id: &str,
        payload: Json,
    ) -> anyhow::Result<Uuid> {
        let handle = self.registry.create_instance(model_name, None, Json::Object(Default::default())).await?;
        self.registry
            .deliver_message(
                handle.id,
                Message::Receive {
                    task_id: task_id.to_string(),
                    payload,
                },
            )
            .await?;
        Ok(handle.id)
    }

    pub async fn search(&self, query: Option<&str>) -> anyhow::Result<Vec<InstanceSnapshot>> {
        self.registry.search(query).await
    }
}
