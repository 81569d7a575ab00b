//! Model catalogue and instance directory (§4.7, §4.8): loads `.bpmn`
//! files from disk once at startup, creates and rehydrates instances, and
//! answers the variable-substring `search` query.

use crate::compiler;
use crate::connector::ConnectorRunner;
use crate::events::{JournalEntry, RuntimeEvent};
use crate::model::ProcessModel;
use crate::scheduler::{self, InstanceHandle};
use crate::store::ProcessStore;
use crate::types::{InstanceSnapshot, Message};
use crate::SystemConfig;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct Registry {
    models: RwLock<HashMap<String, Arc<ProcessModel>>>,
    instances: RwLock<HashMap<Uuid, Arc<InstanceHandle>>>,
    store: Arc<dyn ProcessStore>,
    connector: Arc<dyn ConnectorRunner>,
    config: Arc<SystemConfig>,
    self_weak: RwLock<Weak<Registry>>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        connector: Arc<dyn ConnectorRunner>,
        config: Arc<SystemConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Registry {
            models: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            store,
            connector,
            config,
            self_weak: RwLock::new(weak.clone()),
        })
    }

    /// Load every `*.bpmn` file directly under `config.models_dir`, keyed
    /// by file stem (the name used in `/model/{name}` routes).
    pub async fn load_models(&self) -> anyhow::Result<usize> {
        let dir = std::path::Path::new(&self.config.models_dir);
        let mut loaded = 0;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(models_dir = %self.config.models_dir, "models directory does not exist");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let mut models = self.models.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bpmn") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let xml = tokio::fs::read_to_string(&path).await?;
            match compiler::compile(&xml) {
                Ok(model) => {
                    models.insert(stem.to_string(), Arc::new(model));
                    loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unparseable model");
                }
            }
        }
        Ok(loaded)
    }

    pub async fn get_model(&self, name: &str) -> Option<Arc<ProcessModel>> {
        self.models.read().await.get(name).cloned()
    }

    pub async fn list_models(&self) -> Vec<String> {
        self.models.read().await.keys().cloned().collect()
    }

    /// Resolve a `callActivity`'s `calledElement` against every loaded
    /// top-level model by process id (§4.6, when it is not a nested
    /// sub-process of the caller).
    pub fn find_model_by_process_id(&self, process_id: &str) -> Option<Arc<ProcessModel>> {
        self.models
            .try_read()
            .ok()
            .and_then(|models| models.values().find(|m| m.process_id == process_id).cloned())
    }

    async fn self_arc(&self) -> Weak<Registry> {
        self.self_weak.read().await.clone()
    }

    /// Start a fresh top-level instance and spawn its drive loop.
    pub async fn create_instance(
        &self,
        model_name: &str,
        id: Option<Uuid>,
        initial_variables: Json,
    ) -> anyhow::Result<Arc<InstanceHandle>> {
        let model = self
            .get_model(model_name)
            .await
            .ok_or_else(|| anyhow::anyhow!("no model named '{model_name}'"))?;
        let instance_id = id.unwrap_or_else(Uuid::new_v4);
        let pending: Vec<String> = model
            .start_events
            .iter()
            .map(|&idx| model.graph[idx].id.clone())
            .collect();

        let handle = InstanceHandle::new(
            instance_id,
            model,
            model_name.to_string(),
            initial_variables,
            pending,
            self.store.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.self_arc().await,
        );

        self.store
            .append_event(
                instance_id,
                &RuntimeEvent::InstanceCreated {
                    instance_id,
                    model_path: model_name.to_string(),
                },
            )
            .await?;
        for vertex_id in &handle.snapshot().await.pending {
            self.store
                .append_event(
                    instance_id,
                    &RuntimeEvent::Entered {
                        vertex_id: vertex_id.clone(),
                    },
                )
                .await?;
        }

        self.instances.write().await.insert(instance_id, handle.clone());
        tokio::spawn(scheduler::drive(handle.clone()));
        Ok(handle)
    }

    /// Start a child instance for a `callActivity` (§4.6). The caller
    /// drives it inline rather than spawning — it is `.await`ed by the
    /// parent's own step.
    pub async fn create_child_instance(
        &self,
        model: Arc<ProcessModel>,
        initial_variables: Json,
    ) -> anyhow::Result<Arc<InstanceHandle>> {
        let instance_id = Uuid::new_v4();
        let model_path = model.process_id.clone();
        let pending: Vec<String> = model
            .start_events
            .iter()
            .map(|&idx| model.graph[idx].id.clone())
            .collect();

        let handle = InstanceHandle::new(
            instance_id,
            model,
            model_path.clone(),
            initial_variables,
            pending,
            self.store.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.self_arc().await,
        );

        self.store
            .append_event(
                instance_id,
                &RuntimeEvent::InstanceCreated {
                    instance_id,
                    model_path,
                },
            )
            .await?;
        for vertex_id in &handle.snapshot().await.pending {
            self.store
                .append_event(
                    instance_id,
                    &RuntimeEvent::Entered {
                        vertex_id: vertex_id.clone(),
                    },
                )
                .await?;
        }

        self.instances.write().await.insert(instance_id, handle.clone());
        Ok(handle)
    }

    /// Find a live instance, or rehydrate one from the journal (§4.7).
    /// A rehydrated non-terminal instance has its drive loop respawned.
    pub async fn get_or_load_instance(&self, id: Uuid) -> anyhow::Result<Option<Arc<InstanceHandle>>> {
        if let Some(handle) = self.instances.read().await.get(&id).cloned() {
            return Ok(Some(handle));
        }

        let Some(record) = self.store.load_instance(id).await? else {
            return Ok(None);
        };
        let Some(model) = self.get_model(&record.model_path).await else {
            anyhow::bail!("recovered instance references unknown model '{}'", record.model_path);
        };
        let events = self.store.read_events(id).await?;
        let pending = replay_pending(&events);

        let handle = InstanceHandle::new(
            id,
            model,
            record.model_path,
            record.variables,
            pending,
            self.store.clone(),
            self.connector.clone(),
            self.config.clone(),
            self.self_arc().await,
        );
        if !record.state.is_terminal() {
            tokio::spawn(scheduler::drive(handle.clone()));
        }

        self.instances.write().await.insert(id, handle.clone());
        Ok(Some(handle))
    }

    /// Deliver a message to a pending userTask/receiveTask (§6 task
    /// endpoints). Returns `Ok(false)` if the instance does not exist.
    pub async fn deliver_message(&self, id: Uuid, message: Message) -> anyhow::Result<bool> {
        match self.get_or_load_instance(id).await? {
            Some(handle) => {
                handle.push_message(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `GET /instance?q=...` (§4.8): AND of comma-separated clauses, each
    /// either `attribute:value` or a bare `value`, matched as a
    /// case-insensitive substring against string-valued variables.
    pub async fn search(&self, query: Option<&str>) -> anyhow::Result<Vec<InstanceSnapshot>> {
        let mut snapshots = Vec::new();
        for record in self.store.list_instances().await? {
            let id = record.id;
            let pending = match self.instances.read().await.get(&id) {
                Some(handle) => handle.snapshot().await.pending,
                None => replay_pending(&self.store.read_events(id).await?),
            };
            snapshots.push(InstanceSnapshot {
                id,
                model_path: record.model_path,
                state: record.state,
                variables: record.variables,
                pending,
            });
        }

        let Some(query) = query.filter(|q| !q.is_empty()) else {
            return Ok(snapshots);
        };

        let clauses: Vec<&str> = query.split(',').map(str::trim).filter(|c| !c.is_empty()).collect();
        snapshots.retain(|snapshot| clauses.iter().all(|clause| matches_clause(&snapshot.variables, clause)));
        Ok(snapshots)
    }
}

fn matches_clause(variables: &Json, clause: &str) -> bool {
    let Json::Object(map) = variables else {
        return false;
    };
    if let Some((attribute, value)) = clause.split_once(':') {
        let value = value.to_lowercase();
        map.get(attribute)
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase().contains(&value))
            .unwrap_or(false)
    } else {
        let clause = clause.to_lowercase();
        map.values()
            .any(|v| v.as_str().map(|s| s.to_lowercase().contains(&clause)).unwrap_or(false))
    }
}

/// Reconstruct the `pending` set by replaying the journal's `Entered`/
/// `Completed` events in order (§4.7 "journal replay reconstructs a
/// passed-through state").
fn replay_pending(events: &[JournalEntry]) -> Vec<String> {
    let mut pending = Vec::new();
    for entry in events {
        match &entry.event {
            RuntimeEvent::Entered { vertex_id } => pending.push(vertex_id.clone()),
            RuntimeEvent::Completed { vertex_id } => pending.retain(|v| v != vertex_id),
            _ => {}
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_pending_tracks_entered_and_completed() {
        let events = vec![
            JournalEntry {
                instance_id: Uuid::new_v4(),
                seq: 1,
                timestamp: 0,
                event: RuntimeEvent::Entered {
                    vertex_id: "start".to_string(),
                },
            },
            JournalEntry {
                instance_id: Uuid::new_v4(),
                seq: 2,
                timestamp: 0,
                event: RuntimeEvent::Completed {
                    vertex_id: "start".to_string(),
                },
            },
            JournalEntry {
                instance_id: Uuid::new_v4(),
                seq: 3,
                timestamp: 0,
                event: RuntimeEvent::Entered {
                    vertex_id: "greet".to_string(),
                },
            },
        ];
        assert_eq!(replay_pending(&events), vec!["greet".to_string()]);
    }

    #[test]
    fn matches_clause_supports_attribute_and_bare_forms() {
        let vars = json!({"name": "Ada Lovelace", "status": "open"});
        assert!(matches_clause(&vars, "name:Ada"));
        assert!(matches_clause(&vars, "Lovelace"));
        assert!(!matches_clause(&vars, "name:Bob"));
    }

    #[test]
    fn matches_clause_is_case_insensitive() {
        let vars = json!({"name": "Ada Lovelace"});
        assert!(matches_clause(&vars, "name:ada"));
        assert!(matches_clause(&vars, "LOVELACE"));
    }
}
