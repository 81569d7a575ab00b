//! The per-instance run loop (§4.5): sweeps `pending` vertices in
//! insertion order, advances `Immediate` outcomes, parks `Waiting` ones,
//! and falls back to delivering one inbox message when a full sweep makes
//! no progress.

use crate::behaviors::{self, Outcome, StepEnv};
use crate::connector::ConnectorRunner;
use crate::events::RuntimeEvent;
use crate::model::ProcessModel;
use crate::registry::Registry;
use crate::store::ProcessStore;
use crate::types::{InstanceRecord, InstanceSnapshot, Message, ProcessState};
use crate::SystemConfig;
use serde_json::Value as Json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, Notify};
use uuid::Uuid;

/// Everything that changes while an instance runs. The instance's `Mutex`
/// wraps exactly this and is held for the duration of one vertex step —
/// long enough to span a connector call, short enough that a concurrent
/// `GET /instance/{id}` or inbox push only ever waits on one step (§5).
pub struct RuntimeState {
    pub process_state: ProcessState,
    pub variables: Json,
    pub pending: Vec<String>,
    pub join_counters: HashMap<String, u32>,
    pub inbox: VecDeque<Message>,
}

/// A live process instance: its model, its locked runtime state, and the
/// plumbing (cancellation, inbox wake-up, persistence) the scheduler needs
/// to drive it. Held behind an `Arc` in the registry's instance table.
pub struct InstanceHandle {
    pub id: Uuid,
    pub model: Arc<ProcessModel>,
    pub model_path: String,
    state: Mutex<RuntimeState>,
    inbox_signal: Notify,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    store: Arc<dyn ProcessStore>,
    connector: Arc<dyn ConnectorRunner>,
    config: Arc<SystemConfig>,
    /// Back-reference for `callActivity` to spin up child instances
    /// without the registry holding a cycle through its own instance table.
    registry: Weak<Registry>,
}

impl InstanceHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        model: Arc<ProcessModel>,
        model_path: String,
        variables: Json,
        pending: Vec<String>,
        store: Arc<dyn ProcessStore>,
        connector: Arc<dyn ConnectorRunner>,
        config: Arc<SystemConfig>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(Self {
            id,
            model,
            model_path,
            state: Mutex::new(RuntimeState {
                process_state: ProcessState::Running,
                variables,
                pending,
                join_counters: HashMap::new(),
                inbox: VecDeque::new(),
            }),
            inbox_signal: Notify::new(),
            cancel_tx,
            cancel_rx,
            store,
            connector,
            config,
            registry,
        })
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().await;
        InstanceSnapshot {
            id: self.id,
            model_path: self.model_path.clone(),
            state: state.process_state,
            variables: state.variables.clone(),
            pending: state.pending.clone(),
        }
    }

    /// Enqueue an inbox message and wake the drive loop if it is parked.
    pub async fn push_message(&self, msg: Message) {
        let mut state = self.state.lock().await;
        state.inbox.push_back(msg);
        let was_waiting = state.process_state == ProcessState::Waiting;
        if was_waiting {
            state.process_state = ProcessState::Running;
        }
        drop(state);
        self.inbox_signal.notify_one();
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    async fn journal(&self, event: RuntimeEvent) {
        if let Err(err) = self.store.append_event(self.id, &event).await {
            tracing::warn!(instance_id = %self.id, error = %err, "failed to append journal entry");
        }
    }

    async fn persist(&self, state: &RuntimeState) {
        let record = InstanceRecord {
            id: self.id,
            model_path: self.model_path.clone(),
            state: state.process_state,
            variables: state.variables.clone(),
        };
        if let Err(err) = self.store.save_instance(&record).await {
            tracing::warn!(instance_id = %self.id, error = %err, "failed to persist instance");
        }
    }
}

/// Remove a single occurrence of `vertex_id` from `pending`, by position —
/// a join can legitimately appear more than once (one per arriving token),
/// and `Vec::retain` would drop every copy for one processed token.
fn remove_one_pending(pending: &mut Vec<String>, vertex_id: &str) {
    if let Some(idx) = pending.iter().position(|id| id == vertex_id) {
        pending.remove(idx);
    }
}

fn target_of(model: &ProcessModel, vertex_id: &str, edge_id: &str) -> Option<String> {
    model
        .successors(vertex_id)
        .into_iter()
        .find(|e| e.weight().id == edge_id)
        .map(|e| model.target_id(&e).to_string())
}

/// Apply an `Immediate` outcome: journal the completed vertex, journal and
/// enqueue each chosen edge's target, and leave the lock's caller to
/// re-check termination.
async fn apply_immediate(
    handle: &InstanceHandle,
    state: &mut RuntimeState,
    vertex_id: &str,
    edge_ids: &[String],
) {
    handle
        .journal(RuntimeEvent::Completed {
            vertex_id: vertex_id.to_string(),
        })
        .await;
    for edge_id in edge_ids {
        if let Some(target) = target_of(&handle.model, vertex_id, edge_id) {
            state.pending.push(target.clone());
            handle.journal(RuntimeEvent::Entered { vertex_id: target }).await;
        } else {
            tracing::warn!(instance_id = %handle.id, vertex_id, edge_id, "chosen edge not found");
        }
    }
}

/// Run an instance until it finishes, fails, or parks waiting on its
/// inbox (§4.5). Calling this again on a parked instance (after a message
/// has been pushed) resumes the loop.
pub async fn drive(handle: Arc<InstanceHandle>) {
    loop {
        {
            let guard = handle.state.lock().await;
            if guard.process_state.is_terminal() {
                return;
            }
        }

        let pending_snapshot = {
            let mut guard = handle.state.lock().await;
            guard.process_state = ProcessState::Running;
            guard.pending.clone()
        };

        let mut progressed = false;

        for vertex_id in &pending_snapshot {
            let Some(vertex) = handle.model.vertex(vertex_id).cloned() else {
                let mut guard = handle.state.lock().await;
                remove_one_pending(&mut guard.pending, vertex_id);
                continue;
            };

            let Some(registry) = handle.registry.upgrade() else {
                tracing::warn!(instance_id = %handle.id, "registry dropped mid-drive");
                return;
            };
            let mut cancel_rx = handle.cancel_rx.clone();

            let outcome = {
                let mut guard = handle.state.lock().await;
                if !guard.pending.iter().any(|id| id == vertex_id) {
                    continue;
                }
                let state = &mut *guard;
                let mut env = StepEnv {
                    model: &handle.model,
                    variables: &mut state.variables,
                    join_counters: &mut state.join_counters,
                    instance_id: handle.id,
                    connector: handle.connector.as_ref(),
                    config: &handle.config,
                    registry: &registry,
                    cancel: &mut cancel_rx,
                };
                behaviors::run(&vertex, &mut env).await
            };

            match outcome {
                Ok(Outcome::Waiting) => {}
                Ok(Outcome::Done) => {
                    progressed = true;
                    let mut guard = handle.state.lock().await;
                    remove_one_pending(&mut guard.pending, vertex_id);
                    handle.persist(&guard).await;
                }
                Ok(Outcome::Immediate(edge_ids)) => {
                    progressed = true;
                    let mut guard = handle.state.lock().await;
                    remove_one_pending(&mut guard.pending, vertex_id);
                    apply_immediate(&handle, &mut guard, vertex_id, &edge_ids).await;
                    handle
                        .journal(RuntimeEvent::VariablesUpdated {
                            variables_snapshot: guard.variables.clone(),
                        })
                        .await;
                    handle.persist(&guard).await;
                }
                Err(err) => {
                    tracing::warn!(instance_id = %handle.id, vertex_id, error = %err, "vertex step failed");
                    let mut guard = handle.state.lock().await;
                    guard.process_state = ProcessState::Failed;
                    handle
                        .journal(RuntimeEvent::Terminated {
                            state: ProcessState::Failed,
                        })
                        .await;
                    handle.persist(&guard).await;
                    return;
                }
            }
        }

        let mut guard = handle.state.lock().await;

        if guard.pending.is_empty() {
            guard.process_state = ProcessState::Finished;
            handle
                .journal(RuntimeEvent::Terminated {
                    state: ProcessState::Finished,
                })
                .await;
            handle.persist(&guard).await;
            return;
        }

        if progressed {
            continue;
        }

        // No pending vertex advanced this sweep: either every one of them
        // is genuinely waiting, or an inbox message can unblock one.
        match guard.inbox.pop_front() {
            Some(msg) => {
                handle
                    .journal(RuntimeEvent::MessageReceived { message: msg.clone() })
                    .await;
                match guard.pending.iter().position(|id| id == msg.task_id()) {
                    Some(idx) => {
                        let vertex_id = guard.pending[idx].clone();
                        if let Some(vertex) = handle.model.vertex(&vertex_id).cloned() {
                            let result =
                                behaviors::deliver_message(&vertex, &msg, &mut guard.variables);
                            if matches!(result, Outcome::Immediate(_)) {
                                guard.pending.remove(idx);
                                let edge_ids: Vec<String> = handle
                                    .model
                                    .successors(&vertex_id)
                                    .iter()
                                    .map(|e| e.weight().id.clone())
                                    .collect();
                                apply_immediate(&handle, &mut guard, &vertex_id, &edge_ids).await;
                                handle
                                    .journal(RuntimeEvent::VariablesUpdated {
                                        variables_snapshot: guard.variables.clone(),
                                    })
                                    .await;
                            }
                        }
                    }
                    None => {
                        tracing::warn!(
                            instance_id = %handle.id,
                            task_id = msg.task_id(),
                            "dropping message for a vertex that is not pending"
                        );
                    }
                }
                handle.persist(&guard).await;
                continue;
            }
            None => {
                guard.process_state = ProcessState::Waiting;
                handle.persist(&guard).await;
                drop(guard);
                handle.inbox_signal.notified().await;
                continue;
            }
        }
    }
}
