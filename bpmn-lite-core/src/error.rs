//! Error taxonomy (§7) that can surface past a component boundary.
//! Component-internal functions return `anyhow::Result<T>`; `EngineError`
//! is constructed at the scheduler boundary when a vertex step cannot
//! continue, and is journaled as `Terminated { state: Failed }`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed BPMN model: {0}")]
    Parse(String),

    #[error("connector call failed: {0}")]
    Connector(String),

    #[error("call activity child instance failed: {0}")]
    ChildFailure(String),

    #[error("exclusive gateway '{vertex_id}' had no matching edge and no default")]
    InvalidRouting { vertex_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}
