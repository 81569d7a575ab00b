//! BPMN 2.0 XML → [`crate::model::ProcessModel`] pipeline (§4.2, §6):
//! parse into a draft graph, verify its structural invariants, then lower
//! it into the immutable runtime model.

mod ir;
mod lowering;
mod parser;
mod verifier;

pub use ir::ProcessDraft;
pub use parser::{parse_bpmn, parse_main_process};
pub use verifier::{verify, verify_or_err, VerifyError};

use crate::model::ProcessModel;
use anyhow::Result;

/// Parse, verify and lower a BPMN document into a ready-to-run model.
pub fn compile(xml: &str) -> Result<ProcessModel> {
    let draft = parser::parse_main_process(xml)?;
    verifier::verify_or_err(&draft)?;
    Ok(lowering::lower(draft, xml))
}
