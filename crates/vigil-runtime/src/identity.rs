//! Operator identity imprinting.
//!
//! The identity is written once to `identity.json`. Replacing it requires an
//! explicit `force`, which the CLI only allows while the daemon is stopped.

use tracing::info;

use vigil_core::{OperatorIdentity, Result, StatePaths, VigilError, jsonl};

pub fn load(paths: &StatePaths) -> Result<Option<OperatorIdentity>> {
    jsonl::read_json(&paths.identity_file())
}

pub fn imprint(paths: &StatePaths, operator_id: &str, force: bool) -> Result<OperatorIdentity> {
    let operator_id = operator_id.trim();
    if operator_id.is_empty() {
        return Err(VigilError::ConfigValidation {
            field: "operator_id".into(),
            reason: "must not be empty".into(),
        });
    }
    if let Some(existing) = load(paths)?
        && !force
    {
        return Err(VigilError::Config(format!(
            "already imprinted to '{}' on {}; pass --force to replace it",
            existing.operator_id,
            existing.imprinted_at.format("%Y-%m-%d")
        )));
    }
    let identity = OperatorIdentity::new(operator_id);
    jsonl::write_json(&paths.identity_file(), &identity)?;
    info!(operator = %identity.operator_id, force, "operator imprinted");
    Ok(identity)
}

/// Hint shown wherever an identity is required but missing.
pub fn missing_identity() -> VigilError {
    VigilError::ConfigurationMissing {
        what: "operator identity".into(),
        hint: "run `vigil imprint <id>`".into(),
    }
}
