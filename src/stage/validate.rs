use std::fs;
use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use super::{Stage, StageId};
use crate::algorithm::{self, INPUT_SCHEMA};
use crate::error::StageError;
use crate::job::JobContext;

// violations listed in one error message
const MAX_REPORTED: usize = 10;

/// Checks `algorithmArgs` against the algorithm's input schema.
pub struct ValidateInputStage {
    name: String,
}

impl ValidateInputStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Stage for ValidateInputStage {
    fn stage_id(&self) -> StageId {
        StageId::ValidateInput
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        let root = ctx.require_algorithm_path()?;
        let schema_path = algorithm::find_file(root, INPUT_SCHEMA).ok_or_else(|| {
            StageError::InvalidInput(format!("algorithm has no {INPUT_SCHEMA}"))
        })?;
        let content = fs::read(&schema_path).map_err(|e| {
            StageError::InvalidInput(format!("failed to read {}: {e}", schema_path.display()))
        })?;
        let schema: Value = serde_json::from_slice(&content).map_err(|e| {
            StageError::InvalidInput(format!("{} is not valid JSON: {e}", schema_path.display()))
        })?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| StageError::InvalidInput(format!("invalid input schema: {e}")))?;

        let instance = Value::Object(ctx.job.algorithm_args.clone());
        let violations: Vec<String> = validator
            .iter_errors(&instance)
            .take(MAX_REPORTED)
            .map(|e| match e.instance_path.to_string() {
                path if path.is_empty() => e.to_string(),
                path => format!("{path}: {e}"),
            })
            .collect();
        if !violations.is_empty() {
            return Err(StageError::InvalidInput(violations.join("; ")));
        }
        debug!("Arguments of job `{}` match the input schema.", ctx.job_id());
        Ok(())
    }
}
