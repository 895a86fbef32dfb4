use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::StageError;

/// literal prefix marking an `algorithmArgs` value as a dataset reference
pub const DATASET_PREFIX: &str = "_dataset_:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Mode {
    #[serde(rename = "upload", alias = "UPLOAD", alias = "Upload")]
    Upload,

    #[serde(rename = "api", alias = "API", alias = "Api")]
    Api,
}

// job as published by the gateway, field `task` of a stream entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "id")]
    pub job_id: String,

    pub mode: Mode,

    #[serde(rename = "algorithmGID")]
    pub algorithm_gid: String,
    #[serde(rename = "algorithmCID")]
    pub algorithm_cid: String,
    #[serde(default)]
    pub algorithm_hash: Option<String>,

    #[serde(default)]
    pub algorithm_args: Map<String, Value>,

    pub test_dataset: String,
    #[serde(default)]
    pub test_dataset_hash: Option<String>,

    #[serde(default)]
    pub ground_truth_dataset: Option<String>,
    #[serde(default)]
    pub ground_truth_dataset_hash: Option<String>,
    // column name inside the ground truth dataset
    #[serde(default)]
    pub ground_truth: Option<String>,

    #[serde(default)]
    pub model_file: Option<String>,
    #[serde(default)]
    pub model_file_hash: Option<String>,
    #[serde(default)]
    pub model_type: String,

    // API mode only
    #[serde(default)]
    pub api_schema: Option<Value>,
    #[serde(default)]
    pub api_config: Option<Value>,
}

impl Job {
    pub fn from_payload(payload: &[u8]) -> Result<Job, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    // cache name of the algorithm bundle
    pub fn algorithm_key(&self) -> String {
        format!("{}_{}", self.algorithm_gid, self.algorithm_cid)
    }

    /// Checks the mode-dependent field requirements.
    ///
    /// A violation is permanent: the job is reported as failed and never
    /// retried.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.job_id.trim().is_empty() {
            return Err(StageError::InvalidJob("job id is empty".to_string()));
        }
        if self.algorithm_gid.is_empty() || self.algorithm_cid.is_empty() {
            return Err(StageError::InvalidJob(
                "algorithmGID and algorithmCID are required".to_string(),
            ));
        }
        if self.test_dataset.is_empty() {
            return Err(StageError::InvalidJob("testDataset is required".to_string()));
        }
        match self.mode {
            Mode::Upload => {
                if self.model_file.as_deref().map_or(true, str::is_empty) {
                    return Err(StageError::InvalidJob(
                        "modelFile is required in upload mode".to_string(),
                    ));
                }
            }

            Mode::Api => {
                if self.api_schema.is_none() || self.api_config.is_none() {
                    return Err(StageError::InvalidJob(
                        "apiSchema and apiConfig are required in api mode".to_string(),
                    ));
                }
            }
        }
        // the launcher takes the dataset and its column as a pair
        if self.ground_truth_dataset.is_some() != self.ground_truth.is_some() {
            return Err(StageError::InvalidJob(
                "groundTruthDataset and groundTruth must be given together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Dataset names referenced through the `_dataset_:` prefix, in document
/// order, without duplicates.
pub fn dataset_refs(args: &Map<String, Value>) -> Vec<String> {
    let mut refs = Vec::new();
    for value in args.values() {
        collect_refs(value, &mut refs);
    }
    refs
}

fn collect_refs(value: &Value, refs: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix(DATASET_PREFIX) {
                if !refs.iter().any(|r| r == name) {
                    refs.push(name.to_string());
                }
            }
        }

        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, refs)),

        Value::Object(map) => map.values().for_each(|v| collect_refs(v, refs)),

        _ => {}
    }
}

/// Replaces every `_dataset_:<name>` value with the resolved local path.
///
/// References without a resolution are left untouched. Applying the rewrite
/// twice is the same as applying it once.
pub fn rewrite_dataset_refs(args: &mut Map<String, Value>, resolved: &HashMap<String, PathBuf>) {
    for value in args.values_mut() {
        rewrite_value(value, resolved);
    }
}

fn rewrite_value(value: &mut Value, resolved: &HashMap<String, PathBuf>) {
    match value {
        Value::String(s) => {
            let path = s
                .strip_prefix(DATASET_PREFIX)
                .and_then(|name| resolved.get(name));
            if let Some(path) = path {
                *s = path.to_string_lossy().into_owned();
            }
        }

        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_value(v, resolved)),

        Value::Object(map) => map.values_mut().for_each(|v| rewrite_value(v, resolved)),

        _ => {}
    }
}

/// Mutable state carried from stage to stage for one job.
///
/// Resolved paths are write-once: a stage extends the context, it never
/// re-resolves what an earlier stage wrote.
#[derive(Debug)]
pub struct JobContext {
    pub job: Job,

    algorithm_path: Option<PathBuf>,
    data_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    ground_truth_path: Option<PathBuf>,

    // set by download when the algorithm was freshly installed
    pub to_build: bool,

    output_bundle_path: Option<PathBuf>,

    pub error_message: Option<String>,

    pub started_at: DateTime<Utc>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job: job,
            algorithm_path: None,
            data_path: None,
            model_path: None,
            ground_truth_path: None,
            to_build: false,
            output_bundle_path: None,
            error_message: None,
            started_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn algorithm_path(&self) -> Option<&Path> {
        self.algorithm_path.as_deref()
    }

    pub fn data_path(&self) -> Option<&Path> {
        self.data_path.as_deref()
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn ground_truth_path(&self) -> Option<&Path> {
        self.ground_truth_path.as_deref()
    }

    pub fn output_bundle_path(&self) -> Option<&Path> {
        self.output_bundle_path.as_deref()
    }

    pub fn set_algorithm_path(&mut self, path: PathBuf) -> Result<(), StageError> {
        extend(&mut self.algorithm_path, "algorithm_path", path)
    }

    pub fn set_data_path(&mut self, path: PathBuf) -> Result<(), StageError> {
        extend(&mut self.data_path, "data_path", path)
    }

    pub fn set_model_path(&mut self, path: PathBuf) -> Result<(), StageError> {
        extend(&mut self.model_path, "model_path", path)
    }

    pub fn set_ground_truth_path(&mut self, path: PathBuf) -> Result<(), StageError> {
        extend(&mut self.ground_truth_path, "ground_truth_path", path)
    }

    pub fn set_output_bundle_path(&mut self, path: PathBuf) -> Result<(), StageError> {
        extend(&mut self.output_bundle_path, "output_bundle_path", path)
    }

    // the algorithm directory, or an internal error if download did not run
    pub fn require_algorithm_path(&self) -> Result<&Path, StageError> {
        self.algorithm_path()
            .ok_or_else(|| StageError::Internal("algorithm path is not resolved".to_string()))
    }

    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

fn extend(slot: &mut Option<PathBuf>, field: &str, path: PathBuf) -> Result<(), StageError> {
    if let Some(existing) = slot {
        return Err(StageError::Internal(format!(
            "`{field}` is already resolved to {}",
            existing.display()
        )));
    }
    *slot = Some(path);
    Ok(())
}
