use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use super::{Stage, StageId};
use crate::backend::safe_component;
use crate::cache::{ArtifactCache, Category};
use crate::error::{CacheError, StageError};
use crate::gateway::{algorithm_resource, dataset_resource, model_resource, Gateway};
use crate::job::{dataset_refs, rewrite_dataset_refs, JobContext, Mode};

const API_SCHEMA_FILE: &str = "api_schema.json";
const API_CONFIG_FILE: &str = "api_config.json";

/// Resolves every artifact of a job through the cache, fetching misses from
/// the gateway.
pub struct DownloadStage {
    name: String,
    cache: Arc<ArtifactCache>,
    gateway: Arc<dyn Gateway>,
}

impl DownloadStage {
    pub fn new(name: &str, cache: Arc<ArtifactCache>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.to_string(),
            cache: cache,
            gateway: gateway,
        }
    }

    // returns the cached path and whether it was freshly installed
    async fn resolve(
        &self,
        category: Category,
        name: &str,
        hash: Option<&str>,
        resource: String,
    ) -> Result<(PathBuf, bool), StageError> {
        // reject unusable names before going to the network
        self.cache.entry_path(category, name)?;
        if let Some(path) = self.cache.lookup(category, name, hash) {
            debug!("Cache hit for `{category}/{name}`.");
            return Ok((path, false));
        }

        info!("Fetching `{resource}`.");
        let fetched = self
            .gateway
            .fetch(&resource)
            .await
            .map_err(|source| StageError::Download {
                resource: resource.clone(),
                source: source,
            })?;
        let cache = self.cache.clone();
        let name = name.to_string();
        let hash = hash.map(str::to_string);
        // another worker on the same root may have installed it meanwhile
        let installed = tokio::task::spawn_blocking(move || {
            cache.install_if_absent(category, &name, fetched.path(), hash.as_deref())
        })
        .await
        .map_err(|e| StageError::Internal(format!("install task failed: {e}")))??;
        Ok(installed)
    }

    // api mode has no model file; its schema and config stand in for it
    fn materialize_api_files(&self, ctx: &JobContext) -> Result<PathBuf, StageError> {
        let dir = self
            .cache
            .root()
            .join(Category::Models.as_str())
            .join(format!("api_{}", safe_component(ctx.job_id())));
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        let files = [
            (API_SCHEMA_FILE, ctx.job.api_schema.as_ref()),
            (API_CONFIG_FILE, ctx.job.api_config.as_ref()),
        ];
        for (filename, value) in files {
            let value = value.ok_or_else(|| {
                StageError::InvalidJob(format!("`{filename}` content is missing in api mode"))
            })?;
            let path = dir.join(filename);
            let content = serde_json::to_vec_pretty(value)
                .map_err(|e| StageError::Internal(format!("failed to encode {filename}: {e}")))?;
            fs::write(&path, content).map_err(|e| CacheError::io(&path, e))?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl Stage for DownloadStage {
    fn stage_id(&self) -> StageId {
        StageId::Download
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        let job = ctx.job.clone();

        let (algorithm, fresh) = self
            .resolve(
                Category::Algorithms,
                &job.algorithm_key(),
                job.algorithm_hash.as_deref(),
                algorithm_resource(&job.algorithm_gid, &job.algorithm_cid),
            )
            .await?;
        ctx.set_algorithm_path(algorithm)?;
        ctx.to_build = fresh;

        let model = match job.mode {
            Mode::Upload => {
                let model_file = job.model_file.as_deref().ok_or_else(|| {
                    StageError::InvalidJob("modelFile is required in upload mode".to_string())
                })?;
                let (path, _) = self
                    .resolve(
                        Category::Models,
                        model_file,
                        job.model_file_hash.as_deref(),
                        model_resource(model_file),
                    )
                    .await?;
                path
            }

            Mode::Api => self.materialize_api_files(ctx)?,
        };
        ctx.set_model_path(model)?;

        let (data, _) = self
            .resolve(
                Category::Datasets,
                &job.test_dataset,
                job.test_dataset_hash.as_deref(),
                dataset_resource(&job.test_dataset),
            )
            .await?;
        ctx.set_data_path(data)?;

        if let Some(ground_truth) = job.ground_truth_dataset.as_deref() {
            let (path, _) = self
                .resolve(
                    Category::Datasets,
                    ground_truth,
                    job.ground_truth_dataset_hash.as_deref(),
                    dataset_resource(ground_truth),
                )
                .await?;
            ctx.set_ground_truth_path(path)?;
        }

        let mut resolved = HashMap::new();
        for name in dataset_refs(&job.algorithm_args) {
            let (path, _) = self
                .resolve(Category::Datasets, &name, None, dataset_resource(&name))
                .await?;
            resolved.insert(name, path);
        }
        if !resolved.is_empty() {
            rewrite_dataset_refs(&mut ctx.job.algorithm_args, &resolved);
            debug!(
                "Rewrote dataset arguments: {}",
                Value::Object(ctx.job.algorithm_args.clone())
            );
        }
        Ok(())
    }
}
