use std::sync::Arc;
use async_trait::async_trait;
use log::{info, warn};

use super::{Stage, StageId};
use crate::backend::Backend;
use crate::cache::{ArtifactCache, Category};
use crate::error::StageError;
use crate::job::JobContext;

/// Prepares the execution environment of a freshly installed algorithm.
pub struct BuildStage {
    name: String,
    backend: Arc<dyn Backend>,
    cache: Arc<ArtifactCache>,
}

impl BuildStage {
    pub fn new(name: &str, backend: Arc<dyn Backend>, cache: Arc<ArtifactCache>) -> Self {
        Self {
            name: name.to_string(),
            backend: backend,
            cache: cache,
        }
    }
}

#[async_trait]
impl Stage for BuildStage {
    fn stage_id(&self) -> StageId {
        StageId::Build
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), StageError> {
        self.backend.setup().await
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        let key = ctx.job.algorithm_key();
        info!("Building `{key}` with the `{}` backend.", self.backend.name());
        let Err(e) = self.backend.prepare(ctx).await else {
            return Ok(());
        };
        // a bundle that fails to build must not be served from the cache again
        let cache = self.cache.clone();
        let evicted = tokio::task::spawn_blocking(move || cache.evict(Category::Algorithms, &key))
            .await
            .map_err(|join| join.to_string())
            .and_then(|r| r.map_err(|cache| cache.to_string()));
        if let Err(cleanup) = evicted {
            warn!("Failed to evict algorithm after build failure: {cleanup}");
        }
        Err(e)
    }
}
