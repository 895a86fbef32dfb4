use std::sync::Arc;
use async_trait::async_trait;
use log::info;

use super::{Stage, StageId};
use crate::archive::{self, RESULTS_FILE};
use crate::backend::Backend;
use crate::error::StageError;
use crate::job::JobContext;

/// Runs the launcher through the configured backend and checks the bundle
/// it leaves behind.
pub struct ExecuteStage {
    name: String,
    backend: Arc<dyn Backend>,
}

impl ExecuteStage {
    pub fn new(name: &str, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.to_string(),
            backend: backend,
        }
    }
}

#[async_trait]
impl Stage for ExecuteStage {
    fn stage_id(&self) -> StageId {
        StageId::Execute
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn setup(&mut self) -> Result<(), StageError> {
        self.backend.setup().await
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        let bundle = self.backend.run(ctx).await?;
        if !bundle.is_file() {
            return Err(StageError::Execute(format!(
                "no result bundle at {}",
                bundle.display()
            )));
        }
        if !archive::has_results(&bundle) {
            return Err(StageError::Execute(format!(
                "result bundle {} has no {RESULTS_FILE}",
                bundle.display()
            )));
        }
        info!("Job `{}` produced `{}`.", ctx.job_id(), bundle.display());
        ctx.set_output_bundle_path(bundle)
    }
}
