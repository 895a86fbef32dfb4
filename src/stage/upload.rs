use std::sync::Arc;
use async_trait::async_trait;
use log::info;

use super::{Stage, StageId};
use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::JobContext;

/// Sends the result bundle to the gateway.
pub struct UploadStage {
    name: String,
    gateway: Arc<dyn Gateway>,
}

impl UploadStage {
    pub fn new(name: &str, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.to_string(),
            gateway: gateway,
        }
    }
}

#[async_trait]
impl Stage for UploadStage {
    fn stage_id(&self) -> StageId {
        StageId::Upload
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        let bundle = ctx
            .output_bundle_path()
            .ok_or_else(|| StageError::Internal("no result bundle to upload".to_string()))?;
        self.gateway
            .upload_bundle(bundle)
            .await
            .map_err(|source| StageError::Upload { source: source })?;
        info!("Uploaded results of job `{}`.", ctx.job_id());
        Ok(())
    }
}
