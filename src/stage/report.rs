use std::sync::Arc;
use async_trait::async_trait;
use log::error;

use super::{Stage, StageId};
use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::JobContext;

const UNKNOWN_ERROR: &str = "unknown error";

fn message(ctx: &JobContext) -> &str {
    ctx.error_message.as_deref().unwrap_or(UNKNOWN_ERROR)
}

/// Marks the test run as failed on the gateway.
pub struct ErrorReportStage {
    name: String,
    gateway: Arc<dyn Gateway>,
}

impl ErrorReportStage {
    pub fn new(name: &str, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.to_string(),
            gateway: gateway,
        }
    }
}

#[async_trait]
impl Stage for ErrorReportStage {
    fn stage_id(&self) -> StageId {
        StageId::ErrorReport
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        self.gateway.patch_error(ctx.job_id(), message(ctx)).await;
        Ok(())
    }
}

/// Only logs failures, for workers running without a gateway.
pub struct LogReportStage {
    name: String,
}

impl LogReportStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Stage for LogReportStage {
    fn stage_id(&self) -> StageId {
        StageId::ErrorReport
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        error!("Job `{}` failed: {}", ctx.job_id(), message(ctx));
        Ok(())
    }
}
