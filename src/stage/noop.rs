use async_trait::async_trait;
use log::debug;

use super::{Stage, StageId};
use crate::error::StageError;
use crate::job::JobContext;

/// Fills a stage slot without doing anything.
pub struct NoopStage {
    id: StageId,
}

impl NoopStage {
    pub fn new(id: StageId) -> Self {
        Self { id: id }
    }
}

#[async_trait]
impl Stage for NoopStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
        debug!("Stage `{}` is a no-op for job `{}`.", self.id, ctx.job_id());
        Ok(())
    }
}
