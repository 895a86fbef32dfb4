//! Pipeline stages and the registry binding stage slots to implementations.

use std::{fmt, sync::Arc};
use async_trait::async_trait;

use crate::backend;
use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::error::{RegistryError, StageError};
use crate::gateway::Gateway;
use crate::job::JobContext;
use crate::process::CommandRunner;

mod build;
mod download;
mod execute;
mod noop;
mod report;
mod upload;
mod validate;

pub use build::BuildStage;
pub use download::DownloadStage;
pub use execute::ExecuteStage;
pub use noop::NoopStage;
pub use report::{ErrorReportStage, LogReportStage};
pub use upload::UploadStage;
pub use validate::ValidateInputStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Download,
    Build,
    ValidateInput,
    Execute,
    Upload,
    ErrorReport,
}

impl StageId {
    pub const ALL: [StageId; 6] = [
        StageId::Download,
        StageId::Build,
        StageId::ValidateInput,
        StageId::Execute,
        StageId::Upload,
        StageId::ErrorReport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Download => "download",
            StageId::Build => "build",
            StageId::ValidateInput => "validate_input",
            StageId::Execute => "execute",
            StageId::Upload => "upload",
            StageId::ErrorReport => "error_report",
        }
    }

    pub fn parse(value: &str) -> Result<StageId, RegistryError> {
        StageId::ALL
            .into_iter()
            .find(|id| id.as_str() == value)
            .ok_or_else(|| RegistryError::UnknownStage(value.to_string()))
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the job pipeline.
///
/// Stages keep no job data between calls; everything a job needs travels
/// in the [`JobContext`].
#[async_trait]
pub trait Stage: Send + Sync {
    fn stage_id(&self) -> StageId;

    /// Implementation name, as bound in the configuration.
    fn name(&self) -> &str;

    /// Called once at worker startup.
    async fn setup(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Called once at worker shutdown.
    async fn teardown(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError>;
}

/// Shared services handed to stage constructors.
#[derive(Clone)]
pub struct StageDeps {
    pub config: Arc<Config>,
    pub cache: Arc<ArtifactCache>,
    pub gateway: Arc<dyn Gateway>,
    pub runner: Arc<dyn CommandRunner>,
}

/// Implementation names available per stage slot.
pub const IMPLEMENTATIONS: [(StageId, &[&str]); 6] = [
    (StageId::Download, &["apigw"]),
    (StageId::Build, &["venv", "docker", "kubectl-pod", "kubectl-job", "noop"]),
    (StageId::ValidateInput, &["jsonschema", "noop"]),
    (StageId::Execute, &["venv", "docker", "kubectl-pod", "kubectl-job"]),
    (StageId::Upload, &["apigw", "noop"]),
    (StageId::ErrorReport, &["apigw", "log"]),
];

/// Instantiates the implementation `name` for the slot `id`.
pub fn create_stage(
    id: StageId,
    name: &str,
    deps: &StageDeps,
) -> Result<Box<dyn Stage>, RegistryError> {
    let unknown = || RegistryError::UnknownImplementation {
        stage: id.to_string(),
        name: name.to_string(),
    };
    let stage: Box<dyn Stage> = match (id, name) {
        (StageId::Download, "apigw") => Box::new(DownloadStage::new(
            name,
            deps.cache.clone(),
            deps.gateway.clone(),
        )),

        (StageId::Build, "noop")
        | (StageId::ValidateInput, "noop")
        | (StageId::Upload, "noop") => Box::new(NoopStage::new(id)),

        (StageId::Build, _) => {
            let backend = backend::create(name, deps).ok_or_else(unknown)?;
            Box::new(BuildStage::new(name, backend, deps.cache.clone()))
        }

        (StageId::ValidateInput, "jsonschema") => Box::new(ValidateInputStage::new(name)),

        (StageId::Execute, _) => {
            let backend = backend::create(name, deps).ok_or_else(unknown)?;
            Box::new(ExecuteStage::new(name, backend))
        }

        (StageId::Upload, "apigw") => Box::new(UploadStage::new(name, deps.gateway.clone())),

        (StageId::ErrorReport, "apigw") => {
            Box::new(ErrorReportStage::new(name, deps.gateway.clone()))
        }

        (StageId::ErrorReport, "log") => Box::new(LogReportStage::new(name)),

        _ => return Err(unknown()),
    };
    Ok(stage)
}
