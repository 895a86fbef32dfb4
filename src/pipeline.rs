//! The per-job stage sequence.
//!
//! ```text
//! download -> build -> validate_input -> execute -> upload
//!                 (any failure) -> error_report
//! ```
//!
//! Build only runs when download installed a fresh algorithm bundle.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
};
use futures::FutureExt;
use log::{debug, info, warn};

use crate::config::StageBindings;
use crate::error::{FailureKind, RegistryError, StageError};
use crate::job::JobContext;
use crate::stage::{create_stage, Stage, StageDeps, StageId};

// order of the stages on the success path
const SEQUENCE: [StageId; 5] = [
    StageId::Download,
    StageId::Build,
    StageId::ValidateInput,
    StageId::Execute,
    StageId::Upload,
];

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,

    Failed {
        // None when the job was rejected before any stage ran
        stage: Option<StageId>,

        kind: FailureKind,

        message: String,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }
}

pub struct Pipeline {
    // indexed like `StageId::ALL`
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Instantiates the implementation bound to every stage slot.
    pub fn from_bindings(bindings: &StageBindings, deps: &StageDeps) -> Result<Pipeline, RegistryError> {
        let stages = StageId::ALL
            .into_iter()
            .map(|id| create_stage(id, bindings.get(id), deps))
            .collect::<Result<Vec<_>, _>>()?;
        Pipeline::from_stages(stages)
    }

    /// Assembles a pipeline from one stage per slot, in any order.
    pub fn from_stages(stages: Vec<Box<dyn Stage>>) -> Result<Pipeline, RegistryError> {
        let mut slots: Vec<Option<Box<dyn Stage>>> = StageId::ALL.iter().map(|_| None).collect();
        for stage in stages {
            let id = stage.stage_id();
            let slot = &mut slots[slot_of(id)];
            if slot.is_some() {
                return Err(RegistryError::DuplicateStage(id.to_string()));
            }
            *slot = Some(stage);
        }
        let stages = slots
            .into_iter()
            .zip(StageId::ALL)
            .map(|(slot, id)| slot.ok_or_else(|| RegistryError::MissingStage(id.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pipeline { stages: stages })
    }

    fn stage(&self, id: StageId) -> &dyn Stage {
        self.stages[slot_of(id)].as_ref()
    }

    pub async fn setup(&mut self) -> Result<(), StageError> {
        for stage in self.stages.iter_mut() {
            info!("Stage `{}` -> `{}`", stage.stage_id(), stage.name());
            stage.setup().await?;
        }
        Ok(())
    }

    pub async fn teardown(&mut self) {
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.teardown().await {
                warn!("Teardown of stage `{}` failed: {e}", stage.stage_id());
            }
        }
    }

    /// Drives one job through the stages.
    ///
    /// The first failure stops the sequence and is reported once through the
    /// error-report stage; stage panics count as failures.
    pub async fn run(&self, ctx: &mut JobContext) -> JobOutcome {
        info!(
            "Processing job `{}`: {:?} mode, algorithm `{}`.",
            ctx.job_id(),
            ctx.job.mode,
            ctx.job.algorithm_key()
        );
        let result = match ctx.job.validate() {
            Ok(()) => self.run_stages(ctx).await,
            Err(e) => Err((None, e)),
        };
        match result {
            Ok(()) => {
                info!("Job `{}` succeeded in {}s.", ctx.job_id(), ctx.elapsed_secs());
                JobOutcome::Succeeded
            }

            Err((stage, e)) => {
                let message = match stage {
                    Some(id) => format!("{id}: {e}"),
                    None => e.to_string(),
                };
                warn!(
                    "Job `{}` failed after {}s ({:?}): {message}",
                    ctx.job_id(),
                    ctx.elapsed_secs(),
                    e.kind()
                );
                ctx.error_message = Some(message.clone());
                self.report(ctx).await;
                JobOutcome::Failed {
                    stage: stage,
                    kind: e.kind(),
                    message: message,
                }
            }
        }
    }

    async fn run_stages(&self, ctx: &mut JobContext) -> Result<(), (Option<StageId>, StageError)> {
        for id in SEQUENCE {
            if id == StageId::Build && !ctx.to_build {
                debug!("Algorithm of job `{}` is cached, build skipped.", ctx.job_id());
                continue;
            }
            run_guarded(self.stage(id), ctx)
                .await
                .map_err(|e| (Some(id), e))?;
        }
        Ok(())
    }

    async fn report(&self, ctx: &mut JobContext) {
        if let Err(e) = run_guarded(self.stage(StageId::ErrorReport), ctx).await {
            warn!("Error report for job `{}` failed: {e}", ctx.job_id());
        }
    }
}

fn slot_of(id: StageId) -> usize {
    StageId::ALL
        .iter()
        .position(|candidate| *candidate == id)
        .unwrap_or_default()
}

// a panicking stage becomes an internal error of that stage
async fn run_guarded(stage: &dyn Stage, ctx: &mut JobContext) -> Result<(), StageError> {
    debug!("Running stage `{}` ({}) for job `{}`.", stage.stage_id(), stage.name(), ctx.job_id());
    match AssertUnwindSafe(stage.execute(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(StageError::Internal(format!(
            "stage `{}` panicked: {}",
            stage.name(),
            panic_message(panic.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::job;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<StageId>>>;

    // records its invocations; optionally fails, panics or flags a fresh install
    struct Probe {
        id: StageId,
        journal: Journal,
        fail: bool,
        panic: bool,
        fresh_install: bool,
    }

    impl Probe {
        fn boxed(id: StageId, journal: &Journal) -> Box<dyn Stage> {
            Box::new(Probe {
                id: id,
                journal: journal.clone(),
                fail: false,
                panic: false,
                fresh_install: false,
            })
        }
    }

    #[async_trait]
    impl Stage for Probe {
        fn stage_id(&self) -> StageId {
            self.id
        }

        fn name(&self) -> &str {
            "probe"
        }

        async fn execute(&self, ctx: &mut JobContext) -> Result<(), StageError> {
            self.journal.lock().unwrap().push(self.id);
            if self.panic {
                panic!("probe exploded");
            }
            if self.fresh_install {
                ctx.to_build = true;
            }
            if self.fail {
                return Err(StageError::InvalidInput("k must be positive".into()));
            }
            Ok(())
        }
    }

    fn pipeline(journal: &Journal, tweak: impl Fn(&mut Probe)) -> Pipeline {
        let stages = StageId::ALL
            .into_iter()
            .map(|id| {
                let mut probe = Probe {
                    id: id,
                    journal: journal.clone(),
                    fail: false,
                    panic: false,
                    fresh_install: false,
                };
                tweak(&mut probe);
                Box::new(probe) as Box<dyn Stage>
            })
            .collect();
        Pipeline::from_stages(stages).unwrap()
    }

    fn recorded(journal: &Journal) -> Vec<StageId> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_cached_algorithm_skips_build() {
        let journal = Journal::default();
        let pipeline = pipeline(&journal, |_| {});
        let mut ctx = JobContext::new(job(json!({})));
        assert!(pipeline.run(&mut ctx).await.is_success());
        assert_eq!(
            recorded(&journal),
            vec![StageId::Download, StageId::ValidateInput, StageId::Execute, StageId::Upload]
        );
    }

    #[tokio::test]
    async fn test_fresh_install_runs_build() {
        let journal = Journal::default();
        let pipeline = pipeline(&journal, |p| p.fresh_install = p.id == StageId::Download);
        let mut ctx = JobContext::new(job(json!({})));
        pipeline.run(&mut ctx).await;
        assert_eq!(recorded(&journal)[..2], [StageId::Download, StageId::Build]);
    }

    #[tokio::test]
    async fn test_failure_reports_once_and_stops() {
        let journal = Journal::default();
        let pipeline = pipeline(&journal, |p| p.fail = p.id == StageId::ValidateInput);
        let mut ctx = JobContext::new(job(json!({})));
        let outcome = pipeline.run(&mut ctx).await;
        assert_eq!(
            recorded(&journal),
            vec![StageId::Download, StageId::ValidateInput, StageId::ErrorReport]
        );
        match outcome {
            JobOutcome::Failed { stage, kind, message } => {
                assert_eq!(stage, Some(StageId::ValidateInput));
                assert_eq!(kind, FailureKind::Permanent);
                assert!(message.starts_with("validate_input: "));
            }
            JobOutcome::Succeeded => panic!("job should have failed"),
        }
        assert!(ctx.error_message.is_some());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let journal = Journal::default();
        let pipeline = pipeline(&journal, |p| p.panic = p.id == StageId::Execute);
        let mut ctx = JobContext::new(job(json!({})));
        let outcome = pipeline.run(&mut ctx).await;
        assert!(!outcome.is_success());
        assert!(ctx.error_message.as_deref().unwrap().contains("probe exploded"));
        assert_eq!(recorded(&journal).last(), Some(&StageId::ErrorReport));
    }

    #[tokio::test]
    async fn test_invalid_job_runs_no_stage_but_report() {
        let journal = Journal::default();
        let pipeline = pipeline(&journal, |_| {});
        let mut job = job(json!({}));
        job.model_file = None;
        let mut ctx = JobContext::new(job);
        let outcome = pipeline.run(&mut ctx).await;
        assert!(matches!(outcome, JobOutcome::Failed { stage: None, .. }));
        assert_eq!(recorded(&journal), vec![StageId::ErrorReport]);
    }

    #[test]
    fn test_assembly_checks_slots() {
        let journal = Journal::default();
        let missing = Pipeline::from_stages(vec![Probe::boxed(StageId::Download, &journal)]);
        assert!(matches!(missing, Err(RegistryError::MissingStage(_))));

        let mut stages: Vec<Box<dyn Stage>> =
            StageId::ALL.into_iter().map(|id| Probe::boxed(id, &journal)).collect();
        stages.push(Probe::boxed(StageId::Upload, &journal));
        assert!(matches!(
            Pipeline::from_stages(stages),
            Err(RegistryError::DuplicateStage(_))
        ));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
