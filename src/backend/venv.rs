use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use async_trait::async_trait;
use log::{debug, info};

use super::{
    bundle_location, launcher_args, probe_tool, run_launcher, run_tool, Backend, LaunchOptions,
    LaunchPaths,
};
use crate::algorithm;
use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::JobContext;
use crate::process::{CommandRunner, CommandSpec};
use crate::stage::StageDeps;

const VENV_DIR: &str = ".venv";
const MARKER_FILE: &str = ".algorithm-hash";
const UNVERSIONED: &str = "unversioned";

/// Runs the launcher from a virtualenv kept inside the algorithm's cache
/// directory.
pub struct VenvBackend {
    python: String,
    launcher_module: String,
    launcher_package: Option<String>,
    apigw_url: String,
    upload_inline: bool,

    runner: Arc<dyn CommandRunner>,
    gateway: Arc<dyn Gateway>,
}

impl VenvBackend {
    pub fn new(deps: &StageDeps) -> Self {
        let config = &deps.config;
        Self {
            python: config.python.clone(),
            launcher_module: config.launcher_module.clone(),
            launcher_package: config.launcher_package.clone(),
            apigw_url: config.apigw_url.clone(),
            upload_inline: config.upload_inline,
            runner: deps.runner.clone(),
            gateway: deps.gateway.clone(),
        }
    }

    fn interpreter(algorithm_path: &Path) -> PathBuf {
        algorithm_path.join(VENV_DIR).join("bin").join("python")
    }

    // true when the venv was built for this version of the algorithm
    fn is_current(algorithm_path: &Path, version: &str) -> bool {
        let marker = algorithm_path.join(VENV_DIR).join(MARKER_FILE);
        Self::interpreter(algorithm_path).is_file()
            && fs::read_to_string(marker)
                .map(|stored| stored.trim() == version)
                .unwrap_or(false)
    }

    async fn install(&self, algorithm_path: &Path, version: &str) -> Result<(), StageError> {
        let venv = algorithm_path.join(VENV_DIR);
        if venv.exists() {
            fs::remove_dir_all(&venv)
                .map_err(|e| StageError::Build(format!("failed to remove stale venv: {e}")))?;
        }
        let create = CommandSpec::new(&self.python)
            .args(["-m", "venv"])
            .arg(venv.to_string_lossy());
        run_tool(self.runner.as_ref(), &create)
            .await
            .map_err(StageError::Build)?;

        let python = Self::interpreter(algorithm_path);
        let plugin_root = algorithm::plugin_root(algorithm_path);
        let install = CommandSpec::new(python.to_string_lossy())
            .args(["-m", "pip", "install", "--no-input", "-e"])
            .arg(plugin_root.to_string_lossy())
            .cwd(&plugin_root);
        run_tool(self.runner.as_ref(), &install)
            .await
            .map_err(StageError::Build)?;

        if let Some(package) = &self.launcher_package {
            let launcher = CommandSpec::new(python.to_string_lossy())
                .args(["-m", "pip", "install", "--no-input"])
                .arg(package);
            run_tool(self.runner.as_ref(), &launcher)
                .await
                .map_err(StageError::Build)?;
        }

        fs::write(venv.join(MARKER_FILE), version)
            .map_err(|e| StageError::Build(format!("failed to write venv marker: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for VenvBackend {
    fn name(&self) -> &'static str {
        "venv"
    }

    async fn setup(&self) -> Result<(), StageError> {
        probe_tool(self.runner.as_ref(), &self.python, &["--version"]).await
    }

    async fn prepare(&self, ctx: &JobContext) -> Result<(), StageError> {
        let algorithm_path = ctx.require_algorithm_path()?;
        let version = ctx.job.algorithm_hash.as_deref().unwrap_or(UNVERSIONED);
        if Self::is_current(algorithm_path, version) {
            debug!("Venv of `{}` is up to date.", ctx.job.algorithm_key());
            return Ok(());
        }
        info!("Creating venv for `{}`.", ctx.job.algorithm_key());
        self.install(algorithm_path, version).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<PathBuf, StageError> {
        let algorithm_path = ctx.require_algorithm_path()?;
        // a cache hit skips the build stage, but the venv may belong to another backend's run
        if !Self::interpreter(algorithm_path).is_file() {
            self.prepare(ctx).await?;
        }
        let output = bundle_location(algorithm_path, ctx.job_id());
        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| StageError::Execute(format!("failed to create {}: {e}", dir.display())))?;
        }
        if output.exists() {
            fs::remove_file(&output)
                .map_err(|e| StageError::Execute(format!("failed to remove stale bundle: {e}")))?;
        }

        let paths = LaunchPaths::from_context(ctx)?.with_output(&output);
        let options = LaunchOptions {
            apigw_url: &self.apigw_url,
            upload_inline: self.upload_inline,
        };
        let plugin_root = algorithm::plugin_root(algorithm_path);
        let spec = CommandSpec::new(Self::interpreter(algorithm_path).to_string_lossy())
            .args(["-m", self.launcher_module.as_str()])
            .args(launcher_args(ctx, &paths, &ctx.job.algorithm_args, &options))
            .cwd(plugin_root);
        run_launcher(self.runner.as_ref(), &self.gateway, ctx.job_id(), &spec).await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::job;
    use crate::process::CommandOutput;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // records commands; `python -m venv DIR` creates DIR/bin/python
    #[derive(Default)]
    struct FakePython {
        calls: Mutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for FakePython {
        async fn run(
            &self,
            spec: &CommandSpec,
            lines: Option<mpsc::UnboundedSender<String>>,
        ) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            if spec.args.get(1).map(String::as_str) == Some("venv") {
                let bin = PathBuf::from(&spec.args[2]).join("bin");
                fs::create_dir_all(&bin)?;
                fs::write(bin.join("python"), "")?;
            }
            if let Some(tx) = lines {
                tx.send(r#"{"type":"progress","percent":50}"#.to_string()).ok();
            }
            Ok(CommandOutput::default())
        }
    }

    fn backend(runner: Arc<FakePython>) -> VenvBackend {
        let dir = tempfile::tempdir().unwrap();
        let mut deps = crate::stage::tests::deps(dir.path());
        deps.runner = runner;
        VenvBackend::new(&deps)
    }

    fn context_at(algo: &Path) -> JobContext {
        let mut ctx = JobContext::new(job(json!({})));
        ctx.set_algorithm_path(algo.to_path_buf()).unwrap();
        ctx.set_data_path(algo.join("d.csv")).unwrap();
        ctx.set_model_path(algo.join("m.sav")).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_prepare_creates_venv_once() {
        let algo = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let backend = backend(runner.clone());
        let ctx = context_at(algo.path());

        backend.prepare(&ctx).await.unwrap();
        let first = runner.calls.lock().unwrap().len();
        assert_eq!(first, 2);
        assert_eq!(
            fs::read_to_string(algo.path().join(VENV_DIR).join(MARKER_FILE)).unwrap(),
            "H1"
        );

        backend.prepare(&ctx).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap().len(), first);
    }

    #[tokio::test]
    async fn test_new_version_rebuilds_venv() {
        let algo = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let backend = backend(runner.clone());
        let mut ctx = context_at(algo.path());
        backend.prepare(&ctx).await.unwrap();

        ctx.job.algorithm_hash = Some("H2".into());
        backend.prepare(&ctx).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_run_invokes_launcher_module() {
        let algo = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakePython::default());
        let backend = backend(runner.clone());
        let ctx = context_at(algo.path());

        let output = backend.run(&ctx).await.unwrap();
        assert_eq!(output, algo.path().join("output/j1/output.zip"));
        let calls = runner.calls.lock().unwrap();
        let launch = calls.last().unwrap();
        assert!(launch.program.ends_with(".venv/bin/python"));
        assert_eq!(launch.args[..2], ["-m".to_string(), "algo_launcher".to_string()]);
        assert!(launch.args.contains(&"--output_zip".to_string()));
    }
}
