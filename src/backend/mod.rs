//! Execution backends: prepare an environment for an algorithm and run its
//! launcher against the job's model and data.
//!
//! All backends share the launcher contract implemented here: the argument
//! vector, the progress relay reading the launcher's stdout, and the
//! location where the result bundle ends up.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::JobContext;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::stage::StageDeps;

mod cluster;
mod container;
mod venv;

pub use cluster::{ClusterBackend, ClusterMode};
pub use container::ContainerBackend;
pub use venv::VenvBackend;

/// Mount point of the cache root inside containers and pods.
pub const DATA_MOUNT: &str = "/app/data";
/// Mount point of the bundle output directory inside containers.
pub const OUTPUT_MOUNT: &str = "/app/output";
/// Location of the plugin inside algorithm images.
pub const ALGORITHM_MOUNT: &str = "/app/algorithm";

const BUNDLE_NAME: &str = "output.zip";

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks that the tooling this backend drives is available.
    async fn setup(&self) -> Result<(), StageError>;

    /// Installs the algorithm and its dependencies.
    async fn prepare(&self, ctx: &JobContext) -> Result<(), StageError>;

    /// Runs the launcher and returns the path of the produced bundle, which
    /// lives under the algorithm's cache directory.
    async fn run(&self, ctx: &JobContext) -> Result<PathBuf, StageError>;
}

/// Instantiates the backend registered as `name`.
pub fn create(name: &str, deps: &StageDeps) -> Option<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match name {
        "venv" => Arc::new(VenvBackend::new(deps)),
        "docker" => Arc::new(ContainerBackend::new(deps)),
        "kubectl-pod" => Arc::new(ClusterBackend::new(ClusterMode::Pod, deps)),
        "kubectl-job" => Arc::new(ClusterBackend::new(ClusterMode::Job, deps)),
        _ => return None,
    };
    Some(backend)
}

/// Paths handed to the launcher, as seen from where it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPaths {
    pub algo: PathBuf,
    pub data: PathBuf,
    pub model: PathBuf,
    pub ground_truth: Option<PathBuf>,
    pub output_zip: Option<PathBuf>,
}

impl LaunchPaths {
    /// Host-side paths resolved by the download stage.
    pub fn from_context(ctx: &JobContext) -> Result<LaunchPaths, StageError> {
        let missing = |what: &str| StageError::Internal(format!("{what} is not resolved"));
        Ok(LaunchPaths {
            algo: ctx.require_algorithm_path()?.to_path_buf(),
            data: ctx.data_path().ok_or_else(|| missing("data path"))?.to_path_buf(),
            model: ctx.model_path().ok_or_else(|| missing("model path"))?.to_path_buf(),
            ground_truth: ctx.ground_truth_path().map(Path::to_path_buf),
            output_zip: None,
        })
    }

    /// Same paths with the data files moved under another root.
    pub fn remap(&self, map: &PathMap) -> LaunchPaths {
        LaunchPaths {
            algo: self.algo.clone(),
            data: map.map(&self.data),
            model: map.map(&self.model),
            ground_truth: self.ground_truth.as_deref().map(|p| map.map(p)),
            output_zip: self.output_zip.clone(),
        }
    }

    pub fn with_algo(mut self, algo: impl Into<PathBuf>) -> LaunchPaths {
        self.algo = algo.into();
        self
    }

    pub fn with_output(mut self, output_zip: impl Into<PathBuf>) -> LaunchPaths {
        self.output_zip = Some(output_zip.into());
        self
    }
}

/// Options of the launcher invocation that do not come from the job.
#[derive(Debug, Clone)]
pub struct LaunchOptions<'a> {
    pub apigw_url: &'a str,
    pub upload_inline: bool,
}

/// Builds the launcher argument vector, identical across backends.
pub fn launcher_args(
    ctx: &JobContext,
    paths: &LaunchPaths,
    algorithm_args: &Map<String, Value>,
    options: &LaunchOptions<'_>,
) -> Vec<String> {
    let job = &ctx.job;
    let mut args = vec![
        "--test_run_id".to_string(),
        job.job_id.clone(),
        "--algo_path".to_string(),
        path_arg(&paths.algo),
        "--data_path".to_string(),
        path_arg(&paths.data),
        "--model_path".to_string(),
        path_arg(&paths.model),
        "--model_type".to_string(),
        job.model_type.to_lowercase(),
        "--algorithm_args".to_string(),
        Value::Object(algorithm_args.clone()).to_string(),
        "--apigw_url".to_string(),
        options.apigw_url.to_string(),
    ];
    if let (Some(path), Some(column)) = (&paths.ground_truth, &job.ground_truth) {
        args.push("--ground_truth_path".to_string());
        args.push(path_arg(path));
        args.push("--ground_truth".to_string());
        args.push(column.clone());
    }
    if let Some(output) = &paths.output_zip {
        args.push("--output_zip".to_string());
        args.push(path_arg(output));
    }
    if options.upload_inline {
        args.push("--upload_output_to_apigw".to_string());
    }
    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Maps paths under a host directory onto a mount point.
#[derive(Debug, Clone)]
pub struct PathMap {
    host: PathBuf,
    mount: PathBuf,
}

impl PathMap {
    pub fn new(host: impl Into<PathBuf>, mount: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            mount: mount.into(),
        }
    }

    /// `path` re-rooted under the mount point; paths outside the host
    /// directory are returned unchanged.
    pub fn map(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.host) {
            Ok(rel) => self.mount.join(rel),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Copy of `args` with every string naming a host path rewritten.
    pub fn rewrite_args(&self, args: &Map<String, Value>) -> Map<String, Value> {
        let mut args = args.clone();
        for value in args.values_mut() {
            self.rewrite_value(value);
        }
        args
    }

    fn rewrite_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                let path = Path::new(s.as_str());
                if path.is_absolute() && path.starts_with(&self.host) {
                    *s = path_arg(&self.map(path));
                }
            }

            Value::Array(items) => items.iter_mut().for_each(|v| self.rewrite_value(v)),

            Value::Object(map) => map.values_mut().for_each(|v| self.rewrite_value(v)),

            _ => {}
        }
    }

    /// Host paths referenced by string values of `args`.
    pub fn host_paths(&self, args: &Map<String, Value>) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for value in args.values() {
            collect_host_paths(&self.host, value, &mut found);
        }
        found
    }
}

fn collect_host_paths(host: &Path, value: &Value, found: &mut Vec<PathBuf>) {
    match value {
        Value::String(s) => {
            let path = PathBuf::from(s);
            if path.is_absolute() && path.starts_with(host) && !found.contains(&path) {
                found.push(path);
            }
        }

        Value::Array(items) => items.iter().for_each(|v| collect_host_paths(host, v, found)),

        Value::Object(map) => map.values().for_each(|v| collect_host_paths(host, v, found)),

        _ => {}
    }
}

/// Where the bundle of `job_id` is kept: `{algo}/output/{job_id}/output.zip`.
pub fn bundle_location(algorithm_path: &Path, job_id: &str) -> PathBuf {
    algorithm_path
        .join("output")
        .join(safe_component(job_id))
        .join(BUNDLE_NAME)
}

// job ids are opaque; keep them from escaping the output directory
pub(crate) fn safe_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

/// Extracts the percentage of a launcher progress line,
/// `{"type": "progress", "percent": N}`.
pub fn parse_progress(line: &str) -> Option<u8> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let message: Value = serde_json::from_str(line).ok()?;
    if message.get("type")?.as_str()? != "progress" {
        return None;
    }
    let percent = message.get("percent")?.as_f64()?;
    Some(percent.clamp(0.0, 100.0).round() as u8)
}

/// Runs the launcher, relaying its progress lines to the gateway.
///
/// A non-zero exit is an execution failure carrying the stderr tail.
pub async fn run_launcher(
    runner: &dyn CommandRunner,
    gateway: &Arc<dyn Gateway>,
    job_id: &str,
    spec: &CommandSpec,
) -> Result<CommandOutput, StageError> {
    info!("Launching `{}` for job `{job_id}`.", spec.program);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let relay_gateway = gateway.clone();
    let relay_job = job_id.to_string();
    let relay = tokio::spawn(async move {
        let mut last = None;
        while let Some(line) = rx.recv().await {
            match parse_progress(&line) {
                Some(percent) if last != Some(percent) => {
                    relay_gateway.patch_progress(&relay_job, percent).await;
                    last = Some(percent);
                }

                Some(_) => {}

                None => debug!("[{relay_job}] {line}"),
            }
        }
    });
    let result = runner.run(spec, Some(tx)).await;
    // the sender is gone once `run` returns, so the relay drains and stops
    let _ = relay.await;
    let output = result.map_err(|e| {
        StageError::Execute(format!("failed to start `{}`: {e}", spec.program))
    })?;
    if !output.success() {
        return Err(StageError::Execute(format!(
            "launcher exited with status {}: {}",
            output.status,
            output.stderr_tail()
        )));
    }
    Ok(output)
}

/// Runs a tool command to completion; a spawn failure or non-zero exit is
/// returned as a message for the caller to wrap.
pub(crate) async fn run_tool(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, String> {
    let output = runner
        .run(spec, None)
        .await
        .map_err(|e| format!("failed to start `{}`: {e}", spec.display()))?;
    if output.success() {
        Ok(output)
    } else {
        Err(format!(
            "`{}` exited with status {}: {}",
            spec.display(),
            output.status,
            output.stderr_tail()
        ))
    }
}

/// Checks that `program` can be started.
pub(crate) async fn probe_tool(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> Result<(), StageError> {
    let spec = CommandSpec::new(program).args(args.iter().copied());
    run_tool(runner, &spec)
        .await
        .map(|output| debug!("`{program}` is available: {}", output.stdout.trim()))
        .map_err(|e| StageError::Internal(format!("`{program}` is not usable: {e}")))
}
