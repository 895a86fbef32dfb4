use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Value};

use super::{
    bundle_location, container::copy_bundle, launcher_args, probe_tool, run_launcher, run_tool,
    safe_component, Backend, ContainerBackend, LaunchOptions, LaunchPaths, PathMap,
    ALGORITHM_MOUNT, BUNDLE_NAME, DATA_MOUNT, OUTPUT_MOUNT,
};
use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::JobContext;
use crate::process::{CommandRunner, CommandSpec};
use crate::stage::StageDeps;

const OUTPUTS_DIR: &str = "outputs";
const POD_READY_TIMEOUT: &str = "300s";
const NAME_PREFIX: &str = "testrun-";
// kubernetes object names are DNS labels
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMode {
    /// Sleeping pod; inputs copied in, launcher exec'd, bundle copied out.
    Pod,
    /// Batch job over the shared data volume.
    Job,
}

/// Runs the launcher on a kubernetes cluster.
///
/// Images are built and pushed through the container backend, so a
/// registry the cluster can pull from must be configured.
pub struct ClusterBackend {
    mode: ClusterMode,
    kubectl: String,
    namespace: String,
    pvc: String,
    job_ttl_secs: u64,
    timeout_secs: u64,
    launcher_module: String,
    apigw_url: String,
    upload_inline: bool,
    has_registry: bool,
    data_root: PathBuf,

    images: ContainerBackend,
    runner: Arc<dyn CommandRunner>,
    gateway: Arc<dyn Gateway>,
}

impl ClusterBackend {
    pub fn new(mode: ClusterMode, deps: &StageDeps) -> Self {
        let config = &deps.config;
        Self {
            mode: mode,
            kubectl: config.kubectl.clone(),
            namespace: config.cluster_namespace.clone(),
            pvc: config.cluster_pvc.clone(),
            job_ttl_secs: config.cluster_job_ttl_secs,
            timeout_secs: config.cluster_timeout_secs,
            launcher_module: config.launcher_module.clone(),
            apigw_url: config.cluster_apigw_url().to_string(),
            upload_inline: config.upload_inline,
            has_registry: config.registry.is_some(),
            data_root: deps.cache.root().to_path_buf(),
            images: ContainerBackend::new(deps),
            runner: deps.runner.clone(),
            gateway: deps.gateway.clone(),
        }
    }

    fn kubectl(&self) -> CommandSpec {
        CommandSpec::new(&self.kubectl).args(["-n", self.namespace.as_str()])
    }

    async fn kubectl_ok(&self, spec: CommandSpec) -> Result<(), StageError> {
        run_tool(self.runner.as_ref(), &spec)
            .await
            .map(|_| ())
            .map_err(StageError::Execute)
    }

    async fn run_pod(&self, ctx: &JobContext, image: &str) -> Result<PathBuf, StageError> {
        let name = object_name(ctx.job_id());
        info!("Starting pod `{name}` for job `{}`.", ctx.job_id());
        self.kubectl_ok(
            self.kubectl()
                .args(["run", name.as_str()])
                .arg(format!("--image={image}"))
                .args(["--restart=Never", "--command", "--", "sleep", "infinity"]),
        )
        .await?;

        let result = self.drive_pod(ctx, &name).await;

        // the pod goes away whatever happened inside it
        let delete = self
            .kubectl()
            .args(["delete", "pod", name.as_str(), "--ignore-not-found", "--wait=false"]);
        if let Err(e) = run_tool(self.runner.as_ref(), &delete).await {
            warn!("Failed to delete pod `{name}`: {e}");
        }
        result
    }

    async fn drive_pod(&self, ctx: &JobContext, name: &str) -> Result<PathBuf, StageError> {
        self.kubectl_ok(
            self.kubectl()
                .args(["wait", "--for=condition=Ready"])
                .arg(format!("pod/{name}"))
                .arg(format!("--timeout={POD_READY_TIMEOUT}")),
        )
        .await?;

        let map = PathMap::new(&self.data_root, DATA_MOUNT);
        let host = LaunchPaths::from_context(ctx)?;
        let mut inputs = vec![host.data.clone(), host.model.clone()];
        inputs.extend(host.ground_truth.clone());
        for path in map.host_paths(&ctx.job.algorithm_args) {
            if !inputs.contains(&path) {
                inputs.push(path);
            }
        }

        let mut dirs: Vec<String> = inputs
            .iter()
            .filter_map(|p| map.map(p).parent().map(|d| d.to_string_lossy().into_owned()))
            .collect();
        dirs.push(OUTPUT_MOUNT.to_string());
        dirs.sort();
        dirs.dedup();
        self.kubectl_ok(
            self.kubectl()
                .args(["exec", name, "--", "mkdir", "-p"])
                .args(dirs),
        )
        .await?;

        for input in &inputs {
            self.kubectl_ok(
                self.kubectl()
                    .arg("cp")
                    .arg(input.to_string_lossy())
                    .arg(format!("{name}:{}", map.map(input).display())),
            )
            .await?;
        }

        let in_pod_bundle = Path::new(OUTPUT_MOUNT).join(BUNDLE_NAME);
        let paths = host
            .remap(&map)
            .with_algo(ALGORITHM_MOUNT)
            .with_output(&in_pod_bundle);
        let options = LaunchOptions {
            apigw_url: &self.apigw_url,
            upload_inline: self.upload_inline,
        };
        let args = map.rewrite_args(&ctx.job.algorithm_args);
        let exec = self
            .kubectl()
            .args(["exec", name, "--", "python", "-m", self.launcher_module.as_str()])
            .args(launcher_args(ctx, &paths, &args, &options));
        run_launcher(self.runner.as_ref(), &self.gateway, ctx.job_id(), &exec).await?;

        let output = bundle_location(ctx.require_algorithm_path()?, ctx.job_id());
        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                StageError::Execute(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        self.kubectl_ok(
            self.kubectl()
                .arg("cp")
                .arg(format!("{name}:{}", in_pod_bundle.display()))
                .arg(output.to_string_lossy()),
        )
        .await?;
        Ok(output)
    }

    async fn run_job(&self, ctx: &JobContext, image: &str) -> Result<PathBuf, StageError> {
        let name = object_name(ctx.job_id());
        let map = PathMap::new(&self.data_root, DATA_MOUNT);
        let bundle_name = format!("{}.zip", safe_component(ctx.job_id()));
        let host_bundle = self.data_root.join(OUTPUTS_DIR).join(&bundle_name);
        fs::create_dir_all(self.data_root.join(OUTPUTS_DIR))
            .map_err(|e| StageError::Execute(format!("failed to create outputs directory: {e}")))?;
        if host_bundle.exists() {
            fs::remove_file(&host_bundle)
                .map_err(|e| StageError::Execute(format!("failed to remove stale bundle: {e}")))?;
        }

        let paths = LaunchPaths::from_context(ctx)?
            .remap(&map)
            .with_algo(ALGORITHM_MOUNT)
            .with_output(map.map(&host_bundle));
        let options = LaunchOptions {
            apigw_url: &self.apigw_url,
            upload_inline: self.upload_inline,
        };
        let args = launcher_args(ctx, &paths, &map.rewrite_args(&ctx.job.algorithm_args), &options);
        let manifest = self.job_manifest(&name, image, ctx.job_id(), args);

        // a redelivered job reuses the name, and job specs are immutable
        self.kubectl_ok(
            self.kubectl()
                .args(["delete", "job", name.as_str(), "--ignore-not-found"]),
        )
        .await?;
        info!("Submitting job `{name}` for job `{}`.", ctx.job_id());
        self.kubectl_ok(
            self.kubectl()
                .args(["apply", "-f", "-"])
                .stdin(manifest.to_string()),
        )
        .await?;

        let wait = self
            .kubectl()
            .args(["wait", "--for=condition=complete"])
            .arg(format!("job/{name}"))
            .arg(format!("--timeout={}s", self.timeout_secs));
        if let Err(e) = run_tool(self.runner.as_ref(), &wait).await {
            let logs = self
                .kubectl()
                .args(["logs", "--tail=50"])
                .arg(format!("job/{name}"));
            let tail = match run_tool(self.runner.as_ref(), &logs).await {
                Ok(output) => output.stdout,
                Err(_) => String::new(),
            };
            return Err(StageError::Execute(format!(
                "cluster job `{name}` did not complete: {e}\n{}",
                tail.trim_end()
            )));
        }

        if !host_bundle.is_file() {
            return Err(StageError::Execute(format!(
                "cluster job `{name}` finished without writing {}",
                host_bundle.display()
            )));
        }
        let output = bundle_location(ctx.require_algorithm_path()?, ctx.job_id());
        copy_bundle(&host_bundle, &output)?;
        Ok(output)
    }

    /// Batch job running the launcher image over the shared data volume.
    pub fn job_manifest(&self, name: &str, image: &str, job_id: &str, args: Vec<String>) -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "labels": {
                    "app.kubernetes.io/managed-by": "testrun-worker",
                    "testrun/id": object_label(job_id),
                },
            },
            "spec": {
                "ttlSecondsAfterFinished": self.job_ttl_secs,
                "activeDeadlineSeconds": self.timeout_secs,
                "backoffLimit": 0,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "launcher",
                            "image": image,
                            "args": args,
                            "volumeMounts": [{ "name": "data", "mountPath": DATA_MOUNT }],
                        }],
                        "volumes": [{
                            "name": "data",
                            "persistentVolumeClaim": { "claimName": self.pvc },
                        }],
                    },
                },
            },
        })
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn name(&self) -> &'static str {
        match self.mode {
            ClusterMode::Pod => "kubectl-pod",
            ClusterMode::Job => "kubectl-job",
        }
    }

    async fn setup(&self) -> Result<(), StageError> {
        if !self.has_registry {
            warn!("No REGISTRY configured, the cluster must be able to see locally built images.");
        }
        probe_tool(self.runner.as_ref(), &self.kubectl, &["version", "--client"]).await
    }

    async fn prepare(&self, ctx: &JobContext) -> Result<(), StageError> {
        self.images.prepare(ctx).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<PathBuf, StageError> {
        let image = self.images.image_tag(&ctx.job);
        match self.mode {
            ClusterMode::Pod => self.run_pod(ctx, &image).await,
            ClusterMode::Job => self.run_job(ctx, &image).await,
        }
    }
}

/// `testrun-{job id}` reduced to a valid object name.
pub fn object_name(job_id: &str) -> String {
    let mut name = format!("{NAME_PREFIX}{}", object_label(job_id));
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

fn object_label(value: &str) -> String {
    let label: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    let label = &label[..label.len().min(MAX_NAME_LEN)];
    label.trim_end_matches('-').to_string()
}
