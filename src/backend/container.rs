use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use async_trait::async_trait;
use log::{debug, info};

use super::{
    bundle_location, launcher_args, probe_tool, run_launcher, run_tool, safe_component, Backend,
    LaunchOptions, LaunchPaths, PathMap, ALGORITHM_MOUNT, BUNDLE_NAME, DATA_MOUNT, OUTPUT_MOUNT,
};
use crate::algorithm;
use crate::error::StageError;
use crate::gateway::Gateway;
use crate::job::{Job, JobContext};
use crate::process::{CommandRunner, CommandSpec};
use crate::stage::StageDeps;

// docker caps tags at 128 characters
const MAX_TAG_LEN: usize = 128;

/// Builds one image per algorithm version and runs the launcher in a
/// throwaway container.
pub struct ContainerBackend {
    docker: String,
    base_image: String,
    registry: Option<String>,
    launcher_module: String,
    launcher_package: Option<String>,
    apigw_url: String,
    upload_inline: bool,
    data_root: PathBuf,

    runner: Arc<dyn CommandRunner>,
    gateway: Arc<dyn Gateway>,
}

impl ContainerBackend {
    pub fn new(deps: &StageDeps) -> Self {
        let config = &deps.config;
        Self {
            docker: config.docker.clone(),
            base_image: config.base_image.clone(),
            registry: config.registry.clone(),
            launcher_module: config.launcher_module.clone(),
            launcher_package: config.launcher_package.clone(),
            apigw_url: config.container_apigw_url().to_string(),
            upload_inline: config.upload_inline,
            data_root: deps.cache.root().to_path_buf(),
            runner: deps.runner.clone(),
            gateway: deps.gateway.clone(),
        }
    }

    /// `{cid}:{hash or latest}`, lowercased, under the registry when one is
    /// configured.
    pub fn image_tag(&self, job: &Job) -> String {
        let version: String = match job.algorithm_hash.as_deref().map(str::trim) {
            Some(hash) if !hash.is_empty() => safe_component(hash).chars().take(MAX_TAG_LEN).collect(),
            _ => "latest".to_string(),
        };
        let image = format!("{}:{version}", safe_component(&job.algorithm_cid)).to_lowercase();
        match &self.registry {
            Some(registry) => format!("{}/{image}", registry.trim_end_matches('/')),
            None => image,
        }
    }

    pub fn dockerfile(&self) -> String {
        let mut install = format!("pip install --no-cache-dir -e {ALGORITHM_MOUNT}");
        if let Some(package) = &self.launcher_package {
            install.push_str(&format!(" && pip install --no-cache-dir {package}"));
        }
        format!(
            "FROM {base}\n\
             WORKDIR {ALGORITHM_MOUNT}\n\
             COPY . {ALGORITHM_MOUNT}\n\
             RUN {install}\n\
             ENTRYPOINT [\"python\", \"-m\", \"{module}\"]\n",
            base = self.base_image,
            module = self.launcher_module,
        )
    }

    async fn succeeds(&self, spec: CommandSpec) -> bool {
        match self.runner.run(&spec, None).await {
            Ok(output) => output.success(),
            Err(e) => {
                debug!("`{}` could not run: {e}", spec.display());
                false
            }
        }
    }

    async fn in_registry(&self, image: &str) -> bool {
        self.registry.is_some()
            && self
                .succeeds(CommandSpec::new(&self.docker).args(["manifest", "inspect", image]))
                .await
    }

    async fn is_local(&self, image: &str) -> bool {
        self.succeeds(CommandSpec::new(&self.docker).args(["image", "inspect", image]))
            .await
    }

    async fn build_image(&self, algorithm_path: &Path, image: &str) -> Result<(), StageError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| StageError::Build(format!("failed to create build directory: {e}")))?;
        let dockerfile = scratch.path().join("Dockerfile");
        fs::write(&dockerfile, self.dockerfile())
            .map_err(|e| StageError::Build(format!("failed to write Dockerfile: {e}")))?;

        let context = algorithm::plugin_root(algorithm_path);
        let build = CommandSpec::new(&self.docker)
            .arg("build")
            .arg("-f")
            .arg(dockerfile.to_string_lossy())
            .args(["-t", image])
            .arg(context.to_string_lossy());
        info!("Building image `{image}`.");
        run_tool(self.runner.as_ref(), &build)
            .await
            .map_err(StageError::Build)?;

        if self.registry.is_some() {
            info!("Pushing image `{image}`.");
            let push = CommandSpec::new(&self.docker).args(["push", image]);
            run_tool(self.runner.as_ref(), &push)
                .await
                .map_err(StageError::Build)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn setup(&self) -> Result<(), StageError> {
        probe_tool(self.runner.as_ref(), &self.docker, &["--version"]).await
    }

    async fn prepare(&self, ctx: &JobContext) -> Result<(), StageError> {
        let image = self.image_tag(&ctx.job);
        if self.in_registry(&image).await {
            info!("Image `{image}` is already published, build skipped.");
            return Ok(());
        }
        self.build_image(ctx.require_algorithm_path()?, &image).await
    }

    async fn run(&self, ctx: &JobContext) -> Result<PathBuf, StageError> {
        let image = self.image_tag(&ctx.job);
        // cache hits skip the build stage; the image may still be missing on this host
        if !self.is_local(&image).await && !self.in_registry(&image).await {
            self.build_image(ctx.require_algorithm_path()?, &image).await?;
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| StageError::Execute(format!("failed to create output directory: {e}")))?;
        let map = PathMap::new(&self.data_root, DATA_MOUNT);
        let paths = LaunchPaths::from_context(ctx)?
            .remap(&map)
            .with_algo(ALGORITHM_MOUNT)
            .with_output(Path::new(OUTPUT_MOUNT).join(BUNDLE_NAME));
        let options = LaunchOptions {
            apigw_url: &self.apigw_url,
            upload_inline: self.upload_inline,
        };
        let args = map.rewrite_args(&ctx.job.algorithm_args);

        let spec = CommandSpec::new(&self.docker)
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:{OUTPUT_MOUNT}", scratch.path().display()))
            .arg("-v")
            .arg(format!("{}:{DATA_MOUNT}:ro", self.data_root.display()))
            .arg(&image)
            .args(launcher_args(ctx, &paths, &args, &options));
        run_launcher(self.runner.as_ref(), &self.gateway, ctx.job_id(), &spec).await?;

        let produced = scratch.path().join(BUNDLE_NAME);
        if !produced.is_file() {
            return Err(StageError::Execute(format!(
                "container exited without writing {OUTPUT_MOUNT}/{BUNDLE_NAME}"
            )));
        }
        let output = bundle_location(ctx.require_algorithm_path()?, ctx.job_id());
        copy_bundle(&produced, &output)?;
        Ok(output)
    }
}

/// Copies a produced bundle to its stable location, replacing any old one.
pub(crate) fn copy_bundle(from: &Path, to: &Path) -> Result<(), StageError> {
    let fail = |e: std::io::Error| {
        StageError::Execute(format!("failed to keep bundle at {}: {e}", to.display()))
    };
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir).map_err(fail)?;
    }
    fs::copy(from, to).map_err(fail)?;
    Ok(())
}
