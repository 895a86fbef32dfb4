//! Worker configuration.
//!
//! Values come from built-in defaults, then an optional TOML file, then the
//! environment; later sources win.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::stage::StageId;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageBindings {
    pub download: String,
    pub build: String,
    pub validate_input: String,
    pub execute: String,
    pub upload: String,
    pub error_report: String,
}

impl Default for StageBindings {
    fn default() -> Self {
        Self {
            download: "apigw".to_string(),
            build: "venv".to_string(),
            validate_input: "jsonschema".to_string(),
            execute: "venv".to_string(),
            upload: "apigw".to_string(),
            error_report: "apigw".to_string(),
        }
    }
}

impl StageBindings {
    pub fn get(&self, id: StageId) -> &str {
        match id {
            StageId::Download => &self.download,
            StageId::Build => &self.build,
            StageId::ValidateInput => &self.validate_input,
            StageId::Execute => &self.execute,
            StageId::Upload => &self.upload,
            StageId::ErrorReport => &self.error_report,
        }
    }

    fn slot(&mut self, id: StageId) -> &mut String {
        match id {
            StageId::Download => &mut self.download,
            StageId::Build => &mut self.build,
            StageId::ValidateInput => &mut self.validate_input,
            StageId::Execute => &mut self.execute,
            StageId::Upload => &mut self.upload,
            StageId::ErrorReport => &mut self.error_report,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // broker
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_password: Option<String>,
    pub broker_db: u32,
    pub stream_name: String,
    pub group_name: String,
    pub claim_block_ms: u64,
    pub claim_batch: usize,
    // pending entries idle longer than this are taken over, disabled if unset
    pub reclaim_idle_secs: Option<u64>,

    // cache root
    pub data_dir: Option<PathBuf>,

    // gateway, as seen from the host, a container and a pod
    pub apigw_url: String,
    pub container_apigw_url: Option<String>,
    pub cluster_apigw_url: Option<String>,
    pub http_timeout_secs: u64,
    pub fetch_retries: u32,

    // tools
    pub docker: String,
    pub kubectl: String,
    pub python: String,

    // container images
    pub base_image: String,
    pub registry: Option<String>,

    // launcher
    pub launcher_module: String,
    pub launcher_package: Option<String>,
    pub upload_inline: bool,

    // cluster
    pub cluster_namespace: String,
    pub cluster_pvc: String,
    pub cluster_job_ttl_secs: u64,
    pub cluster_timeout_secs: u64,

    pub stages: StageBindings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 6379,
            broker_password: None,
            broker_db: 0,
            stream_name: "test_runs".to_string(),
            group_name: "test_run_workers".to_string(),
            claim_block_ms: 3000,
            claim_batch: 1,
            reclaim_idle_secs: None,
            data_dir: None,
            apigw_url: "http://127.0.0.1:4000".to_string(),
            container_apigw_url: None,
            cluster_apigw_url: None,
            http_timeout_secs: 300,
            fetch_retries: 2,
            docker: "docker".to_string(),
            kubectl: "kubectl".to_string(),
            python: "python3".to_string(),
            base_image: "python:3.11-slim".to_string(),
            registry: None,
            launcher_module: "algo_launcher".to_string(),
            launcher_package: None,
            upload_inline: false,
            cluster_namespace: "default".to_string(),
            cluster_pvc: "testrun-data".to_string(),
            cluster_job_ttl_secs: 120,
            cluster_timeout_secs: 3600,
            stages: StageBindings::default(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by `file` when given, overlaid by the process
    /// environment.
    pub fn load(file: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source: source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: source,
        })
    }

    /// Overlays variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        };
        set("BROKER_HOST", &mut self.broker_host);
        set("STREAM_NAME", &mut self.stream_name);
        set("GROUP_NAME", &mut self.group_name);
        set("APIGW_URL", &mut self.apigw_url);
        set("DOCKER", &mut self.docker);
        set("KUBECTL", &mut self.kubectl);
        set("PYTHON", &mut self.python);
        set("BASE_IMAGE", &mut self.base_image);
        set("LAUNCHER_MODULE", &mut self.launcher_module);
        set("CLUSTER_NAMESPACE", &mut self.cluster_namespace);
        set("CLUSTER_PVC", &mut self.cluster_pvc);
        for id in StageId::ALL {
            set(&format!("STAGE_{}", id.as_str().to_uppercase()), self.stages.slot(id));
        }

        let optional = |key: &str, slot: &mut Option<String>| {
            if let Some(value) = lookup(key) {
                *slot = if value.is_empty() { None } else { Some(value) };
            }
        };
        optional("BROKER_PASSWORD", &mut self.broker_password);
        optional("CONTAINER_APIGW_URL", &mut self.container_apigw_url);
        optional("CLUSTER_APIGW_URL", &mut self.cluster_apigw_url);
        optional("REGISTRY", &mut self.registry);
        optional("LAUNCHER_PACKAGE", &mut self.launcher_package);
        if let Some(dir) = lookup("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }

        parse_into(&lookup, "BROKER_PORT", &mut self.broker_port)?;
        parse_into(&lookup, "BROKER_DB", &mut self.broker_db)?;
        parse_into(&lookup, "CLAIM_BLOCK_MS", &mut self.claim_block_ms)?;
        parse_into(&lookup, "CLAIM_BATCH", &mut self.claim_batch)?;
        parse_into(&lookup, "HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs)?;
        parse_into(&lookup, "FETCH_RETRIES", &mut self.fetch_retries)?;
        parse_into(&lookup, "CLUSTER_JOB_TTL_SECS", &mut self.cluster_job_ttl_secs)?;
        parse_into(&lookup, "CLUSTER_TIMEOUT_SECS", &mut self.cluster_timeout_secs)?;
        if let Some(value) = lookup("RECLAIM_IDLE_SECS") {
            self.reclaim_idle_secs = if value.is_empty() {
                None
            } else {
                Some(parse_value("RECLAIM_IDLE_SECS", &value)?)
            };
        }
        if let Some(value) = lookup("UPLOAD_INLINE") {
            self.upload_inline = parse_bool("UPLOAD_INLINE", &value)?;
        }
        if self.claim_batch == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CLAIM_BATCH".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Cache root, defaulting to `~/.testrun-worker/data`.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home = home::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".testrun-worker").join("data"))
    }

    /// Redis URL of the broker; the password is percent-encoded.
    pub fn broker_url(&self) -> Result<String, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "BROKER_HOST".to_string(),
            value: self.broker_host.clone(),
        };
        let mut url = Url::parse(&format!(
            "redis://{}:{}/{}",
            self.broker_host, self.broker_port, self.broker_db
        ))
        .map_err(|_| invalid())?;
        if let Some(password) = &self.broker_password {
            url.set_password(Some(password)).map_err(|_| invalid())?;
        }
        Ok(url.to_string())
    }

    pub fn claim_block(&self) -> Duration {
        Duration::from_millis(self.claim_block_ms)
    }

    pub fn reclaim_idle(&self) -> Option<Duration> {
        self.reclaim_idle_secs.map(Duration::from_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn container_apigw_url(&self) -> &str {
        self.container_apigw_url.as_deref().unwrap_or(&self.apigw_url)
    }

    pub fn cluster_apigw_url(&self) -> &str {
        self.cluster_apigw_url.as_deref().unwrap_or(&self.apigw_url)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_into<T, F>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *slot = parse_value(key, &value)?;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.claim_block(), Duration::from_secs(3));
        assert_eq!(config.claim_batch, 1);
        assert_eq!(config.stages.get(StageId::Build), "venv");
        assert_eq!(config.container_apigw_url(), config.apigw_url);
        assert_eq!(config.broker_url().unwrap(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("BROKER_HOST", "redis.internal"),
                ("BROKER_PORT", "6380"),
                ("BROKER_PASSWORD", "secret"),
                ("DATA_DIR", "/var/cache/worker"),
                ("CONTAINER_APIGW_URL", "http://host.docker.internal:4000"),
                ("STAGE_EXECUTE", "docker"),
                ("STAGE_VALIDATE_INPUT", "noop"),
                ("UPLOAD_INLINE", "true"),
                ("RECLAIM_IDLE_SECS", "600"),
            ]))
            .unwrap();
        assert_eq!(
            config.broker_url().unwrap(),
            "redis://:secret@redis.internal:6380/0"
        );
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/var/cache/worker"));
        assert_eq!(config.container_apigw_url(), "http://host.docker.internal:4000");
        assert_eq!(config.cluster_apigw_url(), config.apigw_url);
        assert_eq!(config.stages.get(StageId::Execute), "docker");
        assert_eq!(config.stages.get(StageId::ValidateInput), "noop");
        assert!(config.upload_inline);
        assert_eq!(config.reclaim_idle(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_broker_password_is_escaped() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("BROKER_PASSWORD", "p@ss:w/rd")]))
            .unwrap();
        let url = config.broker_url().unwrap();
        assert_eq!(url, "redis://:p%40ss%3Aw%2Frd@localhost:6379/0");
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("localhost"));
        assert_eq!(parsed.port(), Some(6379));

        config.broker_host = "bad host".to_string();
        assert!(matches!(
            config.broker_url(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("BROKER_PORT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = config.apply_env(env(&[("UPLOAD_INLINE", "perhaps")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        let err = config.apply_env(env(&[("CLAIM_BATCH", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_file_then_env() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(
            &path,
            r#"
stream_name = "jobs"
registry = "registry.local:5000"

[stages]
build = "docker"
execute = "kubectl-pod"
"#,
        )
        .unwrap();
        let mut config = Config::from_file(&path).unwrap();
        assert_eq!(config.stream_name, "jobs");
        assert_eq!(config.group_name, "test_run_workers");
        assert_eq!(config.stages.get(StageId::Execute), "kubectl-pod");
        assert_eq!(config.stages.get(StageId::Upload), "apigw");

        config.apply_env(env(&[("STREAM_NAME", "override")])).unwrap();
        assert_eq!(config.stream_name, "override");
        assert_eq!(config.registry.as_deref(), Some("registry.local:5000"));
    }

    #[test]
    fn test_bad_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        fs::write(&path, "broker_port = \"not a number\"").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
