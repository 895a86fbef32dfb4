//! Client for the control-plane API gateway.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use reqwest::{header::CONTENT_DISPOSITION, multipart, Client, StatusCode};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::error::{FailureKind, GatewayError};

const FALLBACK_FILENAME: &str = "download";
const BACKOFF_BASE_MS: u64 = 500;

/// A downloaded resource living in its own temporary directory.
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct FetchedFile {
    _dir: TempDir,
    path: PathBuf,
}

impl FetchedFile {
    pub fn new(dir: TempDir, filename: &str) -> Self {
        let path = dir.path().join(filename);
        Self { _dir: dir, path: path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Operations the worker performs against the gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Downloads `resource` (a path relative to the gateway base url).
    async fn fetch(&self, resource: &str) -> Result<FetchedFile, GatewayError>;

    /// Reports progress; failures are logged, never returned.
    async fn patch_progress(&self, job_id: &str, percent: u8);

    /// Marks the test run as failed; failures are logged, never returned.
    async fn patch_error(&self, job_id: &str, message: &str);

    async fn upload_bundle(&self, bundle: &Path) -> Result<(), GatewayError>;
}

/// Gateway resource of an algorithm bundle.
pub fn algorithm_resource(gid: &str, cid: &str) -> String {
    format!("/plugins/{gid}/algorithms/{cid}")
}

pub fn model_resource(filename: &str) -> String {
    format!("/storage/models/{filename}")
}

pub fn dataset_resource(filename: &str) -> String {
    format!("/storage/datasets/{filename}")
}

pub struct HttpGateway {
    client: Client,
    base_url: String,
    fetch_retries: u32,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration, fetch_retries: u32) -> Result<Self, GatewayError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Network {
                url: base_url.to_string(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            client: client,
            base_url: base_url.trim_end_matches('/').to_string(),
            fetch_retries: fetch_retries,
        })
    }

    pub fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedFile, GatewayError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| url_filename(url));
        let fetched = FetchedFile::new(tempfile::tempdir()?, &filename);
        let mut file = tokio::fs::File::create(fetched.path()).await?;
        while let Some(chunk) = response.chunk().await.map_err(|e| network_error(url, e))? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!("Fetched `{url}` into `{}`", fetched.path().display());
        Ok(fetched)
    }

    async fn patch_test_run(&self, job_id: &str, body: serde_json::Value) -> Result<(), GatewayError> {
        let url = self.url(&format!("/test_runs/{job_id}"));
        let response = self
            .client
            .patch(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        check_status(&url, response.status())
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch(&self, resource: &str) -> Result<FetchedFile, GatewayError> {
        let url = self.url(resource);
        let mut attempt = 0;
        loop {
            match self.fetch_once(&url).await {
                Err(e) if e.kind() == FailureKind::Transient && attempt < self.fetch_retries => {
                    let delay = backoff(attempt);
                    warn!("Fetch of `{url}` failed ({e}), retrying in {delay:?}.");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn patch_progress(&self, job_id: &str, percent: u8) {
        if let Err(e) = self
            .patch_test_run(job_id, json!({ "progress": percent.min(100) }))
            .await
        {
            warn!("Failed to report progress for `{job_id}`: {e}");
        }
    }

    async fn patch_error(&self, job_id: &str, message: &str) {
        if let Err(e) = self
            .patch_test_run(
                job_id,
                json!({ "status": "error", "errorMessages": message }),
            )
            .await
        {
            warn!("Failed to report error for `{job_id}`: {e}");
        }
    }

    async fn upload_bundle(&self, bundle: &Path) -> Result<(), GatewayError> {
        let url = self.url("/test_results/upload_zip");
        let bytes = tokio::fs::read(bundle).await?;
        let filename = bundle
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.zip".to_string());
        let part = multipart::Part::bytes(bytes)
            .file_name(filename)
            .mime_str("application/zip")
            .map_err(|e| network_error(&url, e))?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        check_status(&url, response.status())
    }
}

fn network_error(url: &str, e: reqwest::Error) -> GatewayError {
    GatewayError::Network {
        url: url.to_string(),
        message: e.to_string(),
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), GatewayError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(GatewayError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

// exponential backoff with up to 50% jitter
fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Filename carried by a `Content-Disposition` header, reduced to its base
/// name. `filename*` (RFC 5987) wins over `filename`.
pub fn disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'lang'percent-encoded
                let encoded = value.rsplit('\'').next().unwrap_or(value);
                extended = Some(percent_decode(encoded));
            }
            "filename" => plain = Some(value.to_string()),
            _ => {}
        }
    }
    extended.or(plain).and_then(|name| sanitize_filename(&name))
}

/// Last non-empty path segment of `url`, ignoring query and fragment.
pub fn url_filename(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let segment = path
        .split('/')
        .skip(1)
        .filter(|s| !s.is_empty())
        .last()
        .map(percent_decode);
    segment
        .and_then(|s| sanitize_filename(&s))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]));
            if let (Some(high), Some(low)) = hex {
                out.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}
