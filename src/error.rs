//! Error types shared by the worker's subsystems.
//!
//! Each subsystem owns a small error enum; the pipeline folds all of them
//! into [`StageError`], whose [`FailureKind`] decides how a failure is
//! reported. Application plumbing (startup, CLI) uses `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Whether a failure could succeed if re-driven.
///
/// The orchestrator does not retry stages, so both kinds currently end the
/// job; the distinction is kept for logging and for retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Errors raised by the artifact cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache entry name `{0}`")]
    InvalidName(String),

    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt archive {path}: {message}")]
    CorruptArchive { path: PathBuf, message: String },

    #[error("failed to lock cache entry {key}: {source}")]
    Lock {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source: source,
        }
    }
}

/// Errors raised by the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("gateway I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid gateway url `{0}`")]
    InvalidUrl(String),
}

impl GatewayError {
    /// 5xx responses and connection-level faults are transient; everything
    /// else (4xx, local I/O, malformed urls) is permanent.
    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::Status { status, .. } if *status >= 500 => FailureKind::Transient,
            GatewayError::Network { .. } => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised by the stream consumer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unexpected stream reply: {0}")]
    Protocol(String),
}

/// Failure of a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("failed to download {resource}: {source}")]
    Download {
        resource: String,
        #[source]
        source: GatewayError,
    },

    #[error("artifact cache failure: {0}")]
    Cache(#[from] CacheError),

    #[error("build failed: {0}")]
    Build(String),

    #[error("input validation failed: {0}")]
    InvalidInput(String),

    #[error("execution failed: {0}")]
    Execute(String),

    #[error("upload failed: {source}")]
    Upload {
        #[source]
        source: GatewayError,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Download { source, .. } => source.kind(),
            _ => FailureKind::Permanent,
        }
    }
}

/// Errors raised while binding stage implementations at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no `{name}` implementation registered for stage `{stage}`")]
    UnknownImplementation { stage: String, name: String },

    #[error("unknown stage id `{0}`")]
    UnknownStage(String),

    #[error("no implementation bound to stage `{0}`")]
    MissingStage(String),

    #[error("stage `{0}` is bound more than once")]
    DuplicateStage(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },

    #[error("home directory is not available, set DATA_DIR")]
    NoHomeDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_kinds() {
        let server = GatewayError::Status {
            url: "http://gw/x".into(),
            status: 503,
        };
        let missing = GatewayError::Status {
            url: "http://gw/x".into(),
            status: 404,
        };
        let reset = GatewayError::Network {
            url: "http://gw/x".into(),
            message: "connection reset".into(),
        };
        assert_eq!(server.kind(), FailureKind::Transient);
        assert_eq!(missing.kind(), FailureKind::Permanent);
        assert_eq!(reset.kind(), FailureKind::Transient);
        assert_eq!(missing.status(), Some(404));
    }

    #[test]
    fn test_stage_error_kind_follows_download_source() {
        let err = StageError::Download {
            resource: "/storage/models/m.sav".into(),
            source: GatewayError::Status {
                url: "http://gw/storage/models/m.sav".into(),
                status: 502,
            },
        };
        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(
            StageError::Build("pip failed".into()).kind(),
            FailureKind::Permanent
        );
    }
}
