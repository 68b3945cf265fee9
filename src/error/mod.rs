//! Error types for every layer of the crate
//!
//! Registry and transport failures start life as [`RegistryError`] and are
//! turned into a [`ClassifiedError`] by [`handlers::classify`] before they reach
//! a caller. The remaining enums describe failures that happen before or around
//! registry traffic: bad references, credential setup, tag resolution, transfers
//! and local archives.

pub mod handlers;

pub use handlers::{ClassifiedError, ErrorKind, classify};

use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category of a transport level failure, taken from the HTTP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Connect,
    Timeout,
    Body,
    Other,
}

/// Low-level failure reported by the registry client
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request to {url} failed: {message}")]
    Transport {
        url: String,
        message: String,
        kind: TransportKind,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("invalid registry response: {0}")]
    InvalidResponse(String),

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportKind::Timeout
        } else if err.is_connect() {
            TransportKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportKind::Body
        } else {
            TransportKind::Other
        };

        RegistryError::Transport {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            message: error_chain(&err),
            kind,
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::InvalidResponse(err.to_string())
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::InvalidResponse(format!("invalid URL: {}", err))
    }
}

/// Render an error together with all of its sources.
///
/// reqwest only prints the outermost layer ("error sending request"), while the
/// interesting part ("Connection refused", "dns error") sits further down.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Image reference or filter pattern could not be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,

    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid filter pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("invalid platform '{platform}': expected os/arch[/variant]")]
    Platform { platform: String },
}

impl ParseError {
    pub(crate) fn reference(reference: &str, reason: impl Into<String>) -> Self {
        ParseError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

/// Registry credentials could not be obtained from the cluster
#[derive(Debug, Error)]
pub enum AuthSetupError {
    #[error("unable to reach the Kubernetes cluster: {0}")]
    ClusterUnavailable(String),

    #[error("failed to read secret {namespace}/{name}: {reason}")]
    SecretUnavailable {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("secret {namespace}/{name} has no .dockerconfigjson or .dockercfg entry")]
    MissingDockerConfig { namespace: String, name: String },

    #[error("secret {namespace}/{name} holds an invalid docker config: {reason}")]
    InvalidDockerConfig {
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Tag listing failed
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("no tags found in repository {0}")]
    EmptyRepository(String),

    #[error(transparent)]
    Registry(#[from] ClassifiedError),
}

/// Copying content between two registry endpoints failed
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source and destination are the same image: {0}")]
    IdenticalEndpoints(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{reference} is neither an image nor an image index (media type '{media_type}')")]
    UnrecognizedContent {
        reference: String,
        media_type: String,
    },

    #[error(transparent)]
    Registry(#[from] ClassifiedError),
}

impl TransferError {
    /// Classification of the underlying registry failure, if any
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TransferError::Registry(err) => Some(err.kind),
            _ => None,
        }
    }
}

/// Reading or writing a local image archive failed
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid image archive {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("{reference} has no manifest for platform {platform}")]
    PlatformNotFound { reference: String, platform: String },

    #[error("{reference} is not a pullable image (media type '{media_type}')")]
    UnsupportedContent {
        reference: String,
        media_type: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Registry(#[from] ClassifiedError),
}

impl ArchiveError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ArchiveError::Io { path, source }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ArchiveError::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error returned by the command runner
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    AuthSetup(#[from] AuthSetupError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Registry(#[from] ClassifiedError),

    #[error("invalid arguments: {0}")]
    Validation(String),
}
