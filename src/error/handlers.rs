//! Classification of registry failures into actionable categories
//!
//! Structured information (HTTP status, transport failure kind) is consulted
//! first. Free-form error text is matched against [`PHRASE_RULES`] as a
//! fallback, which keeps errors from proxies, token servers and wrapped
//! sources classifiable as well.

use crate::error::{RegistryError, TransportKind};
use std::fmt;
use thiserror::Error;

/// Closed set of failure categories surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    NotFound,
    Unreachable,
    Forbidden,
    Other,
}

impl ErrorKind {
    fn summary(self) -> &'static str {
        match self {
            ErrorKind::Auth => "authentication failed",
            ErrorKind::NotFound => "image not found",
            ErrorKind::Unreachable => "registry unreachable",
            ErrorKind::Forbidden => "access forbidden",
            ErrorKind::Other => "registry operation failed",
        }
    }

    /// Remediation hint shown next to the error
    pub fn hint(self) -> Option<&'static str> {
        match self {
            ErrorKind::Auth => Some("Please check your credentials or Kubernetes secret"),
            ErrorKind::NotFound => Some("Please verify the image name and tag are correct"),
            ErrorKind::Unreachable => {
                Some("Please check your network connection and the registry address")
            }
            ErrorKind::Forbidden => {
                Some("The credentials do not have permission to perform this operation")
            }
            ErrorKind::Other => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Substring rules, checked in order against the lowercased error text.
/// The first matching rule wins.
pub const PHRASE_RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Auth,
        &["unauthorized", "authentication required", "denied"],
    ),
    (
        ErrorKind::NotFound,
        &[
            "name_unknown",
            "name unknown",
            "manifest_unknown",
            "manifest unknown",
            "404",
        ],
    ),
    (
        ErrorKind::Unreachable,
        &[
            "dial tcp",
            "no such host",
            "connection refused",
            "i/o timeout",
            "timed out",
            "dns error",
            "failed to lookup address",
            "error trying to connect",
        ],
    ),
    (ErrorKind::Forbidden, &["forbidden"]),
];

/// Registry failure annotated with its category and the operation it broke
#[derive(Debug, Error)]
#[error(
    "{} while {operation}{}: {source}{}",
    .kind.summary(),
    target_suffix(.target),
    hint_suffix(.kind)
)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub operation: String,
    pub target: String,
    #[source]
    pub source: RegistryError,
}

impl ClassifiedError {
    pub fn hint(&self) -> Option<&'static str> {
        self.kind.hint()
    }
}

fn target_suffix(target: &str) -> String {
    if target.is_empty() {
        String::new()
    } else {
        format!(" {}", target)
    }
}

fn hint_suffix(kind: &ErrorKind) -> String {
    kind.hint().map(|hint| format!(". {}", hint)).unwrap_or_default()
}

/// Map a registry failure to an [`ErrorKind`] and wrap it with context
pub fn classify(
    err: RegistryError,
    operation: impl Into<String>,
    target: impl Into<String>,
) -> ClassifiedError {
    let kind = structured_kind(&err).unwrap_or_else(|| classify_text(&err.to_string()));
    ClassifiedError {
        kind,
        operation: operation.into(),
        target: target.into(),
        source: err,
    }
}

/// Substring classification of arbitrary error text
pub fn classify_text(text: &str) -> ErrorKind {
    let lowered = text.to_lowercase();
    PHRASE_RULES
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|phrase| lowered.contains(phrase)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Other)
}

fn structured_kind(err: &RegistryError) -> Option<ErrorKind> {
    match err {
        RegistryError::Status { status, .. } => match status.as_u16() {
            401 => Some(ErrorKind::Auth),
            403 => Some(ErrorKind::Forbidden),
            404 => Some(ErrorKind::NotFound),
            _ => None,
        },
        RegistryError::Transport {
            kind: TransportKind::Connect | TransportKind::Timeout,
            ..
        } => Some(ErrorKind::Unreachable),
        _ => None,
    }
}
