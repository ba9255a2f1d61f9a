//! Error types for admin API calls and route management
//!
//! Every admin call ends in exactly one of: success, connectivity failure,
//! origin-policy rejection, or API error. Callers branch on
//! [`AdminError::kind`] to decide whether launching the daemon can help.

use std::fmt;
use thiserror::Error;

/// Coarse classification of a failed admin call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Daemon process not reachable at all
    Connectivity,
    /// Daemon rejected the caller's Origin
    SecurityPolicy,
    /// Daemon reachable but rejected the request itself
    Domain,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::SecurityPolicy => "security-policy",
            ErrorKind::Domain => "domain",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single admin API call
#[derive(Debug, Error)]
pub enum AdminError {
    /// Connection refused, reset, unreachable or timed out
    #[error("daemon admin API unreachable at {address}: {reason}")]
    Connectivity { address: String, reason: String },

    /// HTTP 403 from the daemon's origin check
    #[error(
        "daemon rejected origin {origin:?} ({body}); check that admin.origin matches the daemon's configured admin origins"
    )]
    OriginRejected { origin: String, body: String },

    /// Any other non-success response
    #[error("{method} {path} failed with HTTP {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Request could not be built or sent for a reason other than reachability,
    /// such as a malformed `admin.address`
    #[error("invalid admin API request to {address}: {reason}; check admin.address")]
    Request { address: String, reason: String },

    /// Request or response body could not be (de)serialized
    #[error("invalid admin API payload for {path}: {reason}")]
    Encode { path: String, reason: String },
}

impl AdminError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::Connectivity { .. } => ErrorKind::Connectivity,
            AdminError::OriginRejected { .. } => ErrorKind::SecurityPolicy,
            AdminError::Api { .. } | AdminError::Request { .. } | AdminError::Encode { .. } => ErrorKind::Domain,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// HTTP status for API errors
    pub fn status(&self) -> Option<u16> {
        match self {
            AdminError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body for API errors, empty otherwise
    pub fn body(&self) -> &str {
        match self {
            AdminError::Api { body, .. } | AdminError::OriginRejected { body, .. } => body,
            _ => "",
        }
    }

    /// Daemon refused a TLS policy because a subject already has one
    pub fn is_policy_overlap(&self) -> bool {
        let body = self.body().to_ascii_lowercase();
        self.status().is_some()
            && (body.contains("more than one automation policy")
                || body.contains("overlapping"))
    }

    /// Conflict on creation of something that is already present
    pub fn is_already_exists(&self) -> bool {
        self.status() == Some(409) || self.body().to_ascii_lowercase().contains("already exists")
    }
}

/// One hostname source that produced nothing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingInput {
    pub source: String,
    pub reason: String,
}

impl MissingInput {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MissingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

fn itemize(missing: &[MissingInput]) -> String {
    if missing.is_empty() {
        return "no hostname sources configured".to_string();
    }
    missing
        .iter()
        .map(|m| format!("\n  - {}", m))
        .collect::<String>()
}

/// Errors surfaced by readiness, reconciliation and the lifecycle
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("hostname not resolved:{}", itemize(.missing))]
    NoHostnames { missing: Vec<MissingInput> },

    #[error("daemon still unreachable at {address} after launching it and probing {attempts} times")]
    DaemonUnreachable { address: String, attempts: u32 },

    #[error("failed to launch daemon with `{command}`: {reason}")]
    Launch { command: String, reason: String },

    #[error("daemon readiness check failed ({}): {0}", .0.kind())]
    Readiness(#[source] AdminError),

    #[error("failed to register route {route_id} ({}): {source}", .source.kind())]
    Reconcile {
        route_id: String,
        #[source]
        source: AdminError,
    },

    #[error("bootstrap lock error: {0}")]
    Lock(#[from] std::io::Error),

    #[error("instance is {0} and cannot register again")]
    InvalidState(&'static str),

    #[error("stopped before registration completed")]
    Stopped,
}
