use crate::error::TunnelError;
use crate::utils::pretty_print;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage at which a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    EngineStart,
    Transport,
    Server,
    EmptyResponse,
    Decoding,
    Timeout,
}

impl FailureKind {
    /// Whether the failure happened while fetching, so the target URL is relevant
    pub fn is_fetch_failure(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Server | Self::EmptyResponse | Self::Decoding
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::EngineStart => "engine start",
            Self::Transport => "transport",
            Self::Server => "server",
            Self::EmptyResponse => "empty response",
            Self::Decoding => "decoding",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

impl From<&TunnelError> for FailureKind {
    fn from(err: &TunnelError) -> Self {
        match err {
            TunnelError::EngineStart(_) => Self::EngineStart,
            TunnelError::Transport { .. } => Self::Transport,
            TunnelError::Server { .. } => Self::Server,
            TunnelError::EmptyResponse { .. } => Self::EmptyResponse,
            TunnelError::Decoding { .. } => Self::Decoding,
            TunnelError::Timeout(_) => Self::Timeout,
            // Everything that goes wrong before the engine runs is a config problem
            TunnelError::Config(_)
            | TunnelError::InvalidTransition { .. }
            | TunnelError::Io(_)
            | TunnelError::Serialization(_)
            | TunnelError::Validation(_) => Self::Config,
        }
    }
}

/// Successfully fetched and decoded response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedBody {
    /// Raw response body
    pub body: Vec<u8>,

    /// Canonical name of the encoding used to decode the body
    pub encoding: String,

    /// Decoded body text
    pub text: String,
}

/// Failure of a fetch or of the session around it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of a single tunneled fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchResult {
    Success(FetchedBody),
    Failure(FetchFailure),
}

impl FetchResult {
    /// Build a successful result
    pub fn success(body: Vec<u8>, encoding: impl Into<String>, text: String) -> Self {
        Self::Success(FetchedBody {
            body,
            encoding: encoding.into(),
            text,
        })
    }

    /// Build a failure result
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure(FetchFailure {
            kind,
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Failure kind, if this is a failure
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.kind),
        }
    }

    /// Human-readable outcome text for the result sink
    ///
    /// Successes read `Result from {url}:` followed by the pretty-printed body,
    /// failures read `Error from {url}:` followed by the pretty-printed message.
    pub fn outcome_text(&self, url: &str) -> String {
        match self {
            Self::Success(fetched) => {
                format!("Result from {}:\n{}", url, pretty_print(&fetched.text))
            }
            Self::Failure(failure) if failure.kind.is_fetch_failure() => {
                format!(
                    "Error from {}:\n\n{}\n\nCheck logs for error.",
                    url,
                    pretty_print(&failure.message)
                )
            }
            Self::Failure(failure) => {
                format!("Failed ({}): {}", failure.kind, failure.message)
            }
        }
    }
}

impl From<TunnelError> for FetchResult {
    fn from(err: TunnelError) -> Self {
        Self::failure(FailureKind::from(&err), err.to_string())
    }
}
