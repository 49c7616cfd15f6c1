use crate::error::{Result, TunnelError};
use crate::utils::{current_timestamp_millis, generate_session_id};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    AwaitingPorts,
    Connecting,
    Connected,
    Fetching,
    Completed,
    TimedOut,
    Failed,
}

impl SessionState {
    /// Terminal states absorb every later event
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match next {
            // The deadline preempts everything that has not finished yet
            TimedOut => true,
            Failed => matches!(self, Starting | AwaitingPorts | Connecting | Fetching),
            Starting => self == Idle,
            AwaitingPorts => self == Starting,
            Connecting => matches!(self, Starting | AwaitingPorts),
            Connected => self == Connecting,
            Fetching => self == Connected,
            Completed => self == Fetching,
            Idle => false,
        }
    }

    /// Short human description used in timeout messages
    pub fn describe(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting the tunnel",
            Self::AwaitingPorts => "waiting for the tunnel to connect",
            Self::Connecting => "waiting for the local proxy port",
            Self::Connected => "preparing the tunneled request",
            Self::Fetching => "waiting for the tunneled request",
            Self::Completed => "completed",
            Self::TimedOut => "timed out",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::AwaitingPorts => "AwaitingPorts",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Fetching => "Fetching",
            Self::Completed => "Completed",
            Self::TimedOut => "TimedOut",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Which local proxy listener a port belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Socks,
    Http,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks => f.write_str("SOCKS"),
            Self::Http => f.write_str("HTTP"),
        }
    }
}

/// A single tunnel attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSession {
    /// Unique session identifier
    pub id: String,

    /// Current lifecycle state
    pub state: SessionState,

    /// Local SOCKS proxy port, 0 until the engine reports it
    pub socks_proxy_port: u16,

    /// Local HTTP proxy port, 0 until the engine reports it
    pub http_proxy_port: u16,

    /// Timestamp when the session was created (Unix epoch milliseconds)
    pub started_at: u64,
}

impl TunnelSession {
    /// Create a new idle session
    pub fn new() -> Self {
        Self {
            id: generate_session_id(),
            state: SessionState::Idle,
            socks_proxy_port: 0,
            http_proxy_port: 0,
            started_at: current_timestamp_millis(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TunnelError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record a listening port and return the previous value if one was overwritten
    ///
    /// Zero is rejected; a port is strictly positive once set.
    pub fn record_port(&mut self, kind: ProxyKind, port: u16) -> Result<Option<u16>> {
        let port = crate::validation::validate_proxy_port(port)?;
        let slot = match kind {
            ProxyKind::Socks => &mut self.socks_proxy_port,
            ProxyKind::Http => &mut self.http_proxy_port,
        };
        let previous = std::mem::replace(slot, port);
        Ok((previous != 0).then_some(previous))
    }

    /// Port for the given listener, if the engine has reported it
    pub fn port(&self, kind: ProxyKind) -> Option<u16> {
        let port = match kind {
            ProxyKind::Socks => self.socks_proxy_port,
            ProxyKind::Http => self.http_proxy_port,
        };
        (port != 0).then_some(port)
    }
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}
