//! Tunnel engine seam
//!
//! The engine is an external black box. It pulls its configuration from a
//! delegate and reports progress back through the same delegate, from
//! whatever thread it happens to run on.

mod process;

pub use process::ProcessEngine;

use std::sync::Arc;
use tunneled_fetch_common::TunnelConfig;

/// Callbacks the tunnel engine invokes on its delegate
pub trait EngineCallbacks: Send + Sync {
    /// Configuration for the engine; `None` makes the engine refuse to start
    fn provide_config(&self) -> Option<TunnelConfig>;

    /// Embedded server entries, passed to the engine verbatim
    fn provide_embedded_server_list(&self) -> Option<String>;

    fn on_diagnostic(&self, message: &str, timestamp: &str);

    /// The tunnel is fully established
    fn on_connected(&self);

    fn on_listening_socks_port(&self, port: u16);

    fn on_listening_http_port(&self, port: u16);

    /// The engine went away on its own; `status` describes how it ended
    fn on_engine_exited(&self, status: &str);
}

/// Control surface of a tunnel engine
pub trait TunnelEngine: Send {
    /// Start connecting; returns false if the engine could not be started
    fn start(&mut self, delegate: Arc<dyn EngineCallbacks>, use_embedded_servers: bool) -> bool;

    /// Stop the tunnel and release its proxies
    fn stop(&mut self);
}
