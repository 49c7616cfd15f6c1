//! Common utilities and types for tunneled-fetch
//!
//! This crate provides the session data model, the error taxonomy, the tunnel
//! configuration loader and the encoding helpers shared by the fetcher
//! library and its command-line front end.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use config::{ConfigProvider, FileConfigProvider, TunnelConfig};
pub use error::{Result, TunnelError};
pub use models::{
    FailureKind, FetchFailure, FetchResult, FetchedBody, ProxyKind, SessionState, TunnelSession,
};
pub use utils::{
    charset_from_content_type, current_timestamp_millis, decode_text, generate_session_id,
    percent_decode_component, percent_encode_component, pretty_print,
};
