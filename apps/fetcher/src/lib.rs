//! Fetch a URL through a local tunnel proxy under a hard deadline
//!
//! A session starts a tunnel engine, waits until it reports a connection and
//! the local proxy port the chosen [`ProxyMode`] needs, issues one GET through
//! that proxy and hands exactly one outcome to a [`ResultSink`]. The deadline
//! preempts every step; when it fires the sink's prepared content (or a
//! timeout message) is delivered instead.
//!
//! The building blocks are traits so hosts can swap them out:
//! [`TunnelEngine`] for the tunnel itself, [`Fetcher`] for the HTTP request,
//! [`ResultSink`] for the outcome and
//! [`ConfigProvider`](tunneled_fetch_common::ConfigProvider) for configuration.

pub mod client;
pub mod controller;
pub mod engine;
pub mod sink;
pub mod warmer;

pub use client::{Fetcher, ProxiedHttpClient, ProxyMode, build_url_proxy_target};
pub use controller::{Deadline, Delivery, SessionOptions, SessionReport, TunnelLifecycleController};
pub use engine::{EngineCallbacks, ProcessEngine, TunnelEngine};
pub use sink::{NotificationContent, NotificationSink, ResultSink, TextSink};
pub use warmer::{MemoryPressureWarmer, WarmupError, WarmupStatus};

#[cfg(test)]
mod tests;
