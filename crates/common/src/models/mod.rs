mod fetch;
mod session;

pub use fetch::{FailureKind, FetchFailure, FetchResult, FetchedBody};
pub use session::{ProxyKind, SessionState, TunnelSession};
