//! Input validation for values that cross the engine and CLI boundaries
//!
//! Proxy ports come from the tunnel engine's callbacks, target URLs and the
//! data root directory come from the command line. All of them are checked
//! before a session relies on them.

use std::path::Path;
use thiserror::Error;
use url::Url;

/// Maximum length for target URLs accepted for a tunneled fetch
pub const MAX_TARGET_URL_LENGTH: usize = 2048;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Proxy port must be positive")]
    ZeroPort,

    #[error("Invalid target URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Target URL too long: {0} bytes (max: {1})")]
    UrlTooLong(usize, usize),

    #[error("Data root directory must be an absolute path: {0}")]
    RelativeDataRoot(String),
}

/// Validate a proxy port reported by the tunnel engine
///
/// # Examples
///
/// ```
/// use tunneled_fetch_common::validation::validate_proxy_port;
///
/// assert!(validate_proxy_port(1080).is_ok());
/// assert!(validate_proxy_port(0).is_err());
/// ```
pub fn validate_proxy_port(port: u16) -> Result<u16, ValidationError> {
    if port == 0 {
        return Err(ValidationError::ZeroPort);
    }
    Ok(port)
}

/// Validate a target URL
///
/// The URL must be absolute, use `http` or `https`, and name a host.
///
/// # Examples
///
/// ```
/// use tunneled_fetch_common::validation::validate_target_url;
///
/// assert!(validate_target_url("https://freegeoip.app/json/").is_ok());
/// assert!(validate_target_url("ftp://example.com").is_err());
/// assert!(validate_target_url("not a url").is_err());
/// ```
pub fn validate_target_url(raw: &str) -> Result<Url, ValidationError> {
    if raw.len() > MAX_TARGET_URL_LENGTH {
        return Err(ValidationError::UrlTooLong(raw.len(), MAX_TARGET_URL_LENGTH));
    }

    let url = Url::parse(raw).map_err(|e| {
        ValidationError::InvalidUrl(format!("{}: {}", raw.chars().take(50).collect::<String>(), e))
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::UnsupportedScheme(other.to_string())),
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::InvalidUrl(format!("{} has no host", raw)));
    }

    Ok(url)
}

/// Validate that the data root directory is an absolute path
pub fn validate_data_root(path: &Path) -> Result<(), ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::RelativeDataRoot(
            path.display().to_string(),
        ));
    }
    Ok(())
}
