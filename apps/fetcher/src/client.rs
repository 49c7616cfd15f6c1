//! HTTP fetches through the tunnel's local proxies

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, Proxy, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};
use tunneled_fetch_common::constants::{
    LOCAL_PROXY_HOST, REQUEST_TIMEOUT_SECS, URL_PROXY_PATH_PREFIX,
};
use tunneled_fetch_common::validation::{validate_proxy_port, validate_target_url};
use tunneled_fetch_common::{
    FetchResult, ProxyKind, TunnelError, charset_from_content_type, decode_text,
    percent_encode_component,
};

/// How a request is routed through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProxyMode {
    /// Route the client's transport through the local SOCKS proxy
    SessionProxy,
    /// Embed the target URL in a path on the local HTTP proxy
    UrlProxy,
}

impl ProxyMode {
    /// Which local proxy port this mode needs
    pub fn required_proxy(self) -> ProxyKind {
        match self {
            Self::SessionProxy => ProxyKind::Socks,
            Self::UrlProxy => ProxyKind::Http,
        }
    }
}

/// Issues a single GET through a local proxy port
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, proxy_port: u16, target_url: &str, mode: ProxyMode) -> FetchResult;
}

/// Build the URL-proxy request URL for `target_url`
///
/// Example: port 8080 and `http://x.test/` give
/// `http://127.0.0.1:8080/tunneled/http%3A%2F%2Fx.test%2F`
pub fn build_url_proxy_target(proxy_port: u16, target_url: &str) -> String {
    format!(
        "http://{}:{}{}{}",
        LOCAL_PROXY_HOST,
        proxy_port,
        URL_PROXY_PATH_PREFIX,
        percent_encode_component(target_url)
    )
}

/// HTTP client for tunneled requests
#[derive(Debug, Clone)]
pub struct ProxiedHttpClient {
    request_timeout: Duration,
}

impl ProxiedHttpClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    async fn fetch_via_session_proxy(
        &self,
        proxy_port: u16,
        target_url: &str,
    ) -> Result<FetchResult, TunnelError> {
        let proxy_url = format!("socks5h://{}:{}", LOCAL_PROXY_HOST, proxy_port);
        let proxy = Proxy::all(&proxy_url).map_err(|e| transport_error(target_url, &e))?;

        // Single-use client: nothing is kept alive once it is dropped
        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| transport_error(target_url, &e))?;

        debug!("Fetching {} via SOCKS proxy {}", target_url, proxy_url);
        let result = execute(&client, target_url, target_url).await;
        drop(client);
        result
    }

    async fn fetch_via_url_proxy(
        &self,
        proxy_port: u16,
        target_url: &str,
    ) -> Result<FetchResult, TunnelError> {
        let proxied_url = build_url_proxy_target(proxy_port, target_url);

        let client = Client::builder()
            .no_proxy()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| transport_error(target_url, &e))?;

        debug!("Fetching {} via URL proxy {}", target_url, proxied_url);
        execute(&client, &proxied_url, target_url).await
    }
}

impl Default for ProxiedHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Fetcher for ProxiedHttpClient {
    async fn fetch(&self, proxy_port: u16, target_url: &str, mode: ProxyMode) -> FetchResult {
        if let Err(e) = validate_proxy_port(proxy_port) {
            return FetchResult::from(transport_error(target_url, &e));
        }
        if let Err(e) = validate_target_url(target_url) {
            return FetchResult::from(transport_error(target_url, &e));
        }

        let outcome = match mode {
            ProxyMode::SessionProxy => self.fetch_via_session_proxy(proxy_port, target_url).await,
            ProxyMode::UrlProxy => self.fetch_via_url_proxy(proxy_port, target_url).await,
        };

        outcome.unwrap_or_else(|e| {
            warn!("{}", e);
            FetchResult::from(e)
        })
    }
}

/// Send the GET to `request_url` and judge the response; errors name `target_url`
async fn execute(
    client: &Client,
    request_url: &str,
    target_url: &str,
) -> Result<FetchResult, TunnelError> {
    let response = client
        .get(request_url)
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await
        .map_err(|e| transport_error(target_url, &e))?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(target_url, &e))?;

    evaluate_response(target_url, status, content_type.as_deref(), &body)
}

/// Turn a completed HTTP exchange into a `FetchResult`
///
/// Success requires status 200 and a non-empty body that decodes with the
/// declared charset (UTF-8 when none is declared).
pub fn evaluate_response(
    target_url: &str,
    status: StatusCode,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<FetchResult, TunnelError> {
    if status != StatusCode::OK {
        return Err(TunnelError::Server {
            url: target_url.to_string(),
            status,
        });
    }

    if body.is_empty() {
        return Err(TunnelError::EmptyResponse {
            url: target_url.to_string(),
        });
    }

    let charset = content_type.and_then(charset_from_content_type);
    let (text, encoding) =
        decode_text(body, charset.as_deref()).map_err(|e| TunnelError::Decoding {
            url: target_url.to_string(),
            charset: e.charset().to_string(),
        })?;

    Ok(FetchResult::success(body.to_vec(), encoding, text))
}

/// Describe an error with its full source chain
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn transport_error(target_url: &str, err: &dyn std::error::Error) -> TunnelError {
    TunnelError::Transport {
        url: target_url.to_string(),
        message: error_chain(err),
    }
}
