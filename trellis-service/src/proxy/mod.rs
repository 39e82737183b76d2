//! Streaming reverse proxy with per-upstream circuit breakers
//!
//! [`ProxyClient::proxy_to`] forwards an exchange to an upstream and streams
//! the response back chunk by chunk; neither body direction is buffered.
//! Admission goes through the upstream's circuit breaker, and failures are
//! classified into the taxonomy in [`ProxyError`].

pub mod breaker;
mod error;

pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use error::{ProxyError, ProxyErrorKind, TimeoutPhase};

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Url;

use crate::config::ProxySettings;
use crate::error::{Error, Result};
use crate::exchange::Exchange;

/// Headers meaningful only to the immediate peer; stripped in both
/// directions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Callback fired after upstream response headers arrive, before body
/// streaming; an error aborts the forward.
pub type UpstreamResponseHook =
    Box<dyn Fn(StatusCode, &HeaderMap) -> Result<()> + Send + Sync>;

/// Runtime proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Total request budget
    pub request_timeout: Duration,
    /// Maximum gap between response chunks
    pub idle_timeout: Duration,
    /// Forward the incoming Host header instead of the upstream authority
    pub preserve_host_header: bool,
    /// Add X-Forwarded-For / X-Forwarded-Proto / X-Forwarded-Host
    pub add_forwarded_headers: bool,
    /// Request headers stripped before forwarding
    pub remove_request_headers: Vec<String>,
    /// Response headers stripped before returning
    pub remove_response_headers: Vec<String>,
    /// Headers appended to every proxied response
    pub additional_response_headers: Vec<(String, String)>,
    /// Reject request bodies larger than this many bytes
    pub max_body_bytes: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from(&ProxySettings::default())
    }
}

impl From<&ProxySettings> for ProxyConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            idle_timeout: settings.idle_timeout(),
            preserve_host_header: settings.preserve_host_header,
            add_forwarded_headers: settings.add_forwarded_headers,
            remove_request_headers: settings
                .remove_request_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            remove_response_headers: settings
                .remove_response_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            additional_response_headers: settings.additional_response_headers.clone(),
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

/// Per-request proxy overrides
#[derive(Default)]
pub struct ProxyOptions {
    /// Replace the upstream path entirely
    pub path_rewrite: Option<String>,
    /// Replace the query string instead of passing it through
    pub query_rewrite: Option<String>,
    /// Override the total request timeout
    pub timeout: Option<Duration>,
    /// Extra request headers, applied last (highest precedence)
    pub add_request_headers: Vec<(String, String)>,
    /// Extra request header removals
    pub remove_request_headers: Vec<String>,
    /// Inspect the upstream head before body streaming begins
    pub on_upstream_response: Option<UpstreamResponseHook>,
}

/// Streaming proxy client
///
/// Holds the upstream connection pool; dropping the client releases it.
pub struct ProxyClient {
    client: reqwest::Client,
    config: ProxyConfig,
    breakers: Arc<BreakerRegistry>,
}

impl ProxyClient {
    /// Build a client from runtime config and a shared breaker registry
    pub fn new(config: ProxyConfig, breakers: Arc<BreakerRegistry>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::internal(format!("failed to build proxy client: {e}")))?;

        Ok(Self {
            client,
            config,
            breakers,
        })
    }

    /// The breaker registry this client consults
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Forward the exchange to `upstream_url` and stream the response back
    ///
    /// On success the outer response is fully written and the breaker records
    /// a success. On failure the error carries the upstream identity and its
    /// status mapping; the caller propagates it.
    pub async fn proxy_to(
        &self,
        exchange: &Exchange,
        upstream_url: &str,
        options: ProxyOptions,
    ) -> Result<()> {
        let url = Url::parse(upstream_url)
            .map_err(|e| Error::bad_request(format!("invalid upstream URL: {e}")))?;
        let authority = authority_of(&url)?;

        if let Some(limit) = self.config.max_body_bytes {
            if exchange.request().content_length().is_some_and(|len| len > limit) {
                return Err(ProxyError::BodyTooLarge { limit }.into());
            }
        }

        let breaker = self.breakers.for_upstream(&authority);
        if !breaker.allow_request() {
            return Err(ProxyError::CircuitOpen {
                upstream: authority,
            }
            .into());
        }

        let target = build_target(
            &url,
            options.path_rewrite.as_deref(),
            options.query_rewrite.as_deref(),
            exchange.request().path(),
            exchange.request().query(),
        );

        let headers = build_upstream_headers(
            exchange.request().headers(),
            &self.config,
            &options,
            exchange.request().client_ip().as_deref(),
        );

        let method = exchange.request().method().clone();
        let mut builder = self
            .client
            .request(method.clone(), target)
            .headers(headers)
            .timeout(options.timeout.unwrap_or(self.config.request_timeout));

        if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            builder = builder.body(reqwest::Body::wrap_stream(
                exchange.request().body_stream()?,
            ));
        }

        tracing::debug!(upstream = %authority, method = %method, "dispatching proxied request");

        let upstream_response = tokio::select! {
            () = exchange.cancellation().cancelled() => {
                return Err(ProxyError::Cancelled.into());
            }
            result = builder.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    let proxy_err = ProxyError::from_reqwest(&e, &authority);
                    breaker.record_failure(proxy_err.kind());
                    return Err(proxy_err.into());
                }
            },
        };

        if let Some(hook) = &options.on_upstream_response {
            if let Err(e) = hook(upstream_response.status(), upstream_response.headers()) {
                breaker.record_failure(ProxyErrorKind::InvalidResponse);
                return Err(e);
            }
        }

        let response = exchange.response();
        response.set_status(upstream_response.status())?;
        for (name, value) in upstream_response.headers() {
            if is_hop_by_hop(name.as_str())
                || self
                    .config
                    .remove_response_headers
                    .iter()
                    .any(|h| h == name.as_str())
            {
                continue;
            }
            if let Ok(v) = value.to_str() {
                response.append_header(name.as_str(), v)?;
            }
        }
        for (name, value) in &self.config.additional_response_headers {
            response.append_header(name, value)?;
        }

        let mut stream = upstream_response.bytes_stream();
        loop {
            let next = tokio::select! {
                () = exchange.cancellation().cancelled() => {
                    response.abort();
                    return Err(ProxyError::Cancelled.into());
                }
                next = tokio::time::timeout(self.config.idle_timeout, stream.next()) => next,
            };

            match next {
                Err(_elapsed) => {
                    let proxy_err = ProxyError::Timeout {
                        upstream: authority,
                        phase: TimeoutPhase::Idle,
                    };
                    breaker.record_failure(proxy_err.kind());
                    response.abort();
                    return Err(proxy_err.into());
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    response.write(chunk).await?;
                }
                Ok(Some(Err(e))) => {
                    let proxy_err = ProxyError::from_reqwest(&e, &authority);
                    breaker.record_failure(proxy_err.kind());
                    response.abort();
                    return Err(proxy_err.into());
                }
            }
        }

        response.end();
        breaker.record_success();
        tracing::debug!(upstream = %authority, "proxied response forwarded");
        Ok(())
    }
}

fn authority_of(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::bad_request("upstream URL has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Target = upstream scheme+authority, plus the rewrite, the upstream's
/// explicit path, or the incoming path; query passes through unless
/// rewritten.
fn build_target(
    upstream: &Url,
    path_rewrite: Option<&str>,
    query_rewrite: Option<&str>,
    incoming_path: &str,
    incoming_query: Option<&str>,
) -> Url {
    let mut target = upstream.clone();

    let path = match path_rewrite {
        Some(rewrite) => rewrite.to_string(),
        None if upstream.path() != "/" && !upstream.path().is_empty() => {
            upstream.path().to_string()
        }
        None => incoming_path.to_string(),
    };
    target.set_path(&path);

    let query = query_rewrite
        .map(str::to_string)
        .or_else(|| incoming_query.map(str::to_string));
    target.set_query(query.as_deref());

    target
}

fn build_upstream_headers(
    incoming: &HeaderMap,
    config: &ProxyConfig,
    options: &ProxyOptions,
    client_ip: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in incoming {
        let lowered = name.as_str();
        if is_hop_by_hop(lowered)
            || config.remove_request_headers.iter().any(|h| h == lowered)
            || options
                .remove_request_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(lowered))
        {
            continue;
        }
        if lowered == "host" && !config.preserve_host_header {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if config.add_forwarded_headers {
        if let Some(ip) = client_ip {
            let forwarded = match headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prev) => format!("{prev}, {ip}"),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", value);
            }
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(host) = incoming.get("host") {
            headers.insert("x-forwarded-host", host.clone());
        }
    }

    for (name, value) in &options.add_request_headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn test_target_uses_incoming_path_by_default() {
        let upstream = Url::parse("http://backend:9000").unwrap();
        let target = build_target(&upstream, None, None, "/api/items", Some("page=2"));
        assert_eq!(target.as_str(), "http://backend:9000/api/items?page=2");
    }

    #[test]
    fn test_target_prefers_explicit_upstream_path() {
        let upstream = Url::parse("http://backend:9000/v2/items").unwrap();
        let target = build_target(&upstream, None, None, "/api/items", None);
        assert_eq!(target.as_str(), "http://backend:9000/v2/items");
    }

    #[test]
    fn test_target_rewrite_wins() {
        let upstream = Url::parse("http://backend:9000/v2/items").unwrap();
        let target = build_target(&upstream, Some("/internal"), Some("k=v"), "/api", None);
        assert_eq!(target.as_str(), "http://backend:9000/internal?k=v");
    }

    #[test]
    fn test_authority_includes_port() {
        let url = Url::parse("http://backend:9000/x").unwrap();
        assert_eq!(authority_of(&url).unwrap(), "backend:9000");
        let url = Url::parse("http://backend/x").unwrap();
        assert_eq!(authority_of(&url).unwrap(), "backend");
    }

    #[test]
    fn test_upstream_headers_strip_and_forward() {
        let mut incoming = HeaderMap::new();
        incoming.insert("host", HeaderValue::from_static("edge.example"));
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("x-api-version", HeaderValue::from_static("3"));
        incoming.insert("x-internal", HeaderValue::from_static("secret"));

        let mut config = ProxyConfig::default();
        config.remove_request_headers = vec!["x-internal".to_string()];

        let headers = build_upstream_headers(
            &incoming,
            &config,
            &ProxyOptions::default(),
            Some("203.0.113.7"),
        );

        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-internal").is_none());
        assert_eq!(headers.get("x-api-version").unwrap(), "3");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "edge.example");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut incoming = HeaderMap::new();
        incoming.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1"),
        );

        let headers = build_upstream_headers(
            &incoming,
            &ProxyConfig::default(),
            &ProxyOptions::default(),
            Some("203.0.113.7"),
        );
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.1, 203.0.113.7"
        );
    }

    #[test]
    fn test_per_request_additions_win() {
        let mut incoming = HeaderMap::new();
        incoming.insert("x-tier", HeaderValue::from_static("edge"));

        let options = ProxyOptions {
            add_request_headers: vec![("x-tier".to_string(), "internal".to_string())],
            ..Default::default()
        };

        let headers =
            build_upstream_headers(&incoming, &ProxyConfig::default(), &options, None);
        assert_eq!(headers.get("x-tier").unwrap(), "internal");
    }

    #[test]
    fn test_preserve_host_header() {
        let mut incoming = HeaderMap::new();
        incoming.insert("host", HeaderValue::from_static("edge.example"));

        let mut config = ProxyConfig::default();
        config.preserve_host_header = true;

        let headers =
            build_upstream_headers(&incoming, &config, &ProxyOptions::default(), None);
        assert_eq!(headers.get("host").unwrap(), "edge.example");
    }
}
