//! HTTP client for remote dependencies
//!
//! Every request goes through a per-host circuit breaker and the retry
//! executor. Failures are classified so that only dependency problems
//! (timeouts, connection errors, 5xx, 429) trip breakers and earn retries;
//! other 4xx responses surface as validation errors.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Proxy, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::error::ResilienceError;
use crate::retry::RetryExecutor;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub proxy_url: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("bulwark/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy_url: None,
        }
    }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Breaker to route through; defaults to the URL's host
    pub dependency: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            dependency: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependency = Some(name.into());
        self
    }
}

/// Successful response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// `reqwest` client guarded by breakers and retries
pub struct ResilientHttpClient {
    client: Client,
    breakers: Arc<BreakerRegistry>,
    retry: RetryExecutor,
}

impl ResilientHttpClient {
    pub fn new(
        config: HttpClientConfig,
        breakers: Arc<BreakerRegistry>,
        retry: RetryExecutor,
    ) -> Result<Self, ResilienceError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(url) = &config.proxy_url {
            let proxy = Proxy::all(url)
                .map_err(|e| ResilienceError::validation(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ResilienceError::validation(format!("invalid HTTP client config: {e}")))?;

        Ok(Self {
            client,
            breakers,
            retry,
        })
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// GET `url` with breaker and retry protection
    pub async fn get(&self, url: &str) -> Result<HttpResponse, ResilienceError> {
        self.send(&HttpRequest::get(url)).await
    }

    /// Send `request` with breaker and retry protection
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ResilienceError> {
        let url = Url::parse(&request.url)
            .map_err(|e| ResilienceError::validation(format!("invalid URL '{}': {e}", request.url)))?;
        let dependency = match &request.dependency {
            Some(name) => name.clone(),
            None => url
                .host_str()
                .map(str::to_string)
                .ok_or_else(|| ResilienceError::validation(format!("URL '{url}' has no host")))?,
        };
        let headers = build_headers(&request.headers)?;

        let breaker = self.breakers.get(&dependency);
        let work = || self.send_once(&dependency, &request.method, &url, &headers, &request.body);

        let result = self.retry.run_with_breaker(&breaker, &work).await;
        if let Err(e) = &result {
            warn!(dependency = %dependency, url = %url, error = %e, "HTTP request failed");
        }
        result
    }

    async fn send_once(
        &self,
        dependency: &str,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &Option<Bytes>,
    ) -> Result<HttpResponse, ResilienceError> {
        debug!(dependency, url = %url, method = %method, "Sending request");

        let mut builder = self.client.request(method.clone(), url.clone()).headers(headers.clone());
        if let Some(body) = body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(dependency, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(dependency, status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| ResilienceError::dependency(dependency, format!("failed to read body: {e}")))?;

        debug!(dependency, url = %url, status = status.as_u16(), size = body.len(), "Request completed");

        Ok(HttpResponse {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

fn build_headers(pairs: &[(String, String)]) -> Result<HeaderMap, ResilienceError> {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ResilienceError::validation(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ResilienceError::validation(format!("invalid header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn classify_transport(dependency: &str, err: &reqwest::Error) -> ResilienceError {
    if err.is_builder() {
        ResilienceError::validation(format!("invalid request: {err}"))
    } else if err.is_timeout() {
        ResilienceError::dependency(dependency, "request timed out")
    } else if err.is_connect() {
        ResilienceError::dependency(dependency, format!("connection failed: {err}"))
    } else if err.is_redirect() {
        ResilienceError::validation(format!("too many redirects: {err}"))
    } else {
        ResilienceError::dependency(dependency, err.to_string())
    }
}

fn classify_status(dependency: &str, status: StatusCode) -> ResilienceError {
    let message = format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ResilienceError::dependency(dependency, message)
    } else {
        ResilienceError::validation(message)
    }
}
