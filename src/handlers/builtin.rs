use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::traits::{JobContext, JobHandler};
use crate::cache::{KeyBuilder, TieredCache};
use crate::error::ResilienceError;
use crate::worker::{HttpRequest, ResilientHttpClient};

/// Returns its payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn run(&self, ctx: &JobContext, payload: &Value) -> Result<Value, ResilienceError> {
        ctx.ensure_active()?;
        Ok(payload.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct FetchPayload {
    url: String,
    #[serde(default)]
    headers: Vec<(String, String)>,
    /// Breaker name; defaults to the URL host
    #[serde(default)]
    dependency: Option<String>,
    /// Cache lifetime in milliseconds; the cache default when absent
    #[serde(default)]
    cache_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct CachedBody {
    status: u16,
    content_type: Option<String>,
    body: String,
}

/// Fetches a URL through the resilient client and caches the body
///
/// Payload: `{"url": "...", "headers": [["name", "value"]], "dependency":
/// "geo", "cache_ttl_ms": 60000}`. The result carries the status, content
/// type, body (lossy UTF-8) and whether it came from the cache.
pub struct HttpFetchHandler {
    client: Arc<ResilientHttpClient>,
    cache: Arc<TieredCache>,
}

impl HttpFetchHandler {
    pub const NAME: &'static str = "http.fetch";

    pub fn new(client: Arc<ResilientHttpClient>, cache: Arc<TieredCache>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl JobHandler for HttpFetchHandler {
    async fn run(&self, ctx: &JobContext, payload: &Value) -> Result<Value, ResilienceError> {
        let request: FetchPayload = serde_json::from_value(payload.clone())
            .map_err(|e| ResilienceError::validation(format!("invalid http.fetch payload: {e}")))?;

        let key = KeyBuilder::new(Self::NAME)
            .namespace("http")
            .kwarg("url", &request.url)
            .kwarg("headers", &request.headers)
            .build()?;

        if let Some(hit) = self.cache.get_json::<CachedBody>(&key).await {
            debug!(job_id = %ctx.job_id, url = %request.url, "Serving fetch from cache");
            return Ok(render(&hit, true));
        }

        ctx.ensure_active()?;

        let mut outgoing = HttpRequest::get(&request.url);
        outgoing.headers = request.headers.clone();
        outgoing.dependency = request.dependency.clone();

        let response = self.client.send(&outgoing).await?;
        let fetched = CachedBody {
            status: response.status,
            content_type: response.content_type,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        };

        let ttl = request
            .cache_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.cache.default_ttl());
        self.cache.set_json(&key, &fetched, ttl).await?;

        Ok(render(&fetched, false))
    }
}

fn render(body: &CachedBody, cached: bool) -> Value {
    json!({
        "status": body.status,
        "content_type": body.content_type,
        "body": body.body,
        "cached": cached,
    })
}
