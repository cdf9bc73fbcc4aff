//! Request parsing helpers shared by the handlers in `services.rs`

use axum::http::{HeaderMap, header};
use uuid::Uuid;

use crate::api::error::ApiError;

/// Require a JSON body: `application/json`, parameters such as `charset`
/// allowed, everything else (`application/jsonp`, `text/json`, `+json`
/// suffixes) rejected
pub fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let raw = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?
        .to_str()
        .map_err(|_| ApiError::InvalidPayload("Content-Type is not valid ASCII".into()))?;

    let media: mime::Mime = raw
        .parse()
        .map_err(|_| ApiError::InvalidPayload(format!("malformed Content-Type: {raw}")))?;

    match (media.type_(), media.subtype()) {
        (mime::APPLICATION, mime::JSON) => Ok(()),
        (kind, sub) => Err(ApiError::InvalidPayload(format!(
            "expected application/json body, got {kind}/{sub}"
        ))),
    }
}

/// Reject a body over `limit` bytes
pub fn check_body_limit(body: &[u8], limit: usize) -> Result<(), ApiError> {
    match body.len() {
        len if len > limit => Err(ApiError::PayloadTooLarge(len)),
        _ => Ok(()),
    }
}

/// Parses a job id path segment; malformed ids are a 400
pub fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::InvalidPayload(format!("invalid job id: {raw}")))
}
