//! Request and response bodies for the operator API
//!
//! Job records, job stats, breaker snapshots and cache stats are serialized
//! straight from the engine types; this module only holds the envelopes
//! specific to HTTP.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::queue::{CancelOutcome, Job};

/// `POST /jobs` body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitJobRequest {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
}

/// `GET /jobs` query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    #[serde(flatten)]
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}
