//! Shared HTTP protocol types for the capture and API servers.

use serde::{Deserialize, Serialize};

use crate::event::{EventId, EventSummary};

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    /// Stored events, `None` when the store could not be read.
    pub events: Option<u64>,
    /// Streamed generation outcomes; only reported by the API server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<SessionCounts>,
}

/// Tally of streamed generation sessions since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Reply sent to a webhook sender after its delivery was captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub id: EventId,
}

/// Raw query string of `GET /api/webhooks`; validated by the API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<String>,
}

/// One page of captured events, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<EventSummary>,
    pub next_cursor: Option<EventId>,
}

/// Body of both generate endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub event_ids: Vec<String>,
}

/// Buffered generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub code: String,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
