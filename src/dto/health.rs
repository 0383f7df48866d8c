use serde::Serialize;
use utoipa::ToSchema;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Number of participant devices currently connected.
    pub connected_participants: usize,
}

impl HealthResponse {
    /// Build the payload from the degraded flag and the participant count.
    pub fn new(degraded: bool, connected_participants: usize) -> Self {
        let status = if degraded { "degraded" } else { "ok" };
        Self {
            status: status.to_string(),
            connected_participants,
        }
    }
}
