use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the live training backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sessions::create_session,
        crate::routes::sessions::join_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::end_session,
        crate::routes::sse::session_events,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::CreateSessionRequest,
            crate::dto::session::CreateSessionResponse,
            crate::dto::session::JoinSessionRequest,
            crate::dto::session::JoinSessionResponse,
            crate::dto::session::EndSessionRequest,
            crate::dto::session::SessionSnapshotResponse,
            crate::dto::sse::Handshake,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::SessionUpdateEvent,
            crate::dto::ws::ParticipantInboundMessage,
            crate::dto::ws::ParticipantOutboundMessage,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Live training room lifecycle"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "participants", description = "WebSocket operations for participant devices"),
    )
)]
pub struct ApiDoc;
