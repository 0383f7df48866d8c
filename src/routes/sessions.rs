use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;
use uuid::Uuid;

use crate::{
    dto::session::{
        CreateSessionRequest, CreateSessionResponse, EndSessionRequest, JoinSessionRequest,
        JoinSessionResponse, SessionSnapshotResponse, SessionSummary,
    },
    error::AppError,
    services::room_service,
    state::SharedState,
};

/// Room lifecycle endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/join", post(join_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/end", post(end_session))
}

/// Open a new room hosted by the caller.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, description = "Session created", body = CreateSessionResponse),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<CreateSessionRequest>>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    let created = room_service::create_session(&state, payload.into()).await?;
    Ok(Json(CreateSessionResponse {
        session_id: created.session_id,
        room_code: created.room_code,
    }))
}

/// Join a room through its shareable code.
#[utoipa::path(
    post,
    path = "/sessions/join",
    tag = "sessions",
    request_body = JoinSessionRequest,
    responses(
        (status = 200, description = "Joined", body = JoinSessionResponse),
        (status = 404, description = "Unknown room code"),
        (status = 409, description = "Session ended or full")
    )
)]
pub async fn join_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<JoinSessionRequest>>,
) -> Result<Json<JoinSessionResponse>, AppError> {
    let (code, profile) = payload.into_parts();
    let joined = room_service::join_session_by_code(&state, &code, profile).await?;
    Ok(Json(JoinSessionResponse {
        session_id: joined.session_id,
        status: joined.status.into(),
    }))
}

/// Current state of a room: session row, members, turn and progress.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    tag = "sessions",
    params(("id" = String, Path, description = "Identifier of the session")),
    responses(
        (status = 200, description = "Session snapshot", body = SessionSnapshotResponse),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshotResponse>, AppError> {
    let snapshot = room_service::session_snapshot(&state, id).await?;
    Ok(Json(snapshot.into()))
}

/// End a room on behalf of one of its members.
#[utoipa::path(
    post,
    path = "/sessions/{id}/end",
    tag = "sessions",
    params(("id" = String, Path, description = "Identifier of the session")),
    request_body = EndSessionRequest,
    responses(
        (status = 200, description = "Session ended", body = SessionSummary),
        (status = 401, description = "Caller is not a member"),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn end_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Valid(Json(payload)): Valid<Json<EndSessionRequest>>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = room_service::end_session(&state, id, &payload.user_id).await?;
    Ok(Json(session.into()))
}
