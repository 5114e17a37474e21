//! HTTP handlers.
//!
//! Every session route takes [`Authenticated`] before any other extractor
//! that can fail, so an unauthenticated request is rejected with 401 before
//! the path, query or body is looked at and before the registry is touched.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::Json;
use futures_util::Stream;
use tracing::{debug, info};

use clibridge_core::{ContinuationToken, SessionId, SessionView};
use clibridge_protocol::{
    parse_last_event_id, parse_tool, CertificateResponse, CreateSessionRequest,
    CreateSessionResponse, HealthResponse, InputAccepted, InputRequest, ProtocolVersion,
    ReloadResponse, SessionListResponse, LAST_EVENT_ID_HEADER, LAST_EVENT_ID_QUERY,
};

use super::auth::Authenticated;
use super::error::ApiError;
use super::stream::{global_stream, session_stream};
use super::AppState;
use crate::registry::RegistryError;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Fetches a session and checks that the caller owns it.
async fn owned_session(
    state: &AppState,
    auth: &Authenticated,
    session_id: &SessionId,
) -> Result<SessionView, ApiError> {
    let view = state
        .registry
        .get_session(session_id.clone())
        .await
        .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

    if view.principal != auth.principal {
        return Err(RegistryError::Forbidden(session_id.clone()).into());
    }
    Ok(view)
}

// ============================================================================
// Sessions
// ============================================================================

/// `POST /session`
pub async fn create_session(
    State(state): State<AppState>,
    auth: Authenticated,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let request = body(payload)?;
    let tool = parse_tool(&request.tool)?;

    if let Some(session_id) = request.session_id {
        let view = owned_session(&state, &auth, &session_id).await?;
        if view.tool != tool.tag() {
            return Err(ApiError::Conflict(format!(
                "session {session_id} runs {}, not {tool}",
                view.tool
            )));
        }
        if view.state.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "session {session_id} is {}",
                view.state
            )));
        }
        debug!(session_id = %session_id, "Resumed existing session");
        return Ok((StatusCode::OK, Json(CreateSessionResponse::from_view(view, true))));
    }

    let continuation = request
        .resume_token
        .filter(|t| !t.trim().is_empty())
        .map(ContinuationToken::new);

    let view = state
        .registry
        .create(auth.principal, tool, continuation, request.workspace.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse::from_view(view, false)),
    ))
}

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Json<SessionListResponse> {
    let sessions = state.registry.list_sessions(Some(auth.principal)).await;
    Json(SessionListResponse { sessions })
}

/// `GET /session/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(session_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let view = owned_session(&state, &auth, &SessionId::new(session_id)).await?;
    Ok(Json(view))
}

/// `GET /session/{id}/events`
pub async fn session_events(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let header = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let last_id = parse_last_event_id(header, query.get(LAST_EVENT_ID_QUERY).map(String::as_str))?;

    let lease = state
        .registry
        .attach(SessionId::new(session_id), auth.principal)
        .await?;

    info!(
        session_id = %lease.session().id,
        consumer_id = %lease.consumer_id(),
        last_event_id = last_id,
        "Consumer attached to event stream"
    );

    Ok(Sse::new(session_stream(
        lease,
        last_id,
        state.config.heartbeat_interval,
    )))
}

/// `POST /session/{id}/input`
pub async fn send_input(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(session_id): Path<String>,
    payload: Result<Json<InputRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InputAccepted>), ApiError> {
    let data = body(payload)?.into_bytes()?;
    let bytes = state
        .registry
        .input(SessionId::new(session_id), auth.principal, data)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(InputAccepted { bytes })))
}

/// `DELETE /session/{id}`
pub async fn terminate_session(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .registry
        .terminate(SessionId::new(session_id), auth.principal)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Daemon
// ============================================================================

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: ProtocolVersion::CURRENT,
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

/// `GET /certificate`
pub async fn certificate(State(state): State<AppState>) -> Result<Json<CertificateResponse>, ApiError> {
    let info = state
        .certs
        .info()
        .ok_or_else(|| ApiError::Unavailable("no certificate loaded".to_string()))?;

    Ok(Json(CertificateResponse {
        fingerprint: info.fingerprint,
        provenance: info.provenance.as_str().to_string(),
        not_before: info.not_before,
        not_after: info.not_after,
        subject_alt_names: info.subject_alt_names,
        fallback: info.fallback,
        reloads: info.reloads,
    }))
}

/// `POST /certificate/reload`
pub async fn reload_certificate(
    State(state): State<AppState>,
    _auth: Authenticated,
) -> Result<Json<ReloadResponse>, ApiError> {
    let certs = Arc::clone(&state.certs);
    let outcome = tokio::task::spawn_blocking(move || certs.reload())
        .await
        .map_err(|e| ApiError::Unavailable(format!("reload task failed: {e}")))??;

    Ok(Json(ReloadResponse {
        previous_fingerprint: outcome.previous,
        fingerprint: outcome.current,
        changed: outcome.changed,
    }))
}

/// `GET /events`
pub async fn global_events(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(principal = %auth.principal, "Global event subscriber connected");
    Sse::new(global_stream(
        state.hub.subscribe(),
        state.registry.subscribe(),
        auth.principal,
        state.config.heartbeat_interval,
    ))
}
