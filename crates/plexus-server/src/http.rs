use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use plexus_core::{PluginEvent, QueryEvent, SessionId};
use plexus_plugins::PluginError;
use plexus_store::StoreError;

use crate::error::OrchestratorError;
use crate::orchestrator::QueryOrchestrator;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<QueryOrchestrator>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<QueryOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/query", post(run_query))
        .route("/api/sessions/{id}/stop", post(stop_query))
        .route("/api/sessions/{id}/events", get(session_events))
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/events", get(plugin_events))
        .route("/api/plugins/{name}/tools/{tool}", post(invoke_tool))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Store(e) => e.into(),
            other => {
                let status = match other {
                    OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
                    OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                Self::new(status, other.error_kind(), other.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            return Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string());
        }
        warn!(error = %err, "store failure while serving request");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store", err.to_string())
    }
}

impl From<PluginError> for ApiError {
    fn from(err: PluginError) -> Self {
        let status = match &err {
            PluginError::UnknownPlugin(_) => StatusCode::NOT_FOUND,
            PluginError::Unavailable { .. } | PluginError::PortsExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PluginError::NotRunning(_) => StatusCode::CONFLICT,
            PluginError::Supervisor(_) | PluginError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.error_kind(), err.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    let plugins = state.orchestrator.plugins().plugins();
    let running = plugins
        .iter()
        .filter(|p| state.orchestrator.plugins().is_running(&p.name))
        .count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "activeQueries": state.orchestrator.active_count(),
        "plugins": { "known": plugins.len(), "running": running },
    }))
}

#[derive(Debug, Deserialize)]
struct CreateSession {
    #[serde(default)]
    name: String,
    #[serde(default)]
    plugins: Vec<String>,
}

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.orchestrator.store().list_sessions()?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSession>,
) -> ApiResult<impl IntoResponse> {
    let meta = state
        .orchestrator
        .store()
        .create_session(&body.name, &body.plugins)?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let id = SessionId::from_raw(id);
    let store = state.orchestrator.store();
    let meta = store.get_session(&id)?;
    let messages = store.messages(&id)?;
    let notes = store.notes(&id)?;
    Ok(Json(json!({
        "session": meta,
        "messages": messages,
        "notes": notes,
        "query": state.orchestrator.state(&id),
    })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = SessionId::from_raw(id);
    if state.orchestrator.state(&id).running {
        return Err(OrchestratorError::Conflict(id).into());
    }
    state.orchestrator.store().delete_session(&id)?;
    state.orchestrator.hub().close(&id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    message: String,
}

async fn run_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<QueryBody>,
) -> ApiResult<impl IntoResponse> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    let id = SessionId::from_raw(id);
    let accepted = state.orchestrator.run_query(&id, &body.message).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn stop_query(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let stopped = state.orchestrator.stop_query(&SessionId::from_raw(id));
    Json(json!({ "stopped": stopped }))
}

async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = SessionId::from_raw(id);
    state.orchestrator.store().get_session(&id)?;
    let rx = state.orchestrator.hub().subscribe(&id);
    Ok(sse(rx, QueryEvent::event_type))
}

async fn list_plugins(State(state): State<AppState>) -> Json<Value> {
    let manager = state.orchestrator.plugins();
    let plugins: Vec<Value> = manager
        .plugins()
        .into_iter()
        .map(|p| {
            let refs = manager.reference_count(&p.name);
            let pinned = manager.is_pinned(&p.name);
            let mut value = serde_json::to_value(&p).unwrap_or(Value::Null);
            if let Some(obj) = value.as_object_mut() {
                obj.insert("references".into(), json!(refs));
                obj.insert("pinned".into(), json!(pinned));
            }
            value
        })
        .collect();
    Json(json!({ "plugins": plugins }))
}

async fn plugin_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse(state.orchestrator.plugins().subscribe(), PluginEvent::event_type)
}

async fn invoke_tool(
    State(state): State<AppState>,
    Path((name, tool)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let arguments = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid tool arguments: {e}")))?
    };
    let result = state
        .orchestrator
        .plugins()
        .invoke_tool(&name, &tool, arguments)
        .await?;
    Ok(Json(result))
}

/// Forward a broadcast feed as SSE, one named event per message. Lagged
/// receivers skip what they missed.
fn sse<T>(
    rx: broadcast::Receiver<T>,
    kind: fn(&T) -> &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Clone + Send + 'static,
{
    let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(value) => Some(Ok(to_event(kind(&value), &value))),
        Err(e) => {
            warn!(error = %e, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event<T: Serialize>(kind: &str, value: &T) -> Event {
    match Event::default().event(kind).json_data(value) {
        Ok(event) => event,
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_errors_map_to_status() {
        let id = SessionId::from_raw("2026-10-16-x");
        let not_found: ApiError = OrchestratorError::NotFound(id.clone()).into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        let conflict: ApiError = OrchestratorError::Conflict(id).into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.body.code, "conflict");
        let aborted: ApiError = OrchestratorError::Aborted(SessionId::from_raw("2026-10-16-y")).into();
        assert_eq!(aborted.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn plugin_errors_map_to_status() {
        let unknown: ApiError = PluginError::UnknownPlugin("ghost".into()).into();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);
        let unavailable: ApiError = PluginError::Unavailable {
            plugin: "broken".into(),
            reason: "args never mention ${PORT}".into(),
        }
        .into();
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
