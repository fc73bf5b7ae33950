use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chat_relay_error::{ErrorType, ProblemDetails, RelayError};
use futures::{stream, Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::VERSION;
use crate::config::RelayConfig;
use crate::history::{ConversationSummary, HistoryReconciler};
use crate::session::{AbortOutcome, MessageOptions, Session, SessionInfo};
use crate::session_manager::SessionManager;
use crate::stream_event::{StreamEvent, UserMessageData};
use crate::subscriber::{ChannelSubscriber, Subscriber};

mod types;

pub use types::*;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub struct AppState {
    session_manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>) -> Self {
        Self { session_manager }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let history = HistoryReconciler::new(Arc::new(config.transcript_store()));
        let session_manager =
            SessionManager::new(Arc::new(config.producer()), history, config.idle_timeout);
        Self::new(session_manager)
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/chat", post(post_chat))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:session_id/stream", get(stream_session))
        .route("/sessions/:session_id/abort", post(abort_session))
        .route("/projects/:project/conversations", get(list_conversations))
        .route(
            "/projects/:project/conversations/:session_id",
            get(get_conversation),
        )
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("CHAT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.session_manager.shutdown();
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        post_chat,
        list_sessions,
        stream_session,
        abort_session,
        list_conversations,
        get_conversation
    ),
    components(
        schemas(
            HealthResponse,
            ChatRequest,
            StreamQuery,
            StreamEvent,
            UserMessageData,
            AbortOutcome,
            SessionInfo,
            SessionListResponse,
            ConversationSummary,
            ConversationListResponse,
            ConversationHistoryResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Chat sessions and streaming"),
        (name = "projects", description = "Persisted conversations")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:3001")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

/// Keeps a subscriber attached for as long as its stream is alive.
struct Subscription {
    session: Arc<Session>,
    subscriber_id: String,
}

impl Subscription {
    fn attach(
        session: Arc<Session>,
        resume_from: Option<&str>,
    ) -> Result<(Self, UnboundedReceiver<StreamEvent>), RelayError> {
        let (subscriber, receiver) = ChannelSubscriber::new();
        let subscriber_id = subscriber.id().to_string();
        session
            .subscribe(Arc::new(subscriber), resume_from)
            .map_err(|err| RelayError::StreamError {
                message: err.to_string(),
            })?;
        Ok((
            Self {
                session,
                subscriber_id,
            },
            receiver,
        ))
    }

    /// Yields the subscriber's events. With `until`, the stream ends right
    /// after the `done` event of that message.
    fn into_stream(
        self,
        receiver: UnboundedReceiver<StreamEvent>,
        until: Option<String>,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        stream::unfold(
            Some((receiver, self)),
            move |state| {
                let until = until.clone();
                async move {
                    let Some((mut receiver, subscription)) = state else {
                        return None;
                    };
                    let Some(event) = receiver.recv().await else {
                        return None;
                    };
                    let finished = event.is_done() && until.as_deref() == Some(event.message_id());
                    let next = (!finished).then_some((receiver, subscription));
                    Some((event, next))
                }
            },
        )
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.unsubscribe(&self.subscriber_id);
    }
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.message_id())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}

fn into_sse(
    events: impl Stream<Item = StreamEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "404 Not Found".to_string())
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "SSE stream of StreamEvent, ending with the message's done event"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(RelayError::invalid_request("message must not be empty").into());
    }
    let working_directory = request.working_directory.map(PathBuf::from);
    let session = state
        .session_manager
        .get_or_create_session(request.session_id.as_deref(), working_directory.clone())
        .await;

    // Only events from here on: the caller already has the earlier history.
    let seen = session.last_message_id();
    let (subscription, receiver) = Subscription::attach(session.clone(), seen.as_deref())?;
    let message_id = session.queue_message(
        request.message,
        MessageOptions {
            allowed_tools: request.allowed_tools,
            working_directory,
            permission_mode: request.permission_mode,
        },
    )?;

    Ok(into_sse(subscription.into_stream(receiver, Some(message_id))))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    responses((status = 200, body = SessionListResponse)),
    tag = "sessions"
)]
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.session_manager.list_sessions(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/stream",
    params(
        ("session_id" = String, Path, description = "Agent session id"),
        ("resumeFrom" = Option<String>, Query, description = "Replay only events after the last event with this message id"),
        ("workingDirectory" = Option<String>, Query, description = "Project directory used to load the transcript")
    ),
    responses((status = 200, description = "SSE stream of StreamEvent")),
    tag = "sessions"
)]
async fn stream_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .session_manager
        .get_or_create_session(
            Some(&session_id),
            query.working_directory.map(PathBuf::from),
        )
        .await;
    let (subscription, receiver) = Subscription::attach(session, query.resume_from.as_deref())?;
    Ok(into_sse(subscription.into_stream(receiver, None)))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/abort",
    params(("session_id" = String, Path, description = "Agent session id")),
    responses(
        (status = 200, body = AbortOutcome),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<AbortOutcome>, ApiError> {
    let session = state
        .session_manager
        .get_session(&session_id)
        .ok_or(RelayError::SessionNotFound { session_id })?;
    Ok(Json(session.abort()))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project}/conversations",
    params(("project" = String, Path, description = "Project path or encoded project directory")),
    responses(
        (status = 200, body = ConversationListResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let conversations = state
        .session_manager
        .history()
        .list_conversations(&project)
        .await?;
    Ok(Json(ConversationListResponse { conversations }))
}

#[utoipa::path(
    get,
    path = "/v1/projects/{project}/conversations/{session_id}",
    params(
        ("project" = String, Path, description = "Project path or encoded project directory"),
        ("session_id" = String, Path, description = "Agent session id")
    ),
    responses(
        (status = 200, body = ConversationHistoryResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "projects"
)]
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path((project, session_id)): Path<(String, String)>,
) -> Result<Json<ConversationHistoryResponse>, ApiError> {
    let events = state
        .session_manager
        .history()
        .load(&project, &session_id)
        .await?;
    Ok(Json(ConversationHistoryResponse { session_id, events }))
}
