use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum::response::sse::KeepAlive;
use axum::response::{IntoResponse, Sse};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use agent_relay_agent_management::agents::{AgentCatalog, AgentDefinition, AgentId};
use agent_relay_error::{ErrorType, ProblemDetails, RelayError};

use crate::chat::{
    generate_session_name, run_oneshot, turn_stream, ChatRequest, TurnMode,
};
use crate::launcher::{probe_version, AgentInvocation, OutputMode};
use crate::session_store::{SessionEntry, SessionStore};
use crate::translate::OutwardEvent;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct AppState {
    catalog: AgentCatalog,
    registries: HashMap<AgentId, Arc<SessionStore>>,
    cancel: watch::Sender<bool>,
}

impl AppState {
    pub fn new(catalog: AgentCatalog, data_dir: PathBuf) -> Self {
        let (cancel, _) = watch::channel(false);
        let registries = catalog
            .agents()
            .map(|definition| {
                (
                    definition.id,
                    Arc::new(SessionStore::for_agent(&data_dir, definition.id)),
                )
            })
            .collect();
        Self {
            catalog,
            registries,
            cancel,
        }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    /// Stop signal observed by every in-flight turn. Fired on shutdown.
    pub fn cancel_all(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn subscribe_cancel(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    fn registry(&self, agent: AgentId) -> Result<Arc<SessionStore>, RelayError> {
        self.registries
            .get(&agent)
            .cloned()
            .ok_or_else(|| RelayError::UnsupportedAgent {
                agent: agent.to_string(),
            })
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let api_router = Router::new()
        .route("/health", get(get_health))
        .route("/agents", get(list_agents))
        .route("/agents/:agent/status", get(get_agent_status))
        .route("/agents/:agent/chat", post(post_chat))
        .route("/agents/:agent/chat/stream", post(post_chat_stream))
        .route(
            "/agents/:agent/sessions",
            get(list_sessions).post(upsert_session),
        )
        .route("/agents/:agent/sessions/:session_id", delete(delete_session))
        .route("/agents/:agent/name-session", post(name_session))
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .merge(api_router)
        .fallback(not_found);

    let http_logging = match std::env::var("AGENT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let include_headers = std::env::var("AGENT_RELAY_LOG_HTTP_HEADERS").is_ok();
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(move |req: &Request<_>| {
                if include_headers {
                    let mut headers = Vec::new();
                    for (name, value) in req.headers().iter() {
                        let name_str = name.as_str();
                        let display_value = if name_str.eq_ignore_ascii_case("authorization") {
                            "<redacted>".to_string()
                        } else {
                            value.to_str().unwrap_or("<binary>").to_string()
                        };
                        headers.push((name_str.to_string(), display_value));
                    }
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri(),
                        headers = ?headers
                    )
                } else {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                }
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

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        get_agent_status,
        post_chat,
        post_chat_stream,
        list_sessions,
        upsert_session,
        delete_session,
        name_session
    ),
    components(
        schemas(
            HealthResponse,
            AgentInfo,
            AgentListResponse,
            AgentStatusResponse,
            ChatRequest,
            TurnMode,
            ChatResponse,
            OutwardEvent,
            SessionEntry,
            SessionListResponse,
            UpsertSessionRequest,
            NameSessionRequest,
            NameSessionResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agents", description = "Agent availability"),
        (name = "chat", description = "Chat turns"),
        (name = "sessions", description = "Session registry")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:8000")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct AgentInfo {
    pub id: String,
    pub available: bool,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct AgentStatusResponse {
    pub agent: String,
    pub available: bool,
    pub version: Option<String>,
    pub path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct ChatResponse {
    pub result: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct UpsertSessionRequest {
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub first_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct NameSessionRequest {
    pub session_id: String,
    pub first_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct NameSessionResponse {
    pub session_id: String,
    pub name: String,
}

const SERVER_INFO: &str = "\
This is an Agent Relay server. Available endpoints:\n\
  - GET  /              - Server info\n\
  - GET  /health        - Health check\n\
  - GET  /agents        - Agent availability\n\
  - GET  /openapi.json  - API document\n\n\
Chat and session endpoints live under /agents/{agent}/.";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server health", body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/agents",
    responses((status = 200, description = "Known agents and their availability", body = AgentListResponse)),
    tag = "agents"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    let mut agents: Vec<AgentInfo> = state
        .catalog
        .agents()
        .map(|definition| {
            let resolved = state.catalog.resolve(definition.id);
            AgentInfo {
                id: definition.id.to_string(),
                available: resolved.is_ok(),
                path: resolved.ok().map(|path| path.display().to_string()),
            }
        })
        .collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));
    Json(AgentListResponse { agents })
}

#[utoipa::path(
    get,
    path = "/agents/{agent}/status",
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Executable availability and version", body = AgentStatusResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agents"
)]
async fn get_agent_status(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<Json<AgentStatusResponse>, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    let definition = definition_for(&state, agent_id)?;

    let response = match state.catalog.resolve(agent_id) {
        Err(err) => AgentStatusResponse {
            agent: agent_id.to_string(),
            available: false,
            version: None,
            path: None,
            error: Some(err.to_string()),
        },
        Ok(path) => match probe_version(&definition).await {
            Ok(version) => AgentStatusResponse {
                agent: agent_id.to_string(),
                available: true,
                version: Some(version),
                path: Some(path.display().to_string()),
                error: None,
            },
            Err(err) => AgentStatusResponse {
                agent: agent_id.to_string(),
                available: false,
                version: None,
                path: Some(path.display().to_string()),
                error: Some(err.to_string()),
            },
        },
    };
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/agents/{agent}/chat",
    request_body = ChatRequest,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Completed turn", body = ChatResponse),
        (status = 400, body = ProblemDetails),
        (status = 502, body = ProblemDetails),
        (status = 504, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    validate_message(&request.message)?;
    let definition = definition_for(&state, agent_id)?;

    let budget = request
        .mode
        .unwrap_or(TurnMode::Quick)
        .budget(definition.default_timeout);
    let invocation = AgentInvocation {
        prompt: request.message.clone(),
        resume_session_id: request.session_id.clone(),
        allowed_tools: request.allowed_tools.clone(),
        output: OutputMode::Json,
    };

    let outcome = run_oneshot(&definition, &invocation, budget).await?;
    if let Some(session_id) = &outcome.session_id {
        let registry = state.registry(agent_id)?;
        if let Err(err) = registry.record_turn(session_id, &request.message).await {
            tracing::warn!(session_id, error = %err, "failed to record session turn");
        }
    }

    Ok(Json(ChatResponse {
        result: outcome.text,
        session_id: outcome.session_id,
        duration_ms: outcome.duration_ms,
        cost_usd: outcome.cost_usd,
        is_error: outcome.is_error,
    }))
}

#[utoipa::path(
    post,
    path = "/agents/{agent}/chat/stream",
    request_body = ChatRequest,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "SSE turn stream"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "chat"
)]
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<axum::response::Response, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    validate_message(&request.message)?;
    let definition = definition_for(&state, agent_id)?;
    let registry = state.registry(agent_id)?;

    // The stream itself always opens; spawn failures arrive as error frames.
    let stream = turn_stream(definition, registry, request, state.subscribe_cancel());
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response();
    let headers = response.headers_mut();
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/agents/{agent}/sessions",
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Sessions, most recently used first", body = SessionListResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<Json<SessionListResponse>, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    let sessions = state.registry(agent_id)?.list().await?;
    Ok(Json(SessionListResponse { sessions }))
}

#[utoipa::path(
    post,
    path = "/agents/{agent}/sessions",
    request_body = UpsertSessionRequest,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Created or renamed session", body = SessionEntry),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn upsert_session(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<UpsertSessionRequest>,
) -> Result<Json<SessionEntry>, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    if request.session_id.trim().is_empty() {
        return Err(invalid_request("session_id must not be empty"));
    }
    if request.name.trim().is_empty() {
        return Err(invalid_request("name must not be empty"));
    }
    let entry = state
        .registry(agent_id)?
        .upsert(
            &request.session_id,
            &request.name,
            request.first_message.as_deref(),
        )
        .await?;
    Ok(Json(entry))
}

#[utoipa::path(
    delete,
    path = "/agents/{agent}/sessions/{session_id}",
    params(
        ("agent" = String, Path, description = "Agent id"),
        ("session_id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path((agent, session_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    state.registry(agent_id)?.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/agents/{agent}/name-session",
    request_body = NameSessionRequest,
    params(("agent" = String, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Generated session name", body = NameSessionResponse),
        (status = 400, body = ProblemDetails)
    ),
    tag = "sessions"
)]
async fn name_session(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Json(request): Json<NameSessionRequest>,
) -> Result<Json<NameSessionResponse>, ApiError> {
    let agent_id = parse_agent_id(&agent)?;
    if request.session_id.trim().is_empty() {
        return Err(invalid_request("session_id must not be empty"));
    }
    if request.first_message.trim().is_empty() {
        return Err(invalid_request("first_message must not be empty"));
    }
    let definition = definition_for(&state, agent_id)?;

    let name = generate_session_name(&definition, &request.first_message).await;
    state
        .registry(agent_id)?
        .upsert(&request.session_id, &name, Some(&request.first_message))
        .await?;

    Ok(Json(NameSessionResponse {
        session_id: request.session_id,
        name,
    }))
}

fn parse_agent_id(agent: &str) -> Result<AgentId, ApiError> {
    AgentId::parse(agent).ok_or_else(|| {
        ApiError::Relay(RelayError::UnsupportedAgent {
            agent: agent.to_string(),
        })
    })
}

fn definition_for(state: &AppState, agent: AgentId) -> Result<AgentDefinition, ApiError> {
    state.catalog.definition(agent).cloned().ok_or_else(|| {
        ApiError::Relay(RelayError::UnsupportedAgent {
            agent: agent.to_string(),
        })
    })
}

fn validate_message(message: &str) -> Result<(), ApiError> {
    if message.trim().is_empty() {
        return Err(invalid_request("message must not be empty"));
    }
    Ok(())
}

fn invalid_request(message: &str) -> ApiError {
    ApiError::Relay(RelayError::InvalidRequest {
        message: message.to_string(),
    })
}
