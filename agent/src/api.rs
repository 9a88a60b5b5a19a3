//! HTTP API
//!
//! Every route requires the `access_token` header. Core operations shell out
//! and touch the filesystem, so they run on the blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode as HttpStatus},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::applications::running_applications;
use crate::command::CommandRunner;
use crate::config::AgentConfig;
use crate::error::{AgentError, StatusCode};
use crate::files::collect_files;
use crate::inventory::{HostInspector, InfoKind};
use crate::plugin::PluginManager;
use crate::probe::{ProbeConfigStore, SwitchMode};
use crate::resource::ResourceInspector;
use crate::token::TokenStore;

pub const TOKEN_HEADER: &str = "access_token";

/// Everything the handlers need, shared across requests.
pub struct AgentState {
    pub plugins: PluginManager,
    pub inventory: HostInspector,
    pub tokens: TokenStore,
    pub scanned_applications: Vec<String>,
}

impl AgentState {
    pub fn new(config: &AgentConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            plugins: PluginManager::new(
                runner.clone(),
                ResourceInspector::new(runner.clone()),
                ProbeConfigStore::new(&config.gopher.config_path),
            ),
            inventory: HostInspector::new(runner),
            tokens: TokenStore::load(&config.agent.token_file),
            scanned_applications: config.collect.scanned_applications.clone(),
        }
    }
}

type SharedState = Arc<AgentState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/agent/basic/info", get(host_info))
        .route("/v1/agent/plugin/info", get(plugin_info))
        .route("/v1/agent/plugin/start", post(start_plugin))
        .route("/v1/agent/plugin/stop", post(stop_plugin))
        .route("/v1/agent/collect/items/change", post(change_collect_items))
        .route("/v1/agent/application/info", get(application_info))
        .route("/v1/agent/file/collect", post(collect_file))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `[agent].ip:port` and serve until interrupted.
pub async fn serve(config: &AgentConfig, state: SharedState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.agent.ip, config.agent.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Agent API listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn require_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(provided) = headers.get(TOKEN_HEADER) else {
        return (HttpStatus::BAD_REQUEST, Json(StatusCode::ParamError.bare())).into_response();
    };
    let provided = provided.to_str().unwrap_or_default();
    if !state.tokens.verify(provided) {
        warn!("Rejected request to {} with invalid token", request.uri().path());
        return Json(StatusCode::TokenError.bare()).into_response();
    }
    next.run(request).await
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(state: &SharedState, f: F) -> Result<T, Json<Value>>
where
    F: FnOnce(&AgentState) -> T + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            warn!("Blocking task failed: {e}");
            Json(StatusCode::ServerError.bare())
        })
}

fn error_body(err: &AgentError) -> Json<Value> {
    warn!("{err}");
    Json(err.status_code().bare())
}

#[derive(Deserialize)]
struct InfoQuery {
    #[serde(default)]
    info_type: Option<String>,
}

async fn host_info(
    State(state): State<SharedState>,
    Query(query): Query<InfoQuery>,
) -> Result<Json<Value>, Json<Value>> {
    let requested: Vec<&str> = query
        .info_type
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let kinds = InfoKind::parse_list(&requested).map_err(|e| error_body(&e))?;

    let info = blocking(&state, move |s| s.inventory.host_info(&kinds)).await?;
    Ok(Json(StatusCode::Success.body(json!({ "resp": info }))))
}

async fn plugin_info(State(state): State<SharedState>) -> Result<Json<Value>, Json<Value>> {
    let infos = blocking(&state, |s| s.plugins.all_plugin_info()).await?;
    Ok(Json(StatusCode::Success.body(json!({ "resp": infos }))))
}

#[derive(Deserialize)]
struct PluginQuery {
    plugin_name: String,
}

async fn start_plugin(
    State(state): State<SharedState>,
    Query(query): Query<PluginQuery>,
) -> Result<Json<Value>, Json<Value>> {
    transition(state, query.plugin_name, true).await
}

async fn stop_plugin(
    State(state): State<SharedState>,
    Query(query): Query<PluginQuery>,
) -> Result<Json<Value>, Json<Value>> {
    transition(state, query.plugin_name, false).await
}

async fn transition(state: SharedState, name: String, start: bool) -> Result<Json<Value>, Json<Value>> {
    if name.trim().is_empty() {
        return Err(Json(StatusCode::ParamError.bare()));
    }
    let result = blocking(&state, move |s| {
        if start {
            s.plugins.start_plugin(&name)
        } else {
            s.plugins.stop_plugin(&name)
        }
    })
    .await?;
    match result {
        Ok(()) => Ok(Json(StatusCode::Success.bare())),
        Err(e) => Err(error_body(&e)),
    }
}

/// `{plugin: {probe: mode}}` with every mode validated.
fn parse_change_request(body: &Map<String, Value>) -> Result<Vec<(String, Vec<(String, SwitchMode)>)>, AgentError> {
    if body.is_empty() {
        return Err(AgentError::ParamInvalid("no plugin given".into()));
    }
    let mut parsed = Vec::with_capacity(body.len());
    for (plugin, items) in body {
        let items = items
            .as_object()
            .ok_or_else(|| AgentError::ParamInvalid(format!("items of {plugin} must be an object")))?;
        let mut requested = Vec::with_capacity(items.len());
        for (probe, mode) in items {
            let mode = mode
                .as_str()
                .ok_or_else(|| AgentError::ParamInvalid(format!("mode of {probe} must be a string")))?
                .parse::<SwitchMode>()
                .map_err(AgentError::ParamInvalid)?;
            requested.push((probe.clone(), mode));
        }
        parsed.push((plugin.clone(), requested));
    }
    Ok(parsed)
}

async fn change_collect_items(
    State(state): State<SharedState>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, Json<Value>> {
    let requests = parse_change_request(&body).map_err(|e| error_body(&e))?;

    let results = blocking(&state, move |s| {
        let mut results = Map::new();
        for (plugin, requested) in &requests {
            let result = s.plugins.change_items_status(plugin, requested);
            results.insert(plugin.clone(), json!(result));
        }
        results
    })
    .await?;
    Ok(Json(StatusCode::Success.body(json!({ "resp": results }))))
}

async fn application_info(State(state): State<SharedState>) -> Result<Json<Value>, Json<Value>> {
    let apps = blocking(&state, |s| {
        running_applications(s.plugins.services(), &s.scanned_applications)
    })
    .await?;
    Ok(Json(StatusCode::Success.body(json!({ "resp": apps }))))
}

async fn collect_file(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, Json<Value>> {
    let paths: Vec<String> = match body {
        Value::Array(items) if !items.is_empty() => items
            .into_iter()
            .map(|item| match item {
                Value::String(path) => Ok(path),
                _ => Err(AgentError::ParamInvalid("file paths must be strings".into())),
            })
            .collect::<Result<_, _>>()
            .map_err(|e| error_body(&e))?,
        _ => return Err(Json(StatusCode::ParamError.bare())),
    };

    let collected = blocking(&state, move |_| collect_files(&paths)).await?;
    Ok(Json(StatusCode::Success.body(collected)))
}
