use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::features::{Feature, FeatureFilter, FeatureModel, FeatureStatus, FeatureUpdate};
use crate::store::Store;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("feature error: {0}")]
    Feature(#[from] crate::features::FeatureError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    events: broadcast::Sender<ServerEvent>,
}

#[derive(Clone, Debug)]
enum ServerEvent {
    Features(Vec<Feature>),
    FeatureUpdated(Feature),
}

fn into_sse(event: ServerEvent) -> Event {
    match event {
        ServerEvent::Features(features) => Event::default()
            .event("features")
            .json_data(features)
            .unwrap_or_else(|_| Event::default().event("features").data("[]")),
        ServerEvent::FeatureUpdated(feature) => Event::default()
            .event("feature-updated")
            .json_data(feature)
            .unwrap_or_else(|_| Event::default().event("feature-updated").data("{}")),
    }
}

pub fn router(store: Arc<Store>) -> Router {
    let (tx, _rx) = broadcast::channel(64);
    let state = AppState {
        store: store.clone(),
        events: tx.clone(),
    };

    tokio::spawn(poll_and_broadcast(store, tx));

    Router::new()
        .route("/api/features", get(list_features))
        .route("/api/features/:id", get(get_feature).patch(patch_feature))
        .route("/api/status", get(status))
        .route("/api/openspec/changes", get(openspec_changes))
        .route("/api/config", get(get_config))
        .route("/api/events", get(events))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve on loopback. Runs until the process is killed.
pub async fn serve(store: Arc<Store>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "read-model server listening");
    axum::serve(listener, router(store)).await
}

/// Every 2 seconds, snapshot the feature list; broadcast `features` only when
/// the serialized snapshot differs from the previous tick. Snapshot failures
/// (store contended by the writer) are silently skipped — the next tick
/// retries, this never crashes the task.
async fn poll_and_broadcast(store: Arc<Store>, tx: broadcast::Sender<ServerEvent>) {
    let mut previous: Option<String> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        let fm = FeatureModel::new(&store);
        let Ok(features) = fm.list(&FeatureFilter::default()) else {
            continue;
        };
        let Ok(serialized) = serde_json::to_string(&features) else {
            continue;
        };
        if previous.as_deref() != Some(serialized.as_str()) {
            previous = Some(serialized);
            let _ = tx.send(ServerEvent::Features(features));
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    status: Option<String>,
    assigned: Option<String>,
}

async fn list_features(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Feature>>, ApiError> {
    let fm = FeatureModel::new(&state.store);
    let filter = FeatureFilter {
        status: query.status.as_deref().map(parse_status),
        assigned_to: query.assigned,
    };
    Ok(Json(fm.list(&filter)?))
}

fn parse_status(s: &str) -> FeatureStatus {
    match s {
        "in-dev" => FeatureStatus::InDev,
        "ready-for-review" => FeatureStatus::ReadyForReview,
        "approved" => FeatureStatus::Approved,
        "needs-revision" => FeatureStatus::NeedsRevision,
        "qa-testing" => FeatureStatus::QaTesting,
        "pr-open" => FeatureStatus::PrOpen,
        "complete" => FeatureStatus::Complete,
        _ => FeatureStatus::Pending,
    }
}

async fn get_feature(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Feature>, ApiError> {
    let fm = FeatureModel::new(&state.store);
    match fm.get(&id) {
        Ok(f) => Ok(Json(f)),
        Err(crate::features::FeatureError::NotFound(_)) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[derive(Debug, Deserialize, Default)]
struct PatchBody {
    description: Option<String>,
    notes: Option<String>,
    status: Option<String>,
    assigned_to: Option<String>,
    passes: Option<bool>,
}

async fn patch_feature(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<PatchBody>,
) -> Result<Json<Feature>, ApiError> {
    let fm = FeatureModel::new(&state.store);
    let update = FeatureUpdate {
        description: body.description,
        notes: body.notes,
        status: body.status.as_deref().map(parse_status),
        assigned_to: body.assigned_to,
        passes: body.passes,
        ..Default::default()
    };
    let updated = match fm.update(&id, update) {
        Ok(f) => f,
        Err(crate::features::FeatureError::NotFound(_)) => return Err(ApiError::NotFound),
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };
    let _ = state.events.send(ServerEvent::FeatureUpdated(updated.clone()));
    Ok(Json(updated))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let fm = FeatureModel::new(&state.store);
    let all = fm.list(&FeatureFilter::default())?;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for f in &all {
        *counts.entry(status_label(&f.status)).or_insert(0) += 1;
    }
    Ok(Json(json!({
        "total": all.len(),
        "by_status": counts,
    })))
}

fn status_label(status: &FeatureStatus) -> &'static str {
    match status {
        FeatureStatus::Pending => "pending",
        FeatureStatus::InDev => "in-dev",
        FeatureStatus::ReadyForReview => "ready-for-review",
        FeatureStatus::Approved => "approved",
        FeatureStatus::NeedsRevision => "needs-revision",
        FeatureStatus::QaTesting => "qa-testing",
        FeatureStatus::PrOpen => "pr-open",
        FeatureStatus::Complete => "complete",
    }
}

async fn openspec_changes(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let fm = FeatureModel::new(&state.store);
    let all = fm.list(&FeatureFilter::default())?;
    let mut groups: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for f in &all {
        if f.openspec_change_id.is_empty() {
            continue;
        }
        let entry = groups.entry(f.openspec_change_id.clone()).or_insert((0, 0));
        entry.1 += 1;
        if f.status == FeatureStatus::Complete {
            entry.0 += 1;
        }
    }
    let out: BTreeMap<String, Value> = groups
        .into_iter()
        .map(|(change, (complete, total))| {
            (change, json!({"complete": complete, "total": total}))
        })
        .collect();
    Ok(Json(json!(out)))
}

async fn get_config(State(state): State<AppState>) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let config = Config::new(&state.store);
    Ok(Json(config.snapshot()?))
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| msg.ok().map(|event| Ok(into_sse(event))));
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

enum ApiError {
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "feature not found").into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<crate::features::FeatureError> for ApiError {
    fn from(e: crate::features::FeatureError) -> Self {
        match e {
            crate::features::FeatureError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigError> for ApiError {
    fn from(e: crate::config::ConfigError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
