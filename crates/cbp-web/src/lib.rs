//! Axum JSON surface over the purchase index.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use cbp_core::Notice;
use cbp_sync::{PurchaseIndex, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "cbp-web";

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<PurchaseIndex>,
}

impl AppState {
    pub fn new(index: Arc<PurchaseIndex>) -> Self {
        Self { index }
    }
}

#[derive(Debug, Deserialize)]
struct BoughtQuery {
    product_id: i64,
    #[serde(default)]
    user_id: i64,
    #[serde(default)]
    customer_email: String,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BoughtResponse {
    pub bought: bool,
}

#[derive(Debug, Default, Deserialize)]
struct NoticeQuery {
    do_update: Option<String>,
    dismiss: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NoticeResponse {
    pub notice: Notice,
    pub has_synced: bool,
    pub updating: bool,
    pub worker_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub source_id: i64,
    pub removed: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/customer-bought-product", get(bought_handler))
        .route("/notice", get(notice_handler))
        .route("/healthcheck", post(healthcheck_handler))
        .route("/sources/{id}", delete(remove_source_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(index: Arc<PurchaseIndex>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(index))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = config.web_port;
    let index = Arc::new(PurchaseIndex::connect(config).await?);
    index.ensure_schema().await?;
    serve(index, port).await
}

async fn bought_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BoughtQuery>,
) -> Response {
    match state
        .index
        .filter_bought(
            query.default,
            &query.customer_email,
            query.user_id,
            query.product_id,
        )
        .await
    {
        Ok(bought) => Json(BoughtResponse { bought }).into_response(),
        Err(err) => server_error(err),
    }
}

async fn notice_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NoticeQuery>,
) -> Response {
    if query.do_update.is_some() {
        if let Err(err) = state.index.request_update().await {
            return server_error(err);
        }
    }
    if query.dismiss.is_some() {
        if let Err(err) = state.index.dismiss_notice().await {
            return server_error(err);
        }
    }
    match state.index.status().await {
        Ok(status) => Json(NoticeResponse {
            notice: status.notice,
            has_synced: status.has_synced,
            updating: status.updating,
            worker_running: status.worker_running,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn healthcheck_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.index.health_check().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

async fn remove_source_handler(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<i64>,
) -> Response {
    match state.index.remove_entries_for_source_id(source_id).await {
        Ok(removed) => Json(RemovedResponse { source_id, removed }).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
