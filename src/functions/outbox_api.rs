use crate::schema::{DeliveryResult, EnqueueOptions, OutboxItem};
use crate::services::store::OutboxStore;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_PULL_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub principal_id: String,
    pub destination: String,
    pub text: String,
    #[serde(flatten)]
    pub options: EnqueueOptions,
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    pub principal_id: String,
    pub worker_id: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    pub items: Vec<OutboxItem>,
}

#[derive(Debug, Deserialize)]
pub struct ReportBody {
    pub principal_id: String,
    pub worker_id: String,
    pub results: Vec<DeliveryResult>,
}

/// Worker- and producer-facing surface for a store running in its own
/// process. Delivery failures are data in the report body, never HTTP
/// errors; only store faults surface as 500s.
pub fn router(store: Arc<OutboxStore>) -> Router {
    Router::new()
        .route("/outbox/enqueue", post(enqueue))
        .route("/outbox/pull", get(pull))
        .route("/outbox/report", post(report))
        .with_state(store)
}

async fn enqueue(
    State(store): State<Arc<OutboxStore>>,
    Json(body): Json<EnqueueBody>,
) -> Result<Json<OutboxItem>, StatusCode> {
    store
        .enqueue(&body.principal_id, &body.destination, &body.text, body.options)
        .await
        .map(Json)
        .map_err(internal_error)
}

async fn pull(
    State(store): State<Arc<OutboxStore>>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, StatusCode> {
    let limit = params.limit.unwrap_or(10).min(MAX_PULL_LIMIT);
    let items = store
        .pull(&params.principal_id, limit, &params.worker_id, Utc::now())
        .await
        .map_err(internal_error)?;
    Ok(Json(PullResponse { items }))
}

async fn report(
    State(store): State<Arc<OutboxStore>>,
    Json(body): Json<ReportBody>,
) -> Result<StatusCode, StatusCode> {
    store
        .report(&body.principal_id, &body.worker_id, Utc::now(), &body.results)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn internal_error(e: anyhow::Error) -> StatusCode {
    tracing::error!(error = %e, "outbox api: store fault");
    StatusCode::INTERNAL_SERVER_ERROR
}
