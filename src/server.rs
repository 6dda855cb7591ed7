//! HTTP surface: the webhook intake endpoint and the admin API.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::admin::{
    AttemptHistory, DeadLetterList, EventList, MetricsReport, ReplayReceipt, DEFAULT_LIST_LIMIT,
};
use crate::error::GatewayResult;
use crate::gateway::Gateway;
use crate::ingest::IngestReceipt;
use crate::signing::SIGNATURE_HEADER;
use crate::types::{EventId, TenantId};

pub const TENANT_HEADER: &str = "X-Tenant-ID";

#[derive(Debug, Default, Deserialize)]
struct TenantQuery {
    tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
    limit: Option<usize>,
}

fn tenant_filter(raw: Option<String>) -> Option<TenantId> {
    raw.filter(|t| !t.is_empty()).map(TenantId)
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    message: &'static str,
    status: &'static str,
}

/// Build the application router over a shared gateway.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/webhook", post(receive_webhook))
        .route("/admin/metrics", get(metrics))
        .route("/admin/events", get(list_events))
        .route("/admin/events/{id}/attempts", get(event_attempts))
        .route("/admin/dead-letters", get(dead_letters))
        .route("/admin/replay/{id}", post(replay))
        .with_state(gateway)
}

async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "Webhook gateway",
        status: "running",
    })
}

async fn receive_webhook(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> GatewayResult<Json<IngestReceipt>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let tenant = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok());

    let receipt = gateway.ingestor().ingest(&body, signature, tenant).await?;
    Ok(Json(receipt))
}

async fn metrics(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<TenantQuery>,
) -> GatewayResult<Json<MetricsReport>> {
    let tenant = tenant_filter(query.tenant_id);
    Ok(Json(gateway.admin().metrics(tenant.as_ref()).await?))
}

async fn list_events(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ListQuery>,
) -> GatewayResult<Json<EventList>> {
    let tenant = tenant_filter(query.tenant_id);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(gateway.admin().events(tenant.as_ref(), limit).await?))
}

async fn event_attempts(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<i64>,
) -> GatewayResult<Json<AttemptHistory>> {
    Ok(Json(gateway.admin().attempts(EventId(id)).await?))
}

async fn dead_letters(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ListQuery>,
) -> GatewayResult<Json<DeadLetterList>> {
    let tenant = tenant_filter(query.tenant_id);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(gateway.admin().dead_letters(tenant.as_ref(), limit).await?))
}

async fn replay(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<i64>,
) -> GatewayResult<Json<ReplayReceipt>> {
    Ok(Json(gateway.admin().replay(id).await?))
}
