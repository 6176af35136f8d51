//! HTTP management API.
//!
//! A thin layer over the registry and the local identity.  Label changes
//! fire the heartbeat trigger so the rest of the group sees them right away
//! instead of on the next keep-alive tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

use crate::heartbeat::Trigger;
use crate::identity::LocalHost;
use crate::prometheus::prepare_prometheus_output;
use crate::registry::Registry;
use crate::types::parse_labels;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub local: Arc<LocalHost>,
    pub trigger: Trigger,
    pub node_exporter_port: u16,
    pub token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/discovery", get(get_identification))
        .route("/v1/discoveries", get(list_discoveries))
        .route("/v1/discoveries/:hostname", get(get_discovery))
        .route("/v1/resolve", get(resolve))
        .route("/v1/prometheus/:name", get(prometheus))
        .route("/v1/labels", get(get_runtime_labels).post(add_labels).delete(delete_labels))
        .layer(middleware::from_fn_with_state(state.clone(), token_auth))
        .with_state(state)
}

/// Serves the API until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: ApiState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

async fn token_auth(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Token ").unwrap_or(v).trim())
        .unwrap_or_default();

    if digest(provided) != digest(expected) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"message": "access denied"})),
        )
            .into_response();
    }
    next.run(request).await
}

async fn get_identification(State(state): State<ApiState>) -> Response {
    match state.local.get_identification().await {
        Ok(discovery) => Json(discovery).into_response(),
        Err(e) => {
            error!("gathering identification info error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("gathering identification info error: {}\n", e),
            )
                .into_response()
        }
    }
}

async fn list_discoveries(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let labels = params.get("labels").map(|v| crate::config::split_list(v));
    let prefixes = params.get("prefixes").map(|v| crate::config::split_list(v));

    let discoveries = match (labels, prefixes) {
        (Some(labels), _) if !labels.is_empty() => state.registry.filter(&labels).await,
        (_, Some(prefixes)) if !prefixes.is_empty() => {
            state.registry.filter_prefix(&prefixes).await
        }
        _ => state.registry.get_all().await,
    };
    Json(discoveries).into_response()
}

async fn get_discovery(State(state): State<ApiState>, Path(hostname): Path<String>) -> Response {
    if !state.registry.exist(&hostname).await {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": format!("{} is not registered", hostname)})),
        )
            .into_response();
    }
    Json(state.registry.get(&hostname).await).into_response()
}

async fn resolve(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let label = params.get("label").cloned().unwrap_or_default();
    Json(state.registry.resolve(&label).await).into_response()
}

async fn prometheus(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let discoveries = state.registry.get_all().await;
    Json(prepare_prometheus_output(
        &name,
        state.node_exporter_port,
        &discoveries,
    ))
    .into_response()
}

async fn get_runtime_labels(State(state): State<ApiState>) -> Response {
    match state.local.runtime_labels().await {
        Ok(labels) => Json(labels).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn add_labels(State(state): State<ApiState>, body: String) -> Response {
    let labels = parse_labels(&body);
    if let Err(e) = state.local.add_labels(&labels).await {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    state.trigger.fire();
    (StatusCode::OK, "OK").into_response()
}

async fn delete_labels(State(state): State<ApiState>, body: String) -> Response {
    let labels = parse_labels(&body);
    if let Err(e) = state.local.delete_labels(&labels).await {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    state.trigger.fire();
    (StatusCode::OK, "OK").into_response()
}
