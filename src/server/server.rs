use anyhow::{Context, Result};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;

use super::{log_requests, metrics::metrics_handler, state::*};
use crate::operation::{AggregationTarget, OperationInput, OperationPriority};
use crate::registry::WebhookType;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
}

fn format_uptime(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    Json(ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
    })
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(manager): State<GuardedOperationsManager>) -> StatusCode {
    let result = tokio::task::spawn_blocking(move || manager.ping()).await;
    match result {
        Ok(Ok(())) => StatusCode::OK,
        Ok(Err(e)) => {
            error!("Readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            error!("Readiness check task failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

fn describe(target: &AggregationTarget) -> String {
    match &target.application_template_id {
        Some(template_id) if target.is_template_only() => {
            format!("application template {}", template_id)
        }
        _ => format!("application {}", target.application_id),
    }
}

/// Whether some ORD webhook makes `target` eligible for aggregation.
///
/// A template-only target needs a static ORD webhook on the template. An
/// application target needs an ORD webhook on the application, or on its
/// template when one is given.
fn has_triggering_webhook(state: &ServerState, target: &AggregationTarget) -> Result<bool, Response> {
    let internal = |e: anyhow::Error| {
        error!("Failed to verify webhooks for {}: {:#}", describe(target), e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    };

    if target.is_template_only() {
        let webhooks = state
            .webhooks
            .list_webhooks_by_type(WebhookType::OpenResourceDiscoveryStatic)
            .map_err(internal)?;
        return Ok(webhooks
            .iter()
            .any(|w| w.application_template_id == target.application_template_id));
    }

    let application = state
        .applications
        .get_application(&target.application_id)
        .map_err(internal)?
        .ok_or_else(|| bad_request(format!("application {} not found", target.application_id)))?;

    let webhooks = state
        .webhooks
        .list_webhooks_by_type(WebhookType::OpenResourceDiscovery)
        .map_err(internal)?;

    let found = match &target.application_template_id {
        Some(template_id) => {
            if application.application_template_id.as_ref() != Some(template_id) {
                return Err(bad_request(format!(
                    "application {} was not created from template {}",
                    application.id, template_id
                )));
            }
            webhooks
                .iter()
                .any(|w| w.application_template_id.as_ref() == Some(template_id))
        }
        None => webhooks
            .iter()
            .any(|w| w.application_id.as_ref() == Some(&application.id)),
    };
    Ok(found)
}

/// Schedule an aggregation for one application, or for a template that
/// serves static ORD documents.
///
/// An existing operation for the same target is bumped to high priority,
/// otherwise a new one is created and workers are woken up.
async fn aggregate(
    State(state): State<ServerState>,
    payload: Result<Json<AggregationTarget>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let application_id = payload.application_id.trim().to_string();
    let template_id = payload
        .application_template_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let target = match (application_id.is_empty(), template_id) {
        (true, None) => return bad_request("applicationID or applicationTemplateID is required"),
        (true, Some(template_id)) => AggregationTarget::for_template(template_id),
        (false, template_id) => AggregationTarget::new(application_id, template_id),
    };

    // Store and registry calls are synchronous SQLite transactions.
    match tokio::task::spawn_blocking(move || schedule_aggregation(&state, &target)).await {
        Ok(response) => response,
        Err(e) => {
            error!("Aggregation request task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn schedule_aggregation(state: &ServerState, target: &AggregationTarget) -> Response {
    let data = target.to_data();
    let manager = &state.operations_manager;

    match manager.find_operation_by_data(&data) {
        Ok(operation) => {
            if let Err(e) = manager.reschedule_operation(&operation.id) {
                error!("Failed to reschedule operation {}: {}", operation.id, e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            debug!("Rescheduled operation {} on demand", operation.id);
            StatusCode::OK.into_response()
        }
        Err(e) if e.is_not_found() => {
            match has_triggering_webhook(state, target) {
                Ok(true) => {}
                Ok(false) if target.is_template_only() => {
                    return bad_request(format!(
                        "no static ORD webhook registered for {}",
                        describe(target)
                    ))
                }
                Ok(false) => {
                    return bad_request(format!(
                        "no ORD webhook registered for {}",
                        describe(target)
                    ))
                }
                Err(response) => return response,
            }

            let input = OperationInput {
                op_type: manager.op_type(),
                priority: OperationPriority::High.as_i32(),
                data,
            };
            match manager.create_operation(input) {
                Ok(id) => {
                    state.on_demand.notify(&id);
                    info!("Scheduled aggregation {} for {}", id, describe(target));
                    StatusCode::OK.into_response()
                }
                Err(e) => {
                    error!("Failed to create aggregation operation: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Err(e) => {
            error!("Failed to look up aggregation operation: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn make_app(state: ServerState) -> Router {
    let api_routes: Router = Router::new()
        .route("/aggregate", post(aggregate))
        .with_state(state.clone());

    let health_routes: Router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state.clone());

    Router::new()
        .route("/", get(home))
        .with_state(state.clone())
        .merge(api_routes)
        .merge(health_routes)
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn_with_state(
            state.config.requests_logging_level.clone(),
            log_requests,
        ))
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn serve(app: Router, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Serve the API until `shutdown` fires.
pub async fn run_server(state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let port = state.config.port;
    info!("Ready to serve at port {}!", port);
    serve(make_app(state), port, shutdown).await
}

/// Serve Prometheus metrics until `shutdown` fires.
pub async fn run_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    info!("Metrics available at port {}!", port);
    serve(make_metrics_app(), port, shutdown).await
}
