use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use mqttpool_cluster::ClusterManager;
use mqttpool_common::{
    ApiResponse, Assignment, ClusterError, ClusterStats, CreateConnectionData, NodeDescriptor,
    NodeFailureNotice, NodeUsage, Result,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ClusterManager>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: Arc<ClusterManager>, metrics: PrometheusHandle) -> Self {
        Self {
            manager,
            metrics,
            started_at: Instant::now(),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn http_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn failure<T>(err: &ClusterError) -> Reply<T> {
    (http_status(err.status_code()), Json(ApiResponse::from(err)))
}

fn reply<T: Serialize>(result: Result<T>, message: &str) -> Reply<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(message, data))),
        Err(e) => {
            warn!("{}", e);
            failure(&e)
        }
    }
}

fn malformed<T>(rejection: JsonRejection) -> Reply<T> {
    failure(&ClusterError::MalformedPayload {
        message: rejection.body_text(),
    })
}

// === CONTROL API ===

/// Liveness probe answered to peers
async fn liveness(State(state): State<AppState>) -> Reply<String> {
    (
        StatusCode::OK,
        Json(ApiResponse::ok("alive", state.manager.local().name.clone())),
    )
}

/// Direct creation on this node
#[instrument(skip(state, payload))]
async fn create_connection(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Assignment>, JsonRejection>,
) -> Reply<CreateConnectionData> {
    let Json(assignment) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return malformed(rejection),
    };

    let id = assignment.id.clone();
    let result = state
        .manager
        .create_connection(assignment)
        .await
        .map(|usage| CreateConnectionData {
            id,
            node: state.manager.local().name.clone(),
            usage,
        });
    reply(result, "connection created")
}

/// Eviction notice from a peer
#[instrument(skip(state, payload))]
async fn node_failure(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NodeFailureNotice>, JsonRejection>,
) -> Reply<String> {
    let Json(notice) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return malformed(rejection),
    };

    state
        .manager
        .handle_node_failure_notice(&notice.failed_node_name);
    reply(Ok(notice.failed_node_name), "notice received")
}

// === OPERATOR API ===

#[instrument(skip(state))]
async fn list_nodes(State(state): State<AppState>) -> Reply<Vec<NodeDescriptor>> {
    reply(state.manager.list_nodes().await, "ok")
}

#[instrument(skip(state))]
async fn node_usage(State(state): State<AppState>) -> Reply<Vec<NodeUsage>> {
    reply(state.manager.node_usage().await, "ok")
}

#[instrument(skip(state))]
async fn get_bound(State(state): State<AppState>, Path(id): Path<String>) -> Reply<Assignment> {
    reply(state.manager.get_bound(&id).await, "ok")
}

#[instrument(skip(state))]
async fn get_pending(State(state): State<AppState>, Path(id): Path<String>) -> Reply<Assignment> {
    reply(state.manager.get_pending(&id).await, "ok")
}

/// Queue a config for placement by the reconciler
#[instrument(skip(state, payload))]
async fn submit_assignment(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Assignment>, JsonRejection>,
) -> Reply<String> {
    let Json(assignment) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return malformed(rejection),
    };

    let id = assignment.id.clone();
    let result = state.manager.submit(assignment).await.map(|_| id);
    reply(result, "assignment queued")
}

#[instrument(skip(state))]
async fn get_stats(State(state): State<AppState>) -> Reply<ClusterStats> {
    reply(state.manager.stats().await, "ok")
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Create the Control and operator API router
pub fn create_router(state: AppState) -> Router {
    use crate::health;

    Router::new()
        // Control API, called by peers
        .route("/liveness", get(liveness))
        .route("/create-connection", post(create_connection))
        .route("/node-failure", post(node_failure))

        // Operator API
        .route("/nodes", get(list_nodes))
        .route("/nodes/usage", get(node_usage))
        .route("/assignments", post(submit_assignment))
        .route("/assignments/bound/:id", get(get_bound))
        .route("/assignments/pending/:id", get(get_pending))
        .route("/stats", get(get_stats))

        // Health and metrics
        .route("/health/live", get(health::health_liveness))
        .route("/health/ready", get(health::health_readiness))
        .route("/metrics", get(render_metrics))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on an already bound listener until `shutdown` is cancelled.
/// Connections accepted by the kernel before this runs wait in the backlog.
pub async fn start_rest_server(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!("Starting REST server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("REST server stopped");
    Ok(())
}
