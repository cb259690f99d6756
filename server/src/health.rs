//! Process liveness and cluster readiness endpoints.

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use tracing::{instrument, warn};

use crate::rest::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    /// Serving, but peers cannot place work here
    Degraded,
    NotReady,
}

impl Readiness {
    fn http_status(self) -> StatusCode {
        match self {
            Readiness::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Readiness::Ready | Readiness::Degraded => StatusCode::OK,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub component: &'static str,
    pub readiness: Readiness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    fn pass(component: &'static str) -> Self {
        Self {
            component,
            readiness: Readiness::Ready,
            detail: None,
        }
    }

    fn fail(component: &'static str, readiness: Readiness, detail: impl Into<String>) -> Self {
        Self {
            component,
            readiness,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub status: Readiness,
    pub node: String,
    pub role: String,
    pub capacity: i64,
    pub uptime_seconds: u64,
    pub checked_at: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alive {
    pub alive: bool,
    pub node: String,
}

/// Answers as long as the process runs; never touches the store
#[instrument(skip(state))]
pub async fn health_liveness(State(state): State<AppState>) -> Json<Alive> {
    Json(Alive {
        alive: true,
        node: state.manager.local().name.clone(),
    })
}

/// Ready when the store answers and this node is listed in its role's catalog.
/// A node missing from the catalog has been evicted and waits for its next
/// heartbeat to re-enter.
#[instrument(skip(state))]
pub async fn health_readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessReport>) {
    let manager = &state.manager;
    let local = manager.local();

    let checks = if manager.store_reachable().await {
        let membership = match manager
            .context()
            .registry
            .get_peer(&local.role, &local.name)
            .await
        {
            Ok(Some(_)) => Check::pass("membership"),
            Ok(None) => Check::fail("membership", Readiness::Degraded, "not listed in catalog"),
            Err(e) => Check::fail("membership", Readiness::Degraded, e.to_string()),
        };
        vec![Check::pass("store"), membership]
    } else {
        warn!("Coordination store unreachable");
        vec![Check::fail("store", Readiness::NotReady, "coordination store unreachable")]
    };

    let status = checks
        .iter()
        .map(|check| check.readiness)
        .max()
        .unwrap_or(Readiness::Ready);

    let report = ReadinessReport {
        status,
        node: local.name.clone(),
        role: local.role.clone(),
        capacity: local.capacity,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        checked_at: chrono::Utc::now(),
        checks,
    };
    (status.http_status(), Json(report))
}
