use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use mqttpool_client::HttpPeerClient;
use mqttpool_cluster::PeerApi;
use mqttpool_common::{
    ApiResponse, Assignment, ClusterError, ConnectionParams, CreateConnectionData,
    NodeDescriptor, NodeFailureNotice,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Notices = Arc<Mutex<Vec<String>>>;

async fn create(Json(assignment): Json<Assignment>) -> (StatusCode, Json<ApiResponse<CreateConnectionData>>) {
    if assignment.id == "full" {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(400, "Capacity exceeded on node b")),
        );
    }
    (
        StatusCode::OK,
        Json(ApiResponse::ok(
            "connection created",
            CreateConnectionData {
                id: assignment.id,
                node: "b".to_string(),
                usage: 1,
            },
        )),
    )
}

async fn node_failure(State(notices): State<Notices>, Json(notice): Json<NodeFailureNotice>) -> StatusCode {
    notices.lock().unwrap().push(notice.failed_node_name);
    StatusCode::OK
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn peer(addr: SocketAddr) -> NodeDescriptor {
    NodeDescriptor::new("b", addr.ip().to_string(), addr.port(), "mqtt", 3)
}

fn assignment(id: &str) -> Assignment {
    Assignment::new(
        id,
        ConnectionParams {
            broker: "broker.local".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            sub_topic: "t".to_string(),
        },
    )
}

async fn control_api() -> (SocketAddr, Notices) {
    let notices: Notices = Arc::default();
    let app = Router::new()
        .route("/liveness", get(|| async { StatusCode::OK }))
        .route("/create-connection", post(create))
        .route("/node-failure", post(node_failure))
        .with_state(notices.clone());
    (serve(app).await, notices)
}

#[tokio::test]
async fn test_probe_liveness_ok() {
    let (addr, _) = control_api().await;
    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();

    client.probe_liveness(&peer(addr)).await.unwrap();
}

#[tokio::test]
async fn test_probe_unreachable_peer() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();
    let result = client.probe_liveness(&peer(addr)).await;

    assert!(matches!(result, Err(ClusterError::PeerUnreachable { .. })));
}

#[tokio::test]
async fn test_probe_times_out() {
    let app = Router::new().route(
        "/liveness",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK
        }),
    );
    let addr = serve(app).await;
    let client = HttpPeerClient::new(Duration::from_millis(200)).unwrap();

    let started = std::time::Instant::now();
    let result = client.probe_liveness(&peer(addr)).await;

    assert!(matches!(result, Err(ClusterError::PeerUnreachable { .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_probe_non_ok_status_fails() {
    let app = Router::new().route("/liveness", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let addr = serve(app).await;
    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();

    assert!(client.probe_liveness(&peer(addr)).await.is_err());
}

#[tokio::test]
async fn test_create_connection_envelopes() {
    let (addr, _) = control_api().await;
    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();

    let accepted = client.create_connection(&peer(addr), &assignment("c1")).await.unwrap();
    assert!(accepted.is_ok());
    assert_eq!(accepted.data.unwrap().id, "c1");

    let rejected = client.create_connection(&peer(addr), &assignment("full")).await.unwrap();
    assert_eq!(rejected.status, 400);
    assert!(rejected.data.is_none());
    assert!(rejected.message.contains("Capacity exceeded"));
}

#[tokio::test]
async fn test_notify_node_failure() {
    let (addr, notices) = control_api().await;
    let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();

    client.notify_node_failure(&peer(addr), "node-a").await.unwrap();

    assert_eq!(*notices.lock().unwrap(), vec!["node-a".to_string()]);
}
