//! JSON-RPC client tests against a mock node

use assert_matches::assert_matches;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use hs_mining_client::{
    client::{RpcClient, RpcWorkSource, WorkSource},
    header::{HDR_SIZE, MASK_HASH_OFFSET},
    miner::TickOutcome,
    worker::{BackendKind, Candidate, ComputeBackend, MineRequest, NonceParams, Params},
    Dispatcher, Error, Network, Orchestrator, Result,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Basic auth header for `hnsrpc:secret`
const AUTHORIZATION: &str = "Basic aG5zcnBjOnNlY3JldA==";

#[derive(Clone, Default)]
struct Node {
    requests: Arc<Mutex<Vec<Value>>>,
}

fn header_hex(identity: u8) -> String {
    let mut raw = [0u8; HDR_SIZE];
    raw[MASK_HASH_OFFSET..MASK_HASH_OFFSET + 32].fill(identity);
    hex::encode(raw)
}

async fn handle(
    State(node): State<Node>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some(AUTHORIZATION);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(Value::Null));
    }

    node.requests.lock().push(body.clone());

    let result = match body["method"].as_str() {
        Some("getwork") => json!({
            "network": "regtest",
            "data": header_hex(9),
            "target": format!("7fffff{}", "00".repeat(29)),
            "height": 12,
            "time": 1_600_000_000u32,
        }),
        Some("submitwork") => json!([false, "high-hash"]),
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "result": null,
                    "error": { "message": "Method not found", "code": -32601 },
                    "id": body["id"],
                })),
            )
        }
    };

    (
        StatusCode::OK,
        Json(json!({ "result": result, "error": null, "id": body["id"] })),
    )
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/", addr)
}

async fn mock_node() -> (String, Node) {
    let node = Node::default();
    let app = Router::new()
        .route("/", post(handle))
        .with_state(node.clone());
    (serve(app).await, node)
}

fn client(url: &str, pass: &str) -> RpcClient {
    RpcClient::new(url, "hnsrpc", pass, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_getwork_round_trip() {
    let (url, node) = mock_node().await;
    let source = RpcWorkSource::new(client(&url, "secret"));

    let response = source.get_work(&[1u8; 32]).await.unwrap().unwrap();
    let work = response.validate(Network::Regtest).unwrap();
    assert_eq!(work.height, 12);
    assert_eq!(work.identity(), [9u8; 32]);

    let requests = node.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["method"], "getwork");
    assert_eq!(requests[0]["params"], json!([hex::encode([1u8; 32])]));
    assert_eq!(requests[0]["id"], 1);
}

#[tokio::test]
async fn test_submitwork_rejection() {
    let (url, node) = mock_node().await;
    let source = RpcWorkSource::new(client(&url, "secret"));

    let result = source.submit_work(&[0xab; 4]).await.unwrap();
    assert!(!result.accepted);
    assert_eq!(result.reason, "high-hash");

    let requests = node.requests.lock().clone();
    assert_eq!(requests[0]["params"], json!(["abababab"]));
}

#[tokio::test]
async fn test_request_ids_increase() {
    let (url, node) = mock_node().await;
    let rpc = client(&url, "secret");

    rpc.execute("getwork", json!([])).await.unwrap();
    rpc.execute("getwork", json!([])).await.unwrap();

    let ids: Vec<_> = node.requests.lock().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_unauthorized() {
    let (url, _node) = mock_node().await;
    let result = client(&url, "wrong").execute("getwork", json!([])).await;
    assert_matches!(result, Err(Error::Unauthorized));
}

#[tokio::test]
async fn test_rpc_error_object() {
    let (url, _node) = mock_node().await;
    let result = client(&url, "secret").execute("getinfo", json!([])).await;
    assert_matches!(
        result,
        Err(Error::Rpc { ref message, code: -32601 }) if message == "Method not found"
    );
}

#[tokio::test]
async fn test_wrong_content_type() {
    let url = serve(Router::new().route("/", post(|| async { "not json" }))).await;
    let result = client(&url, "").execute("getwork", json!([])).await;
    assert_matches!(
        result,
        Err(Error::Protocol { ref message }) if message == "Bad response (wrong content-type)."
    );
}

#[tokio::test]
async fn test_null_body() {
    let url = serve(Router::new().route("/", post(|| async { Json(Value::Null) }))).await;
    let result = client(&url, "").execute("getwork", json!([])).await;
    assert_matches!(
        result,
        Err(Error::Protocol { ref message }) if message == "No body for JSON-RPC response."
    );
}

#[tokio::test]
async fn test_bad_status() {
    let app = Router::new().route(
        "/",
        post(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "result": null, "error": null })),
            )
        }),
    );
    let url = serve(app).await;
    let result = client(&url, "").execute("getwork", json!([])).await;
    assert_matches!(
        result,
        Err(Error::Protocol { ref message }) if message == "Status code: 503."
    );
}

#[tokio::test]
async fn test_null_getwork_result() {
    let app = Router::new().route(
        "/",
        post(|| async { Json(json!({ "result": null, "error": null, "id": 1 })) }),
    );
    let url = serve(app).await;
    let source = RpcWorkSource::new(client(&url, ""));
    assert_eq!(source.get_work(&[0u8; 32]).await.unwrap(), None);
}

#[tokio::test]
async fn test_non_object_getwork_result() {
    let app = Router::new().route(
        "/",
        post(|| async { Json(json!({ "result": "work", "error": null, "id": 1 })) }),
    );
    let url = serve(app).await;
    let source = RpcWorkSource::new(client(&url, ""));
    assert_matches!(
        source.get_work(&[0u8; 32]).await,
        Err(Error::Protocol { ref message }) if message == "Non-object sent as getwork response."
    );
}

/// Backend that never finds anything
struct Idle;

#[async_trait::async_trait]
impl ComputeBackend for Idle {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::BruteForce
    }

    fn device_count(&self) -> u32 {
        1
    }

    async fn mine(
        &self,
        _request: MineRequest,
        cancellation: CancellationToken,
    ) -> Result<Candidate> {
        cancellation.cancelled().await;
        Ok(Candidate::none())
    }

    fn stop(&self, _device: u32) -> bool {
        false
    }

    fn stop_all(&self) {}
}

#[tokio::test]
async fn test_orchestrator_over_rpc() {
    let (url, node) = mock_node().await;
    let source = Arc::new(RpcWorkSource::new(client(&url, "secret")));
    let dispatcher = Dispatcher::new(
        Arc::new(Idle),
        Params::Nonce(NonceParams::default()),
        None,
    );
    let miner = Orchestrator::new(Network::Regtest, Duration::from_secs(3), source, dispatcher);

    assert_eq!(miner.tick().await.unwrap(), TickOutcome::NewJob);
    assert_eq!(miner.tick().await.unwrap(), TickOutcome::Unchanged);

    let requests = node.requests.lock().clone();
    assert_eq!(requests[1]["params"], json!([hex::encode([9u8; 32])]));

    miner.stop();
}
