use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use mcp_hub::mcp::{ConnectionStatus, ManagerSettings, McpManager, ServerDefinition};
use mcp_hub::McpError;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SESSION_HEADER: &str = "mcp-session-id";

fn reply(method: &str, id: u64) -> Value {
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2025-06-18",
            "serverInfo": {"name": "fixture", "version": "1.0.0"},
            "capabilities": {"tools": {}}
        }),
        "tools/list" => json!({"tools": [
            {"name": "lookup", "description": "Find things", "inputSchema": {"type": "object"}},
            {"name": "archive", "inputSchema": {"type": "object"}}
        ]}),
        "tools/call" => json!({"content": [{"type": "text", "text": "found"}]}),
        "ping" => json!({}),
        _ => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            })
        }
    };
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// Request transport fixture: one POST endpoint, session id issued on initialize.

type SeenSessions = Arc<Mutex<Vec<Option<String>>>>;

async fn request_endpoint(
    State(seen): State<SeenSessions>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    seen.lock().push(
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = message["method"].as_str().unwrap_or_default();
    let body = reply(method, id);

    let mut response = if method == "tools/call" {
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            format!("event: message\ndata: {}\n\n", body),
        )
            .into_response()
    } else {
        Json(body).into_response()
    };
    response
        .headers_mut()
        .insert(SESSION_HEADER, HeaderValue::from_static("fixture-session"));
    response
}

async fn request_fixture() -> (SocketAddr, SeenSessions) {
    let seen: SeenSessions = Arc::default();
    let app = Router::new()
        .route("/mcp", post(request_endpoint))
        .route(
            "/broken",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "backend down") }),
        )
        .with_state(Arc::clone(&seen));
    (serve(app).await, seen)
}

// Event-stream fixture: GET /sse announces /messages, replies arrive on the stream.

type StreamSender = Arc<Mutex<Option<mpsc::Sender<Result<Event, Infallible>>>>>;

async fn open_stream(
    State(sender): State<StreamSender>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(16);
    tx.send(Ok(Event::default()
        .event("endpoint")
        .data("/messages?session=abc")))
        .await
        .unwrap();
    *sender.lock() = Some(tx);
    Sse::new(ReceiverStream::new(rx))
}

async fn post_message(State(sender): State<StreamSender>, Json(message): Json<Value>) -> StatusCode {
    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        return StatusCode::ACCEPTED;
    };
    let method = message["method"].as_str().unwrap_or_default();
    let event = Event::default()
        .event("message")
        .data(reply(method, id).to_string());

    let tx = sender.lock().clone();
    match tx {
        Some(tx) if tx.send(Ok(event)).await.is_ok() => StatusCode::ACCEPTED,
        _ => StatusCode::GONE,
    }
}

async fn event_stream_fixture() -> SocketAddr {
    let sender: StreamSender = Arc::default();
    let app = Router::new()
        .route("/sse", get(open_stream))
        .route("/messages", post(post_message))
        .with_state(sender);
    serve(app).await
}

async fn refused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn request_transport_round_trip() {
    let (addr, seen) = request_fixture().await;
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::request("remote", &format!("http://{}/mcp", addr));

    let snapshot = manager.connect(&def).await.unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Connected);

    let names: Vec<String> = manager
        .list_tools("remote")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["lookup", "archive"]);

    let result = manager
        .invoke_tool("remote", "lookup", json!({"q": "x"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "found");

    let seen = seen.lock().clone();
    assert_eq!(seen[0], None);
    assert!(seen[1..]
        .iter()
        .all(|s| s.as_deref() == Some("fixture-session")));

    manager.disconnect("remote").await;
    assert!(manager.get_connection("remote").is_none());
}

#[tokio::test]
async fn request_transport_http_failure_marks_error() {
    let (addr, _) = request_fixture().await;
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::request("remote", &format!("http://{}/broken", addr));

    let err = manager.connect(&def).await.unwrap_err();

    match err {
        McpError::Transport(message) => assert!(message.contains("500"), "{}", message),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        manager.get_connection("remote").unwrap().status,
        ConnectionStatus::Error
    );
}

#[tokio::test]
async fn event_stream_transport_round_trip() {
    let addr = event_stream_fixture().await;
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::event_stream("stream", &format!("http://{}/sse", addr));

    manager.connect(&def).await.unwrap();

    assert_eq!(manager.list_tools("stream").await.unwrap().len(), 2);
    manager.ping("stream").await.unwrap();
    let result = manager
        .invoke_tool("stream", "lookup", json!({}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["type"], "text");

    let missing = manager.list_prompts("stream").await;
    assert!(matches!(missing, Err(McpError::Rpc { code: -32601, .. })));
    assert_eq!(
        manager.get_connection("stream").unwrap().status,
        ConnectionStatus::Connected
    );

    manager.disconnect("stream").await;
    assert!(manager.list_tools("stream").await.is_err());
}

#[tokio::test]
async fn refused_request_endpoint_is_a_transport_error() {
    let addr = refused_addr().await;
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::request("s2", &format!("http://{}/mcp", addr));

    let result = manager.connect(&def).await;

    assert!(matches!(result, Err(McpError::Transport(_))));
    let snapshot = manager.get_connection("s2").unwrap();
    assert_eq!(snapshot.status, ConnectionStatus::Error);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn refused_event_stream_is_a_transport_error() {
    let addr = refused_addr().await;
    let manager = McpManager::new(ManagerSettings::default());
    let def = ServerDefinition::event_stream("s2", &format!("http://{}/sse", addr));

    let result = manager.connect(&def).await;

    assert!(matches!(result, Err(McpError::Transport(_))));
    assert_eq!(
        manager.get_connection("s2").unwrap().status,
        ConnectionStatus::Error
    );
}
