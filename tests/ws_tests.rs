//! `/ws/{task_id}` over a real socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use research_agent_api::{
    agents::{AgentOutput, AgentRunner},
    build_state, create_router,
    tasks::{Priority, ResearchJob},
    types::AppResult,
    AppState, Config,
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

struct EchoAgent;

#[async_trait]
impl AgentRunner for EchoAgent {
    async fn run(&self, job: &ResearchJob) -> AppResult<AgentOutput> {
        Ok(AgentOutput {
            result: format!("Research findings for: {}", job.query),
            files_generated: vec![],
        })
    }
}

async fn serve() -> (SocketAddr, AppState) {
    let mut config = Config::local();
    config.tasks.poll_interval = Duration::from_millis(20);
    let state = build_state(config, Arc::new(EchoAgent), None);
    let app = create_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn open(addr: SocketAddr, task_id: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws/{}", addr, task_id)).await.unwrap();
    client
}

async fn next_frame(client: &mut Client) -> Value {
    let message = tokio::time::timeout(FRAME_TIMEOUT, client.next())
        .await
        .expect("no frame before timeout")
        .expect("socket ended early")
        .unwrap();
    match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn expect_closed(client: &mut Client) {
    let next = tokio::time::timeout(FRAME_TIMEOUT, client.next())
        .await
        .expect("socket still open");
    match next {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_task_gets_error_frame_then_close() {
    let (addr, _) = serve().await;
    let id = Uuid::new_v4().to_string();
    let mut client = open(addr, &id).await;

    let frame = next_frame(&mut client).await;
    assert_eq!(frame["task_id"], id);
    assert_eq!(frame["error"], "Task not found");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_malformed_id_gets_error_frame_then_close() {
    let (addr, _) = serve().await;
    let mut client = open(addr, "not-a-uuid").await;

    let frame = next_frame(&mut client).await;
    assert_eq!(frame["task_id"], "not-a-uuid");
    assert_eq!(frame["error"], "Task not found");
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn test_stream_closes_after_terminal_frame() {
    let (addr, state) = serve().await;
    let id = Uuid::new_v4();
    state.manager.create(id, "What is the capital of France?", Priority::Normal).await.unwrap();

    let mut client = open(addr, &id.to_string()).await;
    let first = next_frame(&mut client).await;
    assert_eq!(first["task_id"], id.to_string());
    assert_eq!(first["status"], "queued");

    state.manager.start(&id).await.unwrap();
    state
        .manager
        .complete(&id, AgentOutput { result: "Paris".into(), files_generated: vec![] })
        .await
        .unwrap();

    let mut last = next_frame(&mut client).await;
    while last["status"] != "completed" {
        assert_ne!(last["status"], "failed");
        last = next_frame(&mut client).await;
    }
    assert_eq!(last["progress"], 100);
    expect_closed(&mut client).await;
}
