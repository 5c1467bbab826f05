use async_trait::async_trait;
use gqlws_core::{
    ExecutionError, ExecutionParams, ExecutionOutcome, ExecutionResult, Executor, ResultSink,
    SubscriptionHandle,
};
use gqlws_server::{Server, ServerConfig};
use gqlws_transport::{FramedTransport, MessageTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

struct Counter;

#[async_trait]
impl Executor for Counter {
    async fn execute(&self, _params: ExecutionParams) -> ExecutionOutcome<ExecutionResult> {
        ExecutionOutcome::Value(ExecutionResult::data(json!({"count": 0})))
    }

    async fn subscribe(
        &self,
        _params: ExecutionParams,
        sink: ResultSink,
    ) -> Result<SubscriptionHandle, ExecutionError> {
        for n in 1..=2 {
            sink.push(Ok(ExecutionResult::data(json!({"count": n}))));
        }
        sink.finish();
        Ok(SubscriptionHandle::new(1))
    }
}

async fn spawn_tcp_server() -> std::net::SocketAddr {
    gqlws_server::init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(ServerConfig::default(), Arc::new(Counter));
    tokio::spawn(server.serve_tcp(listener));
    addr
}

async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("no line from server")
        .unwrap()
        .expect("server closed");
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_subscription_over_newline_delimited_tcp() {
    let addr = spawn_tcp_server().await;
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"{\"type\":\"connection_init\"}\n").await.unwrap();
    assert_eq!(next_line(&mut lines).await, json!({"type": "connection_ack"}));

    write
        .write_all(b"{\"type\":\"start\",\"id\":\"s\",\"payload\":{\"query\":\"subscription { count }\"}}\n")
        .await
        .unwrap();
    assert_eq!(
        next_line(&mut lines).await,
        json!({"type": "data", "id": "s", "payload": {"data": {"count": 1}}})
    );
    assert_eq!(
        next_line(&mut lines).await,
        json!({"type": "data", "id": "s", "payload": {"data": {"count": 2}}})
    );
    assert_eq!(next_line(&mut lines).await, json!({"type": "complete", "id": "s"}));
}

#[tokio::test]
async fn test_framed_transport_talks_to_tcp_endpoint() {
    let addr = spawn_tcp_server().await;
    let mut transport = FramedTransport::new(TcpStream::connect(addr).await.unwrap());

    transport
        .send(json!({"type": "init"}).to_string())
        .await
        .unwrap();
    let ack = transport.recv().await.unwrap().unwrap();
    assert_eq!(serde_json::from_str::<Value>(&ack).unwrap(), json!({"type": "init_success"}));

    transport
        .send(json!({"type": "connection_terminate"}).to_string())
        .await
        .unwrap();
    assert_eq!(transport.recv().await.unwrap(), None);
}
