use crate::connection::{ConnectionConfig, ConnectionController, DEFAULT_EVENT_BUFFER};
use crate::hooks::{DefaultHooks, ServerHooks};
use axum::{response::IntoResponse, routing::get, Json, Router};
use gqlws_core::Executor;
use gqlws_transport::FramedTransport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Route serving the WebSocket endpoint.
    pub path: String,
    /// Keep-alive interval in milliseconds; `None` disables keep-alive.
    pub keep_alive_ms: Option<u64>,
    /// Per-connection capacity for results waiting to be written.
    pub event_buffer: usize,
    /// Port for the newline-delimited TCP endpoint; `None` disables it.
    pub tcp_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            path: "/graphql".to_string(),
            keep_alive_ms: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            tcp_port: None,
        }
    }
}

impl ServerConfig {
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms.map(Duration::from_millis)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tcp_addr(&self) -> Option<String> {
        self.tcp_port.map(|port| format!("{}:{}", self.host, port))
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    executor: Arc<dyn Executor>,
    hooks: Arc<dyn ServerHooks>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(config: ServerConfig, executor: Arc<dyn Executor>) -> Self {
        Server {
            config,
            executor,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ServerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// A controller for one freshly accepted connection.
    pub fn connection(&self, connection_id: impl Into<String>) -> ConnectionController {
        ConnectionController::new(
            connection_id,
            Arc::clone(&self.executor),
            Arc::clone(&self.hooks),
            ConnectionConfig {
                keep_alive: self.config.keep_alive(),
                event_buffer: self.config.event_buffer,
            },
        )
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.config.path, get(crate::ws_h1::websocket_handler))
            .route("/health", get(handle_health))
            .layer(CorsLayer::permissive())
            .with_state(Arc::new(self.clone()))
    }

    /// Binds the configured addresses and serves until the process stops.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = bind(self.config.addr()).await?;
        match self.config.tcp_addr() {
            Some(tcp_addr) => {
                let tcp = bind(tcp_addr).await?;
                tokio::try_join!(self.clone().serve_tcp(tcp), self.serve(listener))?;
                Ok(())
            }
            None => self.serve(listener).await,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        info!(%addr, path = %self.config.path, "GraphQL WebSocket server listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Serves connections that exchange newline-delimited JSON frames over
    /// plain TCP, one controller per accepted stream.
    pub async fn serve_tcp(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        info!(%addr, "GraphQL TCP endpoint listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let connection_id = uuid::Uuid::new_v4().to_string();
            let controller = self.connection(connection_id.clone());
            tokio::spawn(async move {
                info!(connection = %connection_id, %peer, "TCP connection established");
                controller.run(FramedTransport::new(stream)).await;
                debug!(connection = %connection_id, "TCP connection finished");
            });
        }
    }
}

async fn bind(addr: String) -> Result<TcpListener, ServerError> {
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "server": "gqlws-rs",
    }))
}
