//! Demo GraphQL subscription server.
//!
//! Serves a toy executor: `{ hello }` answers once, `subscription { ticker }`
//! pushes a counter every second until stopped, and `{ fail }` errors.
//!
//! Configured through `GQLWS_HOST`, `GQLWS_PORT`, `GQLWS_PATH`,
//! `GQLWS_KEEP_ALIVE_MS`, `GQLWS_EVENT_BUFFER`, `GQLWS_TCP_PORT` and
//! `GQLWS_LOG_DIR`.

use anyhow::Result;
use async_trait::async_trait;
use gqlws_core::{
    ExecutionError, ExecutionOutcome, ExecutionParams, ExecutionResult, Executor, ResultSink,
    SubscriptionHandle,
};
use gqlws_server::{init_console_logging, init_logging, Server, ServerConfig};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct DemoExecutor {
    next_handle: AtomicU64,
    tickers: Mutex<HashMap<SubscriptionHandle, AbortHandle>>,
}

#[async_trait]
impl Executor for DemoExecutor {
    async fn execute(&self, params: ExecutionParams) -> ExecutionOutcome<ExecutionResult> {
        if params.query.contains("fail") {
            return ExecutionOutcome::Error(ExecutionError::bad_request("Requested failure"));
        }
        let name = params
            .variables
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("world")
            .to_string();
        ExecutionOutcome::Value(ExecutionResult::data(json!({
            "hello": format!("Hello, {}!", name),
        })))
    }

    async fn subscribe(
        &self,
        params: ExecutionParams,
        sink: ResultSink,
    ) -> Result<SubscriptionHandle, ExecutionError> {
        if !params.query.contains("ticker") {
            return Err(ExecutionError::bad_request("Unknown subscription field"));
        }
        let every = params
            .variables
            .get("everyMs")
            .and_then(|v| v.as_u64())
            .unwrap_or(1000);
        let limit = params.variables.get("limit").and_then(|v| v.as_u64());

        let handle = SubscriptionHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(every.max(10)));
            let mut count: u64 = 0;
            loop {
                interval.tick().await;
                count += 1;
                if !sink.push(Ok(ExecutionResult::data(json!({ "ticker": count })))) {
                    break;
                }
                if limit.is_some_and(|limit| count >= limit) {
                    sink.finish();
                    break;
                }
            }
        });

        if let Ok(mut tickers) = self.tickers.lock() {
            tickers.insert(handle, task.abort_handle());
        }
        debug!(%handle, every, "Ticker started");
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.tickers.lock().ok().and_then(|mut t| t.remove(&handle)) {
            task.abort();
            debug!(%handle, "Ticker stopped");
        }
    }
}

fn config_from_env() -> Result<ServerConfig> {
    let mut config = ServerConfig::default();
    if let Ok(host) = std::env::var("GQLWS_HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("GQLWS_PORT") {
        config.port = port.parse()?;
    }
    if let Ok(path) = std::env::var("GQLWS_PATH") {
        config.path = path;
    }
    if let Ok(ms) = std::env::var("GQLWS_KEEP_ALIVE_MS") {
        config.keep_alive_ms = Some(ms.parse()?);
    }
    if let Ok(buffer) = std::env::var("GQLWS_EVENT_BUFFER") {
        config.event_buffer = buffer.parse()?;
    }
    if let Ok(port) = std::env::var("GQLWS_TCP_PORT") {
        config.tcp_port = Some(port.parse()?);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = match std::env::var("GQLWS_LOG_DIR") {
        Ok(dir) => Some(init_logging(dir, "gqlws-server")?),
        Err(_) => {
            init_console_logging(false)?;
            None
        }
    };

    let config = config_from_env()?;
    info!(addr = %config.addr(), path = %config.path, "Starting GraphQL subscription server");

    let server = Server::new(config, Arc::new(DemoExecutor::default()));
    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
