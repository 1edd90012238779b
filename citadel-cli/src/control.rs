//! Control socket: how `stop` and `status` reach a running engine
//!
//! Newline-delimited JSON over a Unix socket. One request per
//! connection; the server answers and closes.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use citadel_engine::EngineHandle;

/// Control commands a client may send
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Request {
    /// Report the engine status snapshot
    Status,
    /// Ask the engine to stop
    Stop,
}

/// Serve control requests until a `stop` arrives or the listener dies.
///
/// A `stop` request is acknowledged, then reported to the main loop
/// through `stop_tx`; actually stopping the engine is the main loop's
/// job so the socket file is cleaned up exactly once.
pub async fn serve(listener: UnixListener, engine: EngineHandle, stop_tx: mpsc::Sender<()>) {
    loop {
        let (socket, _addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "control accept failed");
                continue;
            }
        };
        match handle_connection(socket, &engine).await {
            Ok(stop_requested) => {
                if stop_requested {
                    let _ = stop_tx.send(()).await;
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "control connection failed");
            }
        }
    }
}

async fn handle_connection(socket: UnixStream, engine: &EngineHandle) -> Result<bool> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let request: Request = serde_json::from_str(line.trim()).context("bad control request")?;

    let (response, stop_requested) = match request {
        Request::Status => (serde_json::to_value(engine.status())?, false),
        Request::Stop => (serde_json::json!({ "stopping": true }), true),
    };

    let socket = reader.get_mut();
    socket
        .write_all(format!("{response}\n").as_bytes())
        .await?;
    socket.flush().await?;
    Ok(stop_requested)
}

/// Client side: send one request to a running engine.
pub async fn request(socket_path: &Path, request: Request) -> Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("no engine listening on {}", socket_path.display()))?;
    let mut reader = BufReader::new(stream);

    let line = serde_json::to_string(&request)?;
    reader
        .get_mut()
        .write_all(format!("{line}\n").as_bytes())
        .await?;
    reader.get_mut().flush().await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;
    serde_json::from_str(response.trim()).context("bad control response")
}
