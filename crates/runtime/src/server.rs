//! Unix-socket JSON-lines server.
//!
//! Protocol: one JSON request per line, `{"id", "op", "args"}`, answered by
//! one JSON response line, `{"id", "result"}` on success or `{"id",
//! "error": {"type", "message"}}` on failure. Loopback-only by construction:
//! there is no network listener, just the socket file.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

use calm_schema::Result;

use crate::dispatch::{dispatch, error_body};
use crate::services::Services;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: u64,
    op: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    id: u64,
    #[serde(flatten)]
    body: Value,
}

/// Bind the socket and serve until the task is cancelled. A stale socket
/// file from a crashed process is removed before binding.
pub async fn run_server(services: Arc<Services>, socket_path: &str) -> Result<()> {
    let path = Path::new(socket_path);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(socket = socket_path, "server listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let services = services.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(services, stream).await {
                        warn!(error = %err, "connection ended with error");
                    }
                });
            }
            Err(err) => {
                error!(error = %err, "accept failed");
            }
        }
    }
}

async fn handle_connection(services: Arc<Services>, stream: UnixStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let body = match dispatch(&services, &request.op, &request.args).await {
                    Ok(result) => serde_json::json!({"result": result}),
                    Err(err) => error_body(&err),
                };
                Response { id: request.id, body }
            }
            Err(err) => Response {
                id: 0,
                body: serde_json::json!({
                    "error": {"type": "validation", "message": format!("malformed request: {err}")}
                }),
            },
        };

        let mut encoded = serde_json::to_vec(&response)
            .unwrap_or_else(|_| b"{\"id\":0,\"error\":{\"type\":\"store\",\"message\":\"encoding failed\"}}".to_vec());
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;
        write_half.flush().await?;
    }
    Ok(())
}
