//! Minimal line-oriented client for the daemon socket, used by the CLI.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use calm_schema::{CalmError, Result};

pub struct DaemonClient {
    socket_path: String,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    /// Send one operation and wait for its response. Errors returned by the
    /// server are surfaced as `CalmError::Store` carrying the wire message.
    pub async fn call(&self, op: &str, args: Value) -> Result<Value> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            CalmError::Store(format!(
                "connecting to daemon at {}: {err} (is it running?)",
                self.socket_path
            ))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        let request = json!({"id": 1, "op": op, "args": args});
        write_half
            .write_all(format!("{request}\n").as_bytes())
            .await?;
        write_half.flush().await?;

        let mut lines = BufReader::new(read_half).lines();
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| CalmError::Store("daemon closed the connection".to_string()))?;
        let response: Value = serde_json::from_str(&line)
            .map_err(|err| CalmError::Store(format!("malformed daemon response: {err}")))?;

        if let Some(error) = response.get("error") {
            let kind = error.get("type").and_then(|v| v.as_str()).unwrap_or("store");
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            return Err(CalmError::Store(format!("{kind}: {message}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}
