//! Health-check sub-protocol: connect, send `ping`, expect `pong`.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{FarmError, Result};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Whether a coordinator answers at `address` within `timeout`.
pub async fn health_check(address: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, ping(address)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(address, error = %e, "Health check failed");
            false
        }
        Err(_) => {
            tracing::debug!(address, "Health check timed out");
            false
        }
    }
}

async fn ping(address: &str) -> Result<()> {
    let url = format!("ws://{address}/health");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
    ws.send(WsMessage::Text(PING.to_string())).await?;

    while let Some(frame) = ws.next().await {
        match frame? {
            WsMessage::Text(text) if text == PONG => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            WsMessage::Text(other) => {
                return Err(FarmError::Connection(format!("unexpected reply `{other}`")));
            }
            _ => continue,
        }
    }
    Err(FarmError::Connection("closed before pong".into()))
}
