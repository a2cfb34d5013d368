//! Outbound connection used by workers and consoles.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{FarmError, Result};
use crate::net::dispatch::{Call, HandlerRegistry};
use crate::net::handshake::{Identity, Rejection};
use crate::protocol::{Message, Target};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a session to the coordinator at `address`.
///
/// A refused handshake surfaces as [`FarmError::HandshakeRejected`].
pub async fn dial(address: &str, identity: &Identity, timeout: Duration) -> Result<WsStream> {
    let mut request = format!("ws://{address}/").into_client_request()?;
    for (key, value) in identity.headers() {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| FarmError::Connection(format!("header `{key}`: {e}")))?;
        request.headers_mut().insert(key, value);
    }

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
        Err(_) => Err(FarmError::Timeout(format!("connecting to {address}"))),
        Ok(Err(WsError::Http(response))) => {
            let status = response.status().as_u16();
            Err(match Rejection::from_status(status, &identity.name) {
                Some(rejection) => FarmError::HandshakeRejected(rejection),
                None => FarmError::Connection(format!("{address} refused upgrade with {status}")),
            })
        }
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok((ws, _))) => {
            tracing::info!(address, name = %identity.name, kind = %identity.kind, "Connected to coordinator");
            Ok(ws)
        }
    }
}

/// Read/write loop of one outbound connection.
///
/// Incoming calls run concurrently as tasks owned by the session. They are
/// aborted when the session ends, whatever the reason.
pub struct Session<C> {
    pub name: String,
    pub handlers: Arc<HandlerRegistry<C>>,
    pub ctx: C,
}

impl<C: Clone + Send + 'static> Session<C> {
    /// Run until `token` is cancelled (`Ok`) or the connection drops (`Err`).
    pub async fn run(
        self,
        ws: WsStream,
        mut outbox: mpsc::UnboundedReceiver<Message>,
        token: CancellationToken,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();
        let mut calls: JoinSet<(String, Result<()>)> = JoinSet::new();

        let outcome = loop {
            let reply = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                Some(message) = outbox.recv() => Some(message),
                frame = stream.next() => match frame {
                    None | Some(Ok(WsMessage::Close(_))) => {
                        break Err(FarmError::Connection("closed by coordinator".into()));
                    }
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(WsMessage::Text(text))) => self.handle(text.as_bytes(), &mut calls),
                    Some(Ok(WsMessage::Binary(bytes))) => self.handle(&bytes, &mut calls),
                    Some(Ok(_)) => None,
                },
                Some(joined) = calls.join_next() => match joined {
                    Ok((_, Ok(()))) => None,
                    Ok((function, Err(e))) => {
                        tracing::warn!(function = %function, error = %e, "Handler failed");
                        Some(self.report(&function, &e))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Handler task aborted");
                        None
                    }
                },
            };

            if let Some(message) = reply {
                if let Err(e) = sink.send(WsMessage::Text(message.encode_text())).await {
                    break Err(e.into());
                }
            }
        };

        calls.abort_all();
        let _ = sink.close().await;
        outcome
    }

    /// Decode and dispatch one frame. Returns an error report for the
    /// coordinator when the call cannot be dispatched.
    fn handle(&self, bytes: &[u8], calls: &mut JoinSet<(String, Result<()>)>) -> Option<Message> {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable message");
                return None;
            }
        };

        match message {
            Message::Function(call) if call.target == self.handlers.role() => {
                let call = Call::from(call);
                let function = call.function.clone();
                match self.handlers.dispatch(self.ctx.clone(), call) {
                    Ok(future) => {
                        calls.spawn(async move { (function, future.await) });
                        None
                    }
                    Err(e) => {
                        tracing::warn!(function = %function, error = %e, "Dispatch failed");
                        Some(self.report(&function, &e))
                    }
                }
            }
            Message::Function(call) => {
                tracing::warn!(role = %call.target, function = %call.function, "Dropping call for another role");
                None
            }
            Message::HealthCheck(envelope) => {
                tracing::debug!(from = %envelope.name, "Health check");
                None
            }
            Message::Error(envelope) => {
                tracing::warn!(from = %envelope.name, error = %envelope.data, "Error from coordinator");
                None
            }
            Message::Relay(envelope) => {
                tracing::warn!(from = %envelope.name, "Dropping relay, only the coordinator forwards");
                None
            }
        }
    }

    fn report(&self, function: &str, error: &FarmError) -> Message {
        Message::error(Target::Console, self.name.clone(), format!("{function}: {error}"))
    }
}
