use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::net::handshake::{Identity, Rejection};
use crate::net::health::{PING, PONG};

#[derive(Clone)]
struct ServerState {
    coordinator: Coordinator,
    token: CancellationToken,
}

/// Session endpoint on `/`, health check on `/health`.
pub fn router(coordinator: Coordinator, token: CancellationToken) -> Router {
    Router::new()
        .route("/", get(connect))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { coordinator, token })
}

/// Serve until `token` is cancelled. Open sessions observe the same token
/// and close themselves.
pub async fn serve(listener: TcpListener, coordinator: Coordinator, token: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting coordinator endpoint");

    let shutdown = token.clone();
    axum::serve(listener, router(coordinator, token))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!(addr = %addr, "Coordinator endpoint stopped");
    Ok(())
}

fn reject(rejection: Rejection) -> Response {
    tracing::warn!(reason = %rejection, "Handshake rejected");
    (rejection.status_code(), rejection.to_string()).into_response()
}

async fn connect(
    State(state): State<ServerState>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let identity = match Identity::from_headers(&headers)
        .and_then(|id| id.verify(&state.coordinator.config.secret).map(|()| id))
    {
        Ok(identity) => identity,
        Err(rejection) => return reject(rejection),
    };

    let reservation = state.coordinator.registry.write().await.reserve(&identity);
    let session = match reservation {
        Ok(session) => session,
        Err(rejection) => return reject(rejection),
    };

    let Some(upgrade) = upgrade else {
        state
            .coordinator
            .registry
            .write()
            .await
            .remove(identity.kind, &identity.name, session);
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade").into_response();
    };

    let registry = state.coordinator.registry.clone();
    let (kind, name) = (identity.kind, identity.name.clone());
    upgrade
        .on_failed_upgrade(move |e| {
            tracing::warn!(name = %name, error = %e, "Upgrade failed, releasing name");
            tokio::spawn(async move {
                registry.write().await.remove(kind, &name, session);
            });
        })
        .on_upgrade(move |socket| run_peer(state, socket, identity, session))
}

/// Pump one upgraded session until either side closes it.
async fn run_peer(state: ServerState, socket: WebSocket, identity: Identity, session: Uuid) {
    let (outbox, mut outgoing) = mpsc::unbounded_channel();
    state
        .coordinator
        .peer_connected(&identity, session, outbox)
        .await;

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = state.token.cancelled() => break,
            Some(message) = outgoing.recv() => {
                if sink.send(WsMessage::Text(message.encode_text())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => match frame {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(WsMessage::Text(text))) => {
                    state.coordinator.handle_frame(&identity, text.as_bytes()).await;
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    state.coordinator.handle_frame(&identity, &bytes).await;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
    state
        .coordinator
        .peer_disconnected(&identity, session)
        .await;
}

async fn health(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|mut socket| async move {
        while let Some(Ok(frame)) = socket.recv().await {
            if let WsMessage::Text(text) = frame {
                if text == PING {
                    let _ = socket.send(WsMessage::Text(PONG.to_string())).await;
                }
                break;
            }
        }
    })
}
