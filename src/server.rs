//! Hub Server
//!
//! TCP listener and WebSocket handshake routing. Two paths share one
//! listener: `/doc?room=<key>` (document traffic, raw binary CRDT frames
//! allowed) and `/hub` (control and presence). The handshake callback also
//! enforces the configured origin.

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::error::Result;
use crate::hub::Hub;
use crate::session;

pub struct HubServer {
    hub: Hub,
    shutdown_tx: broadcast::Sender<()>,
}

impl HubServer {
    pub fn new(hub: Hub) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { hub, shutdown_tx }
    }

    /// Sender that stops the accept loop.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shutdown. Existing sessions finish on
    /// their own transports.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        info!("KYRO Hub listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let hub = self.hub.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(hub, stream).await {
                                    debug!("connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(hub: Hub, stream: TcpStream) -> Result<()> {
    let allowed_origin = hub.config.cors_origin.clone();
    let mut room_hint: Option<String> = None;

    let callback = |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        if let Some(allowed) = &allowed_origin {
            let origin = request
                .headers()
                .get("origin")
                .and_then(|value| value.to_str().ok());
            if origin != Some(allowed.as_str()) {
                let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
                *rejection.status_mut() = StatusCode::FORBIDDEN;
                return Err(rejection);
            }
        }
        match request.uri().path() {
            "/doc" => {
                room_hint = request.uri().query().and_then(room_query_param);
                Ok(response)
            }
            "/hub" => Ok(response),
            _ => {
                let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = accept_hdr_async(stream, callback).await?;
    session::run_session(hub, ws, room_hint).await;
    Ok(())
}

fn room_query_param(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        pair.strip_prefix("room=")
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}
