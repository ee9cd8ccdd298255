//! Infomundi chat relay library
//!
//! Real-time transport, public-key directory and opaque ciphertext history.
//! Exposed as a library so the client crate and integration tests can run a
//! relay in-process.

mod connection;
mod messages;
mod state;

pub use connection::{handle_connection, handle_message, ACCESS_TOKEN_ENV};
pub use messages::{HistoryEntry, WsMessage};
pub use state::{ServerState, MAX_HISTORY_PER_CONVERSATION};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

/// Accept connections on `listener` until the task is dropped
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New connection from {}", peer_addr);

                let state = state.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws_stream) => {
                            handle_connection(ws_stream, state).await;
                        }
                        Err(e) => {
                            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
