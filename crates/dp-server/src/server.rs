//! WebSocket control server
//!
//! One accept loop, one task per connection. A connection dies on
//! malformed JSON; everything else is answered with a structured reply.
//! `terminate` answers, then shuts the whole server down through a
//! broadcast channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use dp_playback::Transport;

use crate::handlers;
use crate::protocol::{Reply, Request};

/// Write half of a connection, shared with the progress task.
pub type SharedWriter = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

/// State shared by every connection.
pub struct AppState {
    pub transport: Arc<Transport>,
    pub started_at: Instant,
    pub shutdown: broadcast::Sender<()>,
}

/// Per-connection state.
pub struct ControlSession {
    pub last_msg_id: Option<String>,
}

pub struct ControlServer {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ControlServer {
    /// Bind the control endpoint on localhost. Port 0 picks a free port.
    pub async fn bind(transport: Arc<Transport>, port: u16) -> std::io::Result<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let state = Arc::new(AppState {
            transport,
            started_at: Instant::now(),
            shutdown,
        });
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            state,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Accept connections until a `terminate` request shuts us down.
    pub async fn run(self) -> std::io::Result<()> {
        log::info!("Control server listening on ws://{}", self.local_addr);
        let mut shutdown_rx = self.state.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("Connection from {}", peer);
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(state, stream).await {
                                    log::debug!("Connection {} closed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => log::warn!("Accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    log::info!("Control server shutting down");
                    self.state.transport.terminate();
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    state: Arc<AppState>,
    stream: TcpStream,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (write, mut read) = ws.split();
    let writer: SharedWriter = Arc::new(Mutex::new(write));
    let mut session = ControlSession { last_msg_id: None };

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        // Malformed JSON closes the offending connection.
                        log::warn!("Closing connection on malformed message: {}", e);
                        let _ = writer.lock().await.send(Message::Close(None)).await;
                        break;
                    }
                };
                let request: Request = match serde_json::from_value(value) {
                    Ok(request) => request,
                    Err(_) => {
                        let reply = Reply::error(
                            "Missing 'task' field in message",
                            session.last_msg_id.clone(),
                        );
                        send_reply(&writer, &reply).await?;
                        continue;
                    }
                };
                session.last_msg_id = request.id.clone();

                let (reply, close) =
                    handlers::handle(&state, &session, request, &writer).await;
                send_reply(&writer, &reply).await?;

                if close {
                    let _ = writer.lock().await.send(Message::Close(None)).await;
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary/ping/pong ignored
            Err(e) => {
                log::debug!("Read error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Serialize and send one reply over the shared writer.
pub async fn send_reply(
    writer: &SharedWriter,
    reply: &Reply,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(reply).expect("replies always serialize");
    writer.lock().await.send(Message::Text(json)).await
}
