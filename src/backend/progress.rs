// src/backend/progress.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DelegateError;
use crate::protocol::{step, ClientMessage, ServerMessage, StatusUpdate};

pub const DEFAULT_BACKLOG: usize = 64;
/// How long a finished client's history waits for a socket before it is dropped.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

struct ClientSlot {
    sender: broadcast::Sender<StatusUpdate>,
    backlog: Vec<StatusUpdate>,
    finished_at: Option<Instant>,
}

impl ClientSlot {
    fn idle(&self) -> bool {
        self.finished_at.is_some() && self.sender.receiver_count() == 0
    }
}

/// Fans `status_update` events out to whichever sockets are attached for a client id.
///
/// Updates published before a socket attaches are kept and replayed on attach, so a reconnecting
/// client never misses a step.
pub struct ProgressHub {
    clients: Mutex<HashMap<String, ClientSlot>>,
    backlog: usize,
    retention: Duration,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            backlog: backlog.max(1),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientSlot>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot<'a>(
        clients: &'a mut HashMap<String, ClientSlot>,
        client_id: &str,
        backlog: usize,
    ) -> &'a mut ClientSlot {
        clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientSlot {
                sender: broadcast::channel(backlog).0,
                backlog: Vec::new(),
                finished_at: None,
            })
    }

    /// Subscribes to a client id, returning what was already published plus the live feed.
    pub fn register(&self, client_id: &str) -> (Vec<StatusUpdate>, broadcast::Receiver<StatusUpdate>) {
        let mut clients = self.lock();
        let slot = Self::slot(&mut clients, client_id, self.backlog);
        (slot.backlog.clone(), slot.sender.subscribe())
    }

    /// Returns whether a socket was attached to receive the update live.
    pub fn publish(&self, client_id: &str, update: StatusUpdate) -> bool {
        let mut clients = self.lock();
        let slot = Self::slot(&mut clients, client_id, self.backlog);
        if slot.backlog.len() == self.backlog {
            slot.backlog.remove(0);
        }
        slot.backlog.push(update.clone());
        if update.step == step::COMPLETED || update.step == step::FAILED {
            slot.finished_at.get_or_insert_with(Instant::now);
        }
        let delivered = slot.sender.send(update).is_ok();
        if !delivered {
            debug!("No socket attached for {}, update kept", client_id);
        }
        self.sweep(&mut clients);
        delivered
    }

    /// Drops finished clients nobody attached to within the retention window.
    fn sweep(&self, clients: &mut HashMap<String, ClientSlot>) {
        let retention = self.retention;
        clients.retain(|_, slot| {
            !(slot.idle()
                && slot
                    .finished_at
                    .map(|at| at.elapsed() >= retention)
                    .unwrap_or(false))
        });
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    pub fn unregister(&self, client_id: &str) -> bool {
        self.lock().remove(client_id).is_some()
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    /// Drops a finished client's history once nobody is listening.
    fn release(&self, client_id: &str) {
        let mut clients = self.lock();
        let idle = clients.get(client_id).map(ClientSlot::idle).unwrap_or(false);
        if idle {
            clients.remove(client_id);
        }
    }

    pub fn handle_client_message(text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
            Err(e) => {
                debug!("Ignoring client message: {}", e);
                None
            }
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Progress channel listening on {}", addr);
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.handle_connection(stream).await {
                            debug!("Progress socket {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept progress socket: {}", e),
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), DelegateError> {
        let mut requested = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            requested = client_id_from_query(request.uri().query());
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| DelegateError::Transport(e.to_string()))?;
        let client_id = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!("Progress socket attached for {}", client_id);

        let (mut sink, mut source) = ws.split();
        let (backlog, mut updates) = self.register(&client_id);

        let result = async {
            send(
                &mut sink,
                &ServerMessage::Connected {
                    client_id: client_id.clone(),
                },
            )
            .await?;
            for update in backlog {
                send(&mut sink, &ServerMessage::StatusUpdate(update)).await?;
            }

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(update) => send(&mut sink, &ServerMessage::StatusUpdate(update)).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Progress socket {} lagged by {} updates", client_id, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = Self::handle_client_message(text.as_str()) {
                                send(&mut sink, &reply).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(DelegateError::Transport(e.to_string())),
                    },
                }
            }
            Ok(())
        }
        .await;

        drop(updates);
        self.release(&client_id);
        result
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), DelegateError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message)
        .map_err(|e| DelegateError::Transport(format!("encode: {e}")))?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| DelegateError::Transport(e.to_string()))
}

fn client_id_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "clientId")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
