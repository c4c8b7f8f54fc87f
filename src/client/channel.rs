// src/client/channel.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage, StatusUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted. Returned once; every later close yields `Halt`.
    GiveUp,
    Halt,
}

/// Bookkeeping for the disconnected → reconnecting(attempt) → connected cycle.
#[derive(Debug)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempts: u32,
    stopped: bool,
    exhausted: bool,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            stopped: false,
            exhausted: false,
        }
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
    }

    pub fn on_close(&mut self) -> ReconnectDecision {
        if self.stopped || self.exhausted {
            return ReconnectDecision::Halt;
        }
        if self.attempts >= self.policy.max_attempts {
            self.exhausted = true;
            return ReconnectDecision::GiveUp;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// `tokio::time::interval` rejects a zero period.
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT)
    }

    /// Same settings, scoped to one relay client id.
    pub fn for_client(&self, client_id: &str) -> Self {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        Self {
            url: format!("{}{}clientId={}", self.url, separator, client_id),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `permanent` is set exactly once, when reconnection has been given up.
    ConnectionChanged { connected: bool, permanent: bool },
    Connected { client_id: String },
    Status(StatusUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Dropped,
    Shutdown,
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Best-effort push channel for status updates. Delivery is at-most-once and unordered;
/// consumers must tolerate gaps.
pub struct ProgressChannel {
    shutdown: watch::Sender<bool>,
    state: Arc<Mutex<ConnectionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressChannel {
    pub fn connect(config: ChannelConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let task = tokio::spawn(run(config, events, state.clone(), shutdown_rx));
        Self {
            shutdown,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops the socket and every future reconnect.
    pub fn disconnect(&self) {
        self.shutdown.send_replace(true);
    }

    /// Disconnects and waits for the connection task to finish.
    pub async fn close(&self) {
        self.disconnect();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
}

async fn run(
    config: ChannelConfig,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<Mutex<ConnectionState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnector = Reconnector::new(config.reconnect);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connecting = tokio::select! {
            result = connect_async(config.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match connecting {
            Ok((socket, _)) => {
                info!("Progress channel connected to {}", config.url);
                reconnector.on_open();
                set_state(&state, ConnectionState::Connected);
                let _ = events.send(ChannelEvent::ConnectionChanged {
                    connected: true,
                    permanent: false,
                });

                let end = session(socket, &config, &events, &mut shutdown).await;
                if end == SessionEnd::Shutdown {
                    let _ = events.send(ChannelEvent::ConnectionChanged {
                        connected: false,
                        permanent: false,
                    });
                    break;
                }
                info!("Progress channel to {} dropped", config.url);
                let _ = events.send(ChannelEvent::ConnectionChanged {
                    connected: false,
                    permanent: false,
                });
            }
            Err(e) => debug!("Progress channel connect to {} failed: {}", config.url, e),
        }

        match reconnector.on_close() {
            ReconnectDecision::Retry { attempt, delay } => {
                debug!("Reconnecting progress channel in {:?} (attempt {})", delay, attempt);
                set_state(&state, ConnectionState::Reconnecting { attempt });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                set_state(&state, ConnectionState::Connecting);
            }
            ReconnectDecision::GiveUp => {
                warn!(
                    "Giving up on progress channel {} after {} attempts",
                    config.url, config.reconnect.max_attempts
                );
                let _ = events.send(ChannelEvent::ConnectionChanged {
                    connected: false,
                    permanent: true,
                });
                break;
            }
            ReconnectDecision::Halt => break,
        }
    }

    reconnector.stop();
    set_state(&state, ConnectionState::Closed);
}

async fn session(
    socket: Socket,
    config: &ChannelConfig,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    // First tick fires immediately: that is the initial ping.
    let mut heartbeat = tokio::time::interval(config.heartbeat_period());

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let ping = match serde_json::to_string(&ClientMessage::Ping) {
                    Ok(ping) => ping,
                    Err(_) => continue,
                };
                if let Err(e) = sink.send(Message::text(ping)).await {
                    debug!("Heartbeat failed: {}", e);
                    return SessionEnd::Dropped;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(text.as_str(), events),
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Progress channel read error: {}", e);
                    return SessionEnd::Dropped;
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

fn dispatch(text: &str, events: &mpsc::UnboundedSender<ChannelEvent>) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Connected { client_id }) => {
            let _ = events.send(ChannelEvent::Connected { client_id });
        }
        Ok(ServerMessage::StatusUpdate(update)) => {
            debug!("Status update: {} ({}%)", update.step, update.progress);
            let _ = events.send(ChannelEvent::Status(update));
        }
        Ok(ServerMessage::Pong) => {}
        Err(e) => warn!("Ignoring unrecognised progress message: {}", e),
    }
}
