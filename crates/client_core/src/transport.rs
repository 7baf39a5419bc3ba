//! Persistent transport channel.
//!
//! One logical WebSocket connection carrying JSON frames of the form
//! `{"event": ..., "data": ...}`. The socket being open is not enough to send:
//! the channel authenticates explicitly and only reports
//! [`ConnectionState::Authenticated`] once the server acknowledges the
//! credential. Failures are published on the status stream, never returned
//! to senders.

use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use shared::protocol::{events, ClientRequest, RawFrame};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
}

/// Why the channel settled in [`ConnectionState::Disconnected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFault {
    Unreachable { attempts: u32, last_error: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub fault: Option<ChannelFault>,
}

impl ConnectionStatus {
    fn new(state: ConnectionState, fault: Option<ChannelFault>) -> Self {
        Self { state, fault }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn credential_rejected(&self) -> bool {
        matches!(self.fault, Some(ChannelFault::Rejected { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectBackoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub socket_url: String,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Consecutive failed attempts before the channel gives up.
    pub max_attempts: u32,
    pub backoff: ReconnectBackoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub frame_buffer: usize,
}

impl TransportSettings {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        match self.backoff {
            ReconnectBackoff::Fixed => self.base_delay,
            ReconnectBackoff::Exponential => {
                let exponent = failures.saturating_sub(1).min(16);
                self.base_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
            }
        }
    }
}

/// What the store and presence tracker need from the channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Queues a frame. Returns `false` (and drops the frame) unless the
    /// channel is authenticated.
    async fn send(&self, request: ClientRequest) -> bool;
}

enum SessionEnd {
    /// Could not connect or authenticate; counts toward the attempt budget.
    Failed(String),
    /// An authenticated connection went away; the attempt budget restarts.
    Dropped(String),
    /// The server refused the credential.
    Rejected(String),
}

pub struct TransportChannel {
    settings: TransportSettings,
    status: watch::Sender<ConnectionStatus>,
    frames: broadcast::Sender<RawFrame>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientRequest>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportChannel {
    pub fn new(settings: TransportSettings) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::new(
            ConnectionState::Disconnected,
            None,
        ));
        let (frames, _) = broadcast::channel(settings.frame_buffer.max(16));
        Arc::new(Self {
            settings,
            status,
            frames,
            outbound: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Raw inbound frames, in arrival order. Handshake frames are consumed by
    /// the channel and never appear here.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<RawFrame> {
        self.frames.subscribe()
    }

    /// Starts (or restarts) the connection with `credential`. Returns
    /// immediately; progress is reported on the status stream.
    pub async fn connect(self: &Arc<Self>, credential: impl Into<String>) {
        self.disconnect().await;

        let credential = credential.into();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().await = Some(tx);
        self.publish(ConnectionState::Connecting, None);

        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move { channel.supervise(credential, rx).await });
        *self.supervisor.lock().await = Some(handle);
    }

    /// Tears the connection down, cancelling any pending reconnection and the
    /// heartbeat. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            handle.abort();
            let _ = handle.await;
            info!("transport: disconnected");
        }
        self.outbound.lock().await.take();
        self.status.send_if_modified(|status| {
            if status.state == ConnectionState::Disconnected {
                return false;
            }
            *status = ConnectionStatus::new(ConnectionState::Disconnected, None);
            true
        });
    }

    fn publish(&self, state: ConnectionState, fault: Option<ChannelFault>) {
        let next = ConnectionStatus::new(state, fault);
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            debug!(from = ?status.state, to = ?next.state, "transport: state change");
            *status = next;
            true
        });
    }

    async fn supervise(
        self: Arc<Self>,
        credential: String,
        mut outbound: mpsc::UnboundedReceiver<ClientRequest>,
    ) {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut failures = 0u32;
        loop {
            self.publish(ConnectionState::Connecting, None);
            match self.run_session(&credential, &mut outbound).await {
                SessionEnd::Rejected(reason) => {
                    warn!(%reason, "transport: credential rejected; not reconnecting");
                    self.publish(
                        ConnectionState::Disconnected,
                        Some(ChannelFault::Rejected { reason }),
                    );
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    info!(%reason, "transport: connection lost; reconnecting");
                    failures = 0;
                }
                SessionEnd::Failed(reason) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts,
                        %reason,
                        "transport: connection attempt failed"
                    );
                    if failures >= max_attempts {
                        warn!(
                            attempts = failures,
                            "transport: reconnection attempts exhausted"
                        );
                        self.publish(
                            ConnectionState::Disconnected,
                            Some(ChannelFault::Unreachable {
                                attempts: failures,
                                last_error: reason,
                            }),
                        );
                        return;
                    }
                }
            }
            self.publish(ConnectionState::Connecting, None);
            time::sleep(self.settings.retry_delay(failures.max(1))).await;
        }
    }

    async fn run_session(
        &self,
        credential: &str,
        outbound: &mut mpsc::UnboundedReceiver<ClientRequest>,
    ) -> SessionEnd {
        let url = self.settings.socket_url.as_str();
        let ws = match time::timeout(self.settings.connect_timeout, connect_async(url)).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(err)) => return SessionEnd::Failed(err.to_string()),
            Err(_) => return SessionEnd::Failed("connect timed out".to_string()),
        };
        debug!(url, "transport: socket open; authenticating");
        let (mut sink, mut stream) = ws.split();

        let auth = ClientRequest::Auth {
            token: credential.to_string(),
        };
        if let Err(reason) = send_frame(&mut sink, &auth).await {
            return SessionEnd::Failed(reason);
        }

        let handshake = time::sleep(self.settings.handshake_timeout);
        tokio::pin!(handshake);
        loop {
            tokio::select! {
                _ = &mut handshake => {
                    return SessionEnd::Failed("authentication handshake timed out".to_string());
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Some(frame) if frame.event == events::AUTH_SUCCESS => break,
                        Some(frame) if frame.event == events::AUTH_ERROR => {
                            return SessionEnd::Rejected(rejection_reason(&frame));
                        }
                        Some(frame) => debug!(
                            event = %frame.event,
                            "transport: dropping frame received before authentication"
                        ),
                        None => {}
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Failed("connection closed during handshake".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Failed(err.to_string()),
                }
            }
        }

        info!("transport: authenticated");
        self.publish(ConnectionState::Authenticated, None);

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let frame = ClientRequest::Heartbeat { token: credential.to_string() };
                    if let Err(reason) = send_frame(&mut sink, &frame).await {
                        return SessionEnd::Dropped(reason);
                    }
                    debug!("transport: heartbeat sent");
                }
                request = outbound.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Dropped("outbound queue closed".to_string());
                    };
                    if let Err(reason) = send_frame(&mut sink, &request).await {
                        return SessionEnd::Dropped(reason);
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frame) = decode_frame(&text) {
                            // Heartbeats re-validate the session server-side.
                            if frame.event == events::AUTH_ERROR {
                                return SessionEnd::Rejected(rejection_reason(&frame));
                            }
                            let _ = self.frames.send(frame);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("connection closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TransportChannel {
    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    async fn send(&self, request: ClientRequest) -> bool {
        if self.state() != ConnectionState::Authenticated {
            warn!(
                event = request.event_name(),
                "transport: not authenticated; dropping frame"
            );
            return false;
        }
        match self.outbound.lock().await.as_ref() {
            Some(tx) => tx.send(request).is_ok(),
            None => false,
        }
    }
}

async fn send_frame<S>(sink: &mut S, request: &ClientRequest) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(request)
        .map_err(|err| format!("failed to encode {}: {err}", request.event_name()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| err.to_string())
}

fn decode_frame(text: &str) -> Option<RawFrame> {
    match serde_json::from_str::<RawFrame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(error = %err, "transport: ignoring undecodable frame");
            None
        }
    }
}

fn rejection_reason(frame: &RawFrame) -> String {
    frame
        .data
        .get("message")
        .and_then(|message| message.as_str())
        .unwrap_or("authentication rejected")
        .to_string()
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
