//! Per-agent tunnel session.
//!
//! A session owns the agent websocket and runs exactly two long-lived
//! tasks: the read loop (frame dispatch) and the heartbeat loop. All frame
//! writes go through an mpsc channel to a single writer task so that
//! concurrent dispatchers and the heartbeat never interleave frames on the
//! socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::GatewayContext;

use super::dispatcher::ForwardError;
use super::protocol::{Frame, FrameType, HandshakeData, HeartbeatData};
use super::record::{TunnelEntry, TunnelStatus};
use super::registry::TunnelRegistry;

/// Outcome delivered through a rendezvous slot: the matching response
/// frame, or the failure that ended the wait.
pub type SessionReply = Result<Frame, ForwardError>;

/// Why a session ended. Determines the terminal record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Agent sent a `disconnect` frame.
    AgentDisconnect,
    /// The websocket closed cleanly.
    StreamClosed,
    ReadError,
    WriteError,
    /// The heartbeat loop declared the agent dead.
    HeartbeatTimeout,
    /// The liveness sweep found the session stale.
    Stale,
    /// The record outlived its expiry.
    Expired,
    /// Explicit API termination.
    Terminated,
}

impl TeardownReason {
    fn final_status(self) -> TunnelStatus {
        match self {
            TeardownReason::AgentDisconnect
            | TeardownReason::StreamClosed
            | TeardownReason::Expired
            | TeardownReason::Terminated => TunnelStatus::Terminated,
            TeardownReason::ReadError
            | TeardownReason::WriteError
            | TeardownReason::HeartbeatTimeout
            | TeardownReason::Stale => TunnelStatus::Error,
        }
    }
}

pub struct TunnelSession {
    entry: Arc<TunnelEntry>,
    registry: Arc<TunnelRegistry>,
    outbound: mpsc::Sender<Frame>,
    /// Rendezvous slots keyed by correlation id. Never held across `await`.
    pending: Mutex<HashMap<String, oneshot::Sender<SessionReply>>>,
    last_ping: Mutex<Instant>,
    cancel: watch::Sender<bool>,
    torn_down: AtomicBool,
    max_frame_bytes: usize,
    heartbeat_interval: Duration,
    liveness_threshold: Duration,
}

impl TunnelSession {
    pub(crate) fn new(
        entry: Arc<TunnelEntry>,
        registry: Arc<TunnelRegistry>,
        outbound: mpsc::Sender<Frame>,
        cancel: watch::Sender<bool>,
        max_frame_bytes: usize,
        heartbeat_interval: Duration,
        liveness_threshold: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            entry,
            registry,
            outbound,
            pending: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(Instant::now()),
            cancel,
            torn_down: AtomicBool::new(false),
            max_frame_bytes,
            heartbeat_interval,
            liveness_threshold,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn last_ping_elapsed(&self) -> Duration {
        self.last_ping.lock().unwrap().elapsed()
    }

    /// True while the agent has checked in within `threshold`.
    pub fn is_healthy(&self, threshold: Duration) -> bool {
        !self.is_closed() && self.last_ping_elapsed() < threshold
    }

    /// Dispatcher send path: insert the rendezvous slot, then write.
    ///
    /// The insert-before-write order is load-bearing: a response that
    /// arrives before this function returns must find its slot.
    pub async fn send_request(&self, frame: Frame) -> Result<oneshot::Receiver<SessionReply>, ForwardError> {
        if self.is_closed() {
            return Err(ForwardError::TunnelClosed);
        }
        let id = frame.id.clone();
        let (slot, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), slot);

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(ForwardError::UpstreamWriteFailed);
        }

        // Teardown may have drained `pending` between the insert and here;
        // if our slot survived the drain, it would never complete.
        if self.is_closed() && self.pending.lock().unwrap().remove(&id).is_some() {
            return Err(ForwardError::TunnelClosed);
        }
        Ok(rx)
    }

    /// Drop a slot after its deadline fired; a late response is discarded.
    pub fn remove_pending(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Complete and remove a slot. Returns false when no slot is waiting
    /// (late, duplicate, or unknown correlation id).
    fn complete_pending(&self, id: &str, reply: SessionReply) -> bool {
        match self.pending.lock().unwrap().remove(id) {
            Some(slot) => {
                let _ = slot.send(reply);
                true
            }
            None => false,
        }
    }

    /// Tear the session down. Idempotent; safe to call from the read loop,
    /// the heartbeat loop, the sweeps and the admin surface concurrently.
    pub fn teardown(&self, reason: TeardownReason) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            tunnel_id = %self.entry.tunnel_id,
            subdomain = %self.entry.subdomain,
            reason = ?reason,
            "tunnel session closing"
        );

        // Remove from the registry before the socket goes away so no new
        // request is dispatched into a closing session.
        self.registry.remove(&self.entry.tunnel_id);
        self.entry.finish(reason.final_status());

        // Best-effort goodbye; the writer may already be gone.
        let _ = self
            .outbound
            .try_send(Frame::control(FrameType::Disconnect, serde_json::Value::Null));
        let _ = self.cancel.send(true);

        let drained: Vec<(String, oneshot::Sender<SessionReply>)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "completing orphaned in-flight requests");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(ForwardError::TunnelClosed));
        }

        self.entry.clear_session();
    }

    /// Handle one inbound websocket text payload. `Some(reason)` ends the
    /// read loop.
    pub(crate) async fn handle_frame(&self, text: &str) -> Option<TeardownReason> {
        let frame = match Frame::decode(text, self.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    tunnel_id = %self.entry.tunnel_id,
                    error = %e,
                    "dropping undecodable frame"
                );
                return None;
            }
        };

        // Any well-formed frame counts as liveness.
        *self.last_ping.lock().unwrap() = Instant::now();
        self.entry.touch();

        match frame.frame_type {
            FrameType::Response => {
                let id = frame.id.clone();
                if !self.complete_pending(&id, Ok(frame)) {
                    warn!(
                        tunnel_id = %self.entry.tunnel_id,
                        correlation_id = %id,
                        "late or duplicate response, dropping"
                    );
                }
                None
            }
            FrameType::Heartbeat => {
                let echo = Frame::control(
                    FrameType::Heartbeat,
                    serde_json::to_value(HeartbeatData::now()).unwrap_or_default(),
                );
                let _ = self.outbound.send(echo).await;
                None
            }
            FrameType::Error => {
                let message = frame
                    .data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported an error")
                    .to_string();
                warn!(
                    tunnel_id = %self.entry.tunnel_id,
                    correlation_id = %frame.id,
                    message = %message,
                    "error frame from agent"
                );
                self.complete_pending(&frame.id, Err(ForwardError::Agent(message)));
                None
            }
            FrameType::Disconnect => Some(TeardownReason::AgentDisconnect),
            FrameType::Handshake | FrameType::Request => {
                warn!(
                    tunnel_id = %self.entry.tunnel_id,
                    frame_type = ?frame.frame_type,
                    "unexpected frame direction from agent, ignoring"
                );
                None
            }
            FrameType::Unknown => {
                warn!(tunnel_id = %self.entry.tunnel_id, "ignoring unknown frame type");
                None
            }
        }
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        mut cancel: watch::Receiver<bool>,
    ) -> TeardownReason {
        loop {
            tokio::select! {
                msg = stream.next() => {
                    let msg = match msg {
                        None => return TeardownReason::StreamClosed,
                        Some(Err(e)) => {
                            warn!(tunnel_id = %self.entry.tunnel_id, error = %e, "websocket read error");
                            return TeardownReason::ReadError;
                        }
                        Some(Ok(msg)) => msg,
                    };
                    match msg {
                        Message::Text(text) => {
                            if let Some(reason) = self.handle_frame(text.as_str()).await {
                                return reason;
                            }
                        }
                        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                            Ok(text) => {
                                if let Some(reason) = self.handle_frame(text).await {
                                    return reason;
                                }
                            }
                            Err(_) => {
                                warn!(tunnel_id = %self.entry.tunnel_id, "dropping non-UTF-8 binary frame");
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => {}
                        Message::Close(_) => return TeardownReason::StreamClosed,
                    }
                }
                _ = cancel.changed() => {
                    // Teardown already in progress; the reason is recorded there.
                    return TeardownReason::Terminated;
                }
            }
        }
    }
}

/// Run one agent session to completion: handshake, loops, teardown.
///
/// The entry must already be registered; this attaches the session,
/// activates the record on a successful handshake write and blocks until
/// the session ends.
pub async fn run(ctx: GatewayContext, entry: Arc<TunnelEntry>, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(256);

    let writer = spawn_writer(sink, outbound_rx, cancel_rx.clone());

    let session = TunnelSession::new(
        Arc::clone(&entry),
        Arc::clone(&ctx.registry),
        outbound_tx,
        cancel_tx,
        ctx.config.max_frame_bytes,
        ctx.config.heartbeat_interval(),
        ctx.config.liveness_threshold(),
    );
    entry.attach_session(Arc::clone(&session));

    let handshake = Frame::control(
        FrameType::Handshake,
        serde_json::to_value(HandshakeData {
            tunnel_id: entry.tunnel_id,
            subdomain: entry.subdomain.clone(),
            public_url: entry.public_url.clone(),
            status: "connected".to_string(),
        })
        .unwrap_or_default(),
    );
    if session.outbound.send(handshake).await.is_err() {
        error!(tunnel_id = %entry.tunnel_id, "failed to send handshake");
        session.teardown(TeardownReason::WriteError);
        let _ = writer.await;
        return;
    }

    if !entry.activate() {
        // Lost a race with termination or expiry before the handshake.
        session.teardown(TeardownReason::Terminated);
        let _ = writer.await;
        return;
    }
    info!(
        tunnel_id = %entry.tunnel_id,
        user_id = %entry.user_id,
        subdomain = %entry.subdomain,
        local_port = entry.local_port,
        "tunnel active"
    );

    spawn_heartbeat(Arc::clone(&session), cancel_rx.clone());

    let reason = session.read_loop(stream, cancel_rx).await;
    session.teardown(reason);
    let _ = writer.await;
}

/// Dedicated writer task: every outbound frame funnels through here.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let frame = match maybe {
                        Some(frame) => frame,
                        None => break,
                    };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            // Nothing reached the wire; drop the frame whole.
                            error!(error = %e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(error = %e, "websocket write failed");
                        break;
                    }
                }
                _ = cancel.changed() => break,
            }
        }
        let _ = sink.close().await;
        debug!("writer task exiting");
    })
}

/// Heartbeat loop: emit a heartbeat every interval, or declare the agent
/// dead when it stops answering.
fn spawn_heartbeat(session: Arc<TunnelSession>, mut cancel: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(session.heartbeat_interval);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if session.last_ping_elapsed() > session.liveness_threshold {
                        warn!(
                            tunnel_id = %session.entry.tunnel_id,
                            elapsed_secs = session.last_ping_elapsed().as_secs(),
                            "agent missed liveness window"
                        );
                        session.teardown(TeardownReason::HeartbeatTimeout);
                        break;
                    }
                    let frame = Frame::control(
                        FrameType::Heartbeat,
                        serde_json::to_value(HeartbeatData::now()).unwrap_or_default(),
                    );
                    if session.outbound.send(frame).await.is_err() {
                        break; // writer closed
                    }
                }
                _ = cancel.changed() => break,
            }
        }
    });
}
