//! The per-client connection state machine (spec §4.5): a reader task and
//! a writer task sharing a bounded outbound queue and a single-assignment
//! close flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::protocol::RelayMessage;
use crate::subscription::SubscriptionTable;

/// Bounded outbound queue depth. Spec §4.5: live-publish drops and emits a
/// NOTICE when full; stored replay instead awaits queue space.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Heartbeat interval for the writer's idle ping, mirroring long-lived
/// proxies' idle-connection timeouts.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("session is closed")]
pub struct SendError;

/// Shared between the orchestrator (for live-publish fan-out and the
/// session registry) and this session's own reader/writer tasks. The
/// orchestrator is the sole lifetime authority (spec §9): it hands out
/// `Arc<SessionHandle>`s but a session never owns the orchestrator back,
/// only the narrow `InboundHandler` interface below.
pub struct SessionHandle {
    pub id: u64,
    pub remote_addr: String,
    pub ip: std::net::IpAddr,
    outbound: mpsc::Sender<Message>,
    pub subscriptions: Mutex<SubscriptionTable>,
    pub authenticated_pubkey: Mutex<Option<String>>,
    closed: AtomicBool,
    pub cancel: CancelToken,
}

impl SessionHandle {
    pub fn new(
        id: u64,
        remote_addr: String,
        ip: std::net::IpAddr,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            ip,
            outbound,
            subscriptions: Mutex::new(SubscriptionTable::new()),
            authenticated_pubkey: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent: only the first caller actually triggers cancellation.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    /// Non-blocking enqueue: used by live-publish, which must drop rather
    /// than stall the publisher on a slow subscriber (spec §4.5, §9).
    pub fn try_send(&self, message: &RelayMessage) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError);
        }
        self.outbound
            .try_send(Message::Text(message.to_json()))
            .map_err(|_| SendError)
    }

    /// Awaits queue space: used by stored replay, which the spec requires
    /// to block rather than drop (§4.5).
    pub async fn send_blocking(&self, message: &RelayMessage) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError);
        }
        self.outbound
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|_| SendError)
    }
}

/// The orchestrator's narrow surface as seen by a session's reader loop —
/// the "small broadcast interface" spec §9 asks for instead of a strong
/// mutual ownership cycle.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_text(&self, session: &Arc<SessionHandle>, text: &str);
    async fn on_disconnect(&self, session: &Arc<SessionHandle>);
}

/// Drain the outbound queue onto the transport until the session closes or
/// the socket errors; a write error transitions the session to closing.
async fn run_writer(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    session: Arc<SessionHandle>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; discard it.
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            maybe_message = outbound.recv() => {
                match maybe_message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            session.close();
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    session.close();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Read framed text from the transport, dispatching recognised frames to
/// `handler` and ignoring (with a NOTICE) anything that fails to parse.
/// Exits on read error, peer close, or cancellation.
async fn run_reader(
    mut stream: futures::stream::SplitStream<WebSocket>,
    session: Arc<SessionHandle>,
    handler: Arc<dyn InboundHandler>,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handler.handle_text(&session, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // binary/ping/pong frames carry no protocol meaning here.
                    }
                    Some(Err(err)) => {
                        debug!(session_id = session.id, error = %err, "read error, closing session");
                        break;
                    }
                }
            }
        }
    }
    session.close();
}

/// Drive one accepted WebSocket connection end to end: split into
/// reader/writer halves, spawn the writer, run the reader inline, then
/// notify the handler of disconnect once both halves have stopped.
pub async fn handle_socket(
    socket: WebSocket,
    session: Arc<SessionHandle>,
    outbound_rx: mpsc::Receiver<Message>,
    handler: Arc<dyn InboundHandler>,
) {
    let (sink, stream) = socket.split();
    let writer_session = session.clone();
    let writer = tokio::spawn(run_writer(sink, outbound_rx, writer_session));

    run_reader(stream, session.clone(), handler.clone()).await;

    if let Err(err) = writer.await {
        warn!(session_id = session.id, error = %err, "writer task panicked");
    }
    handler.on_disconnect(&session).await;
}

/// Build a session and its outbound channel, ready for `handle_socket`.
pub fn new_session(
    id: u64,
    remote_addr: String,
    ip: std::net::IpAddr,
) -> (Arc<SessionHandle>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    (Arc::new(SessionHandle::new(id, remote_addr, ip, tx)), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_observed_through_cancel_token() {
        let (tx, _rx) = mpsc::channel(4);
        let session = SessionHandle::new(1, "127.0.0.1:1234".into(), "127.0.0.1".parse().unwrap(), tx);
        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
        tokio::time::timeout(std::time::Duration::from_millis(50), session.cancel.cancelled())
            .await
            .expect("cancel token should already be set");
    }

    #[tokio::test]
    async fn try_send_fails_once_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = SessionHandle::new(1, "127.0.0.1:1234".into(), "127.0.0.1".parse().unwrap(), tx);
        let msg = RelayMessage::notice("hi");
        assert!(session.try_send(&msg).is_ok());
        assert!(rx.recv().await.is_some());
        session.close();
        assert_eq!(session.try_send(&msg), Err(SendError));
    }

    #[tokio::test]
    async fn try_send_reports_failure_when_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let session = SessionHandle::new(1, "127.0.0.1:1234".into(), "127.0.0.1".parse().unwrap(), tx);
        let msg = RelayMessage::notice("hi");
        assert!(session.try_send(&msg).is_ok());
        assert_eq!(session.try_send(&msg), Err(SendError));
    }
}
