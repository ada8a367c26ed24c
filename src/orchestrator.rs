//! Wires the event model, storage, and subscription engine together: owns
//! the session registry, implements the five inbound handlers, maintains
//! counters, and enforces rate/connection limits (spec §4.6).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::event::Event;
use crate::filter::Filter;
use crate::health::{iso8601_utc_now, resident_memory_megabytes, HealthDoc};
use crate::kind::{self, ValidationError};
use crate::protocol::{reason, ClientMessage, RelayMessage};
use crate::rate_limit::{RateLimiters, RequestKind};
use crate::session::{InboundHandler, SessionHandle};
use crate::storage::{SaveOutcome, Storage, StorageError};
use crate::subscription::stored_replay;

const RELAY_INFO_KIND_FAMILIES: &[i64] =
    &[1, 2, 4, 9, 11, 17, 22, 25, 40, 42, 44, 45, 50, 59, 62, 65];

/// Lifetime counters exposed by the health document (spec §4.6, §6).
#[derive(Default)]
pub struct Counters {
    pub total_connections: AtomicU64,
    pub total_events_ingested: AtomicU64,
    pub total_requests: AtomicU64,
    pub rate_limited_count: AtomicU64,
    recent_packets: std::sync::Mutex<VecDeque<Instant>>,
}

impl Counters {
    fn record_packet(&self) {
        let mut packets = self.recent_packets.lock().unwrap();
        let now = Instant::now();
        packets.push_back(now);
        while packets
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(60))
            .unwrap_or(false)
        {
            packets.pop_front();
        }
    }

    fn packets_per_minute(&self) -> u64 {
        let mut packets = self.recent_packets.lock().unwrap();
        let now = Instant::now();
        while packets
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(60))
            .unwrap_or(false)
        {
            packets.pop_front();
        }
        packets.len() as u64
    }
}

/// Relay-information document served on `Accept: application/nostr+json`
/// (spec §6).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    pub software: String,
    pub version: String,
    pub supported_nips: Vec<i64>,
    pub icon: String,
}

pub struct RelayOrchestrator {
    storage: Arc<dyn Storage>,
    sessions: RwLock<HashMap<u64, Arc<SessionHandle>>>,
    next_session_id: AtomicU64,
    connections_per_ip: std::sync::Mutex<HashMap<IpAddr, usize>>,
    rate_limiters: RateLimiters,
    settings: Settings,
    counters: Counters,
    started_at: Instant,
    pub shutdown: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRefused {
    PerIpLimit,
    GlobalLimit,
}

impl RelayOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, settings: Settings) -> Self {
        let rate_limiters = RateLimiters::new(settings.rate_limit_config());
        Self {
            storage,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            connections_per_ip: std::sync::Mutex::new(HashMap::new()),
            rate_limiters,
            settings,
            counters: Counters::default(),
            started_at: Instant::now(),
            shutdown: CancelToken::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn relay_info(&self) -> RelayInfo {
        RelayInfo {
            name: self.settings.name.clone(),
            description: self.settings.description.clone(),
            software: "relay-rs".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_nips: RELAY_INFO_KIND_FAMILIES.to_vec(),
            icon: self.settings.icon.clone(),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Admission control at transport-upgrade time (spec §4.6): refusal is
    /// surfaced by the HTTP layer as a 429.
    pub fn try_register_connection(&self, ip: IpAddr) -> Result<(), ConnectionRefused> {
        let mut per_ip = self.connections_per_ip.lock().unwrap();
        let global_total: usize = per_ip.values().sum();
        if global_total >= self.settings.max_connections_global {
            return Err(ConnectionRefused::GlobalLimit);
        }
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.settings.max_connections_per_ip {
            return Err(ConnectionRefused::PerIpLimit);
        }
        *count += 1;
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_connection(&self, ip: IpAddr) {
        let mut per_ip = self.connections_per_ip.lock().unwrap();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }

    pub async fn register_session(&self, session: Arc<SessionHandle>) {
        self.sessions.write().await.insert(session.id, session);
    }

    pub fn health(&self) -> HealthDoc {
        let healthy = !self.shutdown.is_cancelled();
        HealthDoc {
            status: if healthy { "healthy".into() } else { "unhealthy".into() },
            uptime_seconds: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_connections: 0, // filled in by the async accessor below
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            total_events_ingested: self.counters.total_events_ingested.load(Ordering::Relaxed),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            rate_limited_count: self.counters.rate_limited_count.load(Ordering::Relaxed),
            packets_per_minute: self.counters.packets_per_minute(),
            memory_megabytes: resident_memory_megabytes(),
            database_status: "ok".to_string(),
            timestamp: iso8601_utc_now(),
        }
    }

    pub async fn health_with_active_connections(&self) -> HealthDoc {
        let mut doc = self.health();
        doc.active_connections = self.sessions.read().await.len() as u64;
        doc
    }

    fn rate_limited(&self, kind: RequestKind, ip: IpAddr) -> bool {
        let allowed = self.rate_limiters.check(kind, ip);
        if !allowed {
            self.counters.rate_limited_count.fetch_add(1, Ordering::Relaxed);
        }
        !allowed
    }

    async fn handle_event_message(&self, session: &Arc<SessionHandle>, event: Event) {
        self.counters.record_packet();
        if self.rate_limited(RequestKind::Event, session.ip) {
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, reason::RATE_LIMITED));
            return;
        }

        if let Err(err) = event.verify() {
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{reason}: {err}", reason = reason::INVALID)));
            return;
        }

        let now = crate::now_unix();
        if event.is_expired(now) {
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, reason::EXPIRED));
            return;
        }

        if let Err(err) = kind::validate(&event) {
            let ValidationError::Invalid(detail) = err;
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: {detail}", reason::INVALID)));
            return;
        }

        if event.kind == kind::AUTH {
            // AUTH events are never persisted; handled only via the AUTH tag.
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: use AUTH, not EVENT", reason::INVALID)));
            return;
        }

        self.counters.total_events_ingested.fetch_add(1, Ordering::Relaxed);

        if event.kind == kind::DELETION {
            self.handle_deletion(session, &event).await;
            return;
        }
        if event.kind == kind::VANISH_REQUEST {
            self.handle_vanish_request(session, &event).await;
            return;
        }

        match self.storage.save(event.clone(), &session.cancel).await {
            Ok(SaveOutcome::Duplicate) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, true, format!("{}: ", reason::DUPLICATE)));
            }
            Ok(SaveOutcome::Discarded) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, true, ""));
            }
            Ok(SaveOutcome::Inserted) | Ok(SaveOutcome::Replaced) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, true, ""));
                self.live_publish(&event).await;
            }
            Err(StorageError::Deleted) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: event was deleted", reason::INVALID)));
            }
            Err(StorageError::Cancelled) => {}
            Err(other) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: {other}", reason::ERROR)));
            }
        }
    }

    async fn handle_deletion(&self, session: &Arc<SessionHandle>, event: &Event) {
        let mut all_ok = true;
        for tag in event.tags_named("e") {
            let Some(target_id) = tag.value() else { continue };
            match self
                .storage
                .tombstone(target_id, &event.pubkey, &session.cancel)
                .await
            {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(StorageError::Unauthorized) => all_ok = false,
                Err(StorageError::Cancelled) => return,
                Err(_) => all_ok = false,
            }
        }
        if all_ok {
            let _ = session.try_send(&RelayMessage::ok(&event.id, true, ""));
        } else {
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, reason::UNAUTHORIZED));
        }
    }

    async fn handle_vanish_request(&self, session: &Arc<SessionHandle>, event: &Event) {
        if !kind::vanish_targets_this_relay(event, &self.settings.relay_url) {
            let _ = session.try_send(&RelayMessage::ok(&event.id, true, ""));
            return;
        }
        match self
            .storage
            .tombstone_all_by(&event.pubkey, &session.cancel)
            .await
        {
            Ok(_) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, true, reason::VANISH_PROCESSED));
            }
            Err(StorageError::Cancelled) => {}
            Err(other) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: {other}", reason::ERROR)));
            }
        }
    }

    async fn handle_auth_message(&self, session: &Arc<SessionHandle>, event: Event) {
        if self.rate_limited(RequestKind::Event, session.ip) {
            let _ = session.try_send(&RelayMessage::ok(&event.id, false, reason::RATE_LIMITED));
            return;
        }
        match kind::validate_auth(&event) {
            Ok(()) => {
                *session.authenticated_pubkey.lock().await = Some(event.pubkey.clone());
                let _ = session.try_send(&RelayMessage::ok(&event.id, true, reason::AUTHENTICATED));
            }
            Err(err) => {
                let _ = session.try_send(&RelayMessage::ok(&event.id, false, format!("{}: {err}", reason::INVALID)));
            }
        }
    }

    async fn handle_req_message(&self, session: &Arc<SessionHandle>, sub_id: String, filters: Vec<Filter>) {
        self.counters.record_packet();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        if self.rate_limited(RequestKind::Request, session.ip) {
            let _ = session.try_send(&RelayMessage::closed(&sub_id, reason::RATE_LIMITED));
            return;
        }
        if filters.is_empty() {
            let _ = session.try_send(&RelayMessage::closed(&sub_id, format!("{}: at least one filter is required", reason::INVALID)));
            return;
        }

        // Register the subscription for live delivery only after stored
        // replay and EOSE are fully enqueued: `live_publish` acquires this
        // same subscription table under lock, and registering it earlier
        // would let a concurrently-saved event jump the queue ahead of
        // EOSE, violating the stored-before-EOSE-before-live ordering
        // guarantee (spec §4.4, §8).
        match stored_replay(self.storage.as_ref(), &filters, &session.cancel).await {
            Ok(events) => {
                for event in events {
                    if session
                        .send_blocking(&RelayMessage::event(&sub_id, event))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                if session.send_blocking(&RelayMessage::eose(&sub_id)).await.is_err() {
                    return;
                }
                session
                    .subscriptions
                    .lock()
                    .await
                    .insert(sub_id.clone(), filters);
            }
            Err(StorageError::Cancelled) => {}
            Err(err) => {
                let _ = session.try_send(&RelayMessage::closed(&sub_id, format!("{}: {err}", reason::ERROR)));
            }
        }
    }

    async fn handle_close_message(&self, session: &Arc<SessionHandle>, sub_id: String) {
        session.subscriptions.lock().await.remove(&sub_id);
    }

    async fn handle_count_message(&self, session: &Arc<SessionHandle>, count_id: String, filters: Vec<Filter>) {
        self.counters.record_packet();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        if self.rate_limited(RequestKind::Count, session.ip) {
            let _ = session.try_send(&RelayMessage::closed(&count_id, reason::RATE_LIMITED));
            return;
        }
        if filters.is_empty() {
            let _ = session.try_send(&RelayMessage::closed(&count_id, format!("{}: at least one filter is required", reason::INVALID)));
            return;
        }
        match self.storage.count(&filters, &session.cancel).await {
            Ok(n) => {
                let _ = session.try_send(&RelayMessage::count(&count_id, n, false));
            }
            Err(StorageError::Cancelled) => {}
            Err(err) => {
                let _ = session.try_send(&RelayMessage::closed(&count_id, format!("{}: {err}", reason::ERROR)));
            }
        }
    }

    /// After a successful save, fan the event out to every live subscription
    /// it matches (spec §4.4). A full outbound queue drops the delivery and
    /// emits a NOTICE rather than blocking the publisher (spec §4.5, §9).
    async fn live_publish(&self, event: &Event) {
        let now = crate::now_unix();
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            if session.is_closed() {
                continue;
            }
            let subs = session.subscriptions.lock().await;
            for (sub_id, filters) in subs.iter() {
                if crate::subscription::is_deliverable(filters, event, now) {
                    if session
                        .try_send(&RelayMessage::event(sub_id, event.clone()))
                        .is_err()
                    {
                        let _ = session.try_send(&RelayMessage::notice(format!(
                            "outbound queue full, dropped delivery for {sub_id}"
                        )));
                    }
                }
            }
        }
    }

    pub async fn unregister_session(&self, session: &Arc<SessionHandle>) {
        self.sessions.write().await.remove(&session.id);
        self.release_connection(session.ip);
        info!(session_id = session.id, "session disconnected");
    }

    pub async fn shutdown_gracefully(&self) {
        self.shutdown.cancel();
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            session.close();
        }
        self.storage.close().await;
    }
}

#[async_trait]
impl InboundHandler for RelayOrchestrator {
    async fn handle_text(&self, session: &Arc<SessionHandle>, text: &str) {
        match crate::protocol::parse_client_message(text) {
            Ok(ClientMessage::Event(event)) => self.handle_event_message(session, event).await,
            Ok(ClientMessage::Auth(event)) => self.handle_auth_message(session, event).await,
            Ok(ClientMessage::Req { sub_id, filters }) => {
                self.handle_req_message(session, sub_id, filters).await
            }
            Ok(ClientMessage::Close(sub_id)) => self.handle_close_message(session, sub_id).await,
            Ok(ClientMessage::Count { count_id, filters }) => {
                self.handle_count_message(session, count_id, filters).await
            }
            Err(err) => {
                let _ = session.try_send(&RelayMessage::notice(format!("could not parse message: {err}")));
            }
        }
    }

    async fn on_disconnect(&self, session: &Arc<SessionHandle>) {
        self.unregister_session(session).await;
    }
}
