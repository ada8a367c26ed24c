//! Invocation surface (spec §6): listen address, optional TLS material,
//! storage backend selection, and the rate/connection limit knobs whose
//! mechanism (not tuning) is in scope.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::PathBuf;

use clap::Parser;

use crate::rate_limit::RateLimitConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-rs", about = "A Nostr relay core")]
pub struct Settings {
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "RELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "RELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// `memory` is the only backend this crate ships (spec §9 mandates its
    /// behaviour as the storage contract); other values are accepted so a
    /// deployment config naming a future backend fails loudly rather than
    /// silently falling back.
    #[arg(long, env = "RELAY_STORAGE_BACKEND", default_value = "memory")]
    pub storage_backend: String,

    #[arg(long, env = "RELAY_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[arg(long, env = "RELAY_URL", default_value = "wss://localhost")]
    pub relay_url: String,

    #[arg(long, env = "RELAY_NAME", default_value = "relay-rs")]
    pub name: String,

    #[arg(long, env = "RELAY_DESCRIPTION", default_value = "")]
    pub description: String,

    #[arg(long, env = "RELAY_ICON", default_value = "")]
    pub icon: String,

    #[arg(long, env = "RELAY_MAX_CONNECTIONS_PER_IP", default_value_t = 10)]
    pub max_connections_per_ip: usize,

    #[arg(long, env = "RELAY_MAX_CONNECTIONS_GLOBAL", default_value_t = 10_000)]
    pub max_connections_global: usize,

    #[arg(long, env = "RELAY_EVENTS_PER_SECOND", default_value_t = 20)]
    pub events_per_second: u32,

    #[arg(long, env = "RELAY_REQUESTS_PER_SECOND", default_value_t = 50)]
    pub requests_per_second: u32,

    #[arg(long, env = "RELAY_COUNTS_PER_SECOND", default_value_t = 20)]
    pub counts_per_second: u32,
}

impl Settings {
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            events_per_second: NonZeroU32::new(self.events_per_second.max(1)).unwrap(),
            requests_per_second: NonZeroU32::new(self.requests_per_second.max(1)).unwrap(),
            counts_per_second: NonZeroU32::new(self.counts_per_second.max(1)).unwrap(),
        }
    }
}
