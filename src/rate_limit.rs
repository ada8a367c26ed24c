//! Rate limiting (spec §4.6): three per-request-type token buckets per
//! client IP plus three global buckets. A bucket's capacity equals its
//! configured per-second rate; `Quota::per_second` already gives buckets
//! exactly that shape, so this wraps `governor` rather than re-deriving a
//! token-bucket algorithm by hand.

use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    Event,
    Request,
    Count,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub events_per_second: NonZeroU32,
    pub requests_per_second: NonZeroU32,
    pub counts_per_second: NonZeroU32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            events_per_second: nonzero_ext::nonzero!(20u32),
            requests_per_second: nonzero_ext::nonzero!(50u32),
            counts_per_second: nonzero_ext::nonzero!(20u32),
        }
    }
}

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;
type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// The six buckets of spec §4.6, bundled behind a single `check` call.
pub struct RateLimiters {
    per_ip_event: KeyedLimiter,
    per_ip_request: KeyedLimiter,
    per_ip_count: KeyedLimiter,
    global_event: GlobalLimiter,
    global_request: GlobalLimiter,
    global_count: GlobalLimiter,
}

impl RateLimiters {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            per_ip_event: RateLimiter::keyed(Quota::per_second(config.events_per_second)),
            per_ip_request: RateLimiter::keyed(Quota::per_second(config.requests_per_second)),
            per_ip_count: RateLimiter::keyed(Quota::per_second(config.counts_per_second)),
            global_event: RateLimiter::direct(Quota::per_second(config.events_per_second)),
            global_request: RateLimiter::direct(Quota::per_second(config.requests_per_second)),
            global_count: RateLimiter::direct(Quota::per_second(config.counts_per_second)),
        }
    }

    /// `token >= 1` allows the action; otherwise it is rate-limited. Checks
    /// the per-IP bucket before the global one so a client already over
    /// its own budget never touches the shared bucket.
    pub fn check(&self, kind: RequestKind, ip: IpAddr) -> bool {
        let (per_ip, global): (&KeyedLimiter, &GlobalLimiter) = match kind {
            RequestKind::Event => (&self.per_ip_event, &self.global_event),
            RequestKind::Request => (&self.per_ip_request, &self.global_request),
            RequestKind::Count => (&self.per_ip_count, &self.global_count),
        };
        per_ip.check_key(&ip).is_ok() && global.check().is_ok()
    }
}

/// Derive the client IP per spec §4.6: first comma-separated value of a
/// forwarded-for header, then a real-ip header, else the transport peer
/// address stripped of its port.
pub fn client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer_addr: std::net::SocketAddr,
) -> IpAddr {
    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }
    if let Some(header) = real_ip {
        if let Ok(ip) = header.trim().parse::<IpAddr>() {
            return ip;
        }
    }
    peer_addr.ip()
}
