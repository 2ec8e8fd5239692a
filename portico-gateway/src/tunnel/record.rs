//! Tunnel records: the registry entity, its status machine and analytics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::session::TunnelSession;

/// Rolling window kept for response times.
const RESPONSE_TIME_WINDOW: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Connecting,
    Active,
    Error,
    Terminated,
}

impl TunnelStatus {
    /// Terminal states are absorbing; the registry entry is removed as part
    /// of entering them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelStatus::Error | TunnelStatus::Terminated)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Active => "active",
            TunnelStatus::Error => "error",
            TunnelStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Per-tunnel usage counters. Updates are best-effort and never fail a
/// user-visible request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analytics {
    pub request_count: u64,
    pub bytes_transferred: u64,
    pub status_codes: HashMap<u16, u64>,
    pub endpoints: HashMap<String, u64>,
    pub last_request: Option<DateTime<Utc>>,
    pub response_times_ms: Vec<u64>,
}

/// Mutable portion of a tunnel record.
#[derive(Debug)]
struct TunnelState {
    status: TunnelStatus,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    analytics: Analytics,
}

/// One tunnel known to the registry. Immutable identity fields plus mutable
/// state behind a short-held mutex; the live session (if any) is a
/// back-reference owned by the registry side, not by the session.
pub struct TunnelEntry {
    pub tunnel_id: Uuid,
    pub user_id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub public_url: String,
    pub created_at: DateTime<Utc>,
    state: Mutex<TunnelState>,
    session: RwLock<Option<Arc<TunnelSession>>>,
}

impl TunnelEntry {
    pub fn new(
        user_id: impl Into<String>,
        subdomain: impl Into<String>,
        local_port: u16,
        base_domain: &str,
        expiration: std::time::Duration,
    ) -> Self {
        let subdomain = subdomain.into();
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(expiration).unwrap_or(ChronoDuration::hours(24));
        Self {
            tunnel_id: Uuid::new_v4(),
            user_id: user_id.into(),
            public_url: format!("https://{subdomain}.{base_domain}"),
            subdomain,
            local_port,
            created_at: now,
            state: Mutex::new(TunnelState {
                status: TunnelStatus::Connecting,
                last_activity: now,
                expires_at: now + ttl,
                analytics: Analytics::default(),
            }),
            session: RwLock::new(None),
        }
    }

    pub fn status(&self) -> TunnelStatus {
        self.state.lock().unwrap().status
    }

    /// `connecting → active` on successful handshake write.
    /// Returns false if the entry already left `connecting`.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status != TunnelStatus::Connecting {
            return false;
        }
        state.status = TunnelStatus::Active;
        touch_locked(&mut state);
        true
    }

    /// Enter a terminal status. Terminal states are absorbing: a second call
    /// keeps the first terminal status and returns false.
    pub fn finish(&self, status: TunnelStatus) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        touch_locked(&mut state);
        true
    }

    /// Refresh `last_activity`, keeping it monotonic.
    pub fn touch(&self) {
        touch_locked(&mut self.state.lock().unwrap());
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_activity
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.state.lock().unwrap().expires_at
    }

    /// Fold one completed public request into the counters.
    pub fn record_request(&self, status_code: u16, endpoint: &str, bytes: u64, elapsed_ms: u64) {
        let mut state = self.state.lock().unwrap();
        let analytics = &mut state.analytics;
        analytics.request_count += 1;
        analytics.bytes_transferred += bytes;
        *analytics.status_codes.entry(status_code).or_insert(0) += 1;
        *analytics.endpoints.entry(endpoint.to_string()).or_insert(0) += 1;
        analytics.last_request = Some(Utc::now());
        if analytics.response_times_ms.len() >= RESPONSE_TIME_WINDOW {
            analytics.response_times_ms.remove(0);
        }
        analytics.response_times_ms.push(elapsed_ms);
        touch_locked(&mut state);
    }

    pub fn attach_session(&self, session: Arc<TunnelSession>) {
        *self.session.write().unwrap() = Some(session);
    }

    pub fn session(&self) -> Option<Arc<TunnelSession>> {
        self.session.read().unwrap().clone()
    }

    pub fn clear_session(&self) {
        self.session.write().unwrap().take();
    }

    /// Point-in-time copy for admin read paths.
    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state.lock().unwrap();
        TunnelSnapshot {
            tunnel_id: self.tunnel_id,
            user_id: self.user_id.clone(),
            subdomain: self.subdomain.clone(),
            local_port: self.local_port,
            public_url: self.public_url.clone(),
            status: state.status,
            created_at: self.created_at,
            last_activity: state.last_activity,
            expires_at: state.expires_at,
            analytics: state.analytics.clone(),
        }
    }
}

fn touch_locked(state: &mut TunnelState) {
    let now = Utc::now();
    if now > state.last_activity {
        state.last_activity = now;
    }
}

/// Serializable view of a tunnel record.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub tunnel_id: Uuid,
    pub user_id: String,
    pub subdomain: String,
    pub local_port: u16,
    pub public_url: String,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub analytics: Analytics,
}

/// `"<user_id>-<8 lowercase hex chars>"`.
pub fn generate_subdomain(user_id: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("{}-{}", user_id, &token[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> TunnelEntry {
        TunnelEntry::new("alice", "alice-deadbeef", 3000, "example.dev", Duration::from_secs(60))
    }

    #[test]
    fn lifecycle_transitions() {
        let entry = entry();
        assert_eq!(entry.status(), TunnelStatus::Connecting);
        assert!(entry.activate());
        assert_eq!(entry.status(), TunnelStatus::Active);
        // active is not re-enterable
        assert!(!entry.activate());
        assert!(entry.finish(TunnelStatus::Terminated));
        // terminal states are absorbing
        assert!(!entry.finish(TunnelStatus::Error));
        assert_eq!(entry.status(), TunnelStatus::Terminated);
    }

    #[test]
    fn last_activity_is_monotonic() {
        let entry = entry();
        let first = entry.last_activity();
        entry.touch();
        entry.touch();
        assert!(entry.last_activity() >= first);
    }

    #[test]
    fn expiry_is_relative_to_creation() {
        let entry = entry();
        let snap = entry.snapshot();
        assert!(snap.expires_at > snap.created_at);
        assert!(!entry.is_expired(Utc::now()));
        assert!(entry.is_expired(Utc::now() + ChronoDuration::seconds(120)));
    }

    #[test]
    fn analytics_accumulate_and_stay_bounded() {
        let entry = entry();
        for i in 0..(RESPONSE_TIME_WINDOW + 10) {
            entry.record_request(200, "/ping", 4, i as u64);
        }
        entry.record_request(404, "/missing", 0, 1);
        let analytics = entry.snapshot().analytics;
        assert_eq!(analytics.request_count, (RESPONSE_TIME_WINDOW + 11) as u64);
        assert_eq!(analytics.status_codes[&404], 1);
        assert_eq!(analytics.endpoints["/ping"], (RESPONSE_TIME_WINDOW + 10) as u64);
        assert!(analytics.response_times_ms.len() <= RESPONSE_TIME_WINDOW);
        assert!(analytics.last_request.is_some());
    }

    #[test]
    fn subdomain_shape() {
        let sub = generate_subdomain("alice");
        let suffix = sub.strip_prefix("alice-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
