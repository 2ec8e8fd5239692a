//! Periodic lifecycle sweeps: liveness, expiry, and the attach-grace
//! reaper for records whose agent never showed up.
//!
//! Sweeps go through the session's public teardown (never the cancellation
//! handle directly) so every pending slot is completed before removal.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::state::GatewayContext;

use super::record::TunnelStatus;
use super::registry::TunnelRegistry;
use super::session::TeardownReason;

/// Tear down every session whose agent has been silent past `threshold`.
pub fn sweep_stale(registry: &TunnelRegistry, threshold: Duration) -> usize {
    let mut swept = 0;
    for entry in registry.list() {
        if let Some(session) = entry.session() {
            if session.last_ping_elapsed() > threshold {
                info!(
                    tunnel_id = %entry.tunnel_id,
                    subdomain = %entry.subdomain,
                    "removing stale tunnel"
                );
                session.teardown(TeardownReason::Stale);
                swept += 1;
            }
        }
    }
    swept
}

/// Remove expired tunnels and reap `connecting` records whose agent never
/// attached within `connect_grace`.
pub fn sweep_expired(registry: &TunnelRegistry, connect_grace: Duration) -> usize {
    let now = Utc::now();
    let mut swept = 0;
    for entry in registry.list() {
        if entry.is_expired(now) {
            info!(tunnel_id = %entry.tunnel_id, "tunnel expired");
            match entry.session() {
                Some(session) => session.teardown(TeardownReason::Expired),
                None => {
                    registry.remove(&entry.tunnel_id);
                    entry.finish(TunnelStatus::Terminated);
                }
            }
            swept += 1;
            continue;
        }

        if entry.status() == TunnelStatus::Connecting && entry.session().is_none() {
            let waited = now
                .signed_duration_since(entry.created_at)
                .to_std()
                .unwrap_or_default();
            if waited > connect_grace {
                info!(
                    tunnel_id = %entry.tunnel_id,
                    waited_secs = waited.as_secs(),
                    "reaping tunnel that was never attached"
                );
                registry.remove(&entry.tunnel_id);
                entry.finish(TunnelStatus::Terminated);
                swept += 1;
            }
        }
    }
    swept
}

/// Tear down every live session; used during process shutdown.
pub fn drain_all(registry: &TunnelRegistry) {
    for entry in registry.list() {
        match entry.session() {
            Some(session) => session.teardown(TeardownReason::Terminated),
            None => {
                registry.remove(&entry.tunnel_id);
                entry.finish(TunnelStatus::Terminated);
            }
        }
    }
}

/// Spawn the background sweep tasks, each on its own interval.
pub fn spawn_sweepers(ctx: GatewayContext, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let ctx = ctx.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.stale_sweep_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = sweep_stale(&ctx.registry, ctx.config.stale_threshold());
                        if swept > 0 {
                            info!(swept, "liveness sweep finished");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("liveness sweep shutting down");
                        break;
                    }
                }
            }
        }));
    }

    {
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ctx.config.expiry_sweep_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = sweep_expired(&ctx.registry, ctx.config.connect_grace());
                        if swept > 0 {
                            info!(swept, "expiry sweep finished");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!("expiry sweep shutting down");
                        break;
                    }
                }
            }
        }));
    }

    handles
}
