//! Liveness registry for sibling services
//!
//! Each observed service gets an entry with its own ticker task. A tick
//! decrements `ticks_remaining`; hitting zero marks the service offline. Every
//! heartbeat puts the entry back online and restarts the tick phase, so a silent
//! service goes offline `max_ticks` intervals after its last heartbeat.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_TICKS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct HeartbeatEntry {
    pub name: String,
    pub kind: String,
    pub last_seen: DateTime<Utc>,
    pub status: ServiceStatus,
    pub ticks_remaining: u32,
}

/// Snapshot returned by `HeartbeatRegistry::list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ServiceStatus,
    pub last_seen: DateTime<Utc>,
}

struct Tracked {
    entry: Arc<Mutex<HeartbeatEntry>>,
    refreshed: Arc<Notify>,
    ticker: JoinHandle<()>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

pub struct HeartbeatRegistry {
    tick: Duration,
    max_ticks: u32,
    entries: Mutex<HashMap<String, Tracked>>,
}

impl HeartbeatRegistry {
    pub fn new(tick: Duration) -> Self {
        Self::with_ticks(tick, DEFAULT_TICKS)
    }

    pub fn with_ticks(tick: Duration, max_ticks: u32) -> Self {
        Self {
            tick,
            max_ticks: max_ticks.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a heartbeat; creates the entry (and its ticker) on first sight
    pub fn observe(&self, name: &str, kind: &str) {
        let mut entries = self.entries.lock();
        if let Some(tracked) = entries.get(name) {
            {
                let mut entry = tracked.entry.lock();
                if entry.status == ServiceStatus::Offline {
                    info!(service = name, "service back online");
                }
                entry.last_seen = Utc::now();
                entry.ticks_remaining = self.max_ticks;
                entry.status = ServiceStatus::Online;
                entry.kind = kind.to_string();
            }
            tracked.refreshed.notify_one();
            debug!(service = name, "heartbeat refreshed");
            return;
        }

        let entry = Arc::new(Mutex::new(HeartbeatEntry {
            name: name.to_string(),
            kind: kind.to_string(),
            last_seen: Utc::now(),
            status: ServiceStatus::Online,
            ticks_remaining: self.max_ticks,
        }));
        let refreshed = Arc::new(Notify::new());
        let ticker = tokio::spawn(run_ticker(
            entry.clone(),
            refreshed.clone(),
            self.tick,
            self.max_ticks,
        ));
        entries.insert(
            name.to_string(),
            Tracked {
                entry,
                refreshed,
                ticker,
            },
        );
        info!(service = name, kind, "new service registered");
    }

    /// All known services sorted by name
    pub fn list(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = self
            .entries
            .lock()
            .values()
            .map(|tracked| {
                let entry = tracked.entry.lock();
                ServiceInfo {
                    name: entry.name.clone(),
                    kind: entry.kind.clone(),
                    status: entry.status,
                    last_seen: entry.last_seen,
                }
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Stop every ticker and forget all entries
    pub fn shutdown(&self) {
        let drained: Vec<Tracked> = self.entries.lock().drain().map(|(_, t)| t).collect();
        debug!(count = drained.len(), "stopping heartbeat tickers");
        drop(drained);
    }
}

impl Drop for HeartbeatRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_ticker(
    entry: Arc<Mutex<HeartbeatEntry>>,
    refreshed: Arc<Notify>,
    tick: Duration,
    max_ticks: u32,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut entry = entry.lock();
                entry.ticks_remaining = entry.ticks_remaining.saturating_sub(1);
                if entry.ticks_remaining == 0 {
                    if entry.status == ServiceStatus::Online {
                        info!(service = %entry.name, "service went offline");
                    }
                    entry.status = ServiceStatus::Offline;
                    entry.ticks_remaining = max_ticks;
                }
            }
            _ = refreshed.notified() => interval.reset(),
        }
    }
}
