//! Learned MAC entry cache
//!
//! Tracks IP to MAC bindings learned on VPN ports. Each binding is written
//! to `learnt-vpn-vip-to-port-data` and withdrawn again when it has not been
//! refreshed within the configured lifetime, or when its port leaves its VPN.
//!
//! [`MacEntryCache::learn`] is the entry point for the adjacency source
//! (ARP/ND snooping); the daemon itself only withdraws entries.

use crate::tables;
use crate::types::LearntVipToPort;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vpnmgr_common::{DeferError, LogicalDatastoreType, MemoryDataStore, Result};

/// Cache key: VPN name and learned address
pub type MacEntryKey = (String, IpAddr);

#[derive(Debug, Clone)]
struct MacEntry {
    mac_address: String,
    port_name: String,
    generation: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<MacEntryKey, MacEntry>,
    // Stale heap items are skipped when their generation no longer matches
    deadlines: BinaryHeap<Reverse<(Instant, u64, MacEntryKey)>>,
    next_generation: u64,
}

/// Expiring cache of learned IP to MAC bindings.
pub struct MacEntryCache {
    store: Arc<MemoryDataStore>,
    ttl: Duration,
    tick: Duration,
    state: Mutex<CacheState>,
}

impl MacEntryCache {
    pub fn new(store: Arc<MemoryDataStore>, ttl: Duration, tick: Duration) -> Self {
        Self {
            store,
            ttl,
            tick,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Records (or refreshes) a learned binding and publishes it.
    pub fn learn(&self, vpn_name: &str, ip: IpAddr, mac_address: &str, port_name: &str) -> Result<()> {
        let record = LearntVipToPort {
            vpn_name: vpn_name.to_string(),
            port_fixedip: ip.to_string(),
            mac_address: mac_address.to_string(),
            port_name: port_name.to_string(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| DeferError::store("encode", e.to_string()))?;

        let key = (vpn_name.to_string(), ip);
        let expires_at = Instant::now() + self.ttl;

        // Store records only change under the state lock
        let mut state = self.state.lock();
        self.store.put(
            LogicalDatastoreType::Operational,
            tables::learnt_vip_to_port(vpn_name, ip),
            value,
        )?;
        state.next_generation += 1;
        let generation = state.next_generation;
        let refreshed = state
            .entries
            .insert(
                key.clone(),
                MacEntry {
                    mac_address: mac_address.to_string(),
                    port_name: port_name.to_string(),
                    generation,
                    expires_at,
                },
            )
            .is_some();
        state.deadlines.push(Reverse((expires_at, generation, key)));
        drop(state);

        debug!(vpn = vpn_name, %ip, mac = mac_address, port = port_name, refreshed, "Learned MAC entry");
        Ok(())
    }

    /// Drops a binding before it expires. Returns false if it was unknown.
    pub fn forget(&self, vpn_name: &str, ip: IpAddr) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(&(vpn_name.to_string(), ip)).is_some();
        if removed {
            self.store.delete(
                LogicalDatastoreType::Operational,
                &tables::learnt_vip_to_port(vpn_name, ip),
            );
        }
        removed
    }

    /// Withdraws every binding learned on `port_name`. Returns how many
    /// were dropped.
    pub fn forget_port(&self, port_name: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<MacEntryKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.port_name == port_name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            state.entries.remove(key);
            self.store.delete(
                LogicalDatastoreType::Operational,
                &tables::learnt_vip_to_port(&key.0, key.1),
            );
        }
        drop(state);

        if !keys.is_empty() {
            info!(port = port_name, count = keys.len(), "Withdrew MAC entries learned on port");
        }
        keys.len()
    }

    /// Withdraws every binding whose lifetime ended at or before `now`.
    pub fn reap(&self, now: Instant) -> Vec<MacEntryKey> {
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(Reverse((deadline, _, _))) = state.deadlines.peek() {
                if *deadline > now {
                    break;
                }
                let Some(Reverse((_, generation, key))) = state.deadlines.pop() else {
                    break;
                };
                let current = state
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation);
                if current {
                    state.entries.remove(&key);
                    self.store.delete(
                        LogicalDatastoreType::Operational,
                        &tables::learnt_vip_to_port(&key.0, key.1),
                    );
                    expired.push(key);
                }
            }
        }

        for (vpn_name, ip) in &expired {
            info!(vpn = %vpn_name, %ip, "Learned MAC entry expired");
        }
        expired
    }

    /// Reaps expired entries every tick until `shutdown` fires.
    pub async fn run_reaper(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap(Instant::now());
                }
            }
        }
        debug!("MAC entry reaper stopped");
    }

    /// MAC address currently learned for `ip`
    pub fn lookup(&self, vpn_name: &str, ip: IpAddr) -> Option<(String, String)> {
        self.state
            .lock()
            .entries
            .get(&(vpn_name.to_string(), ip))
            .map(|entry| (entry.mac_address.clone(), entry.port_name.clone()))
    }

    /// Expiry time of the binding for `ip`
    pub fn expires_at(&self, vpn_name: &str, ip: IpAddr) -> Option<Instant> {
        self.state
            .lock()
            .entries
            .get(&(vpn_name.to_string(), ip))
            .map(|entry| entry.expires_at)
    }

    pub fn contains(&self, vpn_name: &str, ip: IpAddr) -> bool {
        self.state
            .lock()
            .entries
            .contains_key(&(vpn_name.to_string(), ip))
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
