//! The Alt-Server Registry (§3, §4.4): candidate upstreams with RTT
//! history and failure counters.
//!
//! Grounded on `dnbd3_networking::Host::closeness` for the client-facing
//! sort and modeled structurally on `ImageCache`'s coarse
//! `RwLock<Vec<...>>` shape, generalized to the spec's two-pass uplink
//! candidate selection and failure accounting.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::RwLock;

use dnbd3_networking::Host;

use crate::config::alt_servers::AltServerLine;

/// Number of RTT samples kept per server (§3: "N = 4 or 5").
const RTT_RING_SIZE: usize = 5;

/// Fixed step added to a server's fail-count on an ordinary transient
/// failure (§4.4).
pub const FAIL_STEP: u32 = 1;

/// Step added on a hard protocol/configuration mismatch (§7).
pub const FAIL_STEP_HARD: u32 = 10;

/// Window within which a repeated failure report is suppressed to avoid a
/// fail-count stampede when many uplinks share the same upstream (§4.4).
/// Tied to `SERVER_RTT_DELAY_INIT` per the spec's cross-reference.
pub const RTT_INIT_WINDOW: Duration = Duration::from_secs(10);

/// Max candidates returned to a client in a `GET_SERVERS` reply.
const MAX_CLIENT_SERVERS: usize = 8;

/// Max candidates considered per RTT probe cycle (§4.5).
pub const MAX_PROBE_CANDIDATES: usize = 4;

/// Failure count above which a failing server is skipped by the second
/// probe-candidate pass unless in an emergency (no other candidate at
/// all).
const FAIL_COUNT_SKIP_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct AltServerEntry {
    pub host: Host,
    pub comment: Option<String>,
    pub private: bool,
    pub client_only: bool,

    rtt_ring: [Option<u32>; RTT_RING_SIZE],
    rtt_ring_idx: usize,
    pub live_rtt_micros: Option<u32>,
    pub fail_count: u32,
    pub last_failure: Option<Instant>,
    pub best_count: u32,
}

impl AltServerEntry {
    pub fn new(host: Host, comment: Option<String>, private: bool, client_only: bool) -> Self {
        Self {
            host,
            comment,
            private,
            client_only,
            rtt_ring: [None; RTT_RING_SIZE],
            rtt_ring_idx: 0,
            live_rtt_micros: None,
            fail_count: 0,
            last_failure: None,
            best_count: 0,
        }
    }

    fn record_rtt_sample(&mut self, micros: u32) {
        self.rtt_ring[self.rtt_ring_idx] = Some(micros);
        self.rtt_ring_idx = (self.rtt_ring_idx + 1) % RTT_RING_SIZE;
    }

    /// Feed a fresh RTT probe sample: updates the ring and the EWMA.
    pub fn update_rtt(&mut self, micros: u32) {
        self.record_rtt_sample(micros);
        self.live_rtt_micros = Some(match self.live_rtt_micros {
            Some(prev) => ((prev as u64 * 3 + micros as u64) / 4) as u32,
            None => micros,
        });
    }

    /// Feed a production-path observation (a completed block reply), per
    /// §4.5's "production-path RTT": `liveRtt = (3*liveRtt + observed) / 4`.
    pub fn observe_production_rtt(&mut self, micros: u32) {
        self.live_rtt_micros = Some(match self.live_rtt_micros {
            Some(prev) => ((prev as u64 * 3 + micros as u64) / 4) as u32,
            None => micros,
        });
    }

    pub fn is_eligible_first_pass(&self, allow_private: bool) -> bool {
        if self.client_only {
            return false;
        }
        if self.private && !allow_private {
            return false;
        }
        self.fail_count == 0
    }

    pub fn is_eligible_second_pass(&self, allow_private: bool, emergency: bool) -> bool {
        if self.client_only {
            return false;
        }
        if self.private && !allow_private {
            return false;
        }
        if emergency {
            return true;
        }
        if self.fail_count <= FAIL_COUNT_SKIP_THRESHOLD {
            return true;
        }
        match self.last_failure {
            Some(t) => t.elapsed() >= RTT_INIT_WINDOW,
            None => true,
        }
    }
}

/// The alt-server table: at most 16 entries (§4.4), guarded by a single
/// coarse lock for structural changes. Individual counters are mutated
/// through `&mut` accessors taken under the same lock, funneled
/// single-writer through the RTT probe task as the spec requires.
pub struct AltServerRegistry {
    entries: RwLock<Vec<AltServerEntry>>,
}

const MAX_ENTRIES: usize = 16;

impl AltServerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub async fn load(&self, lines: Vec<AltServerLine>) {
        let mut entries = self.entries.write().await;
        entries.clear();
        for line in lines.into_iter().take(MAX_ENTRIES) {
            entries.push(AltServerEntry::new(
                line.host,
                line.comment,
                line.private,
                line.client_only,
            ));
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Client-facing list, sorted by `closeness(client, server) - fail_count`
    /// descending, capped at [`MAX_CLIENT_SERVERS`] (§4.4).
    pub async fn list_for_client(&self, client: &Host) -> Vec<Host> {
        let entries = self.entries.read().await;
        let mut scored: Vec<(i32, Host)> = entries
            .iter()
            .filter(|e| !e.private)
            .map(|e| (client.closeness(&e.host) - e.fail_count as i32, e.host))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(MAX_CLIENT_SERVERS).map(|(_, h)| h).collect()
    }

    /// Two-pass uplink candidate selection for the RTT probe (§4.4). The
    /// first slot is randomly swapped to tie-break among equals.
    pub async fn select_probe_candidates(&self, allow_private: bool, current: Option<Host>) -> Vec<Host> {
        let entries = self.entries.read().await;

        let mut candidates: Vec<Host> = entries
            .iter()
            .filter(|e| e.is_eligible_first_pass(allow_private))
            .map(|e| e.host)
            .collect();

        if candidates.len() < MAX_PROBE_CANDIDATES {
            let emergency = candidates.is_empty();
            for entry in entries.iter() {
                if candidates.len() >= MAX_PROBE_CANDIDATES {
                    break;
                }
                if candidates.contains(&entry.host) {
                    continue;
                }
                if entry.is_eligible_second_pass(allow_private, emergency) {
                    candidates.push(entry.host);
                }
            }
        }

        candidates.truncate(MAX_PROBE_CANDIDATES);

        if let Some(current) = current {
            if !candidates.contains(&current) && entries.iter().any(|e| e.host == current) {
                if candidates.is_empty() {
                    candidates.push(current);
                } else {
                    let last = candidates.len() - 1;
                    candidates[last] = current;
                }
            }
        }

        if candidates.len() > 1 {
            let swap_with = rand::rng().random_range(0..candidates.len());
            candidates.swap(0, swap_with);
        }

        candidates
    }

    /// `report_failure`: bumps `fail_count` by `step` unless the previous
    /// failure for this host was within [`RTT_INIT_WINDOW`] (§4.4).
    pub async fn report_failure(&self, host: &Host, step: u32) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.host == host) {
            let suppress = entry
                .last_failure
                .map(|t| t.elapsed() < RTT_INIT_WINDOW)
                .unwrap_or(false);
            if suppress {
                return;
            }
            entry.fail_count = entry.fail_count.saturating_add(step);
            entry.last_failure = Some(Instant::now());
        }
    }

    pub async fn report_success(&self, host: &Host) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.host == host) {
            entry.fail_count = 0;
        }
    }

    pub async fn update_rtt(&self, host: &Host, micros: u32) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.host == host) {
            entry.update_rtt(micros);
        }
    }

    pub async fn observe_production_rtt(&self, host: &Host, micros: u32) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.host == host) {
            entry.observe_production_rtt(micros);
        }
    }

    /// Apply a best-count step to every entry after one probe cycle: the
    /// winner's `best_count` is incremented (capped at 50), everyone else
    /// decays by one (§4.5).
    pub async fn apply_best_count_step(&self, winner: &Host) {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut() {
            if &entry.host == winner {
                entry.best_count = (entry.best_count + 2).min(50);
            } else {
                entry.best_count = entry.best_count.saturating_sub(1);
            }
        }
    }

    pub async fn best_count(&self, host: &Host) -> u32 {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| &e.host == host)
            .map(|e| e.best_count)
            .unwrap_or(0)
    }

    pub async fn entry_snapshot(&self, host: &Host) -> Option<AltServerEntry> {
        self.entries.read().await.iter().find(|e| &e.host == host).cloned()
    }
}

impl Default for AltServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host(n: u8) -> Host {
        Host::V4(Ipv4Addr::new(192, 168, 1, n), 5003)
    }

    #[tokio::test]
    async fn client_list_sorts_by_closeness_minus_failcount() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![
                AltServerLine { host: host(10), private: false, client_only: false, comment: None },
                AltServerLine { host: host(200), private: false, client_only: false, comment: None },
            ])
            .await;

        let client = host(11);
        let list = registry.list_for_client(&client).await;
        assert_eq!(list[0], host(10));
    }

    #[tokio::test]
    async fn private_servers_are_not_advertised_to_clients() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![AltServerLine {
                host: host(10),
                private: true,
                client_only: false,
                comment: None,
            }])
            .await;
        let list = registry.list_for_client(&host(11)).await;
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn client_only_servers_are_excluded_from_probe_candidates() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![AltServerLine {
                host: host(10),
                private: false,
                client_only: true,
                comment: None,
            }])
            .await;
        let candidates = registry.select_probe_candidates(true, None).await;
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn report_failure_suppresses_stampede_within_window() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![AltServerLine {
                host: host(10),
                private: false,
                client_only: false,
                comment: None,
            }])
            .await;

        registry.report_failure(&host(10), 1).await;
        registry.report_failure(&host(10), 1).await;
        let snapshot = registry.entry_snapshot(&host(10)).await.unwrap();
        assert_eq!(snapshot.fail_count, 1);
    }

    #[tokio::test]
    async fn production_rtt_feeds_the_same_ewma_as_probe_samples() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![AltServerLine {
                host: host(10),
                private: false,
                client_only: false,
                comment: None,
            }])
            .await;

        registry.update_rtt(&host(10), 1000).await;
        registry.observe_production_rtt(&host(10), 2000).await;

        let snapshot = registry.entry_snapshot(&host(10)).await.unwrap();
        // (3*1000 + 2000) / 4 = 1250, per §4.5's production-path formula.
        assert_eq!(snapshot.live_rtt_micros, Some(1250));
    }

    #[tokio::test]
    async fn best_count_step_increments_winner_and_decays_others() {
        let registry = AltServerRegistry::new();
        registry
            .load(vec![
                AltServerLine { host: host(10), private: false, client_only: false, comment: None },
                AltServerLine { host: host(20), private: false, client_only: false, comment: None },
            ])
            .await;

        registry.apply_best_count_step(&host(10)).await;
        assert_eq!(registry.best_count(&host(10)).await, 2);
        assert_eq!(registry.best_count(&host(20)).await, 0);
    }
}
