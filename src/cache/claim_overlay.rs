//! Short-lived record of placements this extender has claimed.
//!
//! Binding a pod takes the scheduler a moment and the watch stream another
//! moment to report it; until then the cluster cache undercounts. Claimed
//! placements are parked here per node, and expire once the watch stream can
//! be trusted to have caught up. The TTL is an upper bound on that
//! convergence window; in practice it is seconds.

use std::time::Duration;

use dashmap::DashMap;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

/// Per-key lifetime of claimed placements.
pub const CLAIM_TTL: Duration = Duration::from_secs(60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct ClaimEntry {
    pod_names: Vec<String>,
    expires_at: Instant,
}

/// Keyed TTL store mapping a node name to the pod names recently claimed for
/// it. Operations on one key are linearizable through the map's entry
/// locking; distinct keys proceed in parallel.
///
/// A key that is present with an empty list is distinct from an absent key;
/// only expiry and [`ClaimOverlay::remove_pod_name`] drop keys.
pub struct ClaimOverlay {
    entries: DashMap<String, ClaimEntry>,
    ttl: Duration,
}

impl ClaimOverlay {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Claimed pod names for `node`, or `None` when nothing is claimed or
    /// the entry has expired.
    pub fn get(&self, node: &str) -> Option<Vec<String>> {
        let now = Instant::now();
        let expired = {
            let entry = self.entries.get(node)?;
            if entry.expires_at > now {
                return Some(entry.pod_names.clone());
            }
            true
        };
        if expired {
            self.entries.remove_if(node, |_, entry| entry.expires_at <= now);
        }
        None
    }

    /// Replace the claims for `node` and restart its TTL.
    pub fn set(&self, node: &str, pod_names: Vec<String>) {
        self.entries.insert(
            node.to_string(),
            ClaimEntry {
                pod_names,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Append one claimed pod name, creating the entry if absent. The
    /// read-modify-write happens under the entry lock, so concurrent claims
    /// against the same node cannot lose each other. Restarts the TTL.
    pub fn append(&self, node: &str, pod_name: &str) {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(node.to_string())
            .or_insert_with(|| ClaimEntry {
                pod_names: Vec::new(),
                expires_at: now + self.ttl,
            });
        if entry.expires_at <= now {
            entry.pod_names.clear();
        }
        entry.pod_names.push(pod_name.to_string());
        entry.expires_at = now + self.ttl;
    }

    /// Remove the first occurrence of `pod_name` under `node`, dropping the
    /// key once its list empties. Does not restart the TTL: a removal must
    /// never extend the lifetime of the remaining claims.
    pub fn remove_pod_name(&self, node: &str, pod_name: &str) {
        let emptied = {
            let Some(mut entry) = self.entries.get_mut(node) else {
                return;
            };
            if let Some(position) = entry.pod_names.iter().position(|name| name == pod_name) {
                entry.pod_names.remove(position);
                debug!(node, pod = pod_name, "Removed claimed pod");
            }
            entry.pod_names.is_empty()
        };
        if emptied {
            self.entries.remove_if(node, |_, entry| entry.pod_names.is_empty());
        }
    }

    /// Sweep expired entries until cancelled. Reads already ignore expired
    /// entries; the sweep merely bounds memory on idle keys.
    pub async fn run(&self, token: CancellationToken) {
        info!("Starting claim overlay sweeper");
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            select! {
                _ = token.cancelled() => {
                    info!("Claim overlay sweeper shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    self.purge_expired();
                }
            }
        }
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn get_distinguishes_absent_from_empty() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);

        assert_eq!(overlay.get("n1"), None);

        overlay.set("n1", Vec::new());
        assert_eq!(overlay.get("n1"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);

        overlay.append("n1", "web-a");
        overlay.append("n1", "web-b");
        overlay.append("n1", "web-c");

        assert_eq!(overlay.get("n1"), Some(names(&["web-a", "web-b", "web-c"])));
    }

    #[tokio::test]
    async fn remove_pod_name_removes_first_occurrence_only() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a", "web-b", "web-a"]));

        overlay.remove_pod_name("n1", "web-a");

        assert_eq!(overlay.get("n1"), Some(names(&["web-b", "web-a"])));
    }

    #[tokio::test]
    async fn remove_pod_name_drops_emptied_key() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a"]));

        overlay.remove_pod_name("n1", "web-a");

        assert_eq!(overlay.get("n1"), None);
        // Removing from an absent key is a no-op.
        overlay.remove_pod_name("n1", "web-a");
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a"]));

        tokio::time::advance(CLAIM_TTL - Duration::from_secs(1)).await;
        assert_eq!(overlay.get("n1"), Some(names(&["web-a"])));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(overlay.get("n1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_restarts_the_ttl() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a"]));

        tokio::time::advance(Duration::from_secs(45)).await;
        overlay.set("n1", names(&["web-a", "web-b"]));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(overlay.get("n1"), Some(names(&["web-a", "web-b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_does_not_extend_the_ttl() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a", "web-b"]));

        tokio::time::advance(Duration::from_secs(45)).await;
        overlay.remove_pod_name("n1", "web-a");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(overlay.get("n1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn append_resurrects_an_expired_entry_with_only_the_new_claim() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a"]));

        tokio::time::advance(CLAIM_TTL + Duration::from_secs(1)).await;
        overlay.append("n1", "web-b");

        assert_eq!(overlay.get("n1"), Some(names(&["web-b"])));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.set("n1", names(&["web-a"]));
        overlay.set("n2", names(&["web-b"]));

        tokio::time::advance(CLAIM_TTL + Duration::from_secs(1)).await;
        overlay.purge_expired();

        assert!(overlay.entries.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let overlay = ClaimOverlay::new(CLAIM_TTL);
        overlay.append("n1", "web-a");
        overlay.append("n2", "web-b");

        overlay.remove_pod_name("n1", "web-a");

        assert_eq!(overlay.get("n1"), None);
        assert_eq!(overlay.get("n2"), Some(names(&["web-b"])));
    }
}
