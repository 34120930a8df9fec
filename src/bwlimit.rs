//! Shared bandwidth limit groups
//!
//! Each named group carries two token buckets, ingress and egress, refilled
//! in bytes per second. Every backend that references the group shares the
//! same buckets, so the limit applies to their aggregate traffic. Groups are
//! owned by a registry that outlives snapshots: a reload keeps the bucket
//! state of groups whose rates did not change.

use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use crate::config::BwLimit;

type ByteLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A named pair of byte buckets. A rate of zero means unlimited.
pub struct BwGroup {
    name: String,
    ingress_rate: u32,
    egress_rate: u32,
    ingress: Option<ByteLimiter>,
    egress: Option<ByteLimiter>,
}

fn byte_limiter(rate: u32) -> Option<ByteLimiter> {
    let rate = NonZeroU32::new(rate)?;
    Some(RateLimiter::direct(
        Quota::per_second(rate).allow_burst(rate),
    ))
}

impl BwGroup {
    fn new(name: &str, ingress: f64, egress: f64) -> Self {
        let ingress_rate = ingress.max(0.0).min(f64::from(u32::MAX)) as u32;
        let egress_rate = egress.max(0.0).min(f64::from(u32::MAX)) as u32;
        BwGroup {
            name: name.to_string(),
            ingress_rate,
            egress_rate,
            ingress: byte_limiter(ingress_rate),
            egress: byte_limiter(egress_rate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until `n` bytes from the client may be forwarded.
    pub async fn consume_ingress(&self, n: usize) {
        Self::consume(self.ingress.as_ref(), self.ingress_rate, n).await;
    }

    /// Wait until `n` bytes to the client may be forwarded.
    pub async fn consume_egress(&self, n: usize) {
        Self::consume(self.egress.as_ref(), self.egress_rate, n).await;
    }

    async fn consume(limiter: Option<&ByteLimiter>, rate: u32, n: usize) {
        let Some(limiter) = limiter else { return };
        let mut remaining = u32::try_from(n).unwrap_or(u32::MAX);
        // A single read can exceed the burst size; feed it through in
        // bucket-sized pieces.
        while remaining > 0 {
            let chunk = remaining.min(rate);
            if let Some(chunk) = NonZeroU32::new(chunk) {
                if limiter.until_n_ready(chunk).await.is_err() {
                    return;
                }
            }
            remaining -= chunk;
        }
    }
}

/// Registry of bandwidth groups, keyed by name. Survives reloads.
#[derive(Default)]
pub struct BwRegistry {
    groups: DashMap<String, Arc<BwGroup>>,
}

impl BwRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the registry with a new set of limits. Groups with
    /// unchanged rates keep their bucket state; changed or new groups get
    /// fresh buckets; groups no longer configured are dropped.
    pub fn sync(&self, limits: &[BwLimit]) {
        self.groups
            .retain(|name, _| limits.iter().any(|l| &l.name == name));
        for l in limits {
            let ingress = l.ingress.max(0.0).min(f64::from(u32::MAX)) as u32;
            let egress = l.egress.max(0.0).min(f64::from(u32::MAX)) as u32;
            let unchanged = self
                .groups
                .get(&l.name)
                .is_some_and(|g| g.ingress_rate == ingress && g.egress_rate == egress);
            if !unchanged {
                self.groups.insert(
                    l.name.clone(),
                    Arc::new(BwGroup::new(&l.name, l.ingress, l.egress)),
                );
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BwGroup>> {
        self.groups.get(name).map(|g| g.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(name: &str, ingress: f64, egress: f64) -> BwLimit {
        BwLimit {
            name: name.to_string(),
            ingress,
            egress,
        }
    }

    #[test]
    fn test_sync_creates_and_drops_groups() {
        let reg = BwRegistry::new();
        reg.sync(&[limit("a", 1000.0, 1000.0), limit("b", 0.0, 0.0)]);
        assert!(reg.get("a").is_some());
        assert!(reg.get("b").is_some());
        reg.sync(&[limit("a", 1000.0, 1000.0)]);
        assert!(reg.get("b").is_none());
    }

    #[test]
    fn test_sync_keeps_unchanged_group_identity() {
        let reg = BwRegistry::new();
        reg.sync(&[limit("a", 1000.0, 2000.0)]);
        let before = reg.get("a").unwrap();
        reg.sync(&[limit("a", 1000.0, 2000.0)]);
        assert!(Arc::ptr_eq(&before, &reg.get("a").unwrap()));
        reg.sync(&[limit("a", 5000.0, 2000.0)]);
        assert!(!Arc::ptr_eq(&before, &reg.get("a").unwrap()));
    }

    #[tokio::test]
    async fn test_zero_rate_is_unlimited() {
        let group = BwGroup::new("free", 0.0, 0.0);
        // Must return immediately no matter the size.
        group.consume_ingress(10_000_000).await;
        group.consume_egress(10_000_000).await;
    }

    #[tokio::test]
    async fn test_metered_consume_within_burst() {
        let group = BwGroup::new("fast", 1_000_000.0, 1_000_000.0);
        group.consume_ingress(1024).await;
        group.consume_egress(1024).await;
    }

    #[tokio::test]
    async fn test_oversized_read_split_into_chunks() {
        // A read larger than the burst completes only after the bucket
        // refills, roughly one second for a full second burst of debt.
        let group = BwGroup::new("slow", 4096.0, 0.0);
        let start = std::time::Instant::now();
        group.consume_ingress(8192).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(800));
    }
}
