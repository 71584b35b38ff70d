/* src/balancer.rs */

use crate::registry::Backend;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Weighted round-robin selection over a service's candidate list. One
/// atomic cursor per service; no shared lock across services.
pub struct Balancer {
    cursors: DashMap<String, AtomicUsize>,
}

impl Default for Balancer {
    fn default() -> Self {
        Balancer::new()
    }
}

impl Balancer {
    pub fn new() -> Balancer {
        Balancer {
            cursors: DashMap::new(),
        }
    }

    /// Picks the next backend from `candidates`. The caller passes the
    /// already-filtered list (healthy, breaker-admissible, not yet tried),
    /// so selection itself never consults shared health state.
    pub fn pick(&self, service: &str, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: usize = candidates.iter().map(|b| b.weight.max(1) as usize).sum();

        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let tick = cursor.fetch_add(1, Ordering::Relaxed);

        let mut slot = tick % total_weight;
        for backend in candidates {
            let weight = backend.weight.max(1) as usize;
            if slot < weight {
                return Some(backend.clone());
            }
            slot -= weight;
        }

        // Unreachable given the modulo above, but never return nothing when
        // candidates exist.
        candidates.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Health;

    fn backend(address: &str, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::new(address.to_string(), weight, Health::Up))
    }

    #[test]
    fn empty_candidates_yield_none() {
        let b = Balancer::new();
        assert!(b.pick("svc", &[]).is_none());
    }

    #[test]
    fn equal_weights_cycle_round_robin() {
        let b = Balancer::new();
        let candidates = vec![backend("a", 1), backend("b", 1), backend("c", 1)];
        let picks: Vec<String> = (0..6)
            .map(|_| b.pick("svc", &candidates).unwrap().address.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn weights_skew_the_rotation() {
        let b = Balancer::new();
        let candidates = vec![backend("heavy", 3), backend("light", 1)];
        let mut heavy = 0;
        for _ in 0..40 {
            if b.pick("svc", &candidates).unwrap().address == "heavy" {
                heavy += 1;
            }
        }
        assert_eq!(heavy, 30);
    }

    #[test]
    fn cursors_are_per_service() {
        let b = Balancer::new();
        let candidates = vec![backend("a", 1), backend("b", 1)];
        assert_eq!(b.pick("one", &candidates).unwrap().address, "a");
        assert_eq!(b.pick("two", &candidates).unwrap().address, "a");
    }
}
