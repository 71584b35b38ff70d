/* src/breaker.rs */

use crate::metrics::Metrics;
use crate::models::BreakerRule;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Resolved breaker thresholds, shared by every backend of a route table.
#[derive(Debug, Clone)]
pub struct BreakerParams {
    /// Sliding window length, in recorded outcomes.
    pub window: usize,
    /// Failures within the window that trip the breaker.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    /// Concurrent probes admitted while half-open.
    pub trial_limit: u32,
}

impl From<&BreakerRule> for BreakerParams {
    fn from(rule: &BreakerRule) -> BreakerParams {
        BreakerParams {
            window: rule.window.max(1),
            failure_threshold: rule.failure_threshold.max(1),
            cooldown: Duration::from_secs(rule.cooldown_secs),
            trial_limit: rule.trial_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn name(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Outcome of asking the breaker for admission.
pub enum Admission<'a> {
    /// Breaker closed; the call proceeds normally.
    Allowed,
    /// Breaker half-open; the call is a probe whose outcome decides the
    /// next state. The guard keeps the probe slot reserved.
    Trial(TrialGuard<'a>),
    /// Breaker open (or probe slots exhausted); fail fast.
    Rejected,
}

/// Reservation of one HALF_OPEN probe slot. A settled probe leaves
/// HALF_OPEN through `on_success`/`on_failure`; if the call never settles
/// (the client went away mid-flight, or the attempt was abandoned before
/// dispatch), dropping the guard frees the slot so the breaker keeps
/// cycling instead of rejecting that backend forever.
pub struct TrialGuard<'a> {
    store: &'a BreakerStore,
    backend: String,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.store.release_trial(&self.backend);
    }
}

struct BreakerCore {
    state: BreakerState,
    /// `true` entries are failures. Only meaningful while closed.
    outcomes: VecDeque<bool>,
    open_until: Instant,
    trials_in_flight: u32,
}

impl BreakerCore {
    fn new() -> BreakerCore {
        BreakerCore {
            state: BreakerState::Closed,
            outcomes: VecDeque::new(),
            open_until: Instant::now(),
            trials_in_flight: 0,
        }
    }

    fn failures(&self) -> u32 {
        self.outcomes.iter().filter(|&&failed| failed).count() as u32
    }

    fn record(&mut self, failed: bool, window: usize) {
        self.outcomes.push_back(failed);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
    }
}

/// One circuit breaker per backend address, sharded across a concurrent
/// map. Each check-and-update runs under that backend's own lock, so state
/// transitions are linearizable per key without a global bottleneck.
pub struct BreakerStore {
    breakers: DashMap<String, Mutex<BreakerCore>>,
    metrics: Arc<Metrics>,
}

impl BreakerStore {
    pub fn new(metrics: Arc<Metrics>) -> BreakerStore {
        BreakerStore {
            breakers: DashMap::new(),
            metrics,
        }
    }

    fn with_core<T>(&self, backend: &str, f: impl FnOnce(&mut BreakerCore) -> T) -> T {
        let entry = self
            .breakers
            .entry(backend.to_string())
            .or_insert_with(|| Mutex::new(BreakerCore::new()));
        let mut core = match entry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut core)
    }

    /// Asks for admission to call `backend`, moving an expired OPEN breaker
    /// to HALF_OPEN on the way.
    pub fn try_acquire(&self, backend: &str, params: &BreakerParams) -> Admission<'_> {
        let (admission, transition) = self.with_core(backend, |core| {
            let mut transition = None;
            if core.state == BreakerState::Open && Instant::now() >= core.open_until {
                core.state = BreakerState::HalfOpen;
                core.trials_in_flight = 0;
                transition = Some((BreakerState::Open, BreakerState::HalfOpen));
            }
            let admission = match core.state {
                BreakerState::Closed => Admission::Allowed,
                BreakerState::Open => Admission::Rejected,
                BreakerState::HalfOpen => {
                    if core.trials_in_flight < params.trial_limit {
                        core.trials_in_flight += 1;
                        Admission::Trial(TrialGuard {
                            store: self,
                            backend: backend.to_string(),
                        })
                    } else {
                        Admission::Rejected
                    }
                }
            };
            (admission, transition)
        });
        if let Some((from, to)) = transition {
            self.metrics
                .record_breaker_transition(backend, from.name(), to.name());
        }
        admission
    }

    /// Frees a probe slot that was reserved but never settled. Settled
    /// probes have already left HALF_OPEN, which makes this a no-op for
    /// them.
    fn release_trial(&self, backend: &str) {
        self.with_core(backend, |core| {
            if core.state == BreakerState::HalfOpen {
                core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
            }
        });
    }

    /// Whether a call to `backend` would currently be admitted. Used by the
    /// pipeline to fail fast before the dispatcher reserves anything.
    pub fn is_admissible(&self, backend: &str) -> bool {
        match self.breakers.get(backend) {
            Some(entry) => {
                let core = match entry.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                core.state != BreakerState::Open || Instant::now() >= core.open_until
            }
            None => true,
        }
    }

    pub fn on_success(&self, backend: &str, params: &BreakerParams) {
        let transition = self.with_core(backend, |core| match core.state {
            BreakerState::HalfOpen => {
                // Probe succeeded: close and forget the old window.
                core.state = BreakerState::Closed;
                core.outcomes.clear();
                core.trials_in_flight = 0;
                Some((BreakerState::HalfOpen, BreakerState::Closed))
            }
            BreakerState::Closed => {
                core.record(false, params.window);
                None
            }
            BreakerState::Open => None,
        });
        if let Some((from, to)) = transition {
            self.metrics
                .record_breaker_transition(backend, from.name(), to.name());
        }
    }

    pub fn on_failure(&self, backend: &str, params: &BreakerParams) {
        let transition = self.with_core(backend, |core| match core.state {
            BreakerState::HalfOpen => {
                core.state = BreakerState::Open;
                core.open_until = Instant::now() + params.cooldown;
                core.trials_in_flight = 0;
                core.outcomes.clear();
                Some((BreakerState::HalfOpen, BreakerState::Open))
            }
            BreakerState::Closed => {
                core.record(true, params.window);
                if core.failures() >= params.failure_threshold {
                    core.state = BreakerState::Open;
                    core.open_until = Instant::now() + params.cooldown;
                    core.outcomes.clear();
                    Some((BreakerState::Closed, BreakerState::Open))
                } else {
                    None
                }
            }
            // Late failure reports while already open change nothing.
            BreakerState::Open => None,
        });
        if let Some((from, to)) = transition {
            self.metrics
                .record_breaker_transition(backend, from.name(), to.name());
        }
    }

    #[cfg(test)]
    pub fn state_of(&self, backend: &str) -> Option<BreakerState> {
        self.breakers.get(backend).map(|entry| {
            let core = match entry.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            core.state
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BreakerStore {
        BreakerStore::new(Arc::new(Metrics::new()))
    }

    fn params(threshold: u32, window: usize, cooldown: Duration) -> BreakerParams {
        BreakerParams {
            window,
            failure_threshold: threshold,
            cooldown,
            trial_limit: 1,
        }
    }

    const BACKEND: &str = "http://127.0.0.1:8081";

    #[test]
    fn opens_after_threshold_failures() {
        let s = store();
        let p = params(3, 10, Duration::from_secs(30));
        for _ in 0..3 {
            assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Allowed));
            s.on_failure(BACKEND, &p);
        }
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Open));
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Rejected));
        assert!(!s.is_admissible(BACKEND));
    }

    #[test]
    fn failures_below_threshold_stay_closed() {
        let s = store();
        let p = params(3, 10, Duration::from_secs(30));
        s.on_failure(BACKEND, &p);
        s.on_failure(BACKEND, &p);
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Closed));
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Allowed));
    }

    #[test]
    fn successes_age_failures_out_of_the_window() {
        let s = store();
        let p = params(3, 3, Duration::from_secs(30));
        s.on_failure(BACKEND, &p);
        s.on_failure(BACKEND, &p);
        // Three successes push both failures out of the 3-wide window.
        for _ in 0..3 {
            s.on_success(BACKEND, &p);
        }
        s.on_failure(BACKEND, &p);
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Closed));
    }

    #[test]
    fn cooldown_elapses_into_half_open_trial() {
        let s = store();
        let p = params(1, 10, Duration::from_millis(30));
        s.on_failure(BACKEND, &p);
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Rejected));

        std::thread::sleep(Duration::from_millis(40));
        let probe = s.try_acquire(BACKEND, &p);
        assert!(matches!(probe, Admission::Trial(_)));
        // Trial slots are bounded while a probe is in flight.
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Rejected));
        drop(probe);
    }

    #[test]
    fn trial_success_closes_and_resets() {
        let s = store();
        let p = params(1, 10, Duration::from_millis(10));
        s.on_failure(BACKEND, &p);
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Trial(_)));
        s.on_success(BACKEND, &p);
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Closed));
        // Counters were reset: one new failure is again required to trip.
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Allowed));
    }

    #[test]
    fn trial_failure_reopens_with_fresh_cooldown() {
        let s = store();
        let p = params(1, 10, Duration::from_millis(30));
        s.on_failure(BACKEND, &p);
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Trial(_)));
        s.on_failure(BACKEND, &p);
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Open));
        assert!(matches!(s.try_acquire(BACKEND, &p), Admission::Rejected));
    }

    #[test]
    fn unsettled_trial_releases_its_slot_on_drop() {
        let s = store();
        let p = params(1, 10, Duration::from_millis(10));
        s.on_failure(BACKEND, &p);
        std::thread::sleep(Duration::from_millis(20));
        {
            let probe = s.try_acquire(BACKEND, &p);
            assert!(matches!(probe, Admission::Trial(_)));
            // Dropped without settling, as when the client disconnects
            // mid-probe and the handler future is cancelled.
        }
        // The slot is free again: the breaker offers a new trial instead
        // of rejecting this backend forever.
        let retry = s.try_acquire(BACKEND, &p);
        assert!(matches!(retry, Admission::Trial(_)));
        s.on_success(BACKEND, &p);
        assert_eq!(s.state_of(BACKEND), Some(BreakerState::Closed));
    }

    #[test]
    fn backends_trip_independently() {
        let s = store();
        let p = params(1, 10, Duration::from_secs(30));
        s.on_failure("http://a:1", &p);
        assert!(matches!(s.try_acquire("http://a:1", &p), Admission::Rejected));
        assert!(matches!(s.try_acquire("http://b:1", &p), Admission::Allowed));
    }

    #[test]
    fn transitions_are_counted() {
        let metrics = Arc::new(Metrics::new());
        let s = BreakerStore::new(metrics.clone());
        let p = params(1, 10, Duration::from_millis(10));
        s.on_failure(BACKEND, &p); // closed -> open
        std::thread::sleep(Duration::from_millis(20));
        s.try_acquire(BACKEND, &p); // open -> half-open
        s.on_success(BACKEND, &p); // half-open -> closed
        assert_eq!(
            metrics
                .breaker_transitions
                .load(std::sync::atomic::Ordering::Relaxed),
            3
        );
    }
}
