//! Per-backend admission control
//!
//! Each backend key owns a rolling window of grant times. A start that would
//! push the window past its limit is not refused: it is scheduled for the
//! earliest instant at which the oldest grant in the window expires. Windows
//! are half-open, so a grant at `t` stops counting at `t + W`.
//!
//! One controller is shared by every session using the same backend keys.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;

/// Error type for admission operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission for {0} cancelled while waiting")]
    Cancelled(String),
}

/// Result type for admission operations
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Shared reference to AdmissionController
pub type SharedAdmissionController = Arc<AdmissionController>;

/// A scheduled start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    pub backend_key: String,
    pub granted_at: Instant,
}

/// A start that has been admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub backend_key: String,
    pub granted_at: Instant,
    pub waited: Duration,
}

struct RateLimitWindow {
    max_starts: usize,
    window: Duration,
    /// Grant times, ascending. May include future (scheduled) grants.
    grants: VecDeque<(u64, Instant)>,
}

impl RateLimitWindow {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            // zero limits never reach here; sessions reject them up front
            max_starts: config.max_starts.max(1) as usize,
            window: config.window(),
            grants: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(_, granted)) = self.grants.front() {
            if granted + self.window <= now {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Earliest grant time that keeps every window at or under the limit
    /// without reordering already scheduled grants.
    fn schedule(&mut self, id: u64, now: Instant) -> Instant {
        self.prune(now);

        let len = self.grants.len();
        let mut at = now;
        if len >= self.max_starts {
            let (_, oldest_in_window) = self.grants[len - self.max_starts];
            at = at.max(oldest_in_window + self.window);
        }
        if let Some(&(_, last)) = self.grants.back() {
            at = at.max(last);
        }

        self.grants.push_back((id, at));
        at
    }

    fn release(&mut self, id: u64) -> bool {
        match self.grants.iter().position(|&(g, _)| g == id) {
            Some(pos) => {
                self.grants.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Grants counted in the window ending at `now`
    fn in_window(&self, now: Instant) -> usize {
        self.grants
            .iter()
            .filter(|&&(_, t)| t <= now && t + self.window > now)
            .count()
    }
}

/// Sliding-window start limiter keyed by backend
pub struct AdmissionController {
    windows: Mutex<HashMap<String, RateLimitWindow>>,
    next_id: AtomicU64,
}

impl AdmissionController {
    /// Create a controller with limits for the given backend keys. Keys
    /// without a limit are admitted immediately.
    pub fn new(limits: &HashMap<String, RateLimitConfig>) -> Self {
        let windows = limits
            .iter()
            .map(|(key, config)| (key.clone(), RateLimitWindow::new(config)))
            .collect();
        Self {
            windows: Mutex::new(windows),
            next_id: AtomicU64::new(1),
        }
    }

    /// Controller with no limits at all
    pub fn unlimited() -> Self {
        Self::new(&HashMap::new())
    }

    /// Create a shared reference to this controller
    pub fn shared(self) -> SharedAdmissionController {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateLimitWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next start for `backend_key`. The returned grant time is
    /// never earlier than now.
    pub fn admit(&self, backend_key: &str) -> Reservation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let granted_at = match self.lock().get_mut(backend_key) {
            Some(window) => window.schedule(id, now),
            None => now,
        };

        trace!(
            backend_key,
            wait_ms = (granted_at - now).as_millis() as u64,
            "Start reserved"
        );
        Reservation {
            id,
            backend_key: backend_key.to_string(),
            granted_at,
        }
    }

    /// Give a reservation's slot back. Idempotent.
    pub fn cancel(&self, reservation: &Reservation) {
        if let Some(window) = self.lock().get_mut(&reservation.backend_key) {
            if window.release(reservation.id) {
                debug!(backend_key = %reservation.backend_key, "Reservation released");
            }
        }
    }

    /// Reserve a start and wait for it. If `cancel` fires first, the
    /// reservation is released and the window budget is returned.
    pub async fn acquire(
        &self,
        backend_key: &str,
        cancel: &CancellationToken,
    ) -> AdmissionResult<Admission> {
        let requested = Instant::now();
        let reservation = self.admit(backend_key);

        if reservation.granted_at > requested {
            debug!(
                backend_key,
                wait_ms = (reservation.granted_at - requested).as_millis() as u64,
                "Backend saturated, start queued"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(&reservation);
                    return Err(AdmissionError::Cancelled(backend_key.to_string()));
                }
                _ = tokio::time::sleep_until(reservation.granted_at) => {}
            }
        } else if cancel.is_cancelled() {
            self.cancel(&reservation);
            return Err(AdmissionError::Cancelled(backend_key.to_string()));
        }

        Ok(Admission {
            backend_key: backend_key.to_string(),
            granted_at: reservation.granted_at,
            waited: reservation.granted_at - requested,
        })
    }

    /// Starts counted against `backend_key` in the window ending now.
    pub fn in_window(&self, backend_key: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(backend_key)
            .map_or(0, |w| w.in_window(now))
    }

    /// Scheduled starts for `backend_key` that have not been granted yet.
    pub fn pending(&self, backend_key: &str) -> usize {
        let now = Instant::now();
        self.lock()
            .get(backend_key)
            .map_or(0, |w| w.grants.iter().filter(|&&(_, t)| t > now).count())
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(key: &str, max_starts: u32, window_secs: u64) -> AdmissionController {
        let mut limits = HashMap::new();
        limits.insert(key.to_string(), RateLimitConfig::new(max_starts, window_secs));
        AdmissionController::new(&limits)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_key_admits_immediately() {
        let ctl = controller("limited", 1, 60);
        let now = Instant::now();
        for _ in 0..10 {
            assert_eq!(ctl.admit("free").granted_at, now);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_window_schedules_after_oldest_expires() {
        let ctl = controller("k", 2, 60);
        let t0 = Instant::now();

        let grants: Vec<_> = (0..5).map(|_| ctl.admit("k").granted_at - t0).collect();
        assert_eq!(
            grants,
            vec![
                Duration::ZERO,
                Duration::ZERO,
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(120),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_not_bucketed() {
        let ctl = controller("k", 2, 60);
        let t0 = Instant::now();
        ctl.admit("k");
        tokio::time::advance(Duration::from_secs(50)).await;
        ctl.admit("k");

        // oldest expires at 60, not at a bucket boundary
        let third = ctl.admit("k").granted_at - t0;
        assert_eq!(third, Duration::from_secs(60));
        let fourth = ctl.admit("k").granted_at - t0;
        assert_eq!(fourth, Duration::from_secs(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let mut limits = HashMap::new();
        limits.insert("a".to_string(), RateLimitConfig::new(1, 60));
        limits.insert("b".to_string(), RateLimitConfig::new(1, 60));
        let ctl = AdmissionController::new(&limits);
        let now = Instant::now();

        ctl.admit("a");
        assert!(ctl.admit("a").granted_at > now);
        assert_eq!(ctl.admit("b").granted_at, now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_grant() {
        let ctl = controller("k", 1, 10);
        let token = CancellationToken::new();

        let first = ctl.acquire("k", &token).await.unwrap();
        assert_eq!(first.waited, Duration::ZERO);

        let second = ctl.acquire("k", &token).await.unwrap();
        assert_eq!(second.waited, Duration::from_secs(10));
        assert_eq!(ctl.in_window("k"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_returns_budget() {
        let ctl = Arc::new(controller("k", 1, 60));
        let token = CancellationToken::new();
        let t0 = Instant::now();

        ctl.acquire("k", &token).await.unwrap();

        let waiter = {
            let ctl = ctl.clone();
            let token = token.clone();
            tokio::spawn(async move { ctl.acquire("k", &token).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(ctl.pending("k"), 1);

        token.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(AdmissionError::Cancelled(_))
        ));
        assert_eq!(ctl.pending("k"), 0);

        // the released slot is reusable at the original time
        assert_eq!(ctl.admit("k").granted_at - t0, Duration::from_secs(60));
    }
}
