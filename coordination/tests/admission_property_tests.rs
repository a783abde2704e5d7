//! Admission property tests: validates the sliding-window bound across
//! varied limits, burst sizes and arrival patterns.
//!
//! Tests verify:
//! - No window of length W ever contains more than N grants
//! - Every request is eventually granted (queued, never dropped)
//! - Cancelled waiters give their slot back

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coordination::admission::AdmissionController;
use coordination::config::RateLimitConfig;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn controller(key: &str, max_starts: u32, window_secs: u64) -> Arc<AdmissionController> {
    let mut limits = HashMap::new();
    limits.insert(key.to_string(), RateLimitConfig::new(max_starts, window_secs));
    AdmissionController::new(&limits).shared()
}

/// Largest number of grants falling inside any half-open window of `window`.
fn max_in_any_window(grants: &[Instant], window: Duration) -> usize {
    let mut sorted = grants.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|start| sorted.iter().filter(|g| **g >= *start && **g < *start + window).count())
        .max()
        .unwrap_or(0)
}

// ── Property: window bound holds for concurrent bursts ─────────────

#[tokio::test(start_paused = true)]
async fn prop_concurrent_burst_respects_window() {
    for (max_starts, window_secs, requests) in [(1, 10, 5), (2, 60, 9), (3, 30, 10), (5, 5, 23)] {
        let ctl = controller("k", max_starts, window_secs);
        let token = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..requests {
            let ctl = ctl.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                ctl.acquire("k", &token).await.unwrap().granted_at
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }

        assert_eq!(grants.len(), requests);
        assert!(
            max_in_any_window(&grants, Duration::from_secs(window_secs)) <= max_starts as usize,
            "limit {max_starts}/{window_secs}s violated"
        );
    }
}

// ── Property: window bound holds for staggered arrivals ────────────

#[tokio::test(start_paused = true)]
async fn prop_staggered_arrivals_respect_window() {
    for gap_secs in [1, 7, 13, 29] {
        let ctl = controller("k", 3, 30);
        let token = CancellationToken::new();
        let mut grants = Vec::new();

        for i in 0..12u64 {
            if i % 2 == 0 {
                tokio::time::advance(Duration::from_secs(gap_secs)).await;
            }
            grants.push(ctl.admit("k").granted_at);
        }
        // a real acquire after the schedule still obeys the bound
        grants.push(ctl.acquire("k", &token).await.unwrap().granted_at);

        assert!(max_in_any_window(&grants, Duration::from_secs(30)) <= 3);
        assert!(grants.windows(2).all(|w| w[0] <= w[1]));
    }
}

// ── Property: cancellation returns budget ──────────────────────────

#[tokio::test(start_paused = true)]
async fn prop_cancelled_waiters_release_slots() {
    let ctl = controller("k", 1, 60);
    let live = CancellationToken::new();
    let doomed = CancellationToken::new();

    ctl.acquire("k", &live).await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let ctl = ctl.clone();
        let doomed = doomed.clone();
        waiters.push(tokio::spawn(async move { ctl.acquire("k", &doomed).await }));
    }
    tokio::task::yield_now().await;
    assert_eq!(ctl.pending("k"), 4);

    doomed.cancel();
    for waiter in waiters {
        assert!(waiter.await.unwrap().is_err());
    }
    assert_eq!(ctl.pending("k"), 0);

    let start = Instant::now();
    let next = ctl.acquire("k", &live).await.unwrap();
    assert_eq!(next.granted_at - start, Duration::from_secs(60));
}
