// =============================================================================
// Rate Limiter — suspending request pacing per provider
// =============================================================================
//
// Every outbound request to an external provider calls `throttle()` first.
// The call suspends until the request is admissible under the provider's
// declared capacity, then records it as consumed. Requests are only ever
// delayed, never rejected or dropped.
//
// Callers for the same provider queue on the internal mutex, which is exactly
// the serialization the pacing needs; other providers and the
// aggregation/storage path are untouched.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::trace;

/// Rolling window for per-minute limits.
const WINDOW: Duration = Duration::from_millis(60_000);

/// A provider's declared request capacity. Per-second and per-minute limits
/// compose; weight-per-minute limits are declared as requests-per-minute with
/// one request consuming one unit of weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug)]
struct LimiterState {
    last_request: Option<Instant>,
    window_start: Instant,
    request_count: u32,
}

pub struct RateLimiter {
    meta: RateLimitMetadata,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(meta: RateLimitMetadata) -> Self {
        Self {
            meta,
            state: Mutex::new(LimiterState {
                last_request: None,
                window_start: Instant::now(),
                request_count: 0,
            }),
        }
    }

    pub fn metadata(&self) -> RateLimitMetadata {
        self.meta
    }

    /// Suspend until the next request is admissible, then record it.
    pub async fn throttle(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        if now.duration_since(state.window_start) > WINDOW {
            state.window_start = now;
            state.request_count = 0;
        }

        if let Some(rps) = self.meta.requests_per_second {
            let min_interval = Duration::from_secs_f64(1.0 / rps);
            if let Some(last) = state.last_request {
                let elapsed = now.duration_since(last);
                if elapsed < min_interval {
                    let wait = min_interval - elapsed;
                    trace!(?wait, "throttling for per-second spacing");
                    sleep(wait).await;
                }
            }
        }

        if let Some(rpm) = self.meta.requests_per_minute {
            if state.request_count >= rpm {
                let elapsed = Instant::now().duration_since(state.window_start);
                if elapsed < WINDOW {
                    let wait = WINDOW - elapsed;
                    trace!(?wait, "per-minute budget exhausted — suspending");
                    sleep(wait).await;
                }
                state.window_start = Instant::now();
                state.request_count = 0;
            }
        }

        state.last_request = Some(Instant::now());
        state.request_count += 1;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_back_to_back_requests() {
        let limiter = RateLimiter::new(RateLimitMetadata {
            requests_per_second: Some(10.0),
            requests_per_minute: None,
        });

        let start = Instant::now();
        limiter.throttle().await;
        limiter.throttle().await;
        limiter.throttle().await;

        // 10 rps => 100 ms spacing, so the third call finishes >= 200 ms in.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_provider_never_waits() {
        let limiter = RateLimiter::new(RateLimitMetadata::default());

        let start = Instant::now();
        for _ in 0..100 {
            limiter.throttle().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_budget_suspends_until_window_elapses() {
        let limiter = RateLimiter::new(RateLimitMetadata {
            requests_per_second: None,
            requests_per_minute: Some(2),
        });

        let start = Instant::now();
        limiter.throttle().await;
        limiter.throttle().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Third request exceeds the budget and waits out the window.
        limiter.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(60_000));

        // The window was reset, so the next request goes straight through.
        let resumed = Instant::now();
        limiter.throttle().await;
        assert_eq!(resumed.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_gap_resets_the_window() {
        let limiter = RateLimiter::new(RateLimitMetadata {
            requests_per_second: None,
            requests_per_minute: Some(2),
        });

        limiter.throttle().await;
        limiter.throttle().await;

        // After a quiet minute the budget is fresh; no suspension.
        sleep(Duration::from_millis(61_000)).await;
        let start = Instant::now();
        limiter.throttle().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn composed_limits_respect_both_disciplines() {
        let limiter = RateLimiter::new(RateLimitMetadata {
            requests_per_second: Some(10.0),
            requests_per_minute: Some(3),
        });

        let start = Instant::now();
        limiter.throttle().await;
        limiter.throttle().await;
        limiter.throttle().await;
        // Spacing alone: >= 200 ms.
        assert!(start.elapsed() >= Duration::from_millis(200));

        // Fourth call trips the per-minute budget.
        limiter.throttle().await;
        assert!(start.elapsed() >= Duration::from_millis(60_000));
    }
}
