use std::thread::sleep;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::gelbooru::io::Config;

/// Knobs for the adaptive rate limiter.
#[derive(Debug, Clone)]
pub(crate) struct RateLimiterConfig {
    /// Smallest enforced spacing between outbound requests.
    pub(crate) min_delay: Duration,
    /// Largest enforced spacing between outbound requests.
    pub(crate) max_delay: Duration,
    /// Factor to multiply delay by on a rate-limit response.
    pub(crate) increase_factor: f64,
    /// Factor to multiply delay by after a success streak.
    pub(crate) decrease_factor: f64,
    /// Consecutive successes required before the delay is eased off.
    pub(crate) success_threshold: u32,
    /// Upper bound on concurrent workers.
    pub(crate) max_workers: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            increase_factor: 1.5,
            decrease_factor: 0.95,
            success_threshold: 15,
            max_workers: 4,
        }
    }
}

impl RateLimiterConfig {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            min_delay: Duration::from_millis(config.min_delay_ms()),
            max_delay: Duration::from_millis(config.max_delay_ms()),
            increase_factor: config.delay_increase_factor(),
            decrease_factor: config.delay_decrease_factor(),
            success_threshold: config.success_threshold(),
            max_workers: config.max_workers(),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    /// Current spacing enforced between requests.
    delay: Duration,
    /// Consecutive successful requests since the last failure or easing.
    success_streak: u32,
    /// Currently permitted worker count.
    workers: usize,
    /// Reservation time of the most recent admitted call.
    last_call: Option<Instant>,
}

/// Adaptive rate limiter approximating an unknown server-side rate limit:
/// additive success feedback eases the delay off slowly, a rate-limit
/// response backs both the delay and the worker count off at once.
///
/// Delay and concurrency are two independent levers. The delay spaces
/// individual requests, the worker count bounds how many callers can queue
/// at the gate; a 429 means both may be set too high.
#[derive(Debug)]
pub(crate) struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

impl AdaptiveRateLimiter {
    pub(crate) fn new(config: RateLimiterConfig) -> Self {
        let state = LimiterState {
            delay: config.min_delay,
            success_streak: 0,
            workers: config.max_workers.max(1),
            last_call: None,
        };

        AdaptiveRateLimiter {
            config,
            state: Mutex::new(state),
        }
    }

    /// Blocking gate called before every outbound request.
    ///
    /// The next free slot is reserved while the lock is held, so concurrent
    /// callers queue one delay apart instead of all firing at once. The wait
    /// itself happens after the lock is released.
    pub(crate) fn admit(&self) {
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            match state.last_call {
                Some(last) => {
                    let earliest = last + state.delay;
                    if earliest > now {
                        state.last_call = Some(earliest);
                        earliest - now
                    } else {
                        state.last_call = Some(now);
                        Duration::ZERO
                    }
                }
                None => {
                    state.last_call = Some(now);
                    Duration::ZERO
                }
            }
        };

        if !wait.is_zero() {
            debug!("Rate limiter waiting for {wait:?}");
            sleep(wait);
        }
    }

    /// Records a successful request. Only a long unbroken streak eases the
    /// delay off, so recovery from a rate limit does not oscillate straight
    /// back into one.
    pub(crate) fn on_success(&self) {
        let mut state = self.state.lock();
        state.success_streak += 1;

        if state.success_streak >= self.config.success_threshold
            && state.delay > self.config.min_delay
        {
            let eased = scale(state.delay, self.config.decrease_factor);
            state.delay = eased.max(self.config.min_delay);
            state.success_streak = 0;
            debug!("Request streak healthy, easing delay to {:?}", state.delay);
        }
    }

    /// Records a rate-limit response: delay up, workers down, then a cooldown
    /// pause of twice the new delay taken outside the lock.
    pub(crate) fn on_rate_limited(&self) {
        let cooldown = {
            let mut state = self.state.lock();
            state.delay = scale(state.delay, self.config.increase_factor).min(self.config.max_delay);
            state.success_streak = 0;
            state.workers = state.workers.saturating_sub(1).max(1);

            warn!(
                "Rate limited - backing off ({:?} delay, {} workers)",
                state.delay, state.workers
            );
            state.delay * 2
        };

        sleep(cooldown);
    }

    /// Currently permitted worker count, read by stages at submission time.
    pub(crate) fn current_workers(&self) -> usize {
        self.state.lock().workers
    }

    /// Current spacing enforced between requests.
    pub(crate) fn current_delay(&self) -> Duration {
        self.state.lock().delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RateLimiterConfig {
        RateLimiterConfig {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(640),
            increase_factor: 2.0,
            decrease_factor: 0.5,
            success_threshold: 3,
            max_workers: 4,
        }
    }

    #[test]
    fn rate_limits_back_off_multiplicatively_and_shed_workers() {
        let config = quick_config();
        let limiter = AdaptiveRateLimiter::new(config.clone());

        let mut expected = config.min_delay;
        for hit in 1..=6 {
            limiter.on_rate_limited();
            expected = scale(expected, config.increase_factor).min(config.max_delay);
            assert_eq!(limiter.current_delay(), expected, "after {hit} rate limits");
            assert_eq!(
                limiter.current_workers(),
                config.max_workers.saturating_sub(hit).max(1)
            );
        }

        // Capped at max_delay and floored at one worker.
        assert_eq!(limiter.current_delay(), config.max_delay);
        assert_eq!(limiter.current_workers(), 1);
    }

    #[test]
    fn success_streak_eases_delay_until_floor() {
        let config = quick_config();
        let limiter = AdaptiveRateLimiter::new(config.clone());
        limiter.on_rate_limited();
        limiter.on_rate_limited();

        let mut previous = limiter.current_delay();
        assert!(previous > config.min_delay);

        while limiter.current_delay() > config.min_delay {
            for _ in 0..config.success_threshold {
                limiter.on_success();
            }
            let current = limiter.current_delay();
            assert!(current < previous, "delay must strictly decrease");
            previous = current;
        }

        // Further successes never push the delay below the floor.
        for _ in 0..config.success_threshold * 2 {
            limiter.on_success();
        }
        assert_eq!(limiter.current_delay(), config.min_delay);
    }

    #[test]
    fn successes_below_threshold_leave_delay_unchanged() {
        let config = quick_config();
        let limiter = AdaptiveRateLimiter::new(config.clone());
        limiter.on_rate_limited();
        let raised = limiter.current_delay();

        for _ in 0..config.success_threshold - 1 {
            limiter.on_success();
        }
        assert_eq!(limiter.current_delay(), raised);
    }

    #[test]
    fn rate_limit_resets_success_streak() {
        let config = quick_config();
        let limiter = AdaptiveRateLimiter::new(config.clone());
        limiter.on_rate_limited();
        let raised = limiter.current_delay();

        for _ in 0..config.success_threshold - 1 {
            limiter.on_success();
        }
        limiter.on_rate_limited();

        // The streak restarted, so threshold-1 more successes change nothing.
        for _ in 0..config.success_threshold - 1 {
            limiter.on_success();
        }
        assert!(limiter.current_delay() >= raised);
    }

    #[test]
    fn admit_spaces_consecutive_calls() {
        let limiter = AdaptiveRateLimiter::new(RateLimiterConfig {
            min_delay: Duration::from_millis(50),
            ..quick_config()
        });

        let start = Instant::now();
        limiter.admit();
        limiter.admit();
        limiter.admit();
        let elapsed = start.elapsed();

        // First call is free, the next two wait one delay each.
        assert!(elapsed >= Duration::from_millis(95), "elapsed: {elapsed:?}");
    }
}
