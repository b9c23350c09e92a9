use rand::Rng;
use std::time::Duration;

const DEFAULT_INITIAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX: Duration = Duration::from_secs(5);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const MIN_DELAY: Duration = Duration::from_millis(50);

/// Exponential backoff bounds for broker reconnects.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl RetrySettings {
    pub fn new(initial: Option<Duration>, max: Option<Duration>, multiplier: Option<f64>) -> Self {
        let initial = initial.unwrap_or(DEFAULT_INITIAL);
        let mut max = max.unwrap_or(DEFAULT_MAX);
        if max < initial {
            max = initial;
        }
        let multiplier = multiplier.unwrap_or(DEFAULT_MULTIPLIER).clamp(1.1, 10.0);

        Self {
            initial,
            max,
            multiplier,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

pub struct RetryBackoff {
    policy: RetrySettings,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(policy: RetrySettings) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    pub fn on_success(&mut self) {
        self.current = self.policy.initial;
    }

    /// Returns the delay to wait now and advances to the next one.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current.max(MIN_DELAY);
        let next = (delay.as_millis() as f64 * self.policy.multiplier)
            .round()
            .max(self.policy.initial.as_millis() as f64);
        let capped = next.min(self.policy.max.as_millis() as f64);
        self.current = std::cmp::min(Duration::from_millis(capped as u64), self.policy.max);
        delay
    }
}

/// Picks a delay uniformly between `min` and `max`.
pub fn jitter_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let mut rng = rand::thread_rng();
    let min_secs = min.as_secs_f64();
    let span = max.as_secs_f64() - min_secs;
    let sample = rng.gen::<f64>() * span + min_secs;
    Duration::from_secs_f64(sample)
}
