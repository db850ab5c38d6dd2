use std::time::Duration;

use chrono::{DateTime, Utc};

/// Number of steps covered by one `next` call unless configured otherwise.
pub const DEFAULT_STEPS_BATCH: usize = 10;

/// How far back a selector looks for the latest sample of a step.
pub const DEFAULT_LOOKBACK_DELTA: Duration = Duration::from_secs(5 * 60);

/// Time range and batching parameters shared by every operator of a plan.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// First step, in milliseconds since epoch
    pub start: i64,
    /// Last step (inclusive), in milliseconds since epoch
    pub end: i64,
    pub step: Duration,
    pub steps_batch: usize,
    pub lookback_delta: Duration,
    /// Build the plan without the concurrency wrapper.
    pub disable_concurrency: bool,
}

impl QueryOptions {
    pub fn new(start: i64, end: i64, step: Duration) -> Self {
        Self {
            start,
            end,
            step,
            steps_batch: DEFAULT_STEPS_BATCH,
            lookback_delta: DEFAULT_LOOKBACK_DELTA,
            disable_concurrency: false,
        }
    }

    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis(), step)
    }

    /// A single evaluation at `t`.
    pub fn instant(t: DateTime<Utc>) -> Self {
        let t = t.timestamp_millis();
        Self::new(t, t, Duration::ZERO)
    }

    pub fn with_steps_batch(mut self, steps_batch: usize) -> Self {
        self.steps_batch = steps_batch.max(1);
        self
    }

    pub fn with_lookback_delta(mut self, lookback_delta: Duration) -> Self {
        self.lookback_delta = lookback_delta;
        self
    }

    /// Step interval in milliseconds, never less than 1.
    pub fn step_ms(&self) -> i64 {
        (self.step.as_millis() as i64).max(1)
    }

    pub fn lookback_ms(&self) -> i64 {
        self.lookback_delta.as_millis() as i64
    }

    pub fn num_steps(&self) -> usize {
        if self.end < self.start {
            return 0;
        }
        ((self.end - self.start) / self.step_ms()) as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_num_steps() {
        let opts = QueryOptions::new(0, 10_000, Duration::from_secs(5));
        assert_eq!(opts.num_steps(), 3);

        let opts = QueryOptions::new(0, 9_999, Duration::from_secs(5));
        assert_eq!(opts.num_steps(), 2);

        let opts = QueryOptions::instant(Utc.timestamp_opt(100, 0).unwrap());
        assert_eq!(opts.step_ms(), 1);
        assert_eq!(opts.num_steps(), 1);
        assert_eq!(opts.start, 100_000);
    }

    #[test]
    fn test_steps_batch_at_least_one() {
        let opts = QueryOptions::new(0, 0, Duration::ZERO).with_steps_batch(0);
        assert_eq!(opts.steps_batch, 1);
    }
}
