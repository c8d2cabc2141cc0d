//! Request statistics.
//!
//! Lifetime counters survive every wave; burst counters describe the wave
//! currently running and are reset once a full async drain completes.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    request_count: u64,
    response_count: u64,
    time_out_count: u64,
    burst_response_count: u64,
    burst_response_time: Duration,
    burst_started: Option<Instant>,
    burst_runtime: Option<Duration>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_queued(&mut self) {
        self.request_count += 1;
    }

    pub fn record_response(&mut self, start_transfer_time: Duration, timed_out: bool) {
        self.response_count += 1;
        self.burst_response_count += 1;
        self.burst_response_time += start_transfer_time;
        if timed_out {
            self.time_out_count += 1;
        }
    }

    /// Marks the start of a drain. Several drains (emergency ones included)
    /// may accumulate into one burst.
    pub fn start_burst(&mut self) {
        self.burst_started = Some(Instant::now());
    }

    pub fn finish_burst(&mut self) {
        if let Some(started) = self.burst_started {
            let elapsed = started.elapsed();
            self.burst_runtime = Some(self.burst_runtime.unwrap_or_default() + elapsed);
        }
    }

    /// Forgets the finalized runtime so the next burst starts counting afresh.
    pub fn clear_burst_runtime(&mut self) {
        self.burst_runtime = None;
    }

    /// Resets per-burst response counters, lifetime counters are untouched.
    pub fn reset_burst(&mut self) {
        self.burst_response_count = 0;
        self.burst_response_time = Duration::ZERO;
    }

    /// Amount of requests queued over the engine's lifetime.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn response_count(&self) -> u64 {
        self.response_count
    }

    pub fn time_out_count(&self) -> u64 {
        self.time_out_count
    }

    pub fn burst_response_count(&self) -> u64 {
        self.burst_response_count
    }

    /// Sum of start-transfer times for the current burst.
    pub fn burst_response_time(&self) -> Duration {
        self.burst_response_time
    }

    /// Finalized runtime of the last burst, or time since the current one
    /// started.
    pub fn burst_runtime(&self) -> Duration {
        match self.burst_runtime {
            Some(runtime) if !runtime.is_zero() => runtime,
            _ => self
                .burst_started
                .map(|started| started.elapsed())
                .unwrap_or_default(),
        }
    }

    pub fn average_response_time(&self) -> Duration {
        if self.burst_response_count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.burst_response_time.as_nanos() / u128::from(self.burst_response_count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Responses per second for the current burst, truncated.
    pub fn responses_per_second(&self) -> u64 {
        let runtime = self.burst_runtime().as_secs_f64();
        if self.burst_response_count == 0 || runtime <= 0.0 {
            return 0;
        }
        (self.burst_response_count as f64 / runtime).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_is_zero_without_responses() {
        let stats = Statistics::new();
        assert_eq!(stats.average_response_time(), Duration::ZERO);
        assert_eq!(stats.responses_per_second(), 0);
    }

    #[test]
    fn average_truncates() {
        let mut stats = Statistics::new();
        stats.record_response(Duration::from_nanos(10), false);
        stats.record_response(Duration::from_nanos(10), false);
        stats.record_response(Duration::from_nanos(11), true);

        assert_eq!(stats.average_response_time(), Duration::from_nanos(10));
        assert_eq!(stats.time_out_count(), 1);
    }

    #[test]
    fn reset_burst_preserves_lifetime_counters() {
        let mut stats = Statistics::new();
        stats.record_queued();
        stats.record_queued();
        stats.record_response(Duration::from_millis(40), false);
        stats.record_response(Duration::from_millis(20), true);

        stats.reset_burst();

        assert_eq!(stats.request_count(), 2);
        assert_eq!(stats.response_count(), 2);
        assert_eq!(stats.time_out_count(), 1);
        assert_eq!(stats.burst_response_count(), 0);
        assert_eq!(stats.burst_response_time(), Duration::ZERO);
    }

    #[test]
    fn finished_burst_reports_accumulated_runtime() {
        let mut stats = Statistics::new();
        stats.start_burst();
        std::thread::sleep(Duration::from_millis(5));
        stats.finish_burst();
        let first = stats.burst_runtime();
        assert!(first >= Duration::from_millis(5));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.burst_runtime(), first);

        stats.clear_burst_runtime();
        assert!(stats.burst_runtime() >= first);
    }
}
