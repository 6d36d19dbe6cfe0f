use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling-window monitor of downstream write outcomes.
///
/// The sink consumer reports every completed upsert attempt here and asks for
/// an effective batch size before each read. When the keyed store throttles a
/// large share of recent writes, the next batches shrink proportionally
/// instead of piling more retries onto a saturated store; once the window
/// clears, batches recover to their configured size.
pub struct ThrottleMonitor {
    window: Duration,
    min_factor: f64,
    samples: Mutex<VecDeque<(Instant, bool)>>,
}

impl ThrottleMonitor {
    pub fn new(window: Duration, min_factor: f64) -> Self {
        Self {
            window,
            min_factor: min_factor.clamp(0.0, 1.0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_ok(&self) {
        self.record(false)
    }

    pub fn record_throttled(&self) {
        self.record(true)
    }

    fn record(&self, throttled: bool) {
        let mut samples = self.samples.lock().expect("poisoned ThrottleMonitor mutex");
        samples.push_back((Instant::now(), throttled));
        Self::evict(&mut samples, self.window);
    }

    fn evict(samples: &mut VecDeque<(Instant, bool)>, window: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Share of attempts in the current window that were throttled.
    pub fn throttle_ratio(&self) -> f64 {
        let mut samples = self.samples.lock().expect("poisoned ThrottleMonitor mutex");
        Self::evict(&mut samples, self.window);
        if samples.is_empty() {
            return 0.0;
        }
        let throttled = samples.iter().filter(|(_, t)| *t).count();
        throttled as f64 / samples.len() as f64
    }

    /// Shrink a base batch size in proportion to the observed throttle rate,
    /// bounded below by the configured floor and never below one record.
    pub fn effective_batch_size(&self, base: usize) -> usize {
        let factor = (1.0 - self.throttle_ratio()).clamp(self.min_factor, 1.0);
        (((base as f64) * factor).floor() as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ThrottleMonitor {
        ThrottleMonitor::new(Duration::from_secs(10), 0.1)
    }

    #[test]
    fn test_empty_window_keeps_full_batch() {
        assert_eq!(monitor().effective_batch_size(500), 500);
    }

    #[test]
    fn test_half_throttled_halves_the_batch() {
        let monitor = monitor();
        for _ in 0..50 {
            monitor.record_ok();
            monitor.record_throttled();
        }

        assert!((monitor.throttle_ratio() - 0.5).abs() < 1e-9);
        assert_eq!(monitor.effective_batch_size(500), 250);
    }

    #[test]
    fn test_fully_throttled_hits_the_floor() {
        let monitor = monitor();
        for _ in 0..20 {
            monitor.record_throttled();
        }

        assert_eq!(monitor.effective_batch_size(500), 50);
        assert_eq!(monitor.effective_batch_size(1), 1);
    }

    #[test]
    fn test_old_samples_age_out() {
        let monitor = ThrottleMonitor::new(Duration::from_millis(0), 0.1);
        monitor.record_throttled();

        // With a zero-width window every sample is immediately stale.
        assert_eq!(monitor.effective_batch_size(500), 500);
    }
}
