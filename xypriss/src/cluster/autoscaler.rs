//! Autoscaling control loop logic.
//!
//! Pure decision logic, driven by the supervisor once per scale
//! interval:
//!
//! - average CPU above the threshold for **two** consecutive intervals
//!   scales up by one worker, while below the maximum;
//! - average CPU below **half** the threshold for **three** consecutive
//!   intervals scales down by one, while above the minimum;
//! - the memory threshold drives the same rules;
//! - pinned at the maximum under sustained load, the scaler holds and
//!   logs a ceiling warning once per streak.

use crate::config::AutoScaleSection;

/// What the supervisor should do after this interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Spawn one worker
    Up,
    /// Gracefully retire one worker
    Down,
    Hold,
}

/// The control loop state machine.
pub struct AutoScaler {
    config: AutoScaleSection,
    high_streak: u32,
    low_streak: u32,
    ceiling_warned: bool,
}

impl AutoScaler {
    pub fn new(config: AutoScaleSection) -> Self {
        Self {
            config,
            high_streak: 0,
            low_streak: 0,
            ceiling_warned: false,
        }
    }

    pub fn config(&self) -> &AutoScaleSection {
        &self.config
    }

    /// Feed one interval's averages and current worker count.
    pub fn evaluate(
        &mut self,
        avg_cpu: f64,
        avg_memory_pct: f64,
        current_workers: usize,
    ) -> ScaleDecision {
        let pressure_high =
            avg_cpu > self.config.cpu_threshold || avg_memory_pct > self.config.memory_threshold;
        let pressure_low = avg_cpu < self.config.cpu_threshold / 2.0
            && avg_memory_pct < self.config.memory_threshold / 2.0;

        if pressure_high {
            self.low_streak = 0;
            self.high_streak += 1;
            if self.high_streak >= 2 {
                if current_workers < self.config.max {
                    self.high_streak = 0;
                    self.ceiling_warned = false;
                    tracing::info!(
                        avg_cpu,
                        workers = current_workers,
                        "sustained pressure, scaling up"
                    );
                    return ScaleDecision::Up;
                }
                if !self.ceiling_warned {
                    self.ceiling_warned = true;
                    tracing::warn!(
                        avg_cpu,
                        max = self.config.max,
                        "sustained pressure at maximum worker count"
                    );
                }
            }
            return ScaleDecision::Hold;
        }

        self.high_streak = 0;
        self.ceiling_warned = false;

        if pressure_low {
            self.low_streak += 1;
            if self.low_streak >= 3 && current_workers > self.config.min {
                self.low_streak = 0;
                tracing::info!(
                    avg_cpu,
                    workers = current_workers,
                    "sustained idle, scaling down"
                );
                return ScaleDecision::Down;
            }
        } else {
            self.low_streak = 0;
        }
        ScaleDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scaler(min: usize, max: usize, cpu_threshold: f64) -> AutoScaler {
        AutoScaler::new(AutoScaleSection {
            enabled: true,
            min,
            max,
            cpu_threshold,
            memory_threshold: 85.0,
            scale_interval: Duration::from_secs(1),
        })
    }

    #[test]
    fn scale_up_needs_two_consecutive_high_intervals() {
        let mut scaler = scaler(2, 6, 80.0);
        assert_eq!(scaler.evaluate(95.0, 10.0, 2), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(95.0, 10.0, 2), ScaleDecision::Up);
        // Streak resets after a scale action.
        assert_eq!(scaler.evaluate(95.0, 10.0, 3), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(95.0, 10.0, 3), ScaleDecision::Up);
    }

    #[test]
    fn one_quiet_interval_breaks_the_high_streak() {
        let mut scaler = scaler(2, 6, 80.0);
        assert_eq!(scaler.evaluate(95.0, 10.0, 2), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(50.0, 10.0, 2), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(95.0, 10.0, 2), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(95.0, 10.0, 2), ScaleDecision::Up);
    }

    #[test]
    fn scale_down_needs_three_consecutive_idle_intervals() {
        let mut scaler = scaler(2, 6, 80.0);
        assert_eq!(scaler.evaluate(20.0, 10.0, 4), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(20.0, 10.0, 4), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(20.0, 10.0, 4), ScaleDecision::Down);
    }

    #[test]
    fn full_ramp_up_and_down_cycle() {
        let mut scaler = scaler(2, 6, 80.0);
        let mut workers = 2usize;

        // Sustained 95% CPU grows the pool to the max, one per two
        // intervals, and never beyond.
        for _ in 0..16 {
            if scaler.evaluate(95.0, 10.0, workers) == ScaleDecision::Up {
                workers += 1;
            }
        }
        assert_eq!(workers, 6);

        // Sustained 20% drains back to the min, one per three intervals.
        for _ in 0..16 {
            if scaler.evaluate(20.0, 10.0, workers) == ScaleDecision::Down {
                workers -= 1;
            }
        }
        assert_eq!(workers, 2);
    }

    #[test]
    fn floor_and_ceiling_are_respected() {
        // At max: never Up.
        let mut pinned = scaler(2, 3, 80.0);
        pinned.evaluate(95.0, 10.0, 3);
        assert_eq!(pinned.evaluate(95.0, 10.0, 3), ScaleDecision::Hold);

        // At min: never Down.
        let mut idle = scaler(2, 3, 80.0);
        for _ in 0..6 {
            assert_eq!(idle.evaluate(10.0, 10.0, 2), ScaleDecision::Hold);
        }
    }

    #[test]
    fn memory_pressure_triggers_the_same_rules() {
        let mut scaler = scaler(2, 6, 80.0);
        assert_eq!(scaler.evaluate(10.0, 95.0, 2), ScaleDecision::Hold);
        assert_eq!(scaler.evaluate(10.0, 95.0, 2), ScaleDecision::Up);
    }

    #[test]
    fn moderate_load_between_half_and_full_threshold_holds() {
        let mut scaler = scaler(2, 6, 80.0);
        for _ in 0..10 {
            assert_eq!(scaler.evaluate(60.0, 10.0, 4), ScaleDecision::Hold);
        }
    }
}
