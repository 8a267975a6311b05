//! Host-side learning-rate schedule.
//!
//! The schedule is a pure function of the global step plus one piece of
//! persistent state, the plateau divisor. Computing it on the host keeps the
//! staged graph free of control flow; the scheduled rate enters the graph as
//! a plain scalar constant each step.

use tracing::info;

use crate::config::TrainConfig;

/// Windowed plateau detector. Compares the mean loss over the most recent
/// `timespan` steps against an exponential moving average; when the window
/// mean rises above the EMA and at least `timespan` steps have passed since
/// the last reduction, the divisor grows by the configured factor. The
/// divisor never decreases.
#[derive(Debug, Clone)]
pub struct PlateauTracker {
    window: Vec<f64>,
    ema: f64,
    timespan: usize,
    reduction: f64,
    divisor: f64,
    last_reduce: u64,
}

impl PlateauTracker {
    pub fn new(timespan: usize, reduction: f64) -> Self {
        PlateauTracker {
            window: vec![0.0; timespan],
            ema: 0.0,
            timespan,
            reduction,
            divisor: 1.0,
            last_reduce: 0,
        }
    }

    pub fn divisor(&self) -> f64 {
        self.divisor
    }

    /// Feeds one observed loss. Returns true when a reduction fired. A
    /// zero-timespan tracker is inert: it never reduces.
    pub fn observe(&mut self, step: u64, loss: f64) -> bool {
        if self.timespan == 0 {
            return false;
        }
        let slot = (step as usize) % self.timespan;
        self.window[slot] = loss;
        let mean = self.window.iter().sum::<f64>() / self.timespan as f64;
        let keep = 2.0 / self.timespan as f64;
        self.ema = self.ema * keep + loss * (1.0 - keep);

        if step > self.last_reduce + self.timespan as u64 && mean > self.ema {
            self.divisor *= self.reduction;
            self.last_reduce = step;
            info!(step, divisor = self.divisor, "loss plateau, reducing learning rate");
            return true;
        }
        false
    }
}

/// Per-run schedule state: the static warmup/decay curve plus the optional
/// plateau tracker.
#[derive(Debug, Clone)]
pub struct Schedule {
    base: f64,
    warmup_steps: usize,
    decay_multi: f64,
    decay_start: usize,
    decay_min: f64,
    plateau: Option<PlateauTracker>,
}

impl Schedule {
    pub fn from_config(config: &TrainConfig) -> Self {
        let plateau = (config.reduce_lr_on_plateau_timespan > 0).then(|| {
            PlateauTracker::new(
                config.reduce_lr_on_plateau_timespan,
                config.reduce_lr_on_plateau_reduction,
            )
        });
        Schedule {
            base: config.learning_rate as f64,
            warmup_steps: config.warmup_steps,
            decay_multi: config.learning_rate_decay_multi,
            decay_start: config.learning_rate_decay_start_step,
            decay_min: config.learning_rate_decay_min,
            plateau,
        }
    }

    /// The scheduled rate at `step`:
    /// `base * warmup(step) * decay(step) / plateau_divisor`.
    pub fn learning_rate(&self, step: u64) -> f64 {
        let mut rate = self.base;

        if self.warmup_steps > 0 && step < self.warmup_steps as u64 {
            rate *= step as f64 / self.warmup_steps as f64;
        }

        // decay_multi of exactly 0 or 1 means the decay term is disabled.
        if self.decay_multi != 0.0 && self.decay_multi != 1.0 {
            let elapsed = step.saturating_sub(self.decay_start as u64) as f64;
            rate = (rate * self.decay_multi.powf(elapsed)).max(self.decay_min);
        }

        if let Some(plateau) = &self.plateau {
            rate /= plateau.divisor();
        }
        rate
    }

    /// Feeds the summed loss of one step into the plateau tracker.
    pub fn observe_loss(&mut self, step: u64, loss: f64) {
        if let Some(plateau) = &mut self.plateau {
            plateau.observe(step, loss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainConfig {
        TrainConfig {
            learning_rate: 1.0,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn warmup_is_half_rate_halfway_through() {
        let mut cfg = config();
        cfg.warmup_steps = 1000;
        let schedule = Schedule::from_config(&cfg);
        assert_eq!(schedule.learning_rate(500), 0.5);
        assert_eq!(schedule.learning_rate(1000), 1.0);
        assert_eq!(schedule.learning_rate(5000), 1.0);
    }

    #[test]
    fn decay_respects_start_step_and_floor() {
        let mut cfg = config();
        cfg.learning_rate_decay_multi = 0.5;
        cfg.learning_rate_decay_start_step = 10;
        cfg.learning_rate_decay_min = 0.1;
        let schedule = Schedule::from_config(&cfg);
        assert_eq!(schedule.learning_rate(10), 1.0);
        assert_eq!(schedule.learning_rate(11), 0.5);
        assert_eq!(schedule.learning_rate(100), 0.1);
    }

    #[test]
    fn zero_timespan_tracker_is_inert() {
        let mut tracker = PlateauTracker::new(0, 2.0);
        for step in 0..8 {
            assert!(!tracker.observe(step, 1.0));
        }
        assert_eq!(tracker.divisor(), 1.0);
    }

    #[test]
    fn plateau_fires_once_per_timespan() {
        let mut tracker = PlateauTracker::new(4, 2.0);
        // The EMA hugs the latest loss, so while losses trend upward the
        // lagging window mean stays below it and nothing fires.
        for step in 0..=20 {
            assert!(!tracker.observe(step, step as f64));
        }
        assert_eq!(tracker.divisor(), 1.0);

        // The trend breaks: the stale window mean overtakes the EMA and a
        // single reduction fires; the timespan guard blocks repeats.
        let mut fired = 0;
        for step in 21..=25 {
            if tracker.observe(step, 0.0) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(tracker.divisor(), 2.0);
    }
}
