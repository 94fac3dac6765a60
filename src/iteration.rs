use tracing::debug;

use crate::model::RecoveryConfig;

/// Counters of one recovery run. Created once, never reset.
#[derive(Debug, Clone)]
pub struct Iteration {
    pub index: usize,
    pub best_ip: Option<f64>,
    pub previous_ip: Option<f64>,
    pub best_lp: Option<f64>,
    pub previous_lp: Option<f64>,
    /// Best dual bound seen so far.
    pub lower_bound: Option<f64>,
    pub stall: u32,
    /// LP improvements below this count as slow; halved every outer iteration.
    pub slow_lp_threshold: f64,
    ip_slow: bool,
    lp_slow: bool,
    slow_ip_absolute: f64,
    slow_ip_relative: f64,
    stall_limit: u32,
}

/// Improvement from `previous` to `current` below both the absolute and the
/// relative bar. Minimisation: improving means decreasing.
pub fn is_improvement_slow(previous: Option<f64>, current: f64, absolute: f64, relative: f64) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    let gain = previous - current;
    gain < absolute && gain < relative * previous.abs()
}

impl Iteration {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            index: 0,
            best_ip: None,
            previous_ip: None,
            best_lp: None,
            previous_lp: None,
            lower_bound: None,
            stall: 0,
            slow_lp_threshold: config.slow_lp_threshold,
            ip_slow: false,
            lp_slow: false,
            slow_ip_absolute: config.slow_ip_absolute,
            slow_ip_relative: config.slow_ip_relative,
            stall_limit: config.stall_limit,
        }
    }

    /// Records an integer objective; returns whether it is a new best.
    pub fn record_ip(&mut self, objective: f64) -> bool {
        self.ip_slow = is_improvement_slow(
            self.previous_ip,
            objective,
            self.slow_ip_absolute,
            self.slow_ip_relative,
        );
        self.previous_ip = Some(objective);
        let improved = self.best_ip.map_or(true, |best| objective < best);
        if improved {
            self.best_ip = Some(objective);
        }
        improved
    }

    pub fn record_lp(&mut self, objective: f64) {
        self.lp_slow = self
            .previous_lp
            .is_some_and(|previous| previous - objective < self.slow_lp_threshold);
        self.previous_lp = Some(objective);
        if self.best_lp.map_or(true, |best| objective < best) {
            self.best_lp = Some(objective);
        }
    }

    pub fn record_lower_bound(&mut self, bound: f64) {
        if self.lower_bound.map_or(true, |lb| bound > lb) {
            self.lower_bound = Some(bound);
        }
    }

    /// Closes an outer iteration: bumps the stall counter when the IP moved
    /// slowly, resets it otherwise, and cools the LP bar. LP progress is
    /// reported but never holds the stall counter back.
    pub fn finish(&mut self) {
        if self.ip_slow {
            self.stall += 1;
        } else {
            self.stall = 0;
        }
        self.slow_lp_threshold /= 2.0;
        self.index += 1;
        debug!(
            iteration = self.index,
            stall = self.stall,
            lp_slow = self.lp_slow,
            threshold = self.slow_lp_threshold,
            "iteration finished"
        );
    }

    /// Whether the last relaxation improved by less than the LP bar.
    pub fn lp_slow(&self) -> bool {
        self.lp_slow
    }

    pub fn is_improvement_slow(&self) -> bool {
        self.stall >= self.stall_limit
    }

    /// lower bound / incumbent, in [0, 1].
    pub fn optimality_rate(&self) -> f64 {
        match (self.lower_bound, self.best_ip) {
            (_, Some(best)) if best.abs() < 1e-9 => 1.0,
            (Some(lb), Some(best)) if best > 0.0 => (lb / best).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}
