use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::RecoveryOutput;

/// Solve counts and wall-clock spent per phase of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceCounters {
    pub iterations: usize,
    pub lp_solves: usize,
    pub lp_time: Duration,
    pub ip_solves: usize,
    pub ip_time: Duration,
    pub pricing_passes: usize,
    pub pricing_time: Duration,
    pub graph_time: Duration,
    pub columns_generated: usize,
    pub columns_removed: usize,
    pub columns_fixed: usize,
}

impl PerformanceCounters {
    pub fn record_lp(&mut self, started: Instant) {
        self.lp_solves += 1;
        self.lp_time += started.elapsed();
    }

    pub fn record_ip(&mut self, started: Instant) {
        self.ip_solves += 1;
        self.ip_time += started.elapsed();
    }

    pub fn record_pricing(&mut self, started: Instant, generated: usize) {
        self.pricing_passes += 1;
        self.pricing_time += started.elapsed();
        self.columns_generated += generated;
    }
}

pub struct RecoveryEvent {
    pub time: DateTime<Utc>,
    pub data: RecoveryEventType,
}

#[derive(Debug, Clone)]
pub enum RecoveryEventType {
    /// Sent once per outer iteration.
    Heartbeat { iteration: usize, optimality_rate: f64 },
    /// A new best integer solution.
    PartialOutput(Box<RecoveryOutput>),
    Finished { success: bool, objective: Option<f64> },
}

/// Publishes on an optional `mpsc::Sender<RecoveryEvent>`. A dropped
/// receiver only silences the events.
macro_rules! send_event {
    ( $publisher:expr, $ev:expr ) => {{
        if let Some(publisher) = $publisher.as_ref() {
            let _ = publisher.send($crate::metrics::RecoveryEvent {
                time: ::chrono::Utc::now(),
                data: $ev,
            });
        }
    }};
}
pub(crate) use send_event;
