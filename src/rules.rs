//! Domain rules consumed by the engine: feasibility, connection times and costs.
//!
//! Everything here is a pure function of its arguments. The engine calls
//! these from parallel pricing threads, so implementations must be `Sync`
//! and must not keep hidden mutable state.

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::{
    aircraft::Aircraft,
    model::{CostWeights, RecoveryConfig},
    task::{FlightTask, TaskKind},
};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("task `{task}` is malformed: {reason}")]
    MalformedTask { task: String, reason: &'static str },
}

pub trait RecoveryRules: Send + Sync {
    /// Can `aircraft` fly `task` right after `prev` (or as its first task)?
    fn is_feasible(
        &self,
        aircraft: &Aircraft,
        prev: Option<&FlightTask>,
        task: &FlightTask,
    ) -> Result<bool, RuleError>;

    /// Minimum ground time between `prev` arriving and `next` departing.
    fn connection_time(&self, aircraft: &Aircraft, prev: &FlightTask, next: &FlightTask)
        -> TimeDelta;

    /// Earliest departure of `task` given the aircraft is ready at `ready`.
    fn min_departure_time(
        &self,
        aircraft: &Aircraft,
        prev: Option<&FlightTask>,
        task: &FlightTask,
        ready: DateTime<Utc>,
    ) -> DateTime<Utc>;

    /// Cost of flying the recovered `task` after `prev`. `None` rejects the edge.
    fn edge_cost(&self, aircraft: &Aircraft, prev: Option<&FlightTask>, task: &FlightTask)
        -> Option<f64>;

    /// Total cost of a complete routing. `None` rejects the routing.
    fn sequence_cost(
        &self,
        aircraft: &Aircraft,
        first_prev: Option<&FlightTask>,
        tasks: &[FlightTask],
    ) -> Option<f64> {
        let mut total = 0.0;
        let mut prev = first_prev;
        for task in tasks {
            total += self.edge_cost(aircraft, prev, task)?;
            prev = Some(task);
        }
        total.is_finite().then_some(total)
    }

    fn cancel_cost(&self, task: &FlightTask) -> f64;

    fn delay_cost(&self, task: &FlightTask, delay: TimeDelta) -> f64;
}

/// Rules driven by `RecoveryConfig` weights.
#[derive(Debug, Clone)]
pub struct DefaultRules {
    weights: CostWeights,
    turnaround: TimeDelta,
    max_delay: TimeDelta,
    max_advance: TimeDelta,
}

impl DefaultRules {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            turnaround: config.turnaround(),
            max_delay: config.max_delay(),
            max_advance: config.max_advance(),
        }
    }
}

impl RecoveryRules for DefaultRules {
    fn is_feasible(
        &self,
        aircraft: &Aircraft,
        prev: Option<&FlightTask>,
        task: &FlightTask,
    ) -> Result<bool, RuleError> {
        if task.sched_arr < task.sched_dep {
            return Err(RuleError::MalformedTask {
                task: task.key.clone(),
                reason: "arrives before it departs",
            });
        }
        let own = task.scheduled_aircraft == Some(aircraft.id);
        let allowed = match &task.kind {
            TaskKind::Aog | TaskKind::Maintenance => own,
            TaskKind::Flight { passengers, .. } => {
                (own || task.flags.aircraft_change) && u32::from(aircraft.capacity) >= *passengers
            }
            TaskKind::Transfer => own || task.flags.aircraft_change || task.aircraft.is_none(),
        };
        // Departing somewhere other than where the aircraft landed is a reroute
        let misplaced = prev.is_some_and(|p| p.arr != task.dep) && !task.flags.reroute;
        Ok(allowed && !misplaced)
    }

    fn connection_time(
        &self,
        _aircraft: &Aircraft,
        prev: &FlightTask,
        next: &FlightTask,
    ) -> TimeDelta {
        if prev.is_airborne() && next.is_airborne() {
            self.turnaround
        } else {
            TimeDelta::zero()
        }
    }

    fn min_departure_time(
        &self,
        _aircraft: &Aircraft,
        _prev: Option<&FlightTask>,
        _task: &FlightTask,
        ready: DateTime<Utc>,
    ) -> DateTime<Utc> {
        ready
    }

    fn edge_cost(
        &self,
        aircraft: &Aircraft,
        _prev: Option<&FlightTask>,
        task: &FlightTask,
    ) -> Option<f64> {
        let delay = task.delay();
        if delay > self.max_delay || -delay > self.max_advance {
            return None;
        }
        if delay > TimeDelta::zero() && !task.flags.delay {
            return None;
        }
        if delay < TimeDelta::zero() && !task.flags.advance {
            return None;
        }

        let mut cost = if delay >= TimeDelta::zero() {
            self.delay_cost(task, delay)
        } else {
            self.weights.advance_per_minute * (-delay).num_minutes() as f64
        };
        if matches!(task.kind, TaskKind::Transfer) {
            cost += self.weights.ferry;
        }
        if task.scheduled_aircraft.is_some() && task.scheduled_aircraft != Some(aircraft.id) {
            cost += self.weights.aircraft_change;
        }
        if task.is_rerouted() {
            cost += self.weights.reroute;
        }
        cost.is_finite().then_some(cost)
    }

    fn cancel_cost(&self, task: &FlightTask) -> f64 {
        if task.is_mandatory() {
            return self.weights.uncancellable_penalty;
        }
        match &task.kind {
            TaskKind::Flight { passengers, .. } => {
                self.weights.cancel_base + self.weights.cancel_per_passenger * f64::from(*passengers)
            }
            TaskKind::Transfer => 0.0,
            TaskKind::Maintenance | TaskKind::Aog => self.weights.uncancellable_penalty,
        }
    }

    fn delay_cost(&self, task: &FlightTask, delay: TimeDelta) -> f64 {
        let minutes = delay.num_minutes().max(0) as f64;
        match &task.kind {
            TaskKind::Flight { passengers, .. } => {
                minutes
                    * (self.weights.delay_per_minute
                        + self.weights.passenger_delay_per_minute * f64::from(*passengers))
            }
            TaskKind::Transfer => minutes * self.weights.delay_per_minute,
            TaskKind::Maintenance => minutes * self.weights.maintenance_delay_per_minute,
            TaskKind::Aog => 0.0,
        }
    }
}
