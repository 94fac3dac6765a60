//! Columns of the master problem: one aircraft's ordered task sequence.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    aircraft::{AircraftId, AircraftUsability},
    airport::AirportCode,
    task::{FlightTask, TaskId},
};

/// Identity of a column for deduplication: who flies what, when.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BunchSignature {
    pub aircraft: AircraftId,
    /// (task, flown route, recovered departure in minutes since the epoch)
    pub legs: Vec<(TaskId, AirportCode, AirportCode, i64)>,
}

/// Fresh routing produced by the pricer or a seed generator, not yet indexed.
#[derive(Debug, Clone)]
pub struct BunchCandidate {
    pub aircraft: AircraftId,
    pub tasks: Vec<FlightTask>,
    pub cost: f64,
    /// Against the duals it was priced with.
    pub reduced_cost: f64,
}

impl BunchCandidate {
    pub fn signature(&self) -> BunchSignature {
        signature_of(self.aircraft, &self.tasks)
    }
}

/// A column. Never mutated after the column store hands out its index.
#[derive(Debug, Clone)]
pub struct FlightTaskBunch {
    pub index: usize,
    pub iteration: usize,
    pub aircraft: AircraftId,
    pub tasks: Vec<FlightTask>,
    pub cost: f64,
}

fn signature_of(aircraft: AircraftId, tasks: &[FlightTask]) -> BunchSignature {
    BunchSignature {
        aircraft,
        legs: tasks
            .iter()
            .map(|t| (t.id, t.dep, t.arr, t.dep_time.timestamp().div_euclid(60)))
            .collect(),
    }
}

/// Ground gap between two airborne legs shorter than `window`.
pub fn is_tight_turn(prev: &FlightTask, next: &FlightTask, window: TimeDelta) -> bool {
    prev.is_airborne() && next.is_airborne() && next.dep_time - prev.arr_time < window
}

impl FlightTaskBunch {
    pub fn from_candidate(candidate: BunchCandidate, index: usize, iteration: usize) -> Self {
        Self {
            index,
            iteration,
            aircraft: candidate.aircraft,
            tasks: candidate.tasks,
            cost: candidate.cost,
        }
    }

    pub fn signature(&self) -> BunchSignature {
        signature_of(self.aircraft, &self.tasks)
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.tasks.iter().any(|t| t.id == task)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.iter().map(|t| t.id)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Where the aircraft ends up.
    pub fn end_location(&self, usability: &AircraftUsability) -> AirportCode {
        self.tasks.last().map_or(usability.location, |t| t.arr)
    }

    pub fn ready_at(&self, usability: &AircraftUsability) -> DateTime<Utc> {
        self.tasks.last().map_or(usability.available_at, |t| t.arr_time)
    }

    pub fn delay_minutes(&self) -> i64 {
        self.tasks
            .iter()
            .map(|t| t.delay().num_minutes().max(0))
            .sum()
    }

    pub fn aircraft_changes(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_aircraft_changed()).count()
    }

    pub fn flight_minutes(&self) -> i64 {
        self.tasks
            .iter()
            .filter(|t| t.is_airborne())
            .map(|t| t.duration().num_minutes())
            .sum()
    }

    /// Ground time between consecutive tasks.
    pub fn idle_minutes(&self, usability: &AircraftUsability) -> i64 {
        let mut ready = usability.available_at;
        let mut idle = 0;
        for task in &self.tasks {
            idle += (task.dep_time - ready).num_minutes().max(0);
            ready = task.arr_time;
        }
        idle
    }

    pub fn tight_turns(&self, first_prev: Option<&FlightTask>, window: TimeDelta) -> u32 {
        let mut prev = first_prev;
        let mut count = 0;
        for task in &self.tasks {
            if prev.is_some_and(|p| is_tight_turn(p, task, window)) {
                count += 1;
            }
            prev = Some(task);
        }
        count
    }

    /// Each task leaves from where the previous one landed, no earlier than
    /// it landed.
    pub fn is_consistent(&self, usability: &AircraftUsability) -> bool {
        let mut location = usability.location;
        let mut ready: Option<DateTime<Utc>> = None;
        for task in &self.tasks {
            if task.dep != location || ready.is_some_and(|r| task.dep_time < r) {
                return false;
            }
            location = task.arr;
            ready = Some(task.arr_time);
        }
        true
    }
}
