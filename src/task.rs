//! Flight tasks: the units of work the recovery assigns, retimes or cancels.
//!
//! Original tasks live in a `TaskArena` and are addressed by `TaskId`.
//! A recovered task is a new value derived from its origin through a
//! `RecoveryPolicy`; it keeps the origin's id and records the origin as a
//! back-reference, so "what was scheduled" is always an arena lookup.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{aircraft::AircraftId, airport::AirportCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u32);

impl TaskId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Flight { flight_number: String, passengers: u32 },
    Maintenance,
    /// Aircraft-on-ground: the aircraft is unserviceable at a station for the window.
    Aog,
    /// Ferry / positioning leg without passengers.
    Transfer,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Flight { .. } => "flight",
            TaskKind::Maintenance => "maintenance",
            TaskKind::Aog => "aog",
            TaskKind::Transfer => "transfer",
        }
    }
}

/// What a recovery is allowed to do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskFlags {
    pub cancel: bool,
    pub delay: bool,
    pub advance: bool,
    pub aircraft_change: bool,
    pub reroute: bool,
}

impl TaskFlags {
    pub fn all() -> Self {
        Self {
            cancel: true,
            delay: true,
            advance: true,
            aircraft_change: true,
            reroute: true,
        }
    }

    pub fn locked() -> Self {
        Self::default()
    }
}

/// Override applied to an origin task to obtain its recovered form.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub aircraft: AircraftId,
    pub departure: DateTime<Utc>,
    /// Replacement (departure, arrival) airports.
    pub route: Option<(AirportCode, AirportCode)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlightTask {
    pub id: TaskId,
    pub key: String,
    pub kind: TaskKind,
    pub dep: AirportCode,
    pub arr: AirportCode,
    pub sched_dep: DateTime<Utc>,
    pub sched_arr: DateTime<Utc>,
    pub dep_time: DateTime<Utc>,
    pub arr_time: DateTime<Utc>,
    pub aircraft: Option<AircraftId>,
    /// Assignment before recovery; never changed by `recover`.
    pub scheduled_aircraft: Option<AircraftId>,
    pub flags: TaskFlags,
    /// Set on recovered tasks only.
    pub origin: Option<TaskId>,
    pub policy: Option<RecoveryPolicy>,
}

impl FlightTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: impl Into<String>,
        kind: TaskKind,
        dep: AirportCode,
        arr: AirportCode,
        sched_dep: DateTime<Utc>,
        sched_arr: DateTime<Utc>,
        aircraft: Option<AircraftId>,
        flags: TaskFlags,
    ) -> Self {
        Self {
            id: TaskId(u32::MAX),
            key: key.into(),
            kind,
            dep,
            arr,
            sched_dep,
            sched_arr,
            dep_time: sched_dep,
            arr_time: sched_arr,
            aircraft,
            scheduled_aircraft: aircraft,
            flags,
            origin: None,
            policy: None,
        }
    }

    /// Derives the recovered task. The block time of the origin is preserved.
    pub fn recover(&self, policy: RecoveryPolicy) -> FlightTask {
        let (dep, arr) = policy.route.unwrap_or((self.dep, self.arr));
        FlightTask {
            id: self.id,
            key: self.key.clone(),
            kind: self.kind.clone(),
            dep,
            arr,
            sched_dep: self.sched_dep,
            sched_arr: self.sched_arr,
            dep_time: policy.departure,
            arr_time: policy.departure + self.duration(),
            aircraft: Some(policy.aircraft),
            scheduled_aircraft: self.scheduled_aircraft,
            flags: self.flags,
            origin: Some(self.origin.unwrap_or(self.id)),
            policy: Some(policy),
        }
    }

    #[inline]
    pub fn duration(&self) -> TimeDelta {
        self.sched_arr - self.sched_dep
    }

    /// Positive when late, negative when advanced.
    #[inline]
    pub fn delay(&self) -> TimeDelta {
        self.dep_time - self.sched_dep
    }

    #[inline]
    pub fn is_airborne(&self) -> bool {
        matches!(self.kind, TaskKind::Flight { .. } | TaskKind::Transfer)
    }

    #[inline]
    pub fn is_ground(&self) -> bool {
        !self.is_airborne()
    }

    pub fn passengers(&self) -> u32 {
        match &self.kind {
            TaskKind::Flight { passengers, .. } => *passengers,
            _ => 0,
        }
    }

    pub fn flight_number(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Flight { flight_number, .. } => Some(flight_number),
            _ => None,
        }
    }

    /// Tasks that must be flown by their assigned aircraft at their own time.
    pub fn is_locked(&self) -> bool {
        matches!(self.kind, TaskKind::Aog)
            || (!self.flags.delay && !self.flags.advance && !self.flags.aircraft_change)
    }

    /// Tasks the master problem may not cancel without paying the
    /// uncancellable penalty.
    pub fn is_mandatory(&self) -> bool {
        matches!(self.kind, TaskKind::Maintenance | TaskKind::Aog) || !self.flags.cancel
    }

    /// Flown by an aircraft other than the one it was scheduled on.
    pub fn is_aircraft_changed(&self) -> bool {
        self.scheduled_aircraft.is_some() && self.aircraft != self.scheduled_aircraft
    }

    pub fn is_rerouted(&self) -> bool {
        self.policy.as_ref().is_some_and(|p| p.route.is_some())
    }
}

/// Original tasks of a run, indexed by `TaskId` and grouped by departure airport.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: Vec<FlightTask>,
    by_key: HashMap<String, TaskId>,
    by_departure: HashMap<AirportCode, Vec<TaskId>>,
}

impl TaskArena {
    /// Adds an original task and returns its id; duplicate keys return the
    /// already-registered id.
    pub fn push(&mut self, mut task: FlightTask) -> TaskId {
        if let Some(id) = self.by_key.get(&task.key) {
            return *id;
        }
        let id = TaskId(self.tasks.len() as u32);
        task.id = id;
        task.origin = None;
        task.policy = None;
        self.by_key.insert(task.key.clone(), id);
        let group = self.by_departure.entry(task.dep).or_default();
        let position = group.partition_point(|other| {
            let other = &self.tasks[other.index()];
            (other.sched_dep, other.id) < (task.sched_dep, id)
        });
        group.insert(position, id);
        self.tasks.push(task);
        id
    }

    #[inline]
    pub fn get(&self, id: TaskId) -> &FlightTask {
        &self.tasks[id.index()]
    }

    pub fn lookup(&self, key: &str) -> Option<TaskId> {
        self.by_key.get(key).copied()
    }

    /// Tasks departing `airport`, ascending by scheduled departure.
    pub fn departing(&self, airport: AirportCode) -> &[TaskId] {
        self.by_departure
            .get(&airport)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlightTask> {
        self.tasks.iter()
    }

    /// Tasks originally assigned to `aircraft`, ascending by scheduled departure.
    pub fn assigned_to(&self, aircraft: AircraftId) -> Vec<&FlightTask> {
        let mut tasks: Vec<&FlightTask> = self
            .tasks
            .iter()
            .filter(|t| t.aircraft == Some(aircraft))
            .collect();
        tasks.sort_by_key(|t| (t.sched_dep, t.id));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> AirportCode {
        s.parse().unwrap()
    }

    fn flight(key: &str, dep: &str, arr: &str, at: DateTime<Utc>) -> FlightTask {
        FlightTask::new(
            key,
            TaskKind::Flight {
                flight_number: key.to_uppercase(),
                passengers: 100,
            },
            code(dep),
            code(arr),
            at,
            at + TimeDelta::hours(2),
            Some(AircraftId(0)),
            TaskFlags::all(),
        )
    }

    #[test]
    fn recover_keeps_identity_and_block_time() {
        let t0 = Utc::now();
        let mut arena = TaskArena::default();
        let id = arena.push(flight("f1", "PEK", "SHA", t0));
        let origin = arena.get(id);

        let recovered = origin.recover(RecoveryPolicy {
            aircraft: AircraftId(3),
            departure: t0 + TimeDelta::minutes(45),
            route: None,
        });
        assert_eq!(recovered.id, id);
        assert_eq!(recovered.origin, Some(id));
        assert_eq!(recovered.aircraft, Some(AircraftId(3)));
        assert_eq!(recovered.scheduled_aircraft, Some(AircraftId(0)));
        assert!(recovered.is_aircraft_changed());
        assert_eq!(recovered.delay(), TimeDelta::minutes(45));
        assert_eq!(recovered.arr_time - recovered.dep_time, TimeDelta::hours(2));
        assert_eq!(arena.get(id).dep_time, t0);

        // Recovering a recovered task still points at the arena origin
        let twice = recovered.recover(RecoveryPolicy {
            aircraft: AircraftId(1),
            departure: t0,
            route: Some((code("NAY"), code("SHA"))),
        });
        assert_eq!(twice.origin, Some(id));
        assert_eq!(twice.dep, code("NAY"));
        assert!(twice.is_rerouted());
    }

    #[test]
    fn arena_groups_departures_in_time_order() {
        let t0 = Utc::now();
        let mut arena = TaskArena::default();
        let late = arena.push(flight("late", "PEK", "SHA", t0 + TimeDelta::hours(3)));
        let early = arena.push(flight("early", "PEK", "CAN", t0));
        let other = arena.push(flight("other", "SHA", "PEK", t0));
        let dup = arena.push(flight("early", "PEK", "CAN", t0));

        assert_eq!(dup, early);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.departing(code("PEK")), &[early, late]);
        assert_eq!(arena.departing(code("SHA")), &[other]);
        assert!(arena.departing(code("CAN")).is_empty());
        assert_eq!(arena.lookup("late"), Some(late));
    }

    #[test]
    fn mandatory_and_locked_follow_kind_and_flags() {
        let t0 = Utc::now();
        let mut aog = flight("aog", "PEK", "PEK", t0);
        aog.kind = TaskKind::Aog;
        aog.flags = TaskFlags::locked();
        assert!(aog.is_mandatory());
        assert!(aog.is_locked());
        assert!(aog.is_ground());

        let f = flight("f", "PEK", "SHA", t0);
        assert!(!f.is_mandatory());
        assert!(!f.is_locked());
        assert_eq!(f.passengers(), 100);
    }
}
