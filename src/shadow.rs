//! Dual values of the master rows, keyed by the entity each row belongs to.
//!
//! The map is rebuilt after every master LP solve and then only read: the
//! pricer calls [`ShadowPriceMap::price`] from many threads at once.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    aircraft::AircraftId,
    airport::{AirportCode, FleetBalanceId, FlowControlId},
    bunch::{is_tight_turn, FlightTaskBunch},
    model::RecoveryInput,
    task::{FlightTask, TaskId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowPriceKey {
    Aircraft(AircraftId),
    FlightTask(TaskId),
    FlowControl(FlowControlId),
    FleetBalance(FleetBalanceId),
    TightTurn,
}

/// One family per master constraint group. The prefix is the row-name
/// prefix the master uses for that group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowFamily {
    Aircraft,
    FlightTask,
    FlowControl,
    FleetBalance,
    TightTurn,
}

impl ShadowFamily {
    pub const ALL: [ShadowFamily; 5] = [
        ShadowFamily::Aircraft,
        ShadowFamily::FlightTask,
        ShadowFamily::FlowControl,
        ShadowFamily::FleetBalance,
        ShadowFamily::TightTurn,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ShadowFamily::Aircraft => "aircraft:",
            ShadowFamily::FlightTask => "task:",
            ShadowFamily::FlowControl => "flow:",
            ShadowFamily::FleetBalance => "balance:",
            ShadowFamily::TightTurn => "tight_turn",
        }
    }

    fn owns(self, key: &ShadowPriceKey) -> bool {
        matches!(
            (self, key),
            (ShadowFamily::Aircraft, ShadowPriceKey::Aircraft(_))
                | (ShadowFamily::FlightTask, ShadowPriceKey::FlightTask(_))
                | (ShadowFamily::FlowControl, ShadowPriceKey::FlowControl(_))
                | (ShadowFamily::FleetBalance, ShadowPriceKey::FleetBalance(_))
                | (ShadowFamily::TightTurn, ShadowPriceKey::TightTurn)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ShadowPriceMap {
    values: HashMap<ShadowPriceKey, f64>,
    tight_turn: TimeDelta,
}

impl ShadowPriceMap {
    pub fn new(tight_turn: TimeDelta) -> Self {
        Self {
            values: HashMap::new(),
            tight_turn,
        }
    }

    /// Replaces every entry of `family` with the duals of the rows whose
    /// name carries the family prefix. `rows` and `duals` are in row order.
    pub fn refresh(&mut self, family: ShadowFamily, rows: &[(String, ShadowPriceKey)], duals: &[f64]) {
        self.values.retain(|key, _| !family.owns(key));
        for ((name, key), dual) in rows.iter().zip(duals) {
            if name.starts_with(family.prefix()) && dual.is_finite() {
                self.values.insert(*key, *dual);
            }
        }
    }

    pub fn set(&mut self, key: ShadowPriceKey, value: f64) {
        self.values.insert(key, value);
    }

    #[inline]
    pub fn get(&self, key: ShadowPriceKey) -> f64 {
        self.values.get(&key).copied().unwrap_or(0.0)
    }

    pub fn aircraft_price(&self, aircraft: AircraftId) -> f64 {
        self.get(ShadowPriceKey::Aircraft(aircraft))
    }

    /// Dual credit for flying the recovered `task` after `prev`.
    pub fn price(
        &self,
        input: &RecoveryInput,
        prev: Option<&FlightTask>,
        task: &FlightTask,
    ) -> f64 {
        let origin = task.origin.unwrap_or(task.id);
        let mut value = self.get(ShadowPriceKey::FlightTask(origin));
        for hit in input.flow_hits(task) {
            value += self.get(ShadowPriceKey::FlowControl(hit));
        }
        if prev.is_some_and(|p| is_tight_turn(p, task, self.tight_turn)) {
            value += self.get(ShadowPriceKey::TightTurn);
        }
        value
    }

    /// Dual credit for ending the day at `location`, ready from `ready_at`.
    pub fn end_price(
        &self,
        input: &RecoveryInput,
        aircraft: AircraftId,
        location: AirportCode,
        ready_at: &DateTime<Utc>,
    ) -> f64 {
        input
            .balance_hits(aircraft, location, ready_at)
            .into_iter()
            .map(|id| self.get(ShadowPriceKey::FleetBalance(id)))
            .sum()
    }

    pub fn reduced_cost(&self, input: &RecoveryInput, bunch: &FlightTaskBunch) -> f64 {
        let usability = input.usability(bunch.aircraft);
        let mut credit = self.aircraft_price(bunch.aircraft);
        let mut prev = input.last_task(bunch.aircraft);
        for task in &bunch.tasks {
            credit += self.price(input, prev, task);
            prev = Some(task);
        }
        credit += self.end_price(
            input,
            bunch.aircraft,
            bunch.end_location(usability),
            &bunch.ready_at(usability),
        );
        bunch.cost - credit
    }
}
