use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aircraft::{Aircraft, AircraftId, AircraftUsability, Fleet},
    airport::{
        Airport, AirportCode, FleetBalance, FlowControl, FlowControlId, FlowControlIndex,
        FlowDirection,
    },
    task::{FlightTask, TaskArena, TaskId},
};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("malformed airport code `{0}`")]
    BadAirportCode(String),
    #[error("unknown airport {0}")]
    UnknownAirport(AirportCode),
    #[error("unknown aircraft `{0}`")]
    UnknownAircraft(String),
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("aircraft `{0}` has no usability record")]
    MissingUsability(String),
    #[error("recovery window ends before it starts")]
    EmptyWindow,
}

/// Frozen time window the recovery may act on.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RecoveryWindow {
    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        *time >= self.start && *time <= self.end
    }
}

/// Everything the engine reads. Built once through `RecoveryInputBuilder`,
/// immutable while the engine runs.
#[derive(Debug)]
pub struct RecoveryInput {
    pub window: RecoveryWindow,
    pub airports: HashMap<AirportCode, Airport>,
    pub fleet: Fleet,
    pub tasks: TaskArena,
    /// Indexed by `AircraftId`
    pub usability: Vec<AircraftUsability>,
    pub flow_controls: FlowControlIndex,
    pub fleet_balances: Vec<FleetBalance>,
}

impl RecoveryInput {
    #[inline]
    pub fn aircraft(&self, id: AircraftId) -> &Aircraft {
        self.fleet.get(id)
    }

    #[inline]
    pub fn usability(&self, id: AircraftId) -> &AircraftUsability {
        &self.usability[id.index()]
    }

    #[inline]
    pub fn task(&self, id: TaskId) -> &FlightTask {
        self.tasks.get(id)
    }

    /// The task flown right before the window by `aircraft`, if any.
    pub fn last_task(&self, aircraft: AircraftId) -> Option<&FlightTask> {
        self.usability(aircraft).last_task.map(|id| self.tasks.get(id))
    }

    /// Tasks the recovery may act on: everything departing inside the window.
    pub fn recoverable_tasks(&self) -> impl Iterator<Item = &FlightTask> {
        self.tasks
            .iter()
            .filter(move |t| self.window.contains(&t.sched_dep))
    }

    pub fn alternates(&self, airport: AirportCode) -> &[AirportCode] {
        self.airports
            .get(&airport)
            .map(|a| a.alternates.as_slice())
            .unwrap_or(&[])
    }

    /// Flow-control checkpoints consumed by a (recovered) task: its departure
    /// slot and its arrival slot. Ground tasks consume none.
    pub fn flow_hits(&self, task: &FlightTask) -> Vec<FlowControlId> {
        if !task.is_airborne() || self.flow_controls.is_empty() {
            return Vec::new();
        }
        let mut hits = self
            .flow_controls
            .hits(task.dep, FlowDirection::Departure, &task.dep_time);
        hits.extend(
            self.flow_controls
                .hits(task.arr, FlowDirection::Arrival, &task.arr_time),
        );
        hits
    }

    /// Fleet-balance checkpoints satisfied by an aircraft that finishes at
    /// `location`, free from `ready_at`.
    pub fn balance_hits(
        &self,
        aircraft: AircraftId,
        location: AirportCode,
        ready_at: &DateTime<Utc>,
    ) -> Vec<u32> {
        let type_ = &self.aircraft(aircraft).type_;
        self.fleet_balances
            .iter()
            .filter(|b| b.satisfied_by(type_, location, ready_at))
            .map(|b| b.id)
            .collect()
    }
}

/// Two-phase construction of `RecoveryInput`: collect, then validate and freeze.
#[derive(Debug, Default)]
pub struct RecoveryInputBuilder {
    window: Option<RecoveryWindow>,
    airports: HashMap<AirportCode, Airport>,
    fleet: Fleet,
    tasks: TaskArena,
    usability: HashMap<AircraftId, AircraftUsability>,
    flow_controls: Vec<FlowControl>,
    fleet_balances: Vec<FleetBalance>,
}

impl RecoveryInputBuilder {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            window: Some(RecoveryWindow { start, end }),
            ..Default::default()
        }
    }

    pub fn airport(&mut self, airport: Airport) -> &mut Self {
        self.airports.insert(airport.code, airport);
        self
    }

    pub fn has_airport(&self, code: AirportCode) -> bool {
        self.airports.contains_key(&code)
    }

    pub fn fleet_mut(&mut self) -> &mut Fleet {
        &mut self.fleet
    }

    pub fn aircraft_id(&self, registration: &str) -> Option<AircraftId> {
        self.fleet.lookup(registration)
    }

    pub fn task(&mut self, task: FlightTask) -> Result<TaskId, InputError> {
        for code in [task.dep, task.arr] {
            if !self.airports.contains_key(&code) {
                return Err(InputError::UnknownAirport(code));
            }
        }
        Ok(self.tasks.push(task))
    }

    pub fn task_id(&self, key: &str) -> Option<TaskId> {
        self.tasks.lookup(key)
    }

    pub fn usability(&mut self, usability: AircraftUsability) -> Result<&mut Self, InputError> {
        if !self.airports.contains_key(&usability.location) {
            return Err(InputError::UnknownAirport(usability.location));
        }
        self.usability.insert(usability.aircraft, usability);
        Ok(self)
    }

    /// Links an aircraft to the task it flew right before the window.
    pub fn set_last_task(&mut self, aircraft: AircraftId, task: TaskId) -> Result<&mut Self, InputError> {
        let Some(usability) = self.usability.get_mut(&aircraft) else {
            return Err(InputError::UnknownAircraft(format!("#{}", aircraft.0)));
        };
        usability.last_task = Some(task);
        Ok(self)
    }

    pub fn flow_control(&mut self, control: FlowControl) -> Result<&mut Self, InputError> {
        if !self.airports.contains_key(&control.airport) {
            return Err(InputError::UnknownAirport(control.airport));
        }
        self.flow_controls.push(control);
        Ok(self)
    }

    pub fn fleet_balance(&mut self, balance: FleetBalance) -> Result<&mut Self, InputError> {
        if !self.airports.contains_key(&balance.airport) {
            return Err(InputError::UnknownAirport(balance.airport));
        }
        self.fleet_balances.push(balance);
        Ok(self)
    }

    pub fn build(mut self) -> Result<RecoveryInput, InputError> {
        let window = self.window.ok_or(InputError::EmptyWindow)?;
        if window.end < window.start {
            return Err(InputError::EmptyWindow);
        }
        let mut usability = Vec::with_capacity(self.fleet.len());
        for aircraft in self.fleet.iter() {
            let record = self
                .usability
                .remove(&aircraft.id)
                .ok_or_else(|| InputError::MissingUsability(aircraft.registration.clone()))?;
            usability.push(record);
        }
        Ok(RecoveryInput {
            window,
            airports: self.airports,
            fleet: self.fleet,
            tasks: self.tasks,
            usability,
            flow_controls: FlowControlIndex::new(self.flow_controls),
            fleet_balances: self.fleet_balances,
        })
    }
}

// MARK: Configuration

/// Per-heuristic caps of the free-aircraft selector, applied in this order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorQuotas {
    pub gap: usize,
    pub flow_control: usize,
    pub idle: usize,
    pub cost: usize,
    pub cost_density: usize,
    pub flow_shadow: usize,
    pub delay: usize,
    pub aircraft_change: usize,
    pub random: usize,
}

impl Default for SelectorQuotas {
    fn default() -> Self {
        Self {
            gap: 2,
            flow_control: 2,
            idle: 1,
            cost: 1,
            cost_density: 1,
            flow_shadow: 1,
            delay: 1,
            aircraft_change: 1,
            random: 2,
        }
    }
}

/// Cost weights used by `DefaultRules` and the master's penalty variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostWeights {
    pub cancel_base: f64,
    pub cancel_per_passenger: f64,
    pub delay_per_minute: f64,
    pub passenger_delay_per_minute: f64,
    pub advance_per_minute: f64,
    pub aircraft_change: f64,
    pub reroute: f64,
    pub ferry: f64,
    pub maintenance_delay_per_minute: f64,
    pub uncancellable_penalty: f64,
    pub flow_overflow_penalty: f64,
    pub fleet_shortfall_penalty: f64,
    pub tight_turn_penalty: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            cancel_base: 10_000.0,
            cancel_per_passenger: 100.0,
            delay_per_minute: 10.0,
            passenger_delay_per_minute: 0.5,
            advance_per_minute: 20.0,
            aircraft_change: 500.0,
            reroute: 2_000.0,
            ferry: 3_000.0,
            maintenance_delay_per_minute: 50.0,
            uncancellable_penalty: 1e7,
            flow_overflow_penalty: 5_000.0,
            fleet_shortfall_penalty: 8_000.0,
            tight_turn_penalty: 300.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub column_cap: usize,
    pub min_columns_per_free_aircraft: usize,
    pub bad_reduced_cost_columns: usize,
    pub time_limit_secs: u64,
    pub multi_thread: bool,
    pub seed: u64,

    pub max_bunches_per_aircraft: usize,
    pub max_global_passes: usize,
    pub max_local_passes: usize,

    pub stall_limit: u32,
    pub slow_ip_absolute: f64,
    pub slow_ip_relative: f64,
    pub slow_lp_threshold: f64,

    pub removal_threshold: f64,
    pub removal_shrink: f64,
    pub removal_floor: f64,

    pub local_fix_threshold: f64,
    pub local_fix_minimum: f64,

    pub quotas: SelectorQuotas,
    pub tabu_size: usize,
    pub random_attempts: usize,
    pub gap_threshold: f64,

    pub max_delay_minutes: i64,
    pub max_advance_minutes: i64,
    pub turnaround_minutes: i64,
    pub reversal_ceiling_minutes: i64,
    pub allow_early_termination: bool,
    pub tight_turn_minutes: i64,
    pub tight_turn_budget: Option<u32>,

    pub weights: CostWeights,

    pub solver: String,
    pub node_limit: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            column_cap: 3000,
            min_columns_per_free_aircraft: 5,
            bad_reduced_cost_columns: 20,
            time_limit_secs: 300,
            multi_thread: true,
            seed: 42,
            max_bunches_per_aircraft: 60,
            max_global_passes: 10,
            max_local_passes: 50,
            stall_limit: 5,
            slow_ip_absolute: 0.01,
            slow_ip_relative: 0.01,
            slow_lp_threshold: 1000.0,
            removal_threshold: 50.0,
            removal_shrink: 2.0 / 3.0,
            removal_floor: 5.0,
            local_fix_threshold: 0.9,
            local_fix_minimum: 1e-3,
            quotas: SelectorQuotas::default(),
            tabu_size: 6,
            random_attempts: 10090,
            gap_threshold: 1.0,
            max_delay_minutes: 6 * 60,
            max_advance_minutes: 30,
            turnaround_minutes: 40,
            reversal_ceiling_minutes: 3 * 60,
            allow_early_termination: true,
            tight_turn_minutes: 60,
            tight_turn_budget: None,
            weights: CostWeights::default(),
            solver: "highs".to_string(),
            node_limit: 20_000,
        }
    }
}

impl RecoveryConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
    pub fn max_delay(&self) -> TimeDelta {
        TimeDelta::minutes(self.max_delay_minutes)
    }
    pub fn max_advance(&self) -> TimeDelta {
        TimeDelta::minutes(self.max_advance_minutes)
    }
    pub fn turnaround(&self) -> TimeDelta {
        TimeDelta::minutes(self.turnaround_minutes)
    }
    pub fn reversal_ceiling(&self) -> TimeDelta {
        TimeDelta::minutes(self.reversal_ceiling_minutes)
    }
    pub fn tight_turn(&self) -> TimeDelta {
        TimeDelta::minutes(self.tight_turn_minutes)
    }
}
