//! Defines adapters for constructing recovery inputs from external sources.

use chrono::{DateTime, NaiveDateTime, ParseError, TimeDelta, Utc};
use rusqlite::{Connection, Row};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    aircraft::AircraftUsability,
    airport::{Airport, AirportCode, FleetBalance, FlowControl, FlowDirection},
    model::{InputError, RecoveryConfig, RecoveryInput, RecoveryInputBuilder},
    task::{FlightTask, TaskFlags, TaskKind},
};

pub trait ScenarioLoader<E: std::fmt::Debug> {
    fn read_config(&self) -> Result<RecoveryConfig, E>;
    fn read_input(&self) -> Result<RecoveryInput, E>;
}

#[derive(Debug, Error)]
pub enum ScenarioLoaderError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("missing required data: {0}")]
    MissingRequiredData(&'static str),
    #[error("bad timestamp: {0}")]
    Format(#[from] ParseError),
    #[error(transparent)]
    Input(#[from] InputError),
}

pub struct SqliteScenarioLoader {
    conn: Connection,
    id: String,
}

impl SqliteScenarioLoader {
    const TIME_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    pub fn new(path: &str, scenario_id: String) -> Result<Self, ScenarioLoaderError> {
        Ok(Self {
            conn: Connection::open(path)?,
            id: scenario_id,
        })
    }

    pub fn from_connection(conn: Connection, scenario_id: String) -> Self {
        Self {
            conn,
            id: scenario_id,
        }
    }

    fn parse_time(time: &str) -> Result<DateTime<Utc>, ScenarioLoaderError> {
        Ok(NaiveDateTime::parse_from_str(time, Self::TIME_FORMAT)?.and_utc())
    }

    fn time(row: &Row, column: &str) -> Result<DateTime<Utc>, ScenarioLoaderError> {
        Self::parse_time(&row.get::<&str, String>(column)?)
    }

    /// `None` (with a warning) for codes that are malformed or not in the scenario.
    fn airport(builder: &RecoveryInputBuilder, code: &str, what: &str) -> Option<AirportCode> {
        match code.parse::<AirportCode>() {
            Ok(code) if builder.has_airport(code) => Some(code),
            _ => {
                warn!(code, what, "skipping record with unknown airport");
                None
            }
        }
    }

    fn read_window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), ScenarioLoaderError> {
        let mut stmt = self
            .conn
            .prepare("SELECT start_time, end_time FROM scenarios WHERE sid = (?1)")?;
        let mut rows = stmt.query([&self.id])?;
        let Some(row) = rows.next()? else {
            return Err(ScenarioLoaderError::MissingRequiredData("Missing config info"));
        };
        Ok((Self::time(row, "start_time")?, Self::time(row, "end_time")?))
    }

    fn read_airports(&self, builder: &mut RecoveryInputBuilder) -> Result<(), ScenarioLoaderError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code, alternates FROM airports WHERE sid = (?1)")?;
        let mut rows = stmt.query([&self.id])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            let code: String = row.get("code")?;
            let Ok(code) = code.parse::<AirportCode>() else {
                warn!(%code, "skipping malformed airport code");
                continue;
            };
            builder.airport(Airport::new(code));
            let alternates: Option<String> = row.get("alternates")?;
            if let Some(alternates) = alternates {
                pending.push((code, alternates));
            }
        }
        // alternates may name airports listed later
        for (code, alternates) in pending {
            let mut airport = Airport::new(code);
            for alternate in alternates.split('-').filter(|s| !s.is_empty()) {
                if let Some(alternate) = Self::airport(builder, alternate, "alternate") {
                    airport.alternates.push(alternate);
                }
            }
            builder.airport(airport);
        }
        Ok(())
    }

    fn read_aircraft(&self, builder: &mut RecoveryInputBuilder) -> Result<Vec<(String, String)>, ScenarioLoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT tail, typename, minor_type, capacity, location, available_at, last_task, max_flight_minutes, max_cycles FROM aircraft WHERE sid = (?1)",
        )?;
        let mut rows = stmt.query([&self.id])?;
        let mut last_tasks = Vec::new();
        while let Some(row) = rows.next()? {
            let tail: String = row.get("tail")?;
            let Some(location) = Self::airport(builder, &row.get::<&str, String>("location")?, &tail)
            else {
                continue;
            };
            let typename: String = row.get("typename")?;
            let minor_type: Option<String> = row.get("minor_type")?;
            let id = builder.fleet_mut().register(
                &tail,
                &typename,
                minor_type.as_deref().unwrap_or(&typename),
                row.get("capacity")?,
            );
            let flight_minutes: Option<i64> = row.get("max_flight_minutes")?;
            builder
                .fleet_mut()
                .set_limits(id, flight_minutes.map(TimeDelta::minutes), row.get("max_cycles")?);
            builder.usability(AircraftUsability {
                aircraft: id,
                last_task: None,
                location,
                available_at: Self::time(row, "available_at")?,
            })?;
            if let Some(last_task) = row.get::<&str, Option<String>>("last_task")? {
                last_tasks.push((tail, last_task));
            }
        }
        Ok(last_tasks)
    }

    fn read_tasks(&self, builder: &mut RecoveryInputBuilder) -> Result<(), ScenarioLoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, kind, flight_number, passengers, origin, dest, sched_depart, sched_arrive, aircraft, can_cancel, can_delay, can_advance, can_swap, can_reroute FROM tasks WHERE sid = ?1 ORDER BY sched_depart, key",
        )?;
        let mut rows = stmt.query([&self.id])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get("key")?;
            let kind = match row.get::<&str, String>("kind")?.as_str() {
                "flight" => TaskKind::Flight {
                    flight_number: row
                        .get::<&str, Option<String>>("flight_number")?
                        .unwrap_or_else(|| key.clone()),
                    passengers: row.get::<&str, Option<u32>>("passengers")?.unwrap_or(0),
                },
                "maintenance" => TaskKind::Maintenance,
                "aog" => TaskKind::Aog,
                "transfer" => TaskKind::Transfer,
                other => {
                    warn!(%key, kind = other, "skipping task of unknown kind");
                    continue;
                }
            };
            let (Some(dep), Some(arr)) = (
                Self::airport(builder, &row.get::<&str, String>("origin")?, &key),
                Self::airport(builder, &row.get::<&str, String>("dest")?, &key),
            ) else {
                continue;
            };
            let aircraft = match row.get::<&str, Option<String>>("aircraft")? {
                Some(tail) => match builder.aircraft_id(&tail) {
                    Some(id) => Some(id),
                    None => {
                        warn!(%key, %tail, "skipping task assigned to unknown aircraft");
                        continue;
                    }
                },
                None => None,
            };
            let flags = TaskFlags {
                cancel: row.get("can_cancel")?,
                delay: row.get("can_delay")?,
                advance: row.get("can_advance")?,
                aircraft_change: row.get("can_swap")?,
                reroute: row.get("can_reroute")?,
            };
            builder.task(FlightTask::new(
                key,
                kind,
                dep,
                arr,
                Self::time(row, "sched_depart")?,
                Self::time(row, "sched_arrive")?,
                aircraft,
                flags,
            ))?;
        }
        Ok(())
    }

    fn link_last_tasks(
        builder: &mut RecoveryInputBuilder,
        last_tasks: Vec<(String, String)>,
    ) -> Result<(), ScenarioLoaderError> {
        for (tail, key) in last_tasks {
            let (Some(aircraft), Some(task)) = (builder.aircraft_id(&tail), builder.task_id(&key)) else {
                warn!(%tail, %key, "ignoring unknown last task");
                continue;
            };
            builder.set_last_task(aircraft, task)?;
        }
        Ok(())
    }

    fn read_flow_controls(&self, builder: &mut RecoveryInputBuilder) -> Result<(), ScenarioLoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, airport, direction, start, end, capacity FROM flow_controls WHERE sid = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query([&self.id])?;
        while let Some(row) = rows.next()? {
            let id: u32 = row.get("id")?;
            let Some(airport) = Self::airport(builder, &row.get::<&str, String>("airport")?, "flow control")
            else {
                continue;
            };
            let direction = match row.get::<&str, String>("direction")?.as_str() {
                "departure" | "dep" => FlowDirection::Departure,
                "arrival" | "arr" => FlowDirection::Arrival,
                other => {
                    warn!(id, direction = other, "skipping flow control with unknown direction");
                    continue;
                }
            };
            builder.flow_control(FlowControl {
                id,
                airport,
                direction,
                start: Self::time(row, "start")?,
                end: Self::time(row, "end")?,
                capacity: row.get("capacity")?,
            })?;
        }
        Ok(())
    }

    fn read_fleet_balances(&self, builder: &mut RecoveryInputBuilder) -> Result<(), ScenarioLoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, airport, typename, deadline, required FROM fleet_balances WHERE sid = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query([&self.id])?;
        while let Some(row) = rows.next()? {
            let Some(airport) = Self::airport(builder, &row.get::<&str, String>("airport")?, "fleet balance")
            else {
                continue;
            };
            builder.fleet_balance(FleetBalance {
                id: row.get("id")?,
                airport,
                aircraft_type: row.get("typename")?,
                deadline: Self::time(row, "deadline")?,
                required: row.get("required")?,
            })?;
        }
        Ok(())
    }
}

impl ScenarioLoader<ScenarioLoaderError> for SqliteScenarioLoader {
    /// Scenario columns override the defaults; NULL keeps the default.
    fn read_config(&self) -> Result<RecoveryConfig, ScenarioLoaderError> {
        let mut stmt = self.conn.prepare(
            "SELECT max_delay, turnaround_time, time_limit, column_cap, multi_thread, seed, solver FROM scenarios WHERE sid = (?1)",
        )?;
        let mut rows = stmt.query([&self.id])?;
        let Some(row) = rows.next()? else {
            return Err(ScenarioLoaderError::MissingRequiredData("Missing config info"));
        };

        let mut config = RecoveryConfig::default();
        if let Some(minutes) = row.get("max_delay")? {
            config.max_delay_minutes = minutes;
        }
        if let Some(minutes) = row.get("turnaround_time")? {
            config.turnaround_minutes = minutes;
        }
        if let Some(secs) = row.get::<&str, Option<i64>>("time_limit")? {
            config.time_limit_secs = secs.max(0) as u64;
        }
        if let Some(cap) = row.get::<&str, Option<i64>>("column_cap")? {
            config.column_cap = cap.max(0) as usize;
        }
        if let Some(multi_thread) = row.get("multi_thread")? {
            config.multi_thread = multi_thread;
        }
        if let Some(seed) = row.get::<&str, Option<i64>>("seed")? {
            config.seed = seed as u64;
        }
        if let Some(solver) = row.get("solver")? {
            config.solver = solver;
        }
        Ok(config)
    }

    fn read_input(&self) -> Result<RecoveryInput, ScenarioLoaderError> {
        let (start, end) = self.read_window()?;
        let mut builder = RecoveryInputBuilder::new(start, end);
        self.read_airports(&mut builder)?;
        let last_tasks = self.read_aircraft(&mut builder)?;
        self.read_tasks(&mut builder)?;
        Self::link_last_tasks(&mut builder, last_tasks)?;
        self.read_flow_controls(&mut builder)?;
        self.read_fleet_balances(&mut builder)?;
        let input = builder.build()?;
        debug!(
            scenario = %self.id,
            aircraft = input.fleet.len(),
            tasks = input.tasks.len(),
            "scenario loaded"
        );
        Ok(input)
    }
}
