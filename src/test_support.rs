//! Small scenario builder shared by the unit tests.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::{
    aircraft::{AircraftId, AircraftUsability},
    airport::{Airport, AirportCode, FleetBalance, FlowControl, FlowDirection},
    model::{RecoveryConfig, RecoveryInput, RecoveryInputBuilder},
    task::{FlightTask, TaskFlags, TaskId, TaskKind},
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    t0() + TimeDelta::minutes(minutes)
}

pub fn code(s: &str) -> AirportCode {
    s.parse().unwrap()
}

pub struct Scenario {
    builder: RecoveryInputBuilder,
    pub config: RecoveryConfig,
    flow_ids: u32,
    balance_ids: u32,
}

impl Scenario {
    /// A 24 hour window from `t0()`, single-threaded, default weights.
    pub fn new() -> Self {
        Self {
            builder: RecoveryInputBuilder::new(t0(), at(24 * 60)),
            config: RecoveryConfig {
                multi_thread: false,
                ..Default::default()
            },
            flow_ids: 0,
            balance_ids: 0,
        }
    }

    fn station(&mut self, s: &str) -> AirportCode {
        let code = code(s);
        if !self.builder.has_airport(code) {
            self.builder.airport(Airport::new(code));
        }
        code
    }

    pub fn alternate(&mut self, airport: &str, alternate: &str) {
        let alt = self.station(alternate);
        let code = self.station(airport);
        let mut record = Airport::new(code);
        record.alternates.push(alt);
        self.builder.airport(record);
    }

    pub fn aircraft(&mut self, registration: &str, location: &str) -> AircraftId {
        self.aircraft_with(registration, "A320", location, 0, 180)
    }

    pub fn aircraft_with(
        &mut self,
        registration: &str,
        type_: &str,
        location: &str,
        available_min: i64,
        capacity: u16,
    ) -> AircraftId {
        let location = self.station(location);
        let id = self
            .builder
            .fleet_mut()
            .register(registration, type_, type_, capacity);
        self.builder
            .usability(AircraftUsability {
                aircraft: id,
                last_task: None,
                location,
                available_at: at(available_min),
            })
            .unwrap();
        id
    }

    pub fn limits(&mut self, aircraft: AircraftId, flight_min: Option<i64>, cycles: Option<u32>) {
        self.builder
            .fleet_mut()
            .set_limits(aircraft, flight_min.map(TimeDelta::minutes), cycles);
    }

    /// 100 passengers, every recovery action allowed.
    pub fn flight(
        &mut self,
        key: &str,
        dep: &str,
        arr: &str,
        offset_min: i64,
        duration_min: i64,
        aircraft: Option<AircraftId>,
    ) -> TaskId {
        self.task(
            key,
            TaskKind::Flight {
                flight_number: key.to_uppercase(),
                passengers: 100,
            },
            dep,
            arr,
            offset_min,
            duration_min,
            aircraft,
            TaskFlags::all(),
        )
    }

    pub fn maintenance(
        &mut self,
        key: &str,
        station: &str,
        offset_min: i64,
        duration_min: i64,
        aircraft: AircraftId,
    ) -> TaskId {
        let flags = TaskFlags {
            delay: true,
            ..TaskFlags::locked()
        };
        self.task(
            key,
            TaskKind::Maintenance,
            station,
            station,
            offset_min,
            duration_min,
            Some(aircraft),
            flags,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn task(
        &mut self,
        key: &str,
        kind: TaskKind,
        dep: &str,
        arr: &str,
        offset_min: i64,
        duration_min: i64,
        aircraft: Option<AircraftId>,
        flags: TaskFlags,
    ) -> TaskId {
        let dep = self.station(dep);
        let arr = self.station(arr);
        self.builder
            .task(FlightTask::new(
                key,
                kind,
                dep,
                arr,
                at(offset_min),
                at(offset_min + duration_min),
                aircraft,
                flags,
            ))
            .unwrap()
    }

    pub fn flow_control(
        &mut self,
        airport: &str,
        direction: FlowDirection,
        from_min: i64,
        to_min: i64,
        capacity: u32,
    ) -> u32 {
        let airport = self.station(airport);
        let id = self.flow_ids;
        self.flow_ids += 1;
        self.builder
            .flow_control(FlowControl {
                id,
                airport,
                direction,
                start: at(from_min),
                end: at(to_min),
                capacity,
            })
            .unwrap();
        id
    }

    pub fn fleet_balance(&mut self, airport: &str, type_: &str, deadline_min: i64, required: u32) -> u32 {
        let airport = self.station(airport);
        let id = self.balance_ids;
        self.balance_ids += 1;
        self.builder
            .fleet_balance(FleetBalance {
                id,
                airport,
                aircraft_type: type_.to_string(),
                deadline: at(deadline_min),
                required,
            })
            .unwrap();
        id
    }

    pub fn build(self) -> (RecoveryInput, RecoveryConfig) {
        (self.builder.build().unwrap(), self.config)
    }
}
