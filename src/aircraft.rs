use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{airport::AirportCode, task::TaskId};

/// Index into the run's `Fleet` registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AircraftId(pub u32);

impl AircraftId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub id: AircraftId,
    pub registration: String,
    pub type_: String,
    pub minor_type: String,
    /// Seats
    pub capacity: u16,
    /// Airborne time budget over the recovery window, if limited.
    pub max_flight_time: Option<TimeDelta>,
    /// Take-off budget over the recovery window, if limited.
    pub max_cycles: Option<u32>,
}

/// Owns every aircraft of a run; handed out by `AircraftId`.
/// Built once during ingestion and read-only afterwards.
#[derive(Debug, Default)]
pub struct Fleet {
    aircraft: Vec<Aircraft>,
    by_registration: HashMap<String, AircraftId>,
}

impl Fleet {
    /// Interns an aircraft by registration. Registering the same registration
    /// twice returns the existing id and keeps the first record.
    pub fn register(
        &mut self,
        registration: &str,
        type_: &str,
        minor_type: &str,
        capacity: u16,
    ) -> AircraftId {
        if let Some(id) = self.by_registration.get(registration) {
            return *id;
        }
        let id = AircraftId(self.aircraft.len() as u32);
        self.aircraft.push(Aircraft {
            id,
            registration: registration.to_string(),
            type_: type_.to_string(),
            minor_type: minor_type.to_string(),
            capacity,
            max_flight_time: None,
            max_cycles: None,
        });
        self.by_registration.insert(registration.to_string(), id);
        id
    }

    pub fn set_limits(&mut self, id: AircraftId, flight_time: Option<TimeDelta>, cycles: Option<u32>) {
        if let Some(aircraft) = self.aircraft.get_mut(id.index()) {
            aircraft.max_flight_time = flight_time;
            aircraft.max_cycles = cycles;
        }
    }

    #[inline]
    pub fn get(&self, id: AircraftId) -> &Aircraft {
        &self.aircraft[id.index()]
    }

    pub fn lookup(&self, registration: &str) -> Option<AircraftId> {
        self.by_registration.get(registration).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Aircraft> {
        self.aircraft.iter()
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }
}

/// Where and when an aircraft becomes usable at the start of the recovery window.
#[derive(Debug, Clone)]
pub struct AircraftUsability {
    pub aircraft: AircraftId,
    /// Last task flown before the window froze, if any.
    pub last_task: Option<TaskId>,
    pub location: AirportCode,
    pub available_at: DateTime<Utc>,
}
