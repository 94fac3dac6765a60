use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_lapper::{Interval, Lapper};
use serde::{Deserialize, Serialize};

use crate::model::InputError;

/// Three-letter IATA station code, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AirportCode(pub [u8; 3]);

impl FromStr for AirportCode {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.trim().as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphanumeric) {
            return Err(InputError::BadAirportCode(s.to_string()));
        }
        let mut code = [0u8; 3];
        code.copy_from_slice(bytes);
        code.make_ascii_uppercase();
        Ok(Self(code))
    }
}

impl fmt::Display for AirportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Codes are validated ASCII on construction
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("???"))
    }
}

impl fmt::Debug for AirportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, Clone)]
pub struct Airport {
    pub code: AirportCode,
    /// Stations an aircraft parked here may reposition a departure from
    /// (city pairs, backup airports). Only usable by reroutable tasks.
    pub alternates: Vec<AirportCode>,
}

impl Airport {
    pub fn new(code: AirportCode) -> Self {
        Self {
            code,
            alternates: Vec::new(),
        }
    }
}

// MARK: Flow control

pub type FlowControlId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Departure,
    Arrival,
}

/// Throughput ceiling on an airport over a time window: at most `capacity`
/// departures (or arrivals) may be scheduled in `[start, end)`.
#[derive(Debug, Clone)]
pub struct FlowControl {
    pub id: FlowControlId,
    pub airport: AirportCode,
    pub direction: FlowDirection,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub capacity: u32,
}

type FlowInterval = Interval<u64, FlowControlId>;

/// Per-airport interval index over flow-control windows.
#[derive(Debug, Default)]
pub struct FlowControlIndex {
    controls: Vec<FlowControl>,
    by_airport: HashMap<(AirportCode, FlowDirection), Lapper<u64, FlowControlId>>,
}

#[inline]
fn lapper_point(time: &DateTime<Utc>) -> u64 {
    // Lapper wants unsigned coordinates; pre-epoch schedules do not occur
    time.timestamp().max(0) as u64
}

impl FlowControlIndex {
    pub fn new(mut controls: Vec<FlowControl>) -> Self {
        controls.sort_by_key(|c| c.id);
        let mut grouped: HashMap<(AirportCode, FlowDirection), Vec<FlowInterval>> = HashMap::new();
        for control in &controls {
            grouped
                .entry((control.airport, control.direction))
                .or_default()
                .push(Interval {
                    start: lapper_point(&control.start),
                    stop: lapper_point(&control.end),
                    val: control.id,
                });
        }
        Self {
            controls,
            by_airport: grouped
                .into_iter()
                .map(|(key, ivs)| (key, Lapper::new(ivs)))
                .collect(),
        }
    }

    pub fn controls(&self) -> &[FlowControl] {
        &self.controls
    }

    pub fn get(&self, id: FlowControlId) -> Option<&FlowControl> {
        self.controls
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| &self.controls[i])
    }

    /// Checkpoints whose window contains `time` at `airport`, ascending by id.
    pub fn hits(
        &self,
        airport: AirportCode,
        direction: FlowDirection,
        time: &DateTime<Utc>,
    ) -> Vec<FlowControlId> {
        let Some(lapper) = self.by_airport.get(&(airport, direction)) else {
            return Vec::new();
        };
        let point = lapper_point(time);
        let mut ids: Vec<FlowControlId> = lapper.find(point, point + 1).map(|iv| iv.val).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

// MARK: Fleet balance

pub type FleetBalanceId = u32;

/// At least `required` aircraft of `aircraft_type` must have finished their
/// day at `airport` by `deadline`.
#[derive(Debug, Clone)]
pub struct FleetBalance {
    pub id: FleetBalanceId,
    pub airport: AirportCode,
    pub aircraft_type: String,
    pub deadline: DateTime<Utc>,
    pub required: u32,
}

impl FleetBalance {
    pub fn satisfied_by(
        &self,
        aircraft_type: &str,
        location: AirportCode,
        ready_at: &DateTime<Utc>,
    ) -> bool {
        self.aircraft_type == aircraft_type && self.airport == location && *ready_at <= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn code(s: &str) -> AirportCode {
        s.parse().unwrap()
    }

    #[test]
    fn airport_code_parse_and_display() {
        assert_eq!(code("pek").to_string(), "PEK");
        assert!("PEKX".parse::<AirportCode>().is_err());
        assert!("P-K".parse::<AirportCode>().is_err());
    }

    #[test]
    fn flow_control_hits_are_window_bounded() {
        let t0 = Utc::now();
        let index = FlowControlIndex::new(vec![
            FlowControl {
                id: 2,
                airport: code("PEK"),
                direction: FlowDirection::Departure,
                start: t0,
                end: t0 + TimeDelta::hours(1),
                capacity: 3,
            },
            FlowControl {
                id: 1,
                airport: code("PEK"),
                direction: FlowDirection::Departure,
                start: t0 + TimeDelta::minutes(30),
                end: t0 + TimeDelta::hours(2),
                capacity: 1,
            },
            FlowControl {
                id: 3,
                airport: code("PEK"),
                direction: FlowDirection::Arrival,
                start: t0,
                end: t0 + TimeDelta::hours(2),
                capacity: 1,
            },
        ]);

        let at = t0 + TimeDelta::minutes(45);
        assert_eq!(index.hits(code("PEK"), FlowDirection::Departure, &at), vec![1, 2]);
        assert_eq!(index.hits(code("PEK"), FlowDirection::Arrival, &at), vec![3]);
        assert_eq!(
            index.hits(code("PEK"), FlowDirection::Departure, &(t0 + TimeDelta::minutes(90))),
            vec![1]
        );
        assert!(index
            .hits(code("PEK"), FlowDirection::Departure, &(t0 + TimeDelta::hours(3)))
            .is_empty());
        assert!(index.hits(code("SHA"), FlowDirection::Departure, &at).is_empty());
        assert_eq!(index.get(3).map(|c| c.capacity), Some(1));
    }

    #[test]
    fn fleet_balance_checks_type_station_and_deadline() {
        let t0 = Utc::now();
        let balance = FleetBalance {
            id: 0,
            airport: code("PEK"),
            aircraft_type: "A320".into(),
            deadline: t0,
            required: 1,
        };
        assert!(balance.satisfied_by("A320", code("PEK"), &(t0 - TimeDelta::minutes(1))));
        assert!(!balance.satisfied_by("A320", code("PEK"), &(t0 + TimeDelta::minutes(1))));
        assert!(!balance.satisfied_by("B738", code("PEK"), &t0));
        assert!(!balance.satisfied_by("A320", code("SHA"), &t0));
    }
}
