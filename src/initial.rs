//! Seed columns that make the first master problem feasible and meaningful.

use chrono::TimeDelta;
use tracing::debug;

use crate::{
    aircraft::AircraftId,
    bunch::BunchCandidate,
    model::{RecoveryConfig, RecoveryInput},
    rules::RecoveryRules,
    task::{FlightTask, RecoveryPolicy},
};

/// Status-quo and mandatory-only columns for every aircraft. Identical
/// seeds collapse in the column store.
pub fn seed_columns(
    input: &RecoveryInput,
    rules: &dyn RecoveryRules,
    config: &RecoveryConfig,
) -> Vec<BunchCandidate> {
    let mut seeds = Vec::new();
    for aircraft in input.fleet.iter() {
        for mandatory_only in [false, true] {
            if let Some(seed) = follow_schedule(input, rules, config, aircraft.id, mandatory_only) {
                seeds.push(seed);
            }
        }
    }
    debug!(seeds = seeds.len(), "seed columns generated");
    seeds
}

/// Flies the aircraft's own schedule, delaying where the turnaround demands
/// it and skipping tasks it cannot reach.
fn follow_schedule(
    input: &RecoveryInput,
    rules: &dyn RecoveryRules,
    config: &RecoveryConfig,
    id: AircraftId,
    mandatory_only: bool,
) -> Option<BunchCandidate> {
    let aircraft = input.aircraft(id);
    let usability = input.usability(id);
    let first_prev = input.last_task(id);

    let mut tasks: Vec<FlightTask> = Vec::new();
    let mut location = usability.location;
    let mut ready = usability.available_at;
    for origin in input.tasks.assigned_to(id) {
        if !input.window.contains(&origin.sched_dep) || (mandatory_only && !origin.is_mandatory()) {
            continue;
        }
        if origin.dep != location {
            continue;
        }
        let prev = tasks.last().or(first_prev);
        if !rules.is_feasible(aircraft, prev, origin).unwrap_or(false) {
            continue;
        }
        let connection = prev
            .map(|p| rules.connection_time(aircraft, p, origin))
            .unwrap_or_else(TimeDelta::zero);
        let earliest = (ready + connection).max(origin.sched_dep);
        let departure = rules.min_departure_time(aircraft, prev, origin, earliest);
        let delay = departure - origin.sched_dep;
        if delay > TimeDelta::zero() && (!origin.flags.delay || delay > config.max_delay()) {
            continue;
        }
        let task = if delay == TimeDelta::zero() {
            origin.clone()
        } else {
            origin.recover(RecoveryPolicy {
                aircraft: id,
                departure,
                route: None,
            })
        };
        if rules.edge_cost(aircraft, prev, &task).is_none() {
            continue;
        }
        location = task.arr;
        ready = task.arr_time;
        tasks.push(task);
    }

    let cost = rules.sequence_cost(aircraft, first_prev, &tasks)?;
    Some(BunchCandidate {
        aircraft: id,
        tasks,
        cost,
        reduced_cost: cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rules::DefaultRules, test_support::Scenario};

    #[test]
    fn status_quo_delays_tight_connections() {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        s.flight("f1", "PEK", "SHA", 60, 120, Some(a));
        // only 10 minutes on the ground at SHA
        s.flight("f2", "SHA", "PEK", 190, 120, Some(a));
        // departs from a station the aircraft never reaches
        s.flight("f3", "CAN", "PEK", 600, 120, Some(a));
        s.maintenance("chk", "PEK", 700, 60, a);
        let (input, config) = s.build();
        let rules = DefaultRules::new(&config);

        let seeds = seed_columns(&input, &rules, &config);
        assert_eq!(seeds.len(), 2);
        let status_quo: Vec<&str> = seeds[0].tasks.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(status_quo, vec!["f1", "f2", "chk"]);
        assert_eq!(seeds[0].tasks[1].delay(), TimeDelta::minutes(30));
        assert!(seeds[0].cost > 0.0);

        let mandatory: Vec<&str> = seeds[1].tasks.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(mandatory, vec!["chk"]);
        assert_eq!(seeds[1].cost, 0.0);
    }

    #[test]
    fn idle_aircraft_gets_an_empty_seed() {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        let (input, config) = s.build();
        let rules = DefaultRules::new(&config);
        let seeds = seed_columns(&input, &rules, &config);
        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().all(|s| s.aircraft == a && s.tasks.is_empty()));
    }
}
