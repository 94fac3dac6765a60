//! Picks which aircraft to free for the next local column-generation round.
//!
//! Heuristics run in a fixed priority order; each contributes up to its
//! quota and skips aircraft that are tabu or already picked. Every pick
//! enters a bounded tabu list so consecutive rounds look elsewhere.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::{aircraft::AircraftId, model::SelectorQuotas};

/// Per-aircraft snapshot the heuristics rank on, taken from the incumbent
/// solution and the latest LP.
#[derive(Debug, Clone)]
pub struct AircraftStats {
    pub aircraft: AircraftId,
    /// Incumbent cost minus the cost the LP spreads over this aircraft's columns.
    pub gap: f64,
    /// Flow-control checkpoints at capacity touched by the incumbent routing.
    pub closed_flow_hits: usize,
    pub idle_minutes: i64,
    pub cost: f64,
    pub flight_minutes: i64,
    /// Sum of |dual| over the flow checkpoints the incumbent routing hits.
    pub flow_shadow: f64,
    pub delay_minutes: i64,
    pub aircraft_changes: usize,
}

impl AircraftStats {
    fn cost_density(&self) -> f64 {
        self.cost / self.flight_minutes.max(1) as f64
    }
}

pub struct FreeAircraftSelector {
    quotas: SelectorQuotas,
    tabu: VecDeque<AircraftId>,
    tabu_size: usize,
    random_attempts: usize,
    gap_threshold: f64,
    rng: ChaCha8Rng,
}

impl FreeAircraftSelector {
    pub fn new(
        quotas: SelectorQuotas,
        tabu_size: usize,
        random_attempts: usize,
        gap_threshold: f64,
        seed: u64,
    ) -> Self {
        Self {
            quotas,
            tabu: VecDeque::with_capacity(tabu_size),
            tabu_size,
            random_attempts,
            gap_threshold,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn is_tabu(&self, aircraft: AircraftId) -> bool {
        self.tabu.contains(&aircraft)
    }

    pub fn select(&mut self, stats: &[AircraftStats]) -> Vec<AircraftId> {
        let mut picked: Vec<AircraftId> = Vec::new();
        let q = self.quotas.clone();

        self.pick_ranked(stats, &mut picked, q.gap, |s| {
            (s.gap > self.gap_threshold).then_some(s.gap)
        });
        self.pick_ranked(stats, &mut picked, q.flow_control, |s| {
            (s.closed_flow_hits > 0).then_some(s.closed_flow_hits as f64)
        });
        self.pick_ranked(stats, &mut picked, q.idle, |s| Some(s.idle_minutes as f64));
        self.pick_ranked(stats, &mut picked, q.cost, |s| Some(s.cost));
        self.pick_ranked(stats, &mut picked, q.cost_density, |s| Some(s.cost_density()));
        self.pick_ranked(stats, &mut picked, q.flow_shadow, |s| {
            (s.flow_shadow > 0.0).then_some(s.flow_shadow)
        });
        self.pick_ranked(stats, &mut picked, q.delay, |s| {
            (s.delay_minutes > 0).then_some(s.delay_minutes as f64)
        });
        self.pick_ranked(stats, &mut picked, q.aircraft_change, |s| {
            (s.aircraft_changes > 0).then_some(s.aircraft_changes as f64)
        });
        self.pick_random(stats, &mut picked, q.random);

        for aircraft in &picked {
            if self.tabu_size == 0 {
                break;
            }
            if self.tabu.len() == self.tabu_size {
                self.tabu.pop_front();
            }
            self.tabu.push_back(*aircraft);
        }
        debug!(picked = ?picked, "free aircraft selected");
        picked
    }

    /// Highest score first; ties go to the lower aircraft id.
    fn pick_ranked(
        &self,
        stats: &[AircraftStats],
        picked: &mut Vec<AircraftId>,
        quota: usize,
        score: impl Fn(&AircraftStats) -> Option<f64>,
    ) {
        if quota == 0 {
            return;
        }
        let mut ranked: Vec<(AircraftId, f64)> = stats
            .iter()
            .filter(|s| !self.is_tabu(s.aircraft) && !picked.contains(&s.aircraft))
            .filter_map(|s| score(s).map(|v| (s.aircraft, v)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        picked.extend(ranked.into_iter().take(quota).map(|(a, _)| a));
    }

    fn pick_random(&mut self, stats: &[AircraftStats], picked: &mut Vec<AircraftId>, quota: usize) {
        if stats.is_empty() {
            return;
        }
        let mut taken = 0;
        for _ in 0..self.random_attempts {
            if taken == quota {
                break;
            }
            let candidate = stats[self.rng.random_range(0..stats.len())].aircraft;
            if self.is_tabu(candidate) || picked.contains(&candidate) {
                continue;
            }
            picked.push(candidate);
            taken += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(n: u32) -> Vec<AircraftStats> {
        (0..n)
            .map(|i| AircraftStats {
                aircraft: AircraftId(i),
                gap: 0.0,
                closed_flow_hits: 0,
                idle_minutes: 0,
                cost: 0.0,
                flight_minutes: 0,
                flow_shadow: 0.0,
                delay_minutes: 0,
                aircraft_changes: 0,
            })
            .collect()
    }

    fn only(field: &str, value: usize) -> SelectorQuotas {
        let mut q = SelectorQuotas {
            gap: 0,
            flow_control: 0,
            idle: 0,
            cost: 0,
            cost_density: 0,
            flow_shadow: 0,
            delay: 0,
            aircraft_change: 0,
            random: 0,
        };
        match field {
            "gap" => q.gap = value,
            "cost" => q.cost = value,
            "random" => q.random = value,
            _ => unreachable!(),
        }
        q
    }

    #[test]
    fn heuristics_run_in_priority_order() {
        let mut s = stats(5);
        s[3].gap = 50.0;
        s[1].gap = 0.5; // under the threshold
        s[2].closed_flow_hits = 1;
        s[4].idle_minutes = 300;
        s[0].cost = 10.0;
        s[1].cost = 20.0;
        let mut selector = FreeAircraftSelector::new(
            SelectorQuotas {
                random: 0,
                ..SelectorQuotas::default()
            },
            10,
            100,
            1.0,
            7,
        );
        let picked = selector.select(&s);
        assert_eq!(&picked[..4], &[AircraftId(3), AircraftId(2), AircraftId(4), AircraftId(1)]);
        assert_eq!(picked.len(), 5);
    }

    #[test]
    fn tabu_aircraft_are_skipped_until_they_age_out() {
        let mut s = stats(3);
        s[0].cost = 30.0;
        s[1].cost = 20.0;
        s[2].cost = 10.0;
        let mut selector = FreeAircraftSelector::new(only("cost", 1), 2, 10, 1.0, 1);
        assert_eq!(selector.select(&s), vec![AircraftId(0)]);
        assert_eq!(selector.select(&s), vec![AircraftId(1)]);
        assert_eq!(selector.select(&s), vec![AircraftId(2)]);
        // aircraft 0 left the two-slot tabu list
        assert_eq!(selector.select(&s), vec![AircraftId(0)]);
    }

    #[test]
    fn random_fill_is_seeded_and_bounded() {
        let s = stats(20);
        let mut a = FreeAircraftSelector::new(only("random", 3), 0, 10_090, 1.0, 42);
        let mut b = FreeAircraftSelector::new(only("random", 3), 0, 10_090, 1.0, 42);
        let first = a.select(&s);
        assert_eq!(first.len(), 3);
        assert_eq!(first, b.select(&s));

        // with no attempts nothing random gets in
        let mut none = FreeAircraftSelector::new(only("random", 3), 0, 0, 1.0, 42);
        assert!(none.select(&s).is_empty());
    }

    #[test]
    fn gap_heuristic_needs_the_threshold() {
        let mut s = stats(2);
        s[0].gap = 0.9;
        let mut selector = FreeAircraftSelector::new(only("gap", 2), 0, 0, 1.0, 0);
        assert!(selector.select(&s).is_empty());
    }
}
