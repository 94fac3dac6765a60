//! Label-setting pricing over one aircraft's connectivity graph.
//!
//! Labels are propagated forward in topological order. Each label owns a
//! back-pointer (an index into the label arena) to its predecessor, so the
//! chain from any label to the root is finite and acyclic. Labels at a node
//! are kept sorted ascending by reduced cost; a new label can only be
//! dominated by a cheaper one and can only dominate a dearer one, which
//! bounds both scans.

use chrono::{DateTime, TimeDelta, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::{
    aircraft::Aircraft,
    airport::AirportCode,
    bunch::BunchCandidate,
    graph::{Graph, NodeKind},
    model::{RecoveryConfig, RecoveryInput},
    rules::RecoveryRules,
    shadow::ShadowPriceMap,
    task::{FlightTask, RecoveryPolicy, TaskId},
};

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("label {label} of aircraft {registration} has a broken predecessor chain")]
    MalformedChain { registration: String, label: usize },
}

#[derive(Debug, Clone)]
struct Label {
    node: usize,
    pred: Option<usize>,
    /// Recovered task that produced this label; `None` at root and end.
    task: Option<FlightTask>,
    cost: f64,
    shadow: f64,
    delay_minutes: i64,
    arrival: DateTime<Utc>,
    location: AirportCode,
    flight_minutes: i64,
    cycles: u32,
    aircraft_changes: u32,
}

impl Label {
    #[inline]
    fn reduced_cost(&self) -> f64 {
        self.cost - self.shadow
    }

    /// `self ls other`: strictly cheaper and no worse on the resources that
    /// constrain extensions. At the end node only cost and delay matter.
    fn dominates(&self, other: &Label, at_end: bool) -> bool {
        if self.reduced_cost() >= other.reduced_cost() || self.delay_minutes > other.delay_minutes {
            return false;
        }
        at_end
            || (self.aircraft_changes <= other.aircraft_changes
                && self.arrival <= other.arrival
                && self.location == other.location
                && self.flight_minutes <= other.flight_minutes
                && self.cycles <= other.cycles)
    }
}

/// Labels of one pricing call plus the per-node buckets.
struct LabelStore {
    arena: Vec<Label>,
    buckets: Vec<Vec<usize>>,
}

impl LabelStore {
    fn new(nodes: usize) -> Self {
        Self {
            arena: Vec::new(),
            buckets: vec![Vec::new(); nodes],
        }
    }

    /// Inserts unless dominated; evicts labels the newcomer dominates.
    fn insert(&mut self, label: Label) -> bool {
        let at_end = label.node == Graph::END;
        let rc = label.reduced_cost();
        let bucket = &self.buckets[label.node];
        let split = bucket.partition_point(|i| self.arena[*i].reduced_cost() < rc);
        if bucket[..split]
            .iter()
            .any(|i| self.arena[*i].dominates(&label, at_end))
        {
            return false;
        }

        let arena = &self.arena;
        let bucket = &mut self.buckets[label.node];
        let mut k = 0;
        bucket.retain(|i| {
            let keep = k < split || !label.dominates(&arena[*i], at_end);
            k += 1;
            keep
        });
        bucket.insert(split, self.arena.len());
        self.arena.push(label);
        true
    }

    fn visited(&self, mut label: usize, task: TaskId) -> bool {
        loop {
            let l = &self.arena[label];
            if l.task.as_ref().is_some_and(|t| t.id == task) {
                return true;
            }
            match l.pred {
                Some(pred) => label = pred,
                None => return false,
            }
        }
    }
}

pub struct Pricer<'a> {
    input: &'a RecoveryInput,
    rules: &'a dyn RecoveryRules,
    config: &'a RecoveryConfig,
    shadow: &'a ShadowPriceMap,
}

impl<'a> Pricer<'a> {
    pub fn new(
        input: &'a RecoveryInput,
        rules: &'a dyn RecoveryRules,
        config: &'a RecoveryConfig,
        shadow: &'a ShadowPriceMap,
    ) -> Self {
        Self {
            input,
            rules,
            config,
            shadow,
        }
    }

    /// Prices every graph; results come back in the order of `graphs`.
    pub fn price_all(
        &self,
        graphs: &[&Graph],
        parallel: bool,
    ) -> Result<Vec<Vec<BunchCandidate>>, PricingError> {
        if parallel {
            graphs.par_iter().map(|g| self.price(g)).collect()
        } else {
            graphs.iter().map(|g| self.price(g)).collect()
        }
    }

    /// Candidate columns with reduced cost ≤ 0, best first.
    #[instrument(level = "debug", skip_all, fields(tail = %self.input.aircraft(graph.aircraft).registration))]
    pub fn price(&self, graph: &Graph) -> Result<Vec<BunchCandidate>, PricingError> {
        let aircraft = self.input.aircraft(graph.aircraft);
        let usability = self.input.usability(graph.aircraft);
        if graph.is_trivial() {
            return Ok(Vec::new());
        }

        let mut store = LabelStore::new(graph.nodes().len());
        store.insert(Label {
            node: Graph::ROOT,
            pred: None,
            task: None,
            cost: 0.0,
            shadow: self.shadow.aircraft_price(graph.aircraft),
            delay_minutes: 0,
            arrival: usability.available_at,
            location: usability.location,
            flight_minutes: 0,
            cycles: 0,
            aircraft_changes: 0,
        });

        for &u in graph.topological_order() {
            if u == Graph::END {
                continue;
            }
            let labels = store.buckets[u].clone();
            for l in labels {
                for &v in graph.successors(u) {
                    if let Some(next) = self.extend(graph, aircraft, &store, l, v) {
                        store.insert(next);
                    }
                }
            }
        }

        let mut terminals: Vec<usize> = store.buckets[Graph::END]
            .iter()
            .copied()
            .filter(|i| store.arena[*i].reduced_cost() <= 0.0)
            .collect();
        terminals.sort_by(|a, b| {
            store.arena[*a]
                .reduced_cost()
                .total_cmp(&store.arena[*b].reduced_cost())
                .then(a.cmp(b))
        });
        terminals.truncate(self.config.max_bunches_per_aircraft);

        let first_prev = self.input.last_task(graph.aircraft);
        let mut candidates = Vec::with_capacity(terminals.len());
        for terminal in terminals {
            let tasks = self.walk(&store, terminal, aircraft)?;
            let Some(cost) = self.rules.sequence_cost(aircraft, first_prev, &tasks) else {
                trace!(label = terminal, "sequence cost rejected candidate");
                continue;
            };
            let reduced_cost = cost - store.arena[terminal].shadow;
            if reduced_cost > 0.0 {
                continue;
            }
            candidates.push(BunchCandidate {
                aircraft: graph.aircraft,
                tasks,
                cost,
                reduced_cost,
            });
        }
        debug!(labels = store.arena.len(), candidates = candidates.len(), "priced");
        Ok(candidates)
    }

    fn extend(
        &self,
        graph: &Graph,
        aircraft: &Aircraft,
        store: &LabelStore,
        from: usize,
        to: usize,
    ) -> Option<Label> {
        let label = &store.arena[from];
        let node = graph.node(to);
        let task_id = match node.kind {
            NodeKind::End => {
                let end_price =
                    self.shadow
                        .end_price(self.input, aircraft.id, label.location, &label.arrival);
                return Some(Label {
                    node: to,
                    pred: Some(from),
                    task: None,
                    shadow: label.shadow + end_price,
                    ..label.clone()
                });
            }
            NodeKind::Root => return None,
            NodeKind::Task { task, .. } => task,
        };
        if store.visited(from, task_id) {
            return None;
        }

        let origin = self.input.task(task_id);
        let prev = match &label.task {
            Some(task) => Some(task),
            None => self.input.last_task(aircraft.id),
        };
        let connection = prev
            .map(|p| self.rules.connection_time(aircraft, p, origin))
            .unwrap_or_else(TimeDelta::zero);
        let earliest = (label.arrival + connection).max(node.time);
        let departure = self
            .rules
            .min_departure_time(aircraft, prev, origin, earliest);

        let delay = departure - origin.sched_dep;
        if delay > TimeDelta::zero() && (!origin.flags.delay || delay > self.config.max_delay()) {
            return None;
        }
        if delay < TimeDelta::zero() && (!origin.flags.advance || -delay > self.config.max_advance()) {
            return None;
        }
        if departure < self.input.window.start || origin.duration() < TimeDelta::zero() {
            return None;
        }

        let route = (label.location != origin.dep).then_some((label.location, origin.arr));
        let recovered = if delay != TimeDelta::zero()
            || route.is_some()
            || origin.aircraft != Some(aircraft.id)
        {
            origin.recover(RecoveryPolicy {
                aircraft: aircraft.id,
                departure,
                route,
            })
        } else {
            origin.clone()
        };

        let (flight_minutes, cycles) = if recovered.is_airborne() {
            (
                label.flight_minutes + recovered.duration().num_minutes(),
                label.cycles + 1,
            )
        } else {
            (label.flight_minutes, label.cycles)
        };
        if aircraft
            .max_flight_time
            .is_some_and(|max| flight_minutes > max.num_minutes())
            || aircraft.max_cycles.is_some_and(|max| cycles > max)
        {
            return None;
        }

        let edge_cost = self.rules.edge_cost(aircraft, prev, &recovered)?;
        let credit = self.shadow.price(self.input, prev, &recovered);
        Some(Label {
            node: to,
            pred: Some(from),
            cost: label.cost + edge_cost,
            shadow: label.shadow + credit,
            delay_minutes: label.delay_minutes + delay.num_minutes().max(0),
            arrival: recovered.arr_time,
            location: recovered.arr,
            flight_minutes,
            cycles,
            aircraft_changes: label.aircraft_changes + u32::from(recovered.is_aircraft_changed()),
            task: Some(recovered),
        })
    }

    /// Task sequence from the root to `terminal`.
    fn walk(
        &self,
        store: &LabelStore,
        terminal: usize,
        aircraft: &Aircraft,
    ) -> Result<Vec<FlightTask>, PricingError> {
        let mut tasks = Vec::new();
        let mut cursor = store.arena[terminal].pred;
        let mut steps = 0usize;
        while let Some(i) = cursor {
            let label = &store.arena[i];
            steps += 1;
            match (&label.task, label.pred) {
                (Some(task), Some(_)) => tasks.push(task.clone()),
                (None, None) if label.node == Graph::ROOT => break,
                _ => {
                    return Err(PricingError::MalformedChain {
                        registration: aircraft.registration.clone(),
                        label: i,
                    })
                }
            }
            if steps > store.arena.len() {
                return Err(PricingError::MalformedChain {
                    registration: aircraft.registration.clone(),
                    label: i,
                });
            }
            cursor = label.pred;
        }
        tasks.reverse();
        Ok(tasks)
    }
}
