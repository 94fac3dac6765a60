//! Iteration controller: the column-generation state machine.
//!
//! ```text
//! Init -> FirstSolve -> GlobalColumnGen -> LocalColumnGen -> LpRefine
//!                            ^                                  |
//!                            +----------------------------------+
//! ```
//!
//! Terminal conditions are polled between phases only. Whatever ends the
//! run, the output carries the best integer solution captured so far.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc::Sender,
        Arc,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    aircraft::AircraftId,
    airport::FlowControlId,
    bunch::BunchCandidate,
    graph::{Graph, GraphBuilder, GraphError},
    initial::seed_columns,
    iteration::Iteration,
    master::{ColumnStore, MasterError, MasterModel},
    metrics::{send_event, PerformanceCounters, RecoveryEvent, RecoveryEventType},
    model::{InputError, RecoveryConfig, RecoveryInput},
    pricer::{Pricer, PricingError},
    rules::{DefaultRules, RecoveryRules},
    selector::{AircraftStats, FreeAircraftSelector},
    shadow::{ShadowPriceKey, ShadowPriceMap},
    solver::{solver_by_name, LpSolution, MasterSolver, SolverError},
    task::{FlightTask, TaskId, TaskKind},
};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Master(#[from] MasterError),
}

impl RecoveryError {
    /// Stable numeric code reported in `RecoveryOutput::error`.
    pub fn code(&self) -> u32 {
        match self {
            RecoveryError::Input(_) => 1,
            RecoveryError::Graph(_) => 2,
            RecoveryError::Pricing(_) => 3,
            RecoveryError::Solver(_) | RecoveryError::Master(MasterError::Solver(_)) => 4,
            RecoveryError::Master(_) => 5,
        }
    }
}

/// Cooperative stop flag shared with the caller.
#[derive(Clone, Default, Debug)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Relaxed)
    }

    pub fn request_stop(&self) {
        self.0.store(true, Relaxed)
    }
}

impl fmt::Display for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StopToken(set: {})", self.is_set())
    }
}

// MARK: Output

/// What happened to one original task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDecision {
    pub key: String,
    pub kind: &'static str,
    pub flight_number: Option<String>,
    pub original_aircraft: Option<String>,
    pub recovered_aircraft: Option<String>,
    pub origin: String,
    pub dest: String,
    pub rerouted: bool,
    pub sched_dep: DateTime<Utc>,
    pub sched_arr: DateTime<Utc>,
    pub dep_time: Option<DateTime<Utc>>,
    pub arr_time: Option<DateTime<Utc>>,
    pub delay_minutes: i64,
    pub cancelled: bool,
}

impl TaskDecision {
    fn new(input: &RecoveryInput, origin: &FlightTask, flown: Option<&FlightTask>) -> Self {
        let registration = |id: Option<AircraftId>| id.map(|a| input.aircraft(a).registration.clone());
        let route = flown.unwrap_or(origin);
        Self {
            key: origin.key.clone(),
            kind: origin.kind.label(),
            flight_number: origin.flight_number().map(str::to_string),
            original_aircraft: registration(origin.scheduled_aircraft),
            recovered_aircraft: flown.and_then(|t| registration(t.aircraft)),
            origin: route.dep.to_string(),
            dest: route.arr.to_string(),
            rerouted: flown.is_some_and(FlightTask::is_rerouted),
            sched_dep: origin.sched_dep,
            sched_arr: origin.sched_arr,
            dep_time: flown.map(|t| t.dep_time),
            arr_time: flown.map(|t| t.arr_time),
            delay_minutes: flown.map_or(0, |t| t.delay().num_minutes()),
            cancelled: flown.is_none(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryFailure {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutput {
    pub success: bool,
    pub objective: Option<f64>,
    pub lower_bound: Option<f64>,
    pub flights: Vec<TaskDecision>,
    pub maintenances: Vec<TaskDecision>,
    pub counters: PerformanceCounters,
    pub error: Option<RecoveryFailure>,
}

impl RecoveryOutput {
    fn failed(error: &RecoveryError, counters: PerformanceCounters) -> Self {
        Self {
            success: false,
            objective: None,
            lower_bound: None,
            flights: Vec::new(),
            maintenances: Vec::new(),
            counters,
            error: Some(RecoveryFailure {
                code: error.code(),
                message: error.to_string(),
            }),
        }
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &TaskDecision> {
        self.flights
            .iter()
            .chain(&self.maintenances)
            .filter(|d| d.cancelled)
    }
}

// MARK: State machine

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stalled,
    TimeLimit,
    Stopped,
    PerfectRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    FirstSolve,
    GlobalColumnGen,
    LocalColumnGen,
    LpRefine,
    Terminal(StopReason),
}

#[derive(Debug, Clone)]
struct Incumbent {
    objective: f64,
    columns: Vec<usize>,
}

pub struct RecoveryController<'a> {
    input: &'a RecoveryInput,
    rules: &'a dyn RecoveryRules,
    config: &'a RecoveryConfig,
    solver: Box<dyn MasterSolver>,
    publisher: Option<Sender<RecoveryEvent>>,
    stop: StopToken,
    started: Instant,

    graphs: Vec<Graph>,
    store: ColumnStore,
    master: MasterModel,
    shadow: ShadowPriceMap,
    iteration: Iteration,
    selector: FreeAircraftSelector,
    removal_threshold: f64,
    free: Vec<AircraftId>,
    last_lp: Option<LpSolution>,
    incumbent: Option<Incumbent>,
    counters: PerformanceCounters,
}

/// Runs a recovery with `DefaultRules` and the configured solver.
pub fn run(
    input: &RecoveryInput,
    config: &RecoveryConfig,
    publisher: Option<Sender<RecoveryEvent>>,
    stop: StopToken,
) -> RecoveryOutput {
    let rules = DefaultRules::new(config);
    run_with_rules(input, config, &rules, publisher, stop)
}

pub fn run_with_rules(
    input: &RecoveryInput,
    config: &RecoveryConfig,
    rules: &dyn RecoveryRules,
    publisher: Option<Sender<RecoveryEvent>>,
    stop: StopToken,
) -> RecoveryOutput {
    let controller = solver_by_name(&config.solver, config)
        .map_err(RecoveryError::from)
        .and_then(|solver| RecoveryController::new(input, rules, config, solver));
    match controller {
        Ok(controller) => controller.events(publisher).stop_token(stop).solve(),
        Err(error) => {
            warn!(error = %error, "recovery could not start");
            send_event!(publisher, RecoveryEventType::Finished { success: false, objective: None });
            RecoveryOutput::failed(&error, PerformanceCounters::default())
        }
    }
}

impl<'a> RecoveryController<'a> {
    pub fn new(
        input: &'a RecoveryInput,
        rules: &'a dyn RecoveryRules,
        config: &'a RecoveryConfig,
        solver: Box<dyn MasterSolver>,
    ) -> Result<Self, RecoveryError> {
        Ok(Self {
            input,
            rules,
            config,
            solver,
            publisher: None,
            stop: StopToken::new(),
            started: Instant::now(),
            graphs: Vec::new(),
            store: ColumnStore::default(),
            master: MasterModel::new(input, rules, config)?,
            shadow: ShadowPriceMap::new(config.tight_turn()),
            iteration: Iteration::new(config),
            selector: FreeAircraftSelector::new(
                config.quotas.clone(),
                config.tabu_size,
                config.random_attempts,
                config.gap_threshold,
                config.seed,
            ),
            removal_threshold: config.removal_threshold,
            free: Vec::new(),
            last_lp: None,
            incumbent: None,
            counters: PerformanceCounters::default(),
        })
    }

    pub fn events(mut self, publisher: Option<Sender<RecoveryEvent>>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn solve(mut self) -> RecoveryOutput {
        info!(
            aircraft = self.input.fleet.len(),
            tasks = self.input.tasks.len(),
            solver = self.solver.name(),
            "recovery started"
        );
        let mut phase = Phase::Init;
        loop {
            match self.step(phase) {
                Ok(Phase::Terminal(reason)) => return self.finish(Ok(reason)),
                Ok(next) => phase = next,
                Err(error) => return self.finish(Err(error)),
            }
        }
    }

    fn step(&mut self, phase: Phase) -> Result<Phase, RecoveryError> {
        debug!(?phase, iteration = self.iteration.index, "entering phase");
        let next = match phase {
            Phase::Init => {
                self.init()?;
                return Ok(Phase::FirstSolve);
            }
            Phase::FirstSolve => {
                self.master.apply_bounds(&self.store, |_| false);
                self.capture_ip()?;
                Phase::GlobalColumnGen
            }
            Phase::GlobalColumnGen => {
                self.global_column_gen()?;
                self.free = self.select_free();
                Phase::LocalColumnGen
            }
            Phase::LocalColumnGen => {
                self.local_column_gen()?;
                self.capture_ip()?;
                Phase::LpRefine
            }
            Phase::LpRefine => {
                self.lp_refine()?;
                Phase::GlobalColumnGen
            }
            Phase::Terminal(reason) => return Ok(Phase::Terminal(reason)),
        };
        Ok(self.check_terminal().map_or(next, Phase::Terminal))
    }

    fn check_terminal(&self) -> Option<StopReason> {
        if self.stop.is_set() {
            Some(StopReason::Stopped)
        } else if self.started.elapsed() >= self.config.time_limit() {
            Some(StopReason::TimeLimit)
        } else if self.iteration.best_ip.is_some_and(|best| best.abs() < 1e-6) {
            Some(StopReason::PerfectRecovery)
        } else if self.iteration.is_improvement_slow() {
            Some(StopReason::Stalled)
        } else {
            None
        }
    }

    #[instrument(level = "debug", skip_all)]
    fn init(&mut self) -> Result<(), RecoveryError> {
        let started = Instant::now();
        let aircraft: Vec<AircraftId> = self.input.fleet.iter().map(|a| a.id).collect();
        let builder = GraphBuilder::new(self.input, self.rules, self.config);
        self.graphs = builder.build_all(&aircraft, self.config.multi_thread)?;
        self.counters.graph_time = started.elapsed();
        debug!(
            edges = self.graphs.iter().map(Graph::edge_count).sum::<usize>(),
            "graphs built"
        );

        let seeds = seed_columns(self.input, self.rules, self.config);
        let added = self.store.add(0, seeds);
        self.counters.columns_generated += added.len();
        self.master.add_columns(self.input, &self.store, &added)?;
        Ok(())
    }

    fn solve_lp(&mut self) -> Result<LpSolution, RecoveryError> {
        let started = Instant::now();
        let lp = self.master.solve_lp(self.solver.as_ref())?;
        self.counters.record_lp(started);
        self.master.refresh_duals(&mut self.shadow, &lp.duals);
        self.last_lp = Some(lp.clone());
        Ok(lp)
    }

    /// Solves the master as an integer program under the current bounds and
    /// keeps the result if it beats the incumbent.
    fn capture_ip(&mut self) -> Result<(), RecoveryError> {
        let started = Instant::now();
        let ip = self.master.solve_ip(self.solver.as_ref())?;
        self.counters.record_ip(started);
        if !self.iteration.record_ip(ip.objective) {
            return Ok(());
        }
        let columns = self.master.selected_columns(&ip.values);
        info!(objective = ip.objective, columns = columns.len(), "new incumbent");
        self.store.set_kept(columns.iter().copied());
        self.incumbent = Some(Incumbent {
            objective: ip.objective,
            columns,
        });
        send_event!(
            self.publisher,
            RecoveryEventType::PartialOutput(Box::new(self.output()))
        );
        Ok(())
    }

    /// Prices `aircraft` against the current duals and adds the new columns.
    /// Returns the number of columns added and the most negative reduced
    /// cost per aircraft, summed.
    fn price_and_add(&mut self, aircraft: &[AircraftId]) -> Result<(usize, f64), RecoveryError> {
        let started = Instant::now();
        let graphs: Vec<&Graph> = aircraft.iter().map(|a| &self.graphs[a.index()]).collect();
        let pricer = Pricer::new(self.input, self.rules, self.config, &self.shadow);
        let priced = pricer.price_all(&graphs, self.config.multi_thread)?;

        let best: f64 = priced
            .iter()
            .map(|c| c.iter().map(|b| b.reduced_cost).fold(0.0, f64::min))
            .sum();
        let candidates: Vec<BunchCandidate> = priced.into_iter().flatten().collect();
        let added = self.store.add(self.iteration.index + 1, candidates);
        self.counters.record_pricing(started, added.len());
        self.master.add_columns(self.input, &self.store, &added)?;
        Ok((added.len(), best))
    }

    fn pricing_targets(&self) -> Vec<AircraftId> {
        self.graphs
            .iter()
            .filter(|g| !g.is_trivial())
            .map(|g| g.aircraft)
            .collect()
    }

    #[instrument(level = "debug", skip_all, fields(iteration = self.iteration.index))]
    fn global_column_gen(&mut self) -> Result<(), RecoveryError> {
        self.store.clear_fixed();
        let targets = self.pricing_targets();
        let floor = self.config.min_columns_per_free_aircraft * targets.len();
        for pass in 0..self.config.max_global_passes.max(1) {
            self.master.apply_bounds(&self.store, |_| false);
            let lp = self.solve_lp()?;
            let (added, best) = self.price_and_add(&targets)?;
            self.iteration.record_lower_bound(lp.objective + best);
            debug!(pass, added, lp = lp.objective, "global pricing pass");
            if added == 0 || !(added > self.config.bad_reduced_cost_columns || added >= floor) {
                break;
            }
        }
        self.prune();
        Ok(())
    }

    fn prune(&mut self) {
        if self.store.live_count() <= self.config.column_cap {
            return;
        }
        let shadow = &self.shadow;
        let input = self.input;
        let (removed, threshold) = self.store.remove_columns(
            |b| shadow.reduced_cost(input, b),
            self.removal_threshold,
            self.config.column_cap,
            self.config.removal_shrink,
            self.config.removal_floor,
        );
        self.removal_threshold = threshold;
        self.counters.columns_removed += removed.len();
    }

    /// Picks the aircraft to reopen and fixes everyone else to the incumbent.
    fn select_free(&mut self) -> Vec<AircraftId> {
        let stats = self.aircraft_stats();
        let free = self.selector.select(&stats);
        if let Some(incumbent) = &self.incumbent {
            for &index in &incumbent.columns {
                if !free.contains(&self.store.get(index).aircraft) {
                    self.store.fix(index);
                }
            }
        }
        debug!(free = free.len(), fixed = self.store.fixed().count(), "aircraft freed");
        free
    }

    fn aircraft_stats(&self) -> Vec<AircraftStats> {
        let Some(incumbent) = &self.incumbent else {
            return Vec::new();
        };
        let input = self.input;
        let values = self.last_lp.as_ref().map_or(&[][..], |lp| lp.values.as_slice());

        let mut usage: HashMap<FlowControlId, u32> = HashMap::new();
        for &index in &incumbent.columns {
            for task in &self.store.get(index).tasks {
                for hit in input.flow_hits(task) {
                    *usage.entry(hit).or_default() += 1;
                }
            }
        }
        let closed: HashSet<FlowControlId> = usage
            .into_iter()
            .filter(|(id, used)| {
                input
                    .flow_controls
                    .get(*id)
                    .is_some_and(|c| *used >= c.capacity)
            })
            .map(|(id, _)| id)
            .collect();

        let window_minutes = (input.window.end - input.window.start).num_minutes();
        self.pricing_targets()
            .into_iter()
            .map(|aircraft| {
                let current = incumbent
                    .columns
                    .iter()
                    .map(|i| self.store.get(*i))
                    .find(|b| b.aircraft == aircraft);
                let spread: f64 = self
                    .store
                    .columns_of(aircraft)
                    .map(|b| b.cost * self.master.column_value(values, b.index))
                    .sum();
                let hits: Vec<FlowControlId> = current
                    .map(|b| b.tasks.iter().flat_map(|t| input.flow_hits(t)).collect())
                    .unwrap_or_default();
                let cost = current.map_or(0.0, |b| b.cost);
                AircraftStats {
                    aircraft,
                    gap: cost - spread,
                    closed_flow_hits: hits.iter().filter(|h| closed.contains(h)).count(),
                    idle_minutes: current
                        .map_or(window_minutes, |b| b.idle_minutes(input.usability(aircraft))),
                    cost,
                    flight_minutes: current.map_or(0, |b| b.flight_minutes()),
                    flow_shadow: hits
                        .iter()
                        .map(|h| self.shadow.get(ShadowPriceKey::FlowControl(*h)).abs())
                        .sum(),
                    delay_minutes: current.map_or(0, |b| b.delay_minutes()),
                    aircraft_changes: current.map_or(0, |b| b.aircraft_changes()),
                }
            })
            .collect()
    }

    #[instrument(level = "debug", skip_all, fields(iteration = self.iteration.index, free = self.free.len()))]
    fn local_column_gen(&mut self) -> Result<(), RecoveryError> {
        let free = std::mem::take(&mut self.free);
        for pass in 0..self.config.max_local_passes {
            let open: Vec<AircraftId> = free
                .iter()
                .copied()
                .filter(|a| !self.store.fixed().any(|i| self.store.get(i).aircraft == *a))
                .collect();
            if open.is_empty() {
                break;
            }
            let store = &self.store;
            self.master
                .apply_bounds(store, |b| !free.contains(&b.aircraft) && !store.is_fixed(b.index));
            let lp = self.solve_lp()?;
            let (added, _) = self.price_and_add(&open)?;
            let values: Vec<(usize, f64)> = self
                .store
                .live_indices()
                .map(|i| (i, self.master.column_value(&lp.values, i)))
                .collect();
            let fixes = self.locally_fix(&values, &open);
            debug!(pass, added, fixes, lp = lp.objective, "local pricing pass");
            if added == 0 || fixes == 0 {
                break;
            }
        }
        let store = &self.store;
        self.master
            .apply_bounds(store, |b| !free.contains(&b.aircraft) && !store.is_fixed(b.index));
        self.free = free;
        Ok(())
    }

    /// Fixes every column of an open aircraft at or above the local fix
    /// threshold, at most one per aircraft and never two covering the same
    /// task. With none qualifying, fixes the single best column at or
    /// above the minimum instead. `values` pairs column indices with their
    /// relaxation values.
    fn locally_fix(&mut self, values: &[(usize, f64)], open: &[AircraftId]) -> usize {
        let mut ranked: Vec<(usize, f64)> = values
            .iter()
            .copied()
            .filter(|(i, value)| {
                *value >= self.config.local_fix_minimum
                    && self.store.try_get(*i).is_some_and(|b| open.contains(&b.aircraft))
                    && !self.store.is_removed(*i)
                    && !self.store.is_fixed(*i)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut busy: HashSet<AircraftId> = HashSet::new();
        let mut covered: HashSet<TaskId> = HashSet::new();
        for index in self.store.fixed() {
            let bunch = self.store.get(index);
            busy.insert(bunch.aircraft);
            covered.extend(bunch.task_ids());
        }

        let mut picks = Vec::new();
        for &(index, value) in &ranked {
            if value < self.config.local_fix_threshold && !picks.is_empty() {
                break;
            }
            let bunch = self.store.get(index);
            if busy.contains(&bunch.aircraft) || bunch.task_ids().any(|t| covered.contains(&t)) {
                continue;
            }
            busy.insert(bunch.aircraft);
            covered.extend(bunch.task_ids());
            picks.push(index);
            if value < self.config.local_fix_threshold {
                break;
            }
        }
        for &index in &picks {
            self.store.fix(index);
        }
        self.counters.columns_fixed += picks.len();
        picks.len()
    }

    #[instrument(level = "debug", skip_all, fields(iteration = self.iteration.index))]
    fn lp_refine(&mut self) -> Result<(), RecoveryError> {
        self.store.clear_fixed();
        self.master.apply_bounds(&self.store, |_| false);
        let lp = self.solve_lp()?;
        self.iteration.record_lp(lp.objective);
        debug!(lp = lp.objective, slow = self.iteration.lp_slow(), "relaxation refined");
        self.iteration.finish();
        self.counters.iterations += 1;
        send_event!(
            self.publisher,
            RecoveryEventType::Heartbeat {
                iteration: self.iteration.index,
                optimality_rate: self.iteration.optimality_rate(),
            }
        );
        Ok(())
    }

    fn output(&self) -> RecoveryOutput {
        let mut flights = Vec::new();
        let mut maintenances = Vec::new();
        if let Some(incumbent) = &self.incumbent {
            let flown: HashMap<TaskId, &FlightTask> = incumbent
                .columns
                .iter()
                .flat_map(|i| self.store.get(*i).tasks.iter())
                .map(|t| (t.id, t))
                .collect();
            for origin in self.input.recoverable_tasks() {
                let decision = TaskDecision::new(self.input, origin, flown.get(&origin.id).copied());
                match origin.kind {
                    TaskKind::Flight { .. } | TaskKind::Transfer => flights.push(decision),
                    TaskKind::Maintenance | TaskKind::Aog => maintenances.push(decision),
                }
            }
        }
        RecoveryOutput {
            success: self.incumbent.is_some(),
            objective: self.incumbent.as_ref().map(|i| i.objective),
            lower_bound: self.iteration.lower_bound,
            flights,
            maintenances,
            counters: self.counters.clone(),
            error: None,
        }
    }

    fn finish(self, outcome: Result<StopReason, RecoveryError>) -> RecoveryOutput {
        let mut output = self.output();
        match outcome {
            Ok(reason) => {
                info!(
                    ?reason,
                    objective = ?output.objective,
                    iterations = self.iteration.index,
                    "recovery finished"
                );
            }
            Err(error) => {
                warn!(error = %error, objective = ?output.objective, "recovery aborted");
                output.success = false;
                output.error = Some(RecoveryFailure {
                    code: error.code(),
                    message: error.to_string(),
                });
            }
        }
        send_event!(
            self.publisher,
            RecoveryEventType::Finished {
                success: output.success,
                objective: output.objective,
            }
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{
        solver::{HighsSolver, IpSolution, LpModel},
        test_support::Scenario,
    };

    fn column(input: &RecoveryInput, registration: &str, keys: &[&str], cost: f64) -> BunchCandidate {
        BunchCandidate {
            aircraft: input.fleet.lookup(registration).unwrap(),
            tasks: keys
                .iter()
                .map(|k| input.task(input.tasks.lookup(k).unwrap()).clone())
                .collect(),
            cost,
            reduced_cost: 0.0,
        }
    }

    /// A controller over `input` whose store holds exactly `columns`.
    fn controller_with<'a>(
        input: &'a RecoveryInput,
        rules: &'a DefaultRules,
        config: &'a RecoveryConfig,
        columns: Vec<BunchCandidate>,
    ) -> (RecoveryController<'a>, Vec<usize>) {
        let solver = Box::new(HighsSolver::new(config.node_limit));
        let mut controller = RecoveryController::new(input, rules, config, solver).unwrap();
        let added = controller.store.add(0, columns);
        controller.master.add_columns(input, &controller.store, &added).unwrap();
        (controller, added)
    }

    fn close(objective: Option<f64>, expected: f64) -> bool {
        objective.is_some_and(|o| (o - expected).abs() < 1e-6)
    }

    /// B-1 cannot turn f1 into f2 on time; idle B-2 sits at SHA.
    fn swap_scenario() -> Scenario {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        s.aircraft("B-2", "SHA");
        s.flight("f1", "PEK", "SHA", 60, 120, Some(a));
        s.flight("f2", "SHA", "PEK", 190, 120, Some(a));
        s.config.bad_reduced_cost_columns = 0;
        s.config.tabu_size = 0;
        s.config.stall_limit = 2;
        s
    }

    #[test]
    fn swapping_aircraft_beats_delaying() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (input, config) = swap_scenario().build();
        let (tx, rx) = mpsc::channel();
        let output = run(&input, &config, Some(tx), StopToken::new());

        assert!(output.success, "{:?}", output.error);
        // status quo delays f2 by 30 minutes at 60 per minute
        let objective = output.objective.unwrap();
        assert!((objective - 500.0).abs() < 1e-6, "objective {objective}");
        assert_eq!(output.flights.len(), 2);
        assert_eq!(output.cancelled().count(), 0);
        let f2 = output.flights.iter().find(|d| d.key == "f2").unwrap();
        assert_eq!(f2.recovered_aircraft.as_deref(), Some("B-2"));
        assert_eq!(f2.delay_minutes, 0);
        assert!(output.lower_bound.is_some_and(|lb| lb <= objective + 1e-6));
        assert!(output.counters.iterations >= 2);

        let events: Vec<RecoveryEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e.data, RecoveryEventType::Heartbeat { .. })));
        assert!(matches!(
            events.last().map(|e| &e.data),
            Some(RecoveryEventType::Finished { success: true, .. })
        ));
    }

    #[test]
    fn stop_token_returns_the_first_incumbent() {
        let (input, config) = swap_scenario().build();
        let stop = StopToken::new();
        stop.request_stop();
        let output = run(&input, &config, None, stop);
        assert!(output.success);
        assert!(close(output.objective, 1800.0));
        assert_eq!(output.counters.iterations, 0);
        assert_eq!(output.counters.ip_solves, 1);
    }

    #[test]
    fn time_limit_is_a_clean_stop() {
        let (input, mut config) = swap_scenario().build();
        config.time_limit_secs = 0;
        let output = run(&input, &config, None, StopToken::new());
        assert!(output.success);
        assert!(output.error.is_none());
        assert_eq!(output.counters.iterations, 0);
    }

    #[test]
    fn undisrupted_schedule_stops_at_zero_cost() {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        s.flight("f1", "PEK", "SHA", 60, 120, Some(a));
        s.flight("f2", "SHA", "PEK", 300, 120, Some(a));
        s.maintenance("chk", "PEK", 600, 60, a);
        let (input, config) = s.build();
        let output = run(&input, &config, None, StopToken::new());
        assert!(output.success);
        assert!(close(output.objective, 0.0));
        assert_eq!(output.counters.lp_solves, 0);
        assert_eq!(output.maintenances.len(), 1);
        assert!(!output.maintenances[0].cancelled);
    }

    #[test]
    fn unknown_solver_fails_without_a_solution() {
        let (input, mut config) = swap_scenario().build();
        config.solver = "cplex".to_string();
        let output = run(&input, &config, None, StopToken::new());
        assert!(!output.success);
        assert!(output.objective.is_none());
        let error = output.error.unwrap();
        assert_eq!(error.code, 4);
        assert!(error.message.contains("cplex"));
    }

    /// Solves integer programs but refuses every relaxation.
    struct BrokenRelaxation(HighsSolver);

    impl MasterSolver for BrokenRelaxation {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn solve_lp(&self, _model: &LpModel) -> Result<LpSolution, SolverError> {
            Err(SolverError::Unbounded)
        }
        fn solve_ip(&self, model: &LpModel) -> Result<IpSolution, SolverError> {
            self.0.solve_ip(model)
        }
    }

    #[test]
    fn failure_keeps_the_best_captured_solution() {
        let (input, config) = swap_scenario().build();
        let rules = DefaultRules::new(&config);
        let solver = Box::new(BrokenRelaxation(HighsSolver::new(config.node_limit)));
        let output = RecoveryController::new(&input, &rules, &config, solver)
            .unwrap()
            .solve();
        assert!(!output.success);
        assert!(close(output.objective, 1800.0));
        assert_eq!(output.flights.len(), 2);
        assert_eq!(output.error.map(|e| e.code), Some(4));
    }

    #[test]
    fn local_fixing_skips_busy_aircraft_and_covered_tasks() {
        let (input, config) = swap_scenario().build();
        let rules = DefaultRules::new(&config);
        let columns = vec![
            column(&input, "B-1", &["f1"], 0.0),
            column(&input, "B-2", &["f1"], 0.0),
            column(&input, "B-1", &["f2"], 0.0),
            column(&input, "B-2", &["f2"], 0.0),
            column(&input, "B-2", &[], 0.0),
        ];
        let (mut controller, c) = controller_with(&input, &rules, &config, columns);
        let open = [AircraftId(0), AircraftId(1)];

        // c[1] repeats f1, c[2] reuses B-1, c[4] falls under the threshold
        let values = [(c[0], 0.97), (c[1], 0.95), (c[2], 0.94), (c[3], 0.93), (c[4], 0.5)];
        assert_eq!(controller.locally_fix(&values, &open), 2);
        let fixed: Vec<usize> = controller.store.fixed().collect();
        assert_eq!(fixed, vec![c[0], c[3]]);
        assert_eq!(controller.counters.columns_fixed, 2);

        // Fixed columns keep their aircraft busy on the next pass
        assert_eq!(controller.locally_fix(&[(c[2], 1.0), (c[4], 1.0)], &open), 0);
    }

    #[test]
    fn local_fixing_falls_back_to_the_single_best_column() {
        let (input, config) = swap_scenario().build();
        let rules = DefaultRules::new(&config);
        let columns = vec![
            column(&input, "B-1", &["f1"], 0.0),
            column(&input, "B-2", &["f2"], 0.0),
            column(&input, "B-1", &["f1", "f2"], 1800.0),
        ];
        let (mut controller, c) = controller_with(&input, &rules, &config, columns);

        // Nothing reaches the threshold and c[2] is below the minimum
        assert_eq!(controller.locally_fix(&[(c[2], 0.0005)], &[AircraftId(0)]), 0);
        // B-2 is not open, so c[1] cannot be the fallback
        let values = [(c[0], 0.4), (c[1], 0.6), (c[2], 0.3)];
        assert_eq!(controller.locally_fix(&values, &[AircraftId(0)]), 1);
        assert!(controller.store.is_fixed(c[0]));
        assert!(!controller.store.is_fixed(c[1]));
        assert!(!controller.store.is_fixed(c[2]));
    }

    #[test]
    fn pruning_spares_kept_columns_and_lowers_the_threshold() {
        let (input, mut config) = swap_scenario().build();
        config.column_cap = 2;
        let rules = DefaultRules::new(&config);
        let columns = vec![
            column(&input, "B-1", &["f1", "f2"], 1800.0),
            column(&input, "B-1", &["f1"], 30.0),
            column(&input, "B-2", &["f2"], 20.0),
            column(&input, "B-2", &[], 1.0),
        ];
        let (mut controller, c) = controller_with(&input, &rules, &config, columns);
        controller.store.set_kept([c[0]]);

        controller.prune();
        assert_eq!(controller.counters.columns_removed, 2);
        assert!(!controller.store.is_removed(c[0]));
        assert!(controller.store.is_removed(c[1]));
        assert!(controller.store.is_removed(c[2]));
        assert!(!controller.store.is_removed(c[3]));
        assert!(controller.removal_threshold < config.removal_threshold);

        // Back under the cap
        controller.prune();
        assert_eq!(controller.counters.columns_removed, 2);
    }

    #[test]
    fn column_cap_prunes_during_the_run() {
        let (input, mut config) = swap_scenario().build();
        config.column_cap = 1;
        let output = run(&input, &config, None, StopToken::new());
        assert!(output.success, "{:?}", output.error);
        assert!(output.counters.columns_removed > 0);
        assert!(output.objective.is_some_and(|o| o <= 1800.0 + 1e-6));
    }

    #[test]
    fn rule_errors_abort_before_any_solve() {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        s.flight("bad", "PEK", "SHA", 60, -5, Some(a));
        let (input, config) = s.build();
        let output = run(&input, &config, None, StopToken::new());
        assert!(!output.success);
        assert_eq!(output.error.map(|e| e.code), Some(2));
        assert_eq!(output.counters.ip_solves, 0);
    }
}
