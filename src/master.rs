//! Column store and the restricted master problem built over it.
//!
//! Columns are grouped by the iteration that generated them; a column's
//! index is handed out once and never reused, removed or not.

use std::collections::{BTreeSet, HashMap};

use chrono::TimeDelta;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    aircraft::AircraftId,
    airport::{FleetBalanceId, FlowControlId},
    bunch::{BunchCandidate, BunchSignature, FlightTaskBunch},
    model::{RecoveryConfig, RecoveryInput},
    rules::RecoveryRules,
    shadow::{ShadowFamily, ShadowPriceKey, ShadowPriceMap},
    solver::{IpSolution, LpModel, LpSolution, MasterSolver, RowSense, SolverError},
    task::TaskId,
};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("no master row covers task `{0}`")]
    MissingTaskRow(String),
    #[error("no master row for aircraft `{0}`")]
    MissingAircraftRow(String),
    #[error("column {0} is unknown to the master model")]
    UnknownColumn(usize),
    #[error(transparent)]
    Solver(#[from] SolverError),
}

// MARK: Column store

#[derive(Debug, Default)]
pub struct ColumnStore {
    generations: Vec<Vec<FlightTaskBunch>>,
    locations: Vec<(usize, usize)>,
    removed: Vec<bool>,
    live: HashMap<BunchSignature, usize>,
    fixed: BTreeSet<usize>,
    kept: BTreeSet<usize>,
}

impl ColumnStore {
    /// Registers candidates generated in `iteration`; candidates identical to
    /// a live column are skipped. Returns the new indices in candidate order.
    pub fn add(&mut self, iteration: usize, candidates: Vec<BunchCandidate>) -> Vec<usize> {
        if self.generations.len() <= iteration {
            self.generations.resize_with(iteration + 1, Vec::new);
        }
        let mut added = Vec::new();
        for candidate in candidates {
            let signature = candidate.signature();
            if self.live.contains_key(&signature) {
                continue;
            }
            let index = self.locations.len();
            let generation = &mut self.generations[iteration];
            self.locations.push((iteration, generation.len()));
            generation.push(FlightTaskBunch::from_candidate(candidate, index, iteration));
            self.removed.push(false);
            self.live.insert(signature, index);
            added.push(index);
        }
        added
    }

    #[inline]
    pub fn get(&self, index: usize) -> &FlightTaskBunch {
        let (iteration, position) = self.locations[index];
        &self.generations[iteration][position]
    }

    pub fn try_get(&self, index: usize) -> Option<&FlightTaskBunch> {
        self.locations.get(index).map(|_| self.get(index))
    }

    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        self.locations.get(index).copied()
    }

    pub fn at(&self, iteration: usize, position: usize) -> Option<&FlightTaskBunch> {
        self.generations.get(iteration)?.get(position)
    }

    /// Every index ever handed out.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn is_removed(&self, index: usize) -> bool {
        self.removed.get(index).copied().unwrap_or(true)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|i| !self.removed[*i])
    }

    pub fn columns_of(&self, aircraft: AircraftId) -> impl Iterator<Item = &FlightTaskBunch> + '_ {
        self.live_indices()
            .map(|i| self.get(i))
            .filter(move |b| b.aircraft == aircraft)
    }

    pub fn fix(&mut self, index: usize) {
        self.fixed.insert(index);
    }

    pub fn clear_fixed(&mut self) {
        self.fixed.clear();
    }

    pub fn is_fixed(&self, index: usize) -> bool {
        self.fixed.contains(&index)
    }

    pub fn fixed(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed.iter().copied()
    }

    pub fn set_kept(&mut self, kept: impl IntoIterator<Item = usize>) {
        self.kept = kept.into_iter().collect();
    }

    pub fn is_kept(&self, index: usize) -> bool {
        self.kept.contains(&index)
    }

    fn remove(&mut self, index: usize) {
        if self.removed[index] {
            return;
        }
        self.removed[index] = true;
        let signature = self.get(index).signature();
        self.live.remove(&signature);
    }

    /// Prunes non-fixed, non-kept columns whose reduced cost exceeds
    /// `threshold`, dearest first, until at most `cap` columns are live.
    /// While still over the cap the threshold shrinks by `shrink` down to
    /// `floor`; at the floor the dearest remaining columns go regardless.
    /// Returns the removed indices and the threshold to use next time.
    pub fn remove_columns(
        &mut self,
        reduced_cost: impl Fn(&FlightTaskBunch) -> f64,
        threshold: f64,
        cap: usize,
        shrink: f64,
        floor: f64,
    ) -> (Vec<usize>, f64) {
        let mut removed = Vec::new();
        if self.live_count() <= cap {
            return (removed, threshold);
        }
        let mut ranked: Vec<(usize, f64)> = self
            .live_indices()
            .filter(|i| !self.is_fixed(*i) && !self.is_kept(*i))
            .map(|i| (i, reduced_cost(self.get(i))))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut threshold = threshold;
        let mut cursor = 0;
        loop {
            while cursor < ranked.len() && self.live_count() > cap && ranked[cursor].1 > threshold {
                self.remove(ranked[cursor].0);
                removed.push(ranked[cursor].0);
                cursor += 1;
            }
            if self.live_count() <= cap || cursor == ranked.len() {
                break;
            }
            if threshold <= floor {
                while cursor < ranked.len() && self.live_count() > cap {
                    self.remove(ranked[cursor].0);
                    removed.push(ranked[cursor].0);
                    cursor += 1;
                }
                break;
            }
            threshold = (threshold * shrink).max(floor);
        }
        debug!(removed = removed.len(), live = self.live_count(), threshold, "pruned columns");
        (removed, threshold)
    }
}

// MARK: Master model

/// Restricted master problem: one binary per column, one cancel binary per
/// task, and penalty slacks on the side rows.
#[derive(Debug)]
pub struct MasterModel {
    lp: LpModel,
    row_keys: Vec<(String, ShadowPriceKey)>,
    task_rows: HashMap<TaskId, usize>,
    aircraft_rows: HashMap<AircraftId, usize>,
    flow_rows: HashMap<FlowControlId, usize>,
    balance_rows: HashMap<FleetBalanceId, usize>,
    tight_row: Option<usize>,
    column_vars: HashMap<usize, usize>,
    cancel_vars: Vec<(TaskId, usize)>,
    tight_turn: TimeDelta,
}

impl MasterModel {
    pub fn new(
        input: &RecoveryInput,
        rules: &dyn RecoveryRules,
        config: &RecoveryConfig,
    ) -> Result<Self, MasterError> {
        let weights = &config.weights;
        let mut master = Self {
            lp: LpModel::default(),
            row_keys: Vec::new(),
            task_rows: HashMap::new(),
            aircraft_rows: HashMap::new(),
            flow_rows: HashMap::new(),
            balance_rows: HashMap::new(),
            tight_row: None,
            column_vars: HashMap::new(),
            cancel_vars: Vec::new(),
            tight_turn: config.tight_turn(),
        };

        for task in input.recoverable_tasks() {
            let row = master.row(
                format!("task:{}", task.key),
                ShadowPriceKey::FlightTask(task.id),
                RowSense::Eq,
                1.0,
            );
            master.task_rows.insert(task.id, row);
            let var = master
                .lp
                .add_binary(format!("cancel:{}", task.key), rules.cancel_cost(task), true);
            master.lp.add_coefficient(var, row, 1.0)?;
            master.cancel_vars.push((task.id, var));
        }
        for aircraft in input.fleet.iter() {
            let row = master.row(
                format!("aircraft:{}", aircraft.registration),
                ShadowPriceKey::Aircraft(aircraft.id),
                RowSense::Le,
                1.0,
            );
            master.aircraft_rows.insert(aircraft.id, row);
        }
        for control in input.flow_controls.controls() {
            let row = master.row(
                format!("flow:{}", control.id),
                ShadowPriceKey::FlowControl(control.id),
                RowSense::Le,
                f64::from(control.capacity),
            );
            master.flow_rows.insert(control.id, row);
            let over = master
                .lp
                .add_continuous(format!("over:{}", control.id), weights.flow_overflow_penalty);
            master.lp.add_coefficient(over, row, -1.0)?;
        }
        for balance in &input.fleet_balances {
            let row = master.row(
                format!("balance:{}", balance.id),
                ShadowPriceKey::FleetBalance(balance.id),
                RowSense::Ge,
                f64::from(balance.required),
            );
            master.balance_rows.insert(balance.id, row);
            let short = master
                .lp
                .add_continuous(format!("short:{}", balance.id), weights.fleet_shortfall_penalty);
            master.lp.add_coefficient(short, row, 1.0)?;
        }
        if let Some(budget) = config.tight_turn_budget {
            let row = master.row(
                "tight_turn".to_string(),
                ShadowPriceKey::TightTurn,
                RowSense::Le,
                f64::from(budget),
            );
            master.tight_row = Some(row);
            let excess = master.lp.add_continuous("excess", weights.tight_turn_penalty);
            master.lp.add_coefficient(excess, row, -1.0)?;
        }
        debug!(rows = master.row_keys.len(), "master rows registered");
        Ok(master)
    }

    fn row(&mut self, name: String, key: ShadowPriceKey, sense: RowSense, rhs: f64) -> usize {
        let row = self.lp.add_row(name.clone(), sense, rhs);
        self.row_keys.push((name, key));
        row
    }

    /// Adds one variable per new column and its coefficients on every row
    /// the column touches. Existing variables are left alone.
    pub fn add_columns(
        &mut self,
        input: &RecoveryInput,
        store: &ColumnStore,
        indices: &[usize],
    ) -> Result<(), MasterError> {
        for &index in indices {
            if self.column_vars.contains_key(&index) {
                continue;
            }
            let bunch = store.try_get(index).ok_or(MasterError::UnknownColumn(index))?;
            let aircraft = input.aircraft(bunch.aircraft);
            let usability = input.usability(bunch.aircraft);
            let var = self.lp.add_binary(format!("x{index}"), bunch.cost, true);

            let row = *self
                .aircraft_rows
                .get(&bunch.aircraft)
                .ok_or_else(|| MasterError::MissingAircraftRow(aircraft.registration.clone()))?;
            self.lp.add_coefficient(var, row, 1.0)?;
            for task in &bunch.tasks {
                let origin = task.origin.unwrap_or(task.id);
                let row = *self
                    .task_rows
                    .get(&origin)
                    .ok_or_else(|| MasterError::MissingTaskRow(task.key.clone()))?;
                self.lp.add_coefficient(var, row, 1.0)?;
                for hit in input.flow_hits(task) {
                    if let Some(row) = self.flow_rows.get(&hit) {
                        self.lp.add_coefficient(var, *row, 1.0)?;
                    }
                }
            }
            let end = bunch.end_location(usability);
            let ready = bunch.ready_at(usability);
            for hit in input.balance_hits(bunch.aircraft, end, &ready) {
                if let Some(row) = self.balance_rows.get(&hit) {
                    self.lp.add_coefficient(var, *row, 1.0)?;
                }
            }
            if let Some(row) = self.tight_row {
                let turns = bunch.tight_turns(input.last_task(bunch.aircraft), self.tight_turn);
                if turns > 0 {
                    self.lp.add_coefficient(var, row, f64::from(turns))?;
                }
            }
            self.column_vars.insert(index, var);
        }
        Ok(())
    }

    /// Fixed columns at one, removed or `blocked` columns at zero, the rest free.
    pub fn apply_bounds(&mut self, store: &ColumnStore, blocked: impl Fn(&FlightTaskBunch) -> bool) {
        for (&index, &var) in &self.column_vars {
            let (lb, ub) = if store.is_removed(index) {
                (0.0, 0.0)
            } else if store.is_fixed(index) {
                (1.0, 1.0)
            } else if blocked(store.get(index)) {
                (0.0, 0.0)
            } else {
                (0.0, 1.0)
            };
            self.lp.set_bounds(var, lb, ub);
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub fn solve_lp(&self, solver: &dyn MasterSolver) -> Result<LpSolution, MasterError> {
        Ok(solver.solve_lp(&self.lp)?)
    }

    #[instrument(level = "debug", skip_all)]
    pub fn solve_ip(&self, solver: &dyn MasterSolver) -> Result<IpSolution, MasterError> {
        Ok(solver.solve_ip(&self.lp)?)
    }

    /// Pushes the duals of every constraint family into `shadow`.
    pub fn refresh_duals(&self, shadow: &mut ShadowPriceMap, duals: &[f64]) {
        for family in ShadowFamily::ALL {
            shadow.refresh(family, &self.row_keys, duals);
        }
    }

    pub fn column_value(&self, values: &[f64], index: usize) -> f64 {
        self.column_vars
            .get(&index)
            .and_then(|var| values.get(*var))
            .copied()
            .unwrap_or(0.0)
    }

    /// Columns at (or rounding to) one, ascending by index.
    pub fn selected_columns(&self, values: &[f64]) -> Vec<usize> {
        let mut selected: Vec<usize> = self
            .column_vars
            .iter()
            .filter(|(_, var)| values.get(**var).is_some_and(|v| *v > 0.5))
            .map(|(index, _)| *index)
            .collect();
        selected.sort_unstable();
        selected
    }

    pub fn cancelled_tasks(&self, values: &[f64]) -> Vec<TaskId> {
        self.cancel_vars
            .iter()
            .filter(|(_, var)| values.get(*var).is_some_and(|v| *v > 0.5))
            .map(|(task, _)| *task)
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        airport::FlowDirection,
        rules::DefaultRules,
        solver::HighsSolver,
        task::{FlightTask, RecoveryPolicy},
        test_support::{at, Scenario},
    };

    fn candidate(aircraft: AircraftId, tasks: Vec<FlightTask>, cost: f64) -> BunchCandidate {
        BunchCandidate {
            aircraft,
            tasks,
            cost,
            reduced_cost: cost,
        }
    }

    /// `n` distinct one-task columns on a single flight, departing a minute apart.
    fn spread(n: usize) -> (crate::model::RecoveryInput, Vec<BunchCandidate>) {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        let f = s.flight("f1", "PEK", "SHA", 60, 120, Some(a));
        let (input, _) = s.build();
        let candidates = (0..n)
            .map(|i| {
                let task = input.task(f).recover(RecoveryPolicy {
                    aircraft: a,
                    departure: at(60 + i as i64),
                    route: None,
                });
                candidate(a, vec![task], i as f64)
            })
            .collect();
        (input, candidates)
    }

    #[test]
    fn indices_are_stable_across_removal() {
        let (_, candidates) = spread(6);
        let mut store = ColumnStore::default();
        let first = store.add(0, candidates[..4].to_vec());
        let second = store.add(3, candidates[4..].to_vec());
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(second, vec![4, 5]);
        assert_eq!(store.locate(5), Some((3, 1)));
        let before = store.at(3, 1).map(|b| b.signature());

        let (removed, _) = store.remove_columns(|b| b.cost, 0.0, 2, 2.0 / 3.0, 5.0);
        assert_eq!(removed.len(), 4);
        assert!(store.is_removed(5));
        assert_eq!(store.at(3, 1).map(|b| b.signature()), before);
        assert_eq!(store.get(5).index, 5);

        // a regenerated column gets a fresh index
        let again = store.add(4, vec![candidates[5].clone()]);
        assert_eq!(again, vec![6]);
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn duplicates_of_live_columns_are_skipped() {
        let (_, candidates) = spread(2);
        let mut store = ColumnStore::default();
        store.add(0, candidates.clone());
        assert!(store.add(1, candidates).is_empty());
        assert_eq!(store.live_count(), 2);
    }

    #[test]
    fn removal_respects_cap_fixed_and_kept() {
        let (_, candidates) = spread(15);
        let mut store = ColumnStore::default();
        store.add(0, candidates);
        for i in [12, 13, 14] {
            store.fix(i);
        }
        store.set_kept([10, 11]);

        let (removed, threshold) = store.remove_columns(|b| b.cost, 50.0, 10, 2.0 / 3.0, 5.0);
        assert_eq!(removed.len(), 5);
        assert_eq!(store.live_count(), 10);
        for i in 10..15 {
            assert!(!store.is_removed(i));
        }
        // dearest non-protected columns went first
        assert_eq!(removed, vec![9, 8, 7, 6, 5]);
        assert!(threshold < 50.0);
    }

    #[test]
    fn removal_without_pressure_is_a_no_op() {
        let (_, candidates) = spread(3);
        let mut store = ColumnStore::default();
        store.add(0, candidates);
        let (removed, threshold) = store.remove_columns(|b| b.cost, 50.0, 10, 2.0 / 3.0, 5.0);
        assert!(removed.is_empty());
        assert_eq!(threshold, 50.0);
    }

    #[test]
    fn master_prefers_flying_to_cancelling() {
        let mut s = Scenario::new();
        let a = s.aircraft("B-1", "PEK");
        let f1 = s.flight("f1", "PEK", "SHA", 60, 120, Some(a));
        s.flow_control("PEK", FlowDirection::Departure, 0, 120, 0);
        let (input, config) = s.build();
        let rules = DefaultRules::new(&config);
        let mut master = MasterModel::new(&input, &rules, &config).unwrap();
        let mut store = ColumnStore::default();
        let added = store.add(0, vec![candidate(a, vec![input.task(f1).clone()], 0.0)]);
        master.add_columns(&input, &store, &added).unwrap();
        master.apply_bounds(&store, |_| false);

        let solver = HighsSolver::new(100);
        let lp = master.solve_lp(&solver).unwrap();
        // flying costs the flow overflow penalty, cancelling costs more
        assert!((lp.objective - config.weights.flow_overflow_penalty).abs() < 1e-6);
        assert_eq!(master.selected_columns(&lp.values), vec![0]);
        assert!(master.cancelled_tasks(&lp.values).is_empty());

        let mut shadow = ShadowPriceMap::new(config.tight_turn());
        master.refresh_duals(&mut shadow, &lp.duals);
        // the LP reduced cost of a basic column is zero
        assert!(shadow.reduced_cost(&input, store.get(0)).abs() < 1e-6);

        master.apply_bounds(&store, |b| b.aircraft == a);
        let ip = master.solve_ip(&solver).unwrap();
        assert_eq!(master.cancelled_tasks(&ip.values), vec![f1]);
    }
}
