//! Solver boundary for the master problem.
//!
//! The master is assembled as a plain [`LpModel`] (row-sense form, sparse
//! columns) and handed to a [`MasterSolver`]. [`HighsSolver`] translates it
//! into a `good_lp` problem and solves it with HiGHS, which also reports the
//! row duals the pricer needs.

use good_lp::{
    constraint,
    solvers::{highs::highs, DualValues, SolutionWithDual},
    variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel,
};
use thiserror::Error;
use tracing::debug;

use crate::model::RecoveryConfig;

const EPS: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("unknown solver `{0}`")]
    UnknownSolver(String),
    #[error("master problem is infeasible")]
    Infeasible,
    #[error("master problem is unbounded")]
    Unbounded,
    #[error("solver backend failed: {0}")]
    Backend(String),
    #[error("variable `{0}` has inconsistent bounds")]
    InvalidBounds(String),
    #[error("row {0} does not exist")]
    UnknownRow(usize),
}

impl From<ResolutionError> for SolverError {
    fn from(error: ResolutionError) -> Self {
        match error {
            ResolutionError::Infeasible => SolverError::Infeasible,
            ResolutionError::Unbounded => SolverError::Unbounded,
            other => SolverError::Backend(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSense {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone)]
pub struct Row {
    pub name: String,
    pub sense: RowSense,
    pub rhs: f64,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub cost: f64,
    pub lb: f64,
    pub ub: f64,
    pub integer: bool,
    /// The rows already cap this variable at `ub`. The relaxation leaves the
    /// bound off so its dual lands on those rows.
    pub implied_ub: bool,
    coefficients: Vec<(usize, f64)>,
}

/// Minimisation LP/IP in row-sense form with column-wise sparse storage.
#[derive(Debug, Clone, Default)]
pub struct LpModel {
    rows: Vec<Row>,
    variables: Vec<Variable>,
}

impl LpModel {
    pub fn add_row(&mut self, name: impl Into<String>, sense: RowSense, rhs: f64) -> usize {
        self.rows.push(Row {
            name: name.into(),
            sense,
            rhs,
        });
        self.rows.len() - 1
    }

    /// 0/1 variable. With `implied` the rows alone keep it at most one.
    pub fn add_binary(&mut self, name: impl Into<String>, cost: f64, implied: bool) -> usize {
        self.push_variable(name.into(), cost, 1.0, true, implied)
    }

    /// Nonnegative continuous variable without upper bound.
    pub fn add_continuous(&mut self, name: impl Into<String>, cost: f64) -> usize {
        self.push_variable(name.into(), cost, f64::INFINITY, false, false)
    }

    fn push_variable(&mut self, name: String, cost: f64, ub: f64, integer: bool, implied_ub: bool) -> usize {
        self.variables.push(Variable {
            name,
            cost,
            lb: 0.0,
            ub,
            integer,
            implied_ub,
            coefficients: Vec::new(),
        });
        self.variables.len() - 1
    }

    /// Adds `value` to the coefficient of `var` in `row`.
    pub fn add_coefficient(&mut self, var: usize, row: usize, value: f64) -> Result<(), SolverError> {
        if row >= self.rows.len() {
            return Err(SolverError::UnknownRow(row));
        }
        let coefficients = &mut self.variables[var].coefficients;
        match coefficients.iter_mut().find(|(r, _)| *r == row) {
            Some((_, existing)) => *existing += value,
            None => coefficients.push((row, value)),
        }
        Ok(())
    }

    pub fn set_bounds(&mut self, var: usize, lb: f64, ub: f64) {
        let variable = &mut self.variables[var];
        variable.lb = lb;
        variable.ub = ub;
    }

    pub fn objective(&self, values: &[f64]) -> f64 {
        self.variables
            .iter()
            .zip(values)
            .map(|(v, x)| v.cost * x)
            .sum()
    }

    /// Whether the all-zero point satisfies every row.
    fn zero_is_feasible(&self) -> bool {
        self.rows.iter().all(|row| match row.sense {
            RowSense::Le => row.rhs >= -EPS,
            RowSense::Ge => row.rhs <= EPS,
            RowSense::Eq => row.rhs.abs() <= EPS,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LpSolution {
    pub objective: f64,
    pub values: Vec<f64>,
    /// One per model row, in row order. Nonnegative on `≥` rows and
    /// nonpositive on `≤` rows.
    pub duals: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct IpSolution {
    pub objective: f64,
    pub values: Vec<f64>,
}

pub trait MasterSolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn solve_lp(&self, model: &LpModel) -> Result<LpSolution, SolverError>;
    fn solve_ip(&self, model: &LpModel) -> Result<IpSolution, SolverError>;
}

pub fn solver_by_name(name: &str, config: &RecoveryConfig) -> Result<Box<dyn MasterSolver>, SolverError> {
    match name.to_ascii_lowercase().as_str() {
        "highs" => Ok(Box::new(HighsSolver::new(config.node_limit))),
        _ => Err(SolverError::UnknownSolver(name.to_string())),
    }
}

/// HiGHS through `good_lp`. `node_limit` caps the branch-and-bound tree.
#[derive(Debug, Clone)]
pub struct HighsSolver {
    node_limit: usize,
}

impl HighsSolver {
    pub fn new(node_limit: usize) -> Self {
        Self { node_limit }
    }
}

/// Every row is handed over as `expr ≤ rhs` or `expr = rhs`; `≥` rows are
/// negated on the way in and their duals negated on the way out.
struct Translated {
    vars: ProblemVariables,
    columns: Vec<good_lp::Variable>,
    objective: Expression,
    rows: Vec<(good_lp::Constraint, f64)>,
}

fn translate(model: &LpModel, integral: bool) -> Result<Translated, SolverError> {
    let mut vars = ProblemVariables::new();
    let mut columns = Vec::with_capacity(model.variables.len());
    for var in &model.variables {
        if !var.lb.is_finite() || var.lb < 0.0 || var.lb > var.ub + EPS {
            return Err(SolverError::InvalidBounds(var.name.clone()));
        }
        let mut definition = variable().name(var.name.clone()).min(var.lb);
        let relaxed_implied = !integral && var.implied_ub && var.ub >= 1.0;
        if var.ub.is_finite() && !relaxed_implied {
            definition = definition.max(var.ub);
        }
        if integral && var.integer {
            definition = definition.integer();
        }
        columns.push(vars.add(definition));
    }

    let objective: Expression = model
        .variables
        .iter()
        .zip(&columns)
        .map(|(var, &column)| var.cost * column)
        .sum();

    let mut sides: Vec<Expression> = (0..model.rows.len())
        .map(|_| Expression::with_capacity(4))
        .collect();
    for (var, &column) in model.variables.iter().zip(&columns) {
        for &(row, a) in &var.coefficients {
            let sign = if model.rows[row].sense == RowSense::Ge { -1.0 } else { 1.0 };
            sides[row].add_mul(sign * a, column);
        }
    }
    let rows = model
        .rows
        .iter()
        .zip(sides)
        .map(|(row, side)| match row.sense {
            RowSense::Le => (constraint::leq(side, row.rhs), 1.0),
            RowSense::Ge => (constraint::leq(side, -row.rhs), -1.0),
            RowSense::Eq => (constraint::eq(side, row.rhs), 1.0),
        })
        .collect();

    Ok(Translated {
        vars,
        columns,
        objective,
        rows,
    })
}

impl MasterSolver for HighsSolver {
    fn name(&self) -> &'static str {
        "highs"
    }

    fn solve_lp(&self, model: &LpModel) -> Result<LpSolution, SolverError> {
        if model.variables.is_empty() {
            return trivial(model).map(|values| LpSolution {
                objective: 0.0,
                values,
                duals: vec![0.0; model.rows.len()],
            });
        }
        let Translated {
            vars,
            columns,
            objective,
            rows,
        } = translate(model, false)?;
        let mut problem = vars.minimise(objective).using(highs);
        let mut references = Vec::with_capacity(rows.len());
        let mut signs = Vec::with_capacity(rows.len());
        for (row, sign) in rows {
            references.push(problem.add_constraint(row));
            signs.push(sign);
        }

        let mut solution = problem.solve()?;
        let values: Vec<f64> = columns.iter().map(|c| solution.value(*c)).collect();
        let dual = solution.compute_dual();
        let duals = references
            .into_iter()
            .zip(signs)
            .map(|(reference, sign)| sign * dual.dual(reference))
            .collect();
        let objective = model.objective(&values);
        debug!(objective, rows = model.rows.len(), columns = values.len(), "relaxation solved");
        Ok(LpSolution {
            objective,
            values,
            duals,
        })
    }

    fn solve_ip(&self, model: &LpModel) -> Result<IpSolution, SolverError> {
        if model.variables.is_empty() {
            return trivial(model).map(|values| IpSolution {
                objective: 0.0,
                values,
            });
        }
        let Translated {
            vars,
            columns,
            objective,
            rows,
        } = translate(model, true)?;
        let node_limit = i32::try_from(self.node_limit).unwrap_or(i32::MAX);
        let mut problem = vars
            .minimise(objective)
            .using(highs)
            .set_option("mip_max_nodes", node_limit);
        for (row, _) in rows {
            problem.add_constraint(row);
        }

        let solution = problem.solve()?;
        let values: Vec<f64> = columns
            .iter()
            .zip(&model.variables)
            .map(|(c, var)| {
                let x = solution.value(*c);
                if var.integer {
                    x.round()
                } else {
                    x
                }
            })
            .collect();
        let objective = model.objective(&values);
        debug!(objective, columns = values.len(), "integer master solved");
        Ok(IpSolution { objective, values })
    }
}

/// A model with no variables: feasible only if zero satisfies every row.
fn trivial(model: &LpModel) -> Result<Vec<f64>, SolverError> {
    if model.zero_is_feasible() {
        Ok(Vec::new())
    } else {
        Err(SolverError::Infeasible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    /// min 2x + 3y  s.t.  x + y ≥ 4,  x + 3y ≥ 6,  x ≤ 10
    fn textbook() -> LpModel {
        let mut model = LpModel::default();
        let r0 = model.add_row("cover", RowSense::Ge, 4.0);
        let r1 = model.add_row("weighted", RowSense::Ge, 6.0);
        let r2 = model.add_row("cap", RowSense::Le, 10.0);
        let x = model.add_continuous("x", 2.0);
        let y = model.add_continuous("y", 3.0);
        for (var, row, a) in [(x, r0, 1.0), (y, r0, 1.0), (x, r1, 1.0), (y, r1, 3.0), (x, r2, 1.0)] {
            model.add_coefficient(var, row, a).unwrap();
        }
        model
    }

    #[test]
    fn lp_primal_and_duals() {
        let lp = HighsSolver::new(100).solve_lp(&textbook()).unwrap();
        assert!(close(lp.objective, 9.0));
        assert!(close(lp.values[0], 3.0) && close(lp.values[1], 1.0));
        assert!(close(lp.duals[0], 1.5));
        assert!(close(lp.duals[1], 0.5));
        assert!(close(lp.duals[2], 0.0));
        // strong duality
        let dual_objective: f64 = lp.duals.iter().zip([4.0, 6.0, 10.0]).map(|(y, b)| y * b).sum();
        assert!(close(dual_objective, lp.objective));
    }

    #[test]
    fn negative_rhs_rows_keep_their_dual_sign() {
        let mut model = LpModel::default();
        // -x - y ≤ -4 is x + y ≥ 4 written the other way round
        let r0 = model.add_row("cover", RowSense::Le, -4.0);
        let r1 = model.add_row("weighted", RowSense::Ge, 6.0);
        let x = model.add_continuous("x", 2.0);
        let y = model.add_continuous("y", 3.0);
        for (var, row, a) in [(x, r0, -1.0), (y, r0, -1.0), (x, r1, 1.0), (y, r1, 3.0)] {
            model.add_coefficient(var, row, a).unwrap();
        }
        let lp = HighsSolver::new(100).solve_lp(&model).unwrap();
        assert!(close(lp.objective, 9.0));
        assert!(close(lp.duals[0], -1.5));
        assert!(close(lp.duals[1], 0.5));
    }

    #[test]
    fn equality_row_duals_price_columns_to_zero() {
        // min 4a + 3b + 5c  s.t.  a + b = 1 (t0),  a + c = 1 (t1)
        let mut model = LpModel::default();
        let t0 = model.add_row("task:t0", RowSense::Eq, 1.0);
        let t1 = model.add_row("task:t1", RowSense::Eq, 1.0);
        let a = model.add_binary("a", 4.0, true);
        let b = model.add_binary("b", 3.0, true);
        let c = model.add_binary("c", 5.0, true);
        for (var, row) in [(a, t0), (a, t1), (b, t0), (c, t1)] {
            model.add_coefficient(var, row, 1.0).unwrap();
        }
        let lp = HighsSolver::new(100).solve_lp(&model).unwrap();
        assert!(close(lp.objective, 4.0));
        assert!(close(lp.values[a], 1.0));
        // a is basic at one: 4 - y0 - y1 = 0, and no column prices out negative
        assert!(close(4.0 - lp.duals[0] - lp.duals[1], 0.0));
        assert!(3.0 - lp.duals[0] >= -1e-6);
        assert!(5.0 - lp.duals[1] >= -1e-6);
    }

    #[test]
    fn infeasible_and_unbounded_are_reported() {
        let mut model = LpModel::default();
        let r = model.add_row("impossible", RowSense::Le, -1.0);
        let x = model.add_continuous("x", 1.0);
        model.add_coefficient(x, r, 1.0).unwrap();
        assert!(matches!(
            HighsSolver::new(10).solve_lp(&model),
            Err(SolverError::Infeasible | SolverError::Unbounded)
        ));

        let mut model = LpModel::default();
        let r = model.add_row("floor", RowSense::Ge, 1.0);
        let x = model.add_continuous("x", -1.0);
        model.add_coefficient(x, r, 1.0).unwrap();
        assert!(HighsSolver::new(10).solve_lp(&model).is_err());
    }

    #[test]
    fn empty_models_need_no_backend() {
        let mut model = LpModel::default();
        model.add_row("aircraft:B-1", RowSense::Le, 1.0);
        let lp = HighsSolver::new(10).solve_lp(&model).unwrap();
        assert_eq!(lp.duals, vec![0.0]);
        assert!(close(HighsSolver::new(10).solve_ip(&model).unwrap().objective, 0.0));

        model.add_row("task:f1", RowSense::Eq, 1.0);
        assert!(matches!(HighsSolver::new(10).solve_ip(&model), Err(SolverError::Infeasible)));
    }

    /// Three tasks, three pair columns and three singles.
    fn triangle() -> LpModel {
        let mut model = LpModel::default();
        let rows: Vec<usize> = (0..3)
            .map(|i| model.add_row(format!("task:t{i}"), RowSense::Eq, 1.0))
            .collect();
        for (a, b) in [(0, 1), (1, 2), (0, 2)] {
            let var = model.add_binary(format!("pair{a}{b}"), 3.0, true);
            model.add_coefficient(var, rows[a], 1.0).unwrap();
            model.add_coefficient(var, rows[b], 1.0).unwrap();
        }
        for (i, &row) in rows.iter().enumerate() {
            let var = model.add_binary(format!("single{i}"), 2.0, true);
            model.add_coefficient(var, row, 1.0).unwrap();
        }
        model
    }

    #[test]
    fn integrality_closes_the_gap() {
        let model = triangle();
        let solver = HighsSolver::new(1000);
        let lp = solver.solve_lp(&model).unwrap();
        assert!(close(lp.objective, 4.5));

        let ip = solver.solve_ip(&model).unwrap();
        assert!(close(ip.objective, 5.0));
        assert!(ip.values.iter().all(|v| close(*v, 0.0) || close(*v, 1.0)));
        assert!(close(ip.values[..3].iter().sum::<f64>(), 1.0));
    }

    #[test]
    fn bounds_fix_and_drop_variables() {
        let solver = HighsSolver::new(100);
        let mut model = triangle();
        // pair01 forced in leaves t2 to its single
        model.set_bounds(0, 1.0, 1.0);
        let lp = solver.solve_lp(&model).unwrap();
        assert!(close(lp.objective, 5.0));
        assert!(close(lp.values[0], 1.0));
        assert!(close(lp.values[5], 1.0));

        // ...and without the single nothing covers t2
        model.set_bounds(5, 0.0, 0.0);
        assert!(matches!(
            solver.solve_lp(&model),
            Err(SolverError::Infeasible | SolverError::Unbounded)
        ));
    }

    #[test]
    fn unknown_solver_is_rejected() {
        let config = RecoveryConfig::default();
        assert!(solver_by_name("highs", &config).is_ok());
        assert!(matches!(
            solver_by_name("cplex", &config),
            Err(SolverError::UnknownSolver(name)) if name == "cplex"
        ));
    }
}
