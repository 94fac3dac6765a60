//! Per-aircraft connectivity graph over recoverable tasks.
//!
//! A forward breadth-first expansion from a virtual root (the aircraft's
//! starting station and ready time) links every task the aircraft could fly
//! next. Forward edges always go to strictly later scheduled departures, so
//! the graph is acyclic by construction. A second pass adds duplicate nodes
//! for pairs of tasks at the same station whose order may be swapped.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
};

use chrono::{DateTime, TimeDelta, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    aircraft::AircraftId,
    airport::AirportCode,
    model::{RecoveryConfig, RecoveryInput},
    rules::{RecoveryRules, RuleError},
    task::{FlightTask, TaskId},
};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cannot build graph for aircraft {registration}: {source}")]
    Rule {
        registration: String,
        #[source]
        source: RuleError,
    },
    #[error("graph for aircraft {0} is not acyclic")]
    Cyclic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    End,
    /// `reversed` marks the synthetic duplicates added by the reversal pass.
    Task { task: TaskId, reversed: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub kind: NodeKind,
    /// Earliest departure the node stands for (ready time for the root).
    pub time: DateTime<Utc>,
    pub index: usize,
}

impl Node {
    pub fn task(&self) -> Option<TaskId> {
        match self.kind {
            NodeKind::Task { task, .. } => Some(task),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub aircraft: AircraftId,
    nodes: Vec<Node>,
    succ: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl Graph {
    pub const ROOT: usize = 0;
    pub const END: usize = 1;

    #[inline]
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn successors(&self, index: usize) -> &[usize] {
        &self.succ[index]
    }

    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.succ[from].contains(&to)
    }

    /// Node indices in topological order: Kahn's algorithm, ready nodes
    /// released by (time, index).
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn edge_count(&self) -> usize {
        self.succ.iter().map(Vec::len).sum()
    }

    /// Anything for the pricer to do?
    pub fn is_trivial(&self) -> bool {
        self.succ[Self::ROOT].is_empty()
    }

    /// First node standing for `task` (regular nodes precede duplicates).
    pub fn node_of(&self, task: TaskId) -> Option<usize> {
        self.nodes.iter().position(|n| n.task() == Some(task))
    }
}

pub struct GraphBuilder<'a> {
    input: &'a RecoveryInput,
    rules: &'a dyn RecoveryRules,
    config: &'a RecoveryConfig,
}

struct Draft {
    nodes: Vec<Node>,
    succ: Vec<Vec<usize>>,
}

impl Draft {
    fn push(&mut self, kind: NodeKind, time: DateTime<Utc>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node { kind, time, index });
        self.succ.push(Vec::new());
        index
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.succ[from].contains(&to) {
            self.succ[from].push(to);
        }
    }
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        input: &'a RecoveryInput,
        rules: &'a dyn RecoveryRules,
        config: &'a RecoveryConfig,
    ) -> Self {
        Self {
            input,
            rules,
            config,
        }
    }

    /// Builds one graph per aircraft, in the given order.
    pub fn build_all(&self, aircraft: &[AircraftId], parallel: bool) -> Result<Vec<Graph>, GraphError> {
        if parallel {
            aircraft.par_iter().map(|id| self.build(*id)).collect()
        } else {
            aircraft.iter().map(|id| self.build(*id)).collect()
        }
    }

    #[instrument(level = "debug", skip(self), fields(tail = %self.input.aircraft(aircraft).registration))]
    pub fn build(&self, aircraft: AircraftId) -> Result<Graph, GraphError> {
        let input = self.input;
        let usability = input.usability(aircraft);
        let mut draft = Draft {
            nodes: Vec::new(),
            succ: Vec::new(),
        };
        draft.push(NodeKind::Root, usability.available_at);
        draft.push(NodeKind::End, input.window.end);

        let mut task_nodes: HashMap<TaskId, usize> = HashMap::new();
        let mut frontier = VecDeque::from([Graph::ROOT]);
        while let Some(u) = frontier.pop_front() {
            let node = draft.nodes[u];
            let (location, ready, prev) = match node.kind {
                NodeKind::Root => (usability.location, usability.available_at, input.last_task(aircraft)),
                NodeKind::Task { task, .. } => {
                    let task = input.task(task);
                    (task.arr, node.time + task.duration(), Some(task))
                }
                NodeKind::End => continue,
            };

            let mut out_degree = 0usize;
            let stations = std::iter::once(location).chain(input.alternates(location).iter().copied());
            for station in stations {
                for &candidate in input.tasks.departing(station) {
                    let task = input.task(candidate);
                    if !self.connects(aircraft, &node, location, ready, prev, task)? {
                        continue;
                    }
                    let v = *task_nodes.entry(candidate).or_insert_with(|| {
                        let v = draft.push(
                            NodeKind::Task {
                                task: candidate,
                                reversed: false,
                            },
                            task.sched_dep,
                        );
                        frontier.push_back(v);
                        v
                    });
                    draft.link(u, v);
                    out_degree += 1;
                }
            }
            if u != Graph::ROOT && (out_degree == 0 || self.config.allow_early_termination) {
                draft.link(u, Graph::END);
            }
        }

        self.add_reversals(aircraft, &mut draft)?;

        let order = topological_order(&draft).ok_or_else(|| {
            GraphError::Cyclic(input.aircraft(aircraft).registration.clone())
        })?;
        let graph = Graph {
            aircraft,
            nodes: draft.nodes,
            succ: draft.succ,
            order,
        };
        debug!(nodes = graph.nodes.len(), edges = graph.edge_count(), "graph built");
        Ok(graph)
    }

    /// Can the aircraft, sitting at `location` from `ready` after `prev`,
    /// go on to fly `task` next?
    fn connects(
        &self,
        aircraft: AircraftId,
        from: &Node,
        location: AirportCode,
        ready: DateTime<Utc>,
        prev: Option<&FlightTask>,
        task: &FlightTask,
    ) -> Result<bool, GraphError> {
        if !self.input.window.contains(&task.sched_dep) {
            return Ok(false);
        }
        if task.dep != location && !task.flags.reroute {
            return Ok(false);
        }
        if from.kind != NodeKind::Root && task.sched_dep <= from.time {
            return Ok(false);
        }
        let plane = self.input.aircraft(aircraft);
        let latest = if task.flags.delay {
            task.sched_dep + self.config.max_delay()
        } else {
            task.sched_dep
        };
        let connection = prev
            .map(|p| self.rules.connection_time(plane, p, task))
            .unwrap_or_else(TimeDelta::zero);
        if latest < ready + connection {
            return Ok(false);
        }
        self.rules
            .is_feasible(plane, prev, task)
            .map_err(|source| GraphError::Rule {
                registration: plane.registration.clone(),
                source,
            })
    }

    /// Adds duplicate nodes for same-station pairs (A, B), A scheduled first,
    /// B returning to the station: "A delayed behind B" and "B advanced
    /// ahead of A".
    fn add_reversals(&self, aircraft: AircraftId, draft: &mut Draft) -> Result<(), GraphError> {
        let input = self.input;
        let plane = input.aircraft(aircraft);
        let ceiling = self.config.reversal_ceiling();
        let regular: Vec<(usize, TaskId)> = draft
            .nodes
            .iter()
            .filter_map(|n| match n.kind {
                NodeKind::Task { task, reversed: false } => Some((n.index, task)),
                _ => None,
            })
            .collect();
        let succ_snapshot = draft.succ.clone();
        let mut preds_snapshot: Vec<Vec<usize>> = vec![Vec::new(); draft.nodes.len()];
        for (u, targets) in succ_snapshot.iter().enumerate() {
            for &v in targets {
                preds_snapshot[v].push(u);
            }
        }

        let mut duplicates: HashMap<(TaskId, DateTime<Utc>), usize> = HashMap::new();
        for &(ia, a_id) in &regular {
            let a = input.task(a_id);
            for &(ib, b_id) in &regular {
                let b = input.task(b_id);
                if a.dep != b.dep || b.arr != b.dep {
                    continue;
                }
                if b.sched_dep <= a.sched_dep || b.sched_dep - a.sched_dep > ceiling {
                    continue;
                }
                if a.is_locked() || b.is_locked() {
                    continue;
                }

                if a.flags.delay && b.sched_dep - a.sched_dep <= self.config.max_delay() {
                    let feasible = self.rules.is_feasible(plane, Some(b), a).map_err(|source| {
                        GraphError::Rule {
                            registration: plane.registration.clone(),
                            source,
                        }
                    })?;
                    if feasible {
                        let time = draft.nodes[ib].time;
                        let ar = *duplicates.entry((a_id, time)).or_insert_with(|| {
                            draft.push(
                                NodeKind::Task {
                                    task: a_id,
                                    reversed: true,
                                },
                                time,
                            )
                        });
                        draft.link(ib, ar);
                        for &s in &succ_snapshot[ia] {
                            if s == Graph::END || draft.nodes[s].time > time {
                                draft.link(ar, s);
                            }
                        }
                    }
                }

                if b.flags.advance && b.sched_dep - a.sched_dep <= self.config.max_advance() {
                    let feasible = self.rules.is_feasible(plane, None, b).map_err(|source| {
                        GraphError::Rule {
                            registration: plane.registration.clone(),
                            source,
                        }
                    })?;
                    if feasible {
                        let time = draft.nodes[ia].time;
                        let br = *duplicates.entry((b_id, time)).or_insert_with(|| {
                            draft.push(
                                NodeKind::Task {
                                    task: b_id,
                                    reversed: true,
                                },
                                time,
                            )
                        });
                        for &p in &preds_snapshot[ia] {
                            draft.link(p, br);
                        }
                        draft.link(br, ia);
                    }
                }
            }
        }
        Ok(())
    }
}

fn topological_order(draft: &Draft) -> Option<Vec<usize>> {
    let n = draft.nodes.len();
    let mut in_degree = vec![0usize; n];
    for targets in &draft.succ {
        for &v in targets {
            in_degree[v] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse((draft.nodes[i].time, i)))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, u))) = ready.pop() {
        order.push(u);
        for &v in &draft.succ[u] {
            in_degree[v] -= 1;
            if in_degree[v] == 0 {
                ready.push(Reverse((draft.nodes[v].time, v)));
            }
        }
    }
    (order.len() == n).then_some(order)
}
