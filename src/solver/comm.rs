use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::HashMap;
use tracing::debug;

use crate::action::{apply, apply_action, valid, Action, JointAction};
use crate::common::{direction_to, Agent, AgentId, Position, PositionTime, Tick};
use crate::world::World;

/// Space-time reservation by a single agent; `from` backs the swap check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SpaceReservation {
    pub(super) agent: AgentId,
    pub(super) from: Option<Position>,
}

/// A final-standing cell, claimed for every tick at or after `from_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PermanentReservation {
    pub(super) agent: AgentId,
    pub(super) from_time: Tick,
}

pub(super) type ReservationTable = HashMap<PositionTime, SpaceReservation>;
pub(super) type PermanentTable = HashMap<Position, PermanentReservation>;

/// Plan cache and failure counters shared by the solvers that plan each
/// agent separately. Stored paths are reversed: `last()` is the next cell,
/// which may equal the agent's position for a planned wait.
pub(super) struct SeparatePathsCore {
    pub(super) paths: HashMap<AgentId, Vec<Position>>,
    pub(super) times_without_path: u32,
    pub(super) recalculations: u32,
    pub(super) path_invalid: u32,
    pub(super) nodes: usize,
}

impl SeparatePathsCore {
    pub(super) fn new() -> Self {
        SeparatePathsCore {
            paths: HashMap::new(),
            times_without_path: 0,
            recalculations: 0,
            path_invalid: 0,
            nodes: 0,
        }
    }

    pub(super) fn base_stat_names() -> Vec<&'static str> {
        vec![
            "Path not found",
            "Recalculations",
            "Path invalid",
            "Nodes expanded",
        ]
    }

    pub(super) fn base_stat_values(&self) -> Vec<String> {
        vec![
            self.times_without_path.to_string(),
            self.recalculations.to_string(),
            self.path_invalid.to_string(),
            self.nodes.to_string(),
        ]
    }
}

/// The per-tick protocol common to LRA* and WHCA*: process agents in a
/// shuffled order, reuse each agent's stored path while its next step stays
/// valid, recalculate once otherwise, and fold the chosen moves into one
/// joint action. A planning failure leaves that agent in place and never
/// fails the tick.
pub(super) trait SeparatePaths {
    fn core(&self) -> &SeparatePathsCore;

    fn core_mut(&mut self) -> &mut SeparatePathsCore;

    /// The cooperative cancellation flag; a raised flag aborts the tick
    /// without mutating the world.
    fn stop_requested(&self) -> bool;

    /// Called once before agents are processed.
    fn prepare(&mut self, _world: &World) {}

    /// Drops whatever claims the solver holds for this agent before its turn
    /// is decided.
    fn clear_commitments(&mut self, _agent: &Agent) {}

    /// Plans a fresh path for `agent` standing at `from`. `old_path` is the
    /// remainder of the plan that just became invalid, for solvers that can
    /// splice back onto it.
    fn find_path(
        &mut self,
        agent: Agent,
        from: Position,
        old_path: &[Position],
        world: &World,
        rng: &mut StdRng,
    ) -> Vec<Position>;

    /// Records the path the agent will follow from this tick on; `path` is
    /// empty for an agent that stays where it is.
    fn commit(&mut self, _agent: &Agent, _from: Position, _path: &[Position], _world: &World) {}
}

pub(super) fn separate_step<S: SeparatePaths + ?Sized>(
    solver: &mut S,
    world: &mut World,
    rng: &mut StdRng,
) {
    solver.prepare(world);

    let mut order: Vec<(Position, Agent)> = world.agents().iter().map(|(&p, &a)| (p, a)).collect();
    order.sort_by_key(|(p, _)| *p);
    order.shuffle(rng);

    // Earlier agents' moves are visible to later validity checks.
    let mut scratch = world.clone();
    let mut joint = JointAction::new();

    for (pos, agent) in order {
        solver.clear_commitments(&agent);

        if pos == agent.target {
            solver.core_mut().paths.remove(&agent.id);
            solver.commit(&agent, pos, &[], world);
            continue;
        }

        let mut path = solver
            .core_mut()
            .paths
            .remove(&agent.id)
            .unwrap_or_default();

        let reusable = match path.last() {
            None => false,
            Some(&next) if next == pos => true,
            Some(&next) => valid(Action::new(pos, direction_to(pos, next)), &scratch),
        };

        if !reusable {
            solver.core_mut().recalculations += 1;
            debug!(agent = agent.id, from = %pos, "recalculating");
            let old = std::mem::take(&mut path);
            path = solver.find_path(agent, pos, &old, &scratch, rng);

            if path.is_empty() {
                debug!(agent = agent.id, from = %pos, "no path");
                solver.core_mut().times_without_path += 1;
                solver.commit(&agent, pos, &[], world);
                continue;
            }
        }

        solver.commit(&agent, pos, &path, world);

        let next = path.pop().expect("checked non-empty");
        if next != pos {
            let action = Action::new(pos, direction_to(pos, next));
            if !valid(action, &scratch) {
                debug!(agent = agent.id, from = %pos, "path invalid");
                solver.core_mut().path_invalid += 1;
                continue;
            }
            joint.add(action);
            apply_action(action, &mut scratch);
        }

        if !path.is_empty() {
            solver.core_mut().paths.insert(agent.id, path);
        }
    }

    if solver.stop_requested() {
        return;
    }
    apply(&joint, world);
}
