mod comm;
mod lra;
mod od;
mod whca;

pub use lra::Lra;
pub use od::OperatorDecomposition;
pub use whca::Whca;

use rand::rngs::StdRng;
use std::collections::HashMap;

use crate::common::{AgentId, Position, PositionTime};
use crate::config::{Config, PredictorKind, SolverKind};
use crate::predictor::{shared, DiffusionPredictor, SharedPredictor};
use crate::algorithm::StopFlag;
use crate::world::World;

/// One planning strategy driving all agents. `step` advances the world by
/// one tick's worth of agent motion; obstacle motion is the driver's job.
pub trait Solver {
    fn step(&mut self, world: &mut World, rng: &mut StdRng);

    fn name(&self) -> &'static str;

    fn stat_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn stat_values(&self) -> Vec<String> {
        Vec::new()
    }

    /// The currently committed plan for an agent, final cell first. Empty
    /// when the solver holds no plan for it.
    fn get_path(&self, _agent: AgentId) -> Vec<Position> {
        Vec::new()
    }

    fn get_obstacle_field(&self) -> HashMap<PositionTime, f64> {
        HashMap::new()
    }

    /// Adjusts the horizon of windowed variants.
    fn set_window(&mut self, _window: u32) {}
}

pub fn solved(world: &World) -> bool {
    world
        .agents()
        .iter()
        .all(|(&pos, agent)| pos == agent.target)
}

fn make_predictor(config: &Config) -> Option<SharedPredictor> {
    match config.predictor {
        PredictorKind::None => None,
        PredictorKind::Diffusion => Some(shared(DiffusionPredictor::new(
            config.predictor_move_probability,
            config.predictor_horizon,
        ))),
    }
}

pub fn make_solver(config: &Config, should_stop: StopFlag) -> Box<dyn Solver> {
    match config.solver {
        SolverKind::Lra => Box::new(Lra::new(
            config.agitation_window,
            config.agitation_boost,
            should_stop,
        )),
        SolverKind::Whca => Box::new(Whca::new(
            config.window,
            config.rejoin_limit,
            make_predictor(config),
            config.obstacle_penalty,
            config.obstacle_threshold,
            should_stop,
        )),
        SolverKind::Od => Box::new(OperatorDecomposition::new(
            config.window,
            make_predictor(config),
            config.obstacle_penalty,
            config.obstacle_threshold,
            should_stop,
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::common::{manhattan, AgentId, Position};
    use crate::map::{Map, Tile};
    use crate::world::World;

    pub(crate) fn world_with(map: Map, agents: &[(Position, Position)]) -> World {
        let mut world = World::new(Arc::new(map));
        for &(start, goal) in agents {
            let agent = world.create_agent(goal);
            world.put_agent(start, agent);
        }
        world
    }

    pub(crate) fn positions_by_id(world: &World) -> HashMap<AgentId, Position> {
        world.agents().iter().map(|(&p, a)| (a.id, p)).collect()
    }

    /// The §8-style invariants that must hold across any single `step`:
    /// no two agents share a cell, no pair swaps across an edge, nobody
    /// stands on a wall, and every displacement is at most one cell along
    /// one axis.
    pub(crate) fn assert_step_invariants(before: &World, after: &World) {
        let old = positions_by_id(before);
        let new = positions_by_id(after);
        assert_eq!(old.len(), new.len(), "agents appeared or vanished");

        for (&id, &pos) in &new {
            assert_eq!(after.map().get(pos), Tile::Free, "agent {id} on a wall");
            let prev = old[&id];
            assert!(
                manhattan(prev, pos) <= 1,
                "agent {id} jumped {prev} -> {pos}"
            );
        }

        for (&a, &a_new) in &new {
            for (&b, &b_new) in &new {
                if a >= b {
                    continue;
                }
                assert_ne!(a_new, b_new, "agents {a} and {b} collide at {a_new}");
                assert!(
                    !(old[&a] == b_new && old[&b] == a_new && old[&a] != old[&b]),
                    "agents {a} and {b} swapped across an edge"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Map;
    use std::sync::Arc;

    #[test]
    fn test_solved() {
        let mut w = World::new(Arc::new(Map::open(3, 3)));
        let a = w.create_agent(Position::new(2, 2));
        w.put_agent(Position::new(0, 0), a);
        assert!(!solved(&w));

        let mut done = World::new(Arc::new(Map::open(3, 3)));
        let b = done.create_agent(Position::new(1, 1));
        done.put_agent(Position::new(1, 1), b);
        assert!(solved(&done));
    }
}
