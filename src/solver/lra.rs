use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use tracing::instrument;

use super::comm::{separate_step, SeparatePaths, SeparatePathsCore};
use super::Solver;
use crate::algorithm::{grid_successors, Cost, Search, SearchDomain, StopFlag};
use crate::common::{manhattan, neighbours, Agent, AgentId, Position, Tick};
use crate::map::Tile;
use crate::world::World;

struct AgentData {
    last_recalculation: Tick,
    agitation: f64,
}

/// Independent per-agent A*: no coordination beyond what the current world
/// shows, with agitation noise added to the heuristic to shake agents out of
/// repeated head-on stalemates.
pub struct Lra {
    core: SeparatePathsCore,
    agent_data: HashMap<AgentId, AgentData>,
    agitation_window: Tick,
    agitation_boost: f64,
    should_stop: StopFlag,
}

struct LraDomain<'a> {
    start: Position,
    target: Position,
    agitation: f64,
    rng: &'a mut StdRng,
}

impl SearchDomain for LraDomain<'_> {
    type State = Position;
    type Coord = Position;

    fn successors(&mut self, state: &Position, world: &World, out: &mut Vec<Position>) {
        grid_successors(world.map(), *state, false, out);
    }

    /// Occupied cells block only in the immediate neighbourhood of the
    /// agent; anything farther out is assumed to have moved by the time the
    /// agent gets there.
    fn passable(&mut self, to: &Position, _from: &Position, world: &World, _distance: Cost) -> bool {
        world.get(*to) == Tile::Free || !neighbours(*to, self.start)
    }

    fn heuristic(&mut self, state: &Position, _world: &World, _distance: Cost) -> Cost {
        let noise = if self.agitation > 0.0 {
            self.rng.gen_range(0.0..self.agitation) as Cost
        } else {
            0
        };
        manhattan(*state, self.target) + noise
    }

    fn coordinate(state: &Position, _g: Cost) -> Position {
        *state
    }

    fn is_goal(&self, state: &Position, _world: &World) -> bool {
        *state == self.target
    }
}

impl Lra {
    pub fn new(agitation_window: Tick, agitation_boost: f64, should_stop: StopFlag) -> Self {
        Lra {
            core: SeparatePathsCore::new(),
            agent_data: HashMap::new(),
            agitation_window,
            agitation_boost,
            should_stop,
        }
    }

    /// Recalculating again within the agitation window raises the noise
    /// bound by `boost / Δ`; a calm stretch resets it.
    fn update_agitation(&mut self, agent: AgentId, now: Tick) -> f64 {
        let data = self.agent_data.entry(agent).or_insert(AgentData {
            last_recalculation: now,
            agitation: 0.0,
        });

        let delta = now - data.last_recalculation;
        if delta > 0 {
            if delta < self.agitation_window {
                data.agitation += self.agitation_boost / delta as f64;
            } else {
                data.agitation = 0.0;
            }
        }
        data.last_recalculation = now;
        data.agitation
    }

    #[cfg(test)]
    fn agitation(&self, agent: AgentId) -> f64 {
        self.agent_data.get(&agent).map_or(0.0, |d| d.agitation)
    }
}

impl SeparatePaths for Lra {
    fn core(&self) -> &SeparatePathsCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SeparatePathsCore {
        &mut self.core
    }

    fn stop_requested(&self) -> bool {
        self.should_stop.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[instrument(skip_all, name = "lra_find_path", fields(agent = agent.id, from = %from), level = "debug")]
    fn find_path(
        &mut self,
        agent: Agent,
        from: Position,
        _old_path: &[Position],
        world: &World,
        rng: &mut StdRng,
    ) -> Vec<Position> {
        let agitation = self.update_agitation(agent.id, world.tick());

        let domain = LraDomain {
            start: from,
            target: agent.target,
            agitation,
            rng,
        };
        let mut search = Search::new(from, domain, std::sync::Arc::clone(&self.should_stop));
        let mut path = search.find_path(world);
        self.core.nodes += search.nodes_expanded();

        // Drop the start; the stored plan begins with the next cell.
        path.pop();
        path
    }
}

impl Solver for Lra {
    fn step(&mut self, world: &mut World, rng: &mut StdRng) {
        separate_step(self, world, rng);
    }

    fn name(&self) -> &'static str {
        "LRA*"
    }

    fn stat_names(&self) -> Vec<&'static str> {
        SeparatePathsCore::base_stat_names()
    }

    fn stat_values(&self) -> Vec<String> {
        self.core.base_stat_values()
    }

    fn get_path(&self, agent: AgentId) -> Vec<Position> {
        self.core.paths.get(&agent).cloned().unwrap_or_default()
    }
}
