use super::astar::{Cost, Search, SearchDomain, StopFlag};
use super::grid_successors;
use crate::common::{manhattan, Position, PositionTime, Tick};
use crate::predictor::SharedPredictor;
use crate::world::World;

/// Policy bundle for the reverse distance oracle: roles inverted, the search
/// grows from the goal and is guided toward the agent's position at
/// construction time. The Manhattan heuristic to that fixed anchor stays
/// consistent for any queried cell, which `Search::find_distance` requires.
struct ReverseDomain {
    anchor: Position,
    predictor: Option<SharedPredictor>,
    penalty: Cost,
    base_tick: Tick,
}

impl SearchDomain for ReverseDomain {
    type State = Position;
    type Coord = Position;

    fn successors(&mut self, state: &Position, world: &World, out: &mut Vec<Position>) {
        grid_successors(world.map(), *state, false, out);
    }

    fn heuristic(&mut self, state: &Position, _world: &World, _distance: Cost) -> Cost {
        manhattan(*state, self.anchor)
    }

    fn step_cost(&mut self, to: &Position, distance: Cost) -> Cost {
        let penalty = match &self.predictor {
            Some(predictor) => {
                let probability = predictor
                    .borrow_mut()
                    .predict_obstacle(PositionTime::new(*to, self.base_tick + distance + 1));
                (self.penalty as f64 * probability).round() as Cost
            }
            None => 0,
        };
        1 + penalty
    }

    fn coordinate(state: &Position, _g: Cost) -> Position {
        *state
    }

    fn is_goal(&self, _state: &Position, _world: &World) -> bool {
        false
    }
}

/// Resumable reverse A* answering shortest-distance-to-goal queries on the
/// static map, optionally with a predictor-penalized step cost.
pub(crate) struct ReverseSearch {
    search: Search<ReverseDomain>,
}

impl ReverseSearch {
    pub(crate) fn new(
        target: Position,
        agent_position: Position,
        predictor: Option<SharedPredictor>,
        penalty: Cost,
        base_tick: Tick,
        should_stop: StopFlag,
    ) -> Self {
        let domain = ReverseDomain {
            anchor: agent_position,
            predictor,
            penalty,
            base_tick,
        };
        ReverseSearch {
            search: Search::new(target, domain, should_stop),
        }
    }

    pub(crate) fn find_distance(&mut self, from: Position, world: &World) -> Cost {
        self.search.find_distance(from, world)
    }

    pub(crate) fn nodes_expanded(&self) -> usize {
        self.search.nodes_expanded()
    }
}
