use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

use super::comm::{
    separate_step, PermanentReservation, PermanentTable, ReservationTable, SeparatePaths,
    SeparatePathsCore, SpaceReservation,
};
use super::Solver;
use crate::algorithm::{Cost, ReverseSearch, Search, SearchDomain, StopFlag};
use crate::common::{
    manhattan, neighbours, translate, Agent, AgentId, Position, PositionTime, Tick,
    ALL_DIRECTIONS,
};
use crate::map::{traversable, Tile};
use crate::predictor::SharedPredictor;
use crate::world::World;

/// Windowed hierarchical cooperative A*: each agent plans in space-time
/// against the reservations left by the agents before it, guided by a
/// resumable reverse search on the static map.
pub struct Whca {
    core: SeparatePathsCore,
    reservations: ReservationTable,
    permanent: PermanentTable,
    heuristics: HashMap<AgentId, ReverseSearch>,
    predictor: Option<SharedPredictor>,
    window: u32,
    rejoin_limit: usize,
    obstacle_penalty: Cost,
    obstacle_threshold: f64,
    rejoin_attempts: u32,
    rejoin_successes: u32,
    should_stop: StopFlag,
}

fn space_time_successors(state: &PositionTime, world: &World, out: &mut Vec<PositionTime>) {
    let p = state.position();
    for d in ALL_DIRECTIONS {
        let q = translate(p, d);
        if world.map().in_bounds(q) && traversable(world.map().get(q)) {
            out.push(PositionTime::new(q, state.time + 1));
        }
    }
    // Implicit wait move.
    out.push(PositionTime::new(p, state.time + 1));
}

/// Reservation-aware passability shared by the primary and rejoin searches:
/// the arrival cell must be unreserved, the move must not cross another
/// agent's reserved edge, predicted obstacle probability must stay under the
/// threshold, and currently occupied cells block only next to the agent's
/// start.
fn space_time_passable(
    reservations: &ReservationTable,
    permanent: &PermanentTable,
    predictor: Option<&SharedPredictor>,
    threshold: f64,
    start: Position,
    to: &PositionTime,
    from: &PositionTime,
    world: &World,
) -> bool {
    if reservations.contains_key(to) {
        return false;
    }
    if let Some(vacated) = reservations.get(&PositionTime::new(from.position(), to.time)) {
        if vacated.from == Some(to.position()) {
            return false;
        }
    }
    if let Some(perm) = permanent.get(&to.position()) {
        if perm.from_time <= to.time {
            return false;
        }
    }
    if let Some(predictor) = predictor {
        if predictor.borrow_mut().predict_obstacle(*to) > threshold {
            return false;
        }
    }
    world.get(to.position()) == Tile::Free || !neighbours(to.position(), start)
}

struct SpaceTimeDomain<'a> {
    start: Position,
    target: Position,
    reservations: &'a ReservationTable,
    permanent: &'a PermanentTable,
    reverse: &'a mut ReverseSearch,
    predictor: Option<SharedPredictor>,
    penalty: Cost,
    threshold: f64,
}

impl SearchDomain for SpaceTimeDomain<'_> {
    type State = PositionTime;
    type Coord = PositionTime;

    fn successors(&mut self, state: &PositionTime, world: &World, out: &mut Vec<PositionTime>) {
        space_time_successors(state, world, out);
    }

    fn passable(
        &mut self,
        to: &PositionTime,
        from: &PositionTime,
        world: &World,
        _distance: Cost,
    ) -> bool {
        space_time_passable(
            self.reservations,
            self.permanent,
            self.predictor.as_ref(),
            self.threshold,
            self.start,
            to,
            from,
            world,
        )
    }

    fn heuristic(&mut self, state: &PositionTime, world: &World, _distance: Cost) -> Cost {
        let distance = self.reverse.find_distance(state.position(), world);
        let penalty = match &self.predictor {
            Some(predictor) => {
                let probability = predictor.borrow_mut().predict_obstacle(*state);
                (self.penalty as f64 * probability).round() as Cost
            }
            None => 0,
        };
        distance.saturating_add(penalty)
    }

    fn coordinate(state: &PositionTime, _g: Cost) -> PositionTime {
        *state
    }

    fn is_goal(&self, state: &PositionTime, _world: &World) -> bool {
        state.position() == self.target
    }
}

/// Multi-target search back onto a still-valid suffix of the old plan.
struct RejoinDomain<'a> {
    start: Position,
    targets: &'a HashSet<Position>,
    reservations: &'a ReservationTable,
    permanent: &'a PermanentTable,
    predictor: Option<SharedPredictor>,
    threshold: f64,
}

impl SearchDomain for RejoinDomain<'_> {
    type State = PositionTime;
    type Coord = PositionTime;

    fn successors(&mut self, state: &PositionTime, world: &World, out: &mut Vec<PositionTime>) {
        space_time_successors(state, world, out);
    }

    fn passable(
        &mut self,
        to: &PositionTime,
        from: &PositionTime,
        world: &World,
        _distance: Cost,
    ) -> bool {
        space_time_passable(
            self.reservations,
            self.permanent,
            self.predictor.as_ref(),
            self.threshold,
            self.start,
            to,
            from,
            world,
        )
    }

    fn heuristic(&mut self, state: &PositionTime, _world: &World, _distance: Cost) -> Cost {
        self.targets
            .iter()
            .map(|&t| manhattan(state.position(), t))
            .min()
            .unwrap_or(0)
    }

    fn coordinate(state: &PositionTime, _g: Cost) -> PositionTime {
        *state
    }

    fn is_goal(&self, state: &PositionTime, _world: &World) -> bool {
        self.targets.contains(&state.position())
    }
}

impl Whca {
    pub fn new(
        window: u32,
        rejoin_limit: usize,
        predictor: Option<SharedPredictor>,
        obstacle_penalty: Cost,
        obstacle_threshold: f64,
        should_stop: StopFlag,
    ) -> Self {
        Whca {
            core: SeparatePathsCore::new(),
            reservations: ReservationTable::new(),
            permanent: PermanentTable::new(),
            heuristics: HashMap::new(),
            predictor,
            window,
            rejoin_limit,
            obstacle_penalty,
            obstacle_threshold,
            rejoin_attempts: 0,
            rejoin_successes: 0,
            should_stop,
        }
    }

    fn try_rejoin(
        &mut self,
        from: Position,
        old_path: &[Position],
        world: &World,
    ) -> Option<Vec<Position>> {
        let targets: HashSet<Position> = old_path
            .iter()
            .copied()
            .filter(|&cell| world.get(cell) == Tile::Free)
            .collect();
        if targets.is_empty() {
            return None;
        }

        let Whca {
            core,
            reservations,
            permanent,
            predictor,
            obstacle_threshold,
            rejoin_limit,
            should_stop,
            ..
        } = self;

        let domain = RejoinDomain {
            start: from,
            targets: &targets,
            reservations,
            permanent,
            predictor: predictor.clone(),
            threshold: *obstacle_threshold,
        };
        let mut search = Search::new(
            PositionTime::new(from, world.tick()),
            domain,
            Arc::clone(should_stop),
        );
        let states = search.find_path_limited(world, *rejoin_limit);
        core.nodes += search.nodes_expanded();

        if states.is_empty() {
            return None;
        }

        let mut join: Vec<Position> = states.iter().map(|st| st.position()).collect();
        join.pop(); // the agent's own position
        let rejoin_cell = *join.first()?;
        let suffix_start = old_path.iter().position(|&c| c == rejoin_cell)?;

        let mut path = old_path[..suffix_start].to_vec();
        path.extend(join);
        Some(path)
    }
}

impl SeparatePaths for Whca {
    fn core(&self) -> &SeparatePathsCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SeparatePathsCore {
        &mut self.core
    }

    fn stop_requested(&self) -> bool {
        self.should_stop.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn prepare(&mut self, world: &World) {
        if let Some(predictor) = &self.predictor {
            predictor.borrow_mut().update_obstacles(world);
        }
    }

    fn clear_commitments(&mut self, agent: &Agent) {
        let id = agent.id;
        self.reservations.retain(|_, r| r.agent != id);
        self.permanent.retain(|_, r| r.agent != id);
    }

    #[instrument(skip_all, name = "whca_find_path", fields(agent = agent.id, from = %from), level = "debug")]
    fn find_path(
        &mut self,
        agent: Agent,
        from: Position,
        old_path: &[Position],
        world: &World,
        _rng: &mut StdRng,
    ) -> Vec<Position> {
        if !old_path.is_empty() && self.rejoin_limit > 0 {
            self.rejoin_attempts += 1;
            if let Some(path) = self.try_rejoin(from, old_path, world) {
                self.rejoin_successes += 1;
                return path;
            }
        }

        let now = world.tick();
        self.heuristics.entry(agent.id).or_insert_with(|| {
            ReverseSearch::new(
                agent.target,
                from,
                None,
                0,
                now,
                Arc::clone(&self.should_stop),
            )
        });

        let Whca {
            core,
            reservations,
            permanent,
            heuristics,
            predictor,
            window,
            obstacle_penalty,
            obstacle_threshold,
            should_stop,
            ..
        } = self;
        let reverse = heuristics.get_mut(&agent.id).expect("inserted above");
        let reverse_nodes_before = reverse.nodes_expanded();

        let domain = SpaceTimeDomain {
            start: from,
            target: agent.target,
            reservations,
            permanent,
            reverse,
            predictor: predictor.clone(),
            penalty: *obstacle_penalty,
            threshold: *obstacle_threshold,
        };
        let mut search = Search::new(
            PositionTime::new(from, now),
            domain,
            Arc::clone(should_stop),
        );
        let states = if *window > 0 {
            search.find_path_window(world, *window)
        } else {
            search.find_path(world)
        };
        let expanded = search.nodes_expanded();
        drop(search);
        core.nodes += expanded;
        core.nodes += heuristics[&agent.id].nodes_expanded() - reverse_nodes_before;

        let mut path: Vec<Position> = states.iter().map(|st| st.position()).collect();
        path.pop(); // the agent's own position
        path
    }

    /// Re-records the agent's claims so the tables always mirror its stored
    /// plan: one space-time entry per future cell plus a permanent claim on
    /// the cell it will come to rest on.
    fn commit(&mut self, agent: &Agent, from: Position, path: &[Position], world: &World) {
        let now = world.tick();

        let mut prev = from;
        for (i, &cell) in path.iter().rev().enumerate() {
            self.reservations.insert(
                PositionTime::new(cell, now + 1 + i as Tick),
                SpaceReservation {
                    agent: agent.id,
                    from: Some(prev),
                },
            );
            prev = cell;
        }

        let final_cell = path.first().copied().unwrap_or(from);
        self.permanent.insert(
            final_cell,
            PermanentReservation {
                agent: agent.id,
                from_time: now + path.len() as Tick,
            },
        );
    }
}

impl Solver for Whca {
    fn step(&mut self, world: &mut World, rng: &mut StdRng) {
        separate_step(self, world, rng);
    }

    fn name(&self) -> &'static str {
        "WHCA*"
    }

    fn stat_names(&self) -> Vec<&'static str> {
        let mut names = SeparatePathsCore::base_stat_names();
        names.push("Rejoin attempts");
        names.push("Rejoin successes");
        names
    }

    fn stat_values(&self) -> Vec<String> {
        let mut values = self.core.base_stat_values();
        values.push(self.rejoin_attempts.to_string());
        values.push(self.rejoin_successes.to_string());
        values
    }

    fn get_path(&self, agent: AgentId) -> Vec<Position> {
        self.core.paths.get(&agent).cloned().unwrap_or_default()
    }

    fn get_obstacle_field(&self) -> HashMap<PositionTime, f64> {
        self.predictor
            .as_ref()
            .map(|p| p.borrow().field())
            .unwrap_or_default()
    }

    fn set_window(&mut self, window: u32) {
        self.window = window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Map;
    use crate::predictor::{shared, DiffusionPredictor};
    use crate::solver::tests_support::{assert_step_invariants, world_with};
    use crate::solver::solved;
    use crate::world::Obstacle;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use std::sync::atomic::AtomicBool;

    fn stop() -> StopFlag {
        Arc::new(AtomicBool::new(false))
    }

    fn whca(window: u32) -> Whca {
        Whca::new(window, 0, None, 100, 0.5, stop())
    }

    fn static_obstacle() -> Obstacle {
        let mut o = Obstacle::new(Normal::new(1000.0, 1.0).unwrap());
        o.next_move = 1000;
        o
    }

    /// The stored reservations must exactly mirror each agent's position
    /// timeline: its post-step position at the next tick, then its stored
    /// plan, then a permanent claim on the final cell.
    fn assert_reservation_invariant(solver: &Whca, world: &World) {
        let now = world.tick();
        let mut known = HashSet::new();

        for (&pos, agent) in world.agents() {
            let stored = solver.get_path(agent.id);

            if stored.is_empty() && pos == agent.target {
                let perm = solver.permanent.get(&pos).expect("standing agent unreserved");
                assert_eq!(perm.agent, agent.id);
                // The arrival entry from the tick the agent reached its goal
                // may still be present.
                known.insert(PositionTime::new(pos, now + 1));
                continue;
            }

            let mut timeline = vec![pos];
            timeline.extend(stored.iter().rev().copied());
            for (i, &cell) in timeline.iter().enumerate() {
                let key = PositionTime::new(cell, now + 1 + i as Tick);
                let reservation = solver
                    .reservations
                    .get(&key)
                    .unwrap_or_else(|| panic!("missing reservation {key} for {}", agent.id));
                assert_eq!(reservation.agent, agent.id);
                known.insert(key);
            }

            let final_cell = *timeline.last().unwrap();
            let perm = solver.permanent.get(&final_cell).expect("no permanent claim");
            assert_eq!(perm.agent, agent.id);
        }

        // Nothing beyond the plans themselves may stay reserved.
        for key in solver.reservations.keys() {
            assert!(known.contains(key), "stray reservation {key}");
        }
    }

    #[test]
    fn test_single_agent_clear_grid() {
        let mut world = world_with(Map::open(5, 5), &[(Position::new(0, 0), Position::new(4, 4))]);
        let mut solver = whca(0);
        let mut rng = StdRng::seed_from_u64(1);

        let mut ticks = 0;
        while !solved(&world) && ticks < 20 {
            let before = world.clone();
            solver.step(&mut world, &mut rng);
            assert_step_invariants(&before, &world);
            world.next_tick(&mut rng);
            ticks += 1;
        }
        assert_eq!(ticks, 8);
    }

    #[test]
    fn test_windowed_plan_is_truncated_and_progresses() {
        let map = Map::open(20, 1);
        let mut world = world_with(map, &[(Position::new(0, 0), Position::new(19, 0))]);
        let mut solver = whca(0);
        solver.set_window(5);
        let mut rng = StdRng::seed_from_u64(1);

        solver.step(&mut world, &mut rng);
        let stored = solver.get_path(0);
        assert!(!stored.is_empty() && stored.len() <= 5);
        world.next_tick(&mut rng);

        // Monotone progress along the corridor over consecutive steps.
        for tick in 2..=5 {
            solver.step(&mut world, &mut rng);
            let (&pos, _) = world.agents().iter().next().unwrap();
            assert_eq!(pos.x, tick);
            world.next_tick(&mut rng);
        }
    }

    #[test]
    fn test_reservations_track_plans() {
        let mut world = world_with(
            Map::open(6, 6),
            &[
                (Position::new(0, 0), Position::new(5, 0)),
                (Position::new(0, 5), Position::new(5, 5)),
            ],
        );
        let mut solver = whca(4);
        let mut rng = StdRng::seed_from_u64(2);

        for _ in 0..6 {
            solver.step(&mut world, &mut rng);
            assert_reservation_invariant(&solver, &world);
            world.next_tick(&mut rng);
        }
    }

    #[test]
    fn test_swap_corridor_keeps_invariants() {
        let map = crate::map::parse_map("type octile\nheight 1\nwidth 3\nmap\n...").unwrap();
        let mut world = world_with(
            map,
            &[
                (Position::new(0, 0), Position::new(2, 0)),
                (Position::new(2, 0), Position::new(0, 0)),
            ],
        );
        let mut solver = whca(0);
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..20 {
            let before = world.clone();
            solver.step(&mut world, &mut rng);
            assert_step_invariants(&before, &world);
            world.next_tick(&mut rng);
        }
    }

    #[test]
    fn test_swap_resolves_with_side_cell() {
        let mut world = world_with(
            Map::open(3, 2),
            &[
                (Position::new(0, 0), Position::new(2, 0)),
                (Position::new(2, 0), Position::new(0, 0)),
            ],
        );
        let mut solver = whca(0);
        let mut rng = StdRng::seed_from_u64(9);

        let mut ticks = 0;
        while !solved(&world) && ticks < 20 {
            let before = world.clone();
            solver.step(&mut world, &mut rng);
            assert_step_invariants(&before, &world);
            world.next_tick(&mut rng);
            ticks += 1;
        }
        assert!(solved(&world), "swap with a side cell should resolve");
    }

    #[test]
    fn test_predictor_avoids_ambush_cell() {
        // An obstacle parked mid-corridor. With a predictor the very first
        // plan routes around it; without one the plan goes straight through
        // and has to be repaired on approach.
        let ambush = Position::new(3, 1);

        let build = || {
            let mut w = world_with(Map::open(7, 3), &[(Position::new(0, 1), Position::new(6, 1))]);
            w.put_obstacle(ambush, static_obstacle());
            w
        };

        let mut rng = StdRng::seed_from_u64(4);
        let predictor = shared(DiffusionPredictor::new(0.001, 6));
        let mut aware = Whca::new(6, 0, Some(predictor), 100, 0.5, stop());
        let mut world = build();
        aware.step(&mut world, &mut rng);
        assert!(
            !aware.get_path(0).contains(&ambush),
            "predictor-aware plan must avoid the ambush cell"
        );
        let field = aware.get_obstacle_field();
        assert_eq!(field.get(&PositionTime::new(ambush, 0)), Some(&1.0));
        let mut aware_ticks = 1;
        world.next_tick(&mut rng);
        while !solved(&world) && aware_ticks < 30 {
            aware.step(&mut world, &mut rng);
            world.next_tick(&mut rng);
            aware_ticks += 1;
        }
        assert!(solved(&world));

        let mut rng = StdRng::seed_from_u64(4);
        let mut blind = whca(6);
        let mut world = build();
        blind.step(&mut world, &mut rng);
        assert!(
            blind.get_path(0).contains(&ambush),
            "without a predictor the straight line is chosen"
        );
        let mut blind_ticks = 1;
        world.next_tick(&mut rng);
        while !solved(&world) && blind_ticks < 30 {
            blind.step(&mut world, &mut rng);
            world.next_tick(&mut rng);
            blind_ticks += 1;
        }
        assert!(solved(&world));
        assert!(aware_ticks <= blind_ticks);
    }

    #[test]
    fn test_rejoin_splices_old_plan() {
        let run = |rejoin_limit: usize| -> (Whca, u32) {
            let mut world =
                world_with(Map::open(20, 2), &[(Position::new(0, 0), Position::new(19, 0))]);
            let mut solver = Whca::new(0, rejoin_limit, None, 100, 0.5, stop());
            let mut rng = StdRng::seed_from_u64(8);

            solver.step(&mut world, &mut rng);
            world.next_tick(&mut rng);

            // A transient blocker appears on the committed straight line.
            world.put_obstacle(Position::new(2, 0), static_obstacle());

            let mut ticks = 1;
            while !solved(&world) && ticks < 60 {
                solver.step(&mut world, &mut rng);
                world.next_tick(&mut rng);
                ticks += 1;
            }
            assert!(solved(&world));
            (solver, ticks)
        };

        let (with_rejoin, _) = run(200);
        assert!(with_rejoin.rejoin_attempts >= 1);
        assert!(with_rejoin.rejoin_successes >= 1);

        let (without_rejoin, _) = run(0);
        assert_eq!(without_rejoin.rejoin_attempts, 0);
        assert!(
            with_rejoin.core.nodes < without_rejoin.core.nodes,
            "rejoin should expand fewer nodes ({} vs {})",
            with_rejoin.core.nodes,
            without_rejoin.core.nodes
        );
    }
}
