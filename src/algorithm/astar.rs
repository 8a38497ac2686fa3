use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::world::World;

pub(crate) type Cost = u32;

/// Distance reported for coordinates the search cannot reach.
pub(crate) const UNREACHABLE: Cost = Cost::MAX;

/// Cooperative cancellation flag, observed after every expansion.
pub(crate) type StopFlag = Arc<AtomicBool>;

/// The pluggable policies of a best-first search over states of type
/// `State`. `Coord` is the key under which states are deduplicated in the
/// open and closed sets; several states may share a coordinate (and for
/// joint planning the coordinate's equality is deliberately coarser than the
/// state's).
pub(crate) trait SearchDomain {
    type State: Clone;
    type Coord: Clone + Eq + Hash;

    fn successors(&mut self, state: &Self::State, world: &World, out: &mut Vec<Self::State>);

    /// Filters successors. `distance` is the g-value of the expanded parent.
    fn passable(
        &mut self,
        _to: &Self::State,
        _from: &Self::State,
        _world: &World,
        _distance: Cost,
    ) -> bool {
        true
    }

    /// Admissible estimate of the remaining cost. `distance` is the g-value
    /// of the estimated state.
    fn heuristic(&mut self, state: &Self::State, world: &World, distance: Cost) -> Cost;

    fn step_cost(&mut self, _to: &Self::State, _distance: Cost) -> Cost {
        1
    }

    fn coordinate(state: &Self::State, g: Cost) -> Self::Coord;

    /// Whether the state may be closed once expanded. States for which this
    /// is false stay revisitable and are re-expanded whenever a cheaper path
    /// to their coordinate appears.
    fn close_full(_state: &Self::State) -> bool {
        true
    }

    fn is_goal(&self, state: &Self::State, world: &World) -> bool;
}

struct NodeRecord<D: SearchDomain> {
    g: Cost,
    parent: Option<D::Coord>,
    state: D::State,
}

struct OpenEntry<D: SearchDomain> {
    f: Cost,
    seq: u64,
    g: Cost,
    coord: D::Coord,
    state: D::State,
}

impl<D: SearchDomain> PartialEq for OpenEntry<D> {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f && self.seq == other.seq
    }
}

impl<D: SearchDomain> Eq for OpenEntry<D> {}

impl<D: SearchDomain> PartialOrd for OpenEntry<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Min-f ordering under std's max-heap; equal f resolved by insertion order.
impl<D: SearchDomain> Ord for OpenEntry<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .cmp(&self.f)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A stateful best-first searcher. It owns its frontier, closed set,
/// predecessor map and node counter, so a paused search can be resumed
/// (`find_distance`) without rebuilding anything.
///
/// Decrease-key is realized lazily: improved nodes are re-inserted and stale
/// heap entries discarded on pop.
pub(crate) struct Search<D: SearchDomain> {
    domain: D,
    start: D::State,
    open: BinaryHeap<OpenEntry<D>>,
    nodes: HashMap<D::Coord, NodeRecord<D>>,
    closed: HashSet<D::Coord>,
    next_seq: u64,
    nodes_expanded: usize,
    started: bool,
    should_stop: StopFlag,
}

impl<D: SearchDomain> Search<D> {
    pub(crate) fn new(start: D::State, domain: D, should_stop: StopFlag) -> Self {
        Search {
            domain,
            start,
            open: BinaryHeap::new(),
            nodes: HashMap::new(),
            closed: HashSet::new(),
            next_seq: 0,
            nodes_expanded: 0,
            started: false,
            should_stop,
        }
    }

    pub(crate) fn nodes_expanded(&self) -> usize {
        self.nodes_expanded
    }

    /// Searches to the domain goal. The path comes back reversed: the final
    /// state first, the start state last, so popping from the back walks the
    /// plan forward. Empty when no path exists or the search was cancelled.
    pub(crate) fn find_path(&mut self, world: &World) -> Vec<D::State> {
        self.run(world, None, usize::MAX)
    }

    /// Like `find_path` but also accepts any node whose depth reaches
    /// `window`, returning the partial plan to the cheapest such frontier
    /// node. Falls back to the start-state singleton when the reachable
    /// region is smaller than the window.
    pub(crate) fn find_path_window(&mut self, world: &World, window: Cost) -> Vec<D::State> {
        let path = self.run(world, Some(window), usize::MAX);
        if path.is_empty() && !self.should_stop.load(AtomicOrdering::Relaxed) {
            return vec![self.start.clone()];
        }
        path
    }

    /// Like `find_path` but gives up after expanding `node_budget` nodes;
    /// used for opportunistic searches that must stay cheap.
    pub(crate) fn find_path_limited(
        &mut self,
        world: &World,
        node_budget: usize,
    ) -> Vec<D::State> {
        self.run(world, None, node_budget)
    }

    /// Reverse/distance-cache mode: expands until `coord` is closed and
    /// returns its g-value, resuming from the previous frontier on repeated
    /// calls. Correct only with a consistent heuristic, since a closed
    /// coordinate's g must be final.
    pub(crate) fn find_distance(&mut self, coord: D::Coord, world: &World) -> Cost {
        self.ensure_started(world);

        loop {
            if self.closed.contains(&coord) {
                return self.nodes[&coord].g;
            }

            let entry = match self.pop_best() {
                Some(entry) => entry,
                None => return UNREACHABLE,
            };
            if self.should_stop.load(AtomicOrdering::Relaxed) {
                return UNREACHABLE;
            }

            self.expand(entry, world);
        }
    }

    fn run(
        &mut self,
        world: &World,
        window: Option<Cost>,
        node_budget: usize,
    ) -> Vec<D::State> {
        self.ensure_started(world);

        let mut budget = node_budget;
        while let Some(entry) = self.pop_best() {
            if self.should_stop.load(AtomicOrdering::Relaxed) {
                return Vec::new();
            }

            if self.domain.is_goal(&entry.state, world) {
                return self.reconstruct(entry.coord);
            }
            if let Some(window) = window {
                if entry.g >= window {
                    return self.reconstruct(entry.coord);
                }
            }

            if budget == 0 {
                return Vec::new();
            }
            budget -= 1;

            self.expand(entry, world);
        }

        Vec::new()
    }

    fn ensure_started(&mut self, world: &World) {
        if self.started {
            return;
        }
        self.started = true;

        let start = self.start.clone();
        let h = self.domain.heuristic(&start, world, 0);
        let coord = D::coordinate(&start, 0);
        self.nodes.insert(
            coord.clone(),
            NodeRecord {
                g: 0,
                parent: None,
                state: start.clone(),
            },
        );
        self.push_open(h, 0, coord, start);
    }

    fn push_open(&mut self, f: Cost, g: Cost, coord: D::Coord, state: D::State) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.open.push(OpenEntry {
            f,
            seq,
            g,
            coord,
            state,
        });
    }

    fn pop_best(&mut self) -> Option<OpenEntry<D>> {
        while let Some(entry) = self.open.pop() {
            if self.closed.contains(&entry.coord) {
                continue;
            }
            if let Some(record) = self.nodes.get(&entry.coord) {
                if record.g < entry.g {
                    continue; // Superseded by a cheaper insertion.
                }
            }
            return Some(entry);
        }
        None
    }

    fn expand(&mut self, entry: OpenEntry<D>, world: &World) {
        self.nodes_expanded += 1;
        if D::close_full(&entry.state) {
            self.closed.insert(entry.coord.clone());
        }

        let mut successors = Vec::new();
        self.domain.successors(&entry.state, world, &mut successors);

        for next in successors {
            if !self.domain.passable(&next, &entry.state, world, entry.g) {
                continue;
            }

            let g = entry.g.saturating_add(self.domain.step_cost(&next, entry.g));
            let coord = D::coordinate(&next, g);
            if self.closed.contains(&coord) {
                continue;
            }
            if let Some(record) = self.nodes.get(&coord) {
                if record.g <= g {
                    continue;
                }
            }

            let h = self.domain.heuristic(&next, world, g);
            self.nodes.insert(
                coord.clone(),
                NodeRecord {
                    g,
                    parent: Some(entry.coord.clone()),
                    state: next.clone(),
                },
            );
            self.push_open(g.saturating_add(h), g, coord, next);
        }
    }

    fn reconstruct(&self, goal: D::Coord) -> Vec<D::State> {
        let mut path = Vec::new();
        let mut cursor = Some(goal);
        while let Some(coord) = cursor {
            let record = &self.nodes[&coord];
            path.push(record.state.clone());
            cursor = record.parent.clone();
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::grid_successors;
    use crate::common::{manhattan, Position};
    use crate::map::{parse_map, Map};
    use std::sync::Arc;

    /// Plain spatial search over the static map.
    struct GridDomain {
        goal: Position,
    }

    impl SearchDomain for GridDomain {
        type State = Position;
        type Coord = Position;

        fn successors(&mut self, state: &Position, world: &World, out: &mut Vec<Position>) {
            grid_successors(world.map(), *state, false, out);
        }

        fn heuristic(&mut self, state: &Position, _world: &World, _distance: Cost) -> Cost {
            manhattan(*state, self.goal)
        }

        fn coordinate(state: &Position, _g: Cost) -> Position {
            *state
        }

        fn is_goal(&self, state: &Position, _world: &World) -> bool {
            *state == self.goal
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn stop_flag() -> StopFlag {
        Arc::new(AtomicBool::new(false))
    }

    fn open_world(width: i32, height: i32) -> World {
        World::new(Arc::new(Map::open(width, height)))
    }

    fn search_to(goal: Position, start: Position) -> Search<GridDomain> {
        Search::new(start, GridDomain { goal }, stop_flag())
    }

    #[test]
    fn test_find_path_optimal_on_open_grid() {
        init_tracing();
        let world = open_world(5, 5);
        let start = Position::new(0, 0);
        let goal = Position::new(4, 4);
        let mut search = search_to(goal, start);

        let path = search.find_path(&world);
        assert_eq!(path.first(), Some(&goal));
        assert_eq!(path.last(), Some(&start));
        // Manhattan-optimal: 8 moves, 9 states.
        assert_eq!(path.len() as u32, manhattan(start, goal) + 1);
        for pair in path.windows(2) {
            assert_eq!(manhattan(pair[0], pair[1]), 1);
        }
    }

    #[test]
    fn test_find_path_detours_walls() {
        let map = parse_map(concat!(
            "type octile\n",
            "height 3\n",
            "width 3\n",
            "map\n",
            "...\n",
            "@@.\n",
            "...\n"
        ))
        .unwrap();
        let world = World::new(Arc::new(map));
        let mut search = search_to(Position::new(0, 2), Position::new(0, 0));

        let path = search.find_path(&world);
        // Forced around the right end of the wall: 6 moves.
        assert_eq!(path.len(), 7);
    }

    #[test]
    fn test_find_path_empty_when_unreachable() {
        let map = parse_map("type octile\nheight 1\nwidth 3\nmap\n.@.").unwrap();
        let world = World::new(Arc::new(map));
        let mut search = search_to(Position::new(2, 0), Position::new(0, 0));
        assert!(search.find_path(&world).is_empty());
    }

    #[test]
    fn test_find_distance_resumes_and_agrees() {
        let world = open_world(8, 8);
        let goal = Position::new(7, 7);
        // Reverse roles: expand from the goal, guide toward the agent.
        let mut reverse = search_to(Position::new(0, 0), goal);

        let d1 = reverse.find_distance(Position::new(0, 0), &world);
        assert_eq!(d1, 14);
        let expanded_after_first = reverse.nodes_expanded();

        // Resuming must be monotone in work done and agree with a full
        // search's g-values.
        let d2 = reverse.find_distance(Position::new(0, 0), &world);
        assert_eq!(d2, 14);
        assert_eq!(reverse.nodes_expanded(), expanded_after_first);

        let d3 = reverse.find_distance(Position::new(3, 7), &world);
        assert_eq!(d3, manhattan(goal, Position::new(3, 7)));
        assert!(reverse.nodes_expanded() >= expanded_after_first);
    }

    #[test]
    fn test_find_distance_unreachable() {
        let map = parse_map("type octile\nheight 1\nwidth 3\nmap\n.@.").unwrap();
        let world = World::new(Arc::new(map));
        let mut search = search_to(Position::new(2, 0), Position::new(0, 0));
        assert_eq!(search.find_distance(Position::new(2, 0), &world), UNREACHABLE);
    }

    #[test]
    fn test_window_truncates_path() {
        let world = open_world(20, 1);
        let mut search = search_to(Position::new(19, 0), Position::new(0, 0));

        let path = search.find_path_window(&world, 5);
        // Partial plan: depth-5 frontier node plus the chain back to start.
        assert_eq!(path.len(), 6);
        assert_eq!(path.last(), Some(&Position::new(0, 0)));
        assert_eq!(path.first(), Some(&Position::new(5, 0)));
    }

    #[test]
    fn test_window_larger_than_region_returns_singleton() {
        let map = parse_map("type octile\nheight 1\nwidth 3\nmap\n..@").unwrap();
        let world = World::new(Arc::new(map));
        let mut search = search_to(Position::new(4, 0), Position::new(0, 0));

        let path = search.find_path_window(&world, 10);
        assert_eq!(path, vec![Position::new(0, 0)]);
    }

    #[test]
    fn test_node_budget_aborts() {
        let world = open_world(30, 30);
        let mut search = search_to(Position::new(29, 29), Position::new(0, 0));
        assert!(search.find_path_limited(&world, 3).is_empty());
        assert!(search.nodes_expanded() <= 4);
    }

    #[test]
    fn test_cancellation_unwinds() {
        let world = open_world(10, 10);
        let flag = stop_flag();
        let mut search = Search::new(
            Position::new(0, 0),
            GridDomain {
                goal: Position::new(9, 9),
            },
            Arc::clone(&flag),
        );

        flag.store(true, AtomicOrdering::Relaxed);
        assert!(search.find_path(&world).is_empty());
    }
}
