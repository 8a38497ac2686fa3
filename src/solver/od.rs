use rand::rngs::StdRng;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::Solver;
use crate::action::{apply, Action, JointAction};
use crate::algorithm::{Cost, ReverseSearch, Search, SearchDomain, StopFlag};
use crate::common::{
    direction_to, neighbours, translate, AgentId, Direction, Position, PositionTime, Tick,
    ALL_DIRECTIONS,
};
use crate::map::Tile;
use crate::predictor::SharedPredictor;
use crate::world::World;

/// One agent's assignment within a move round. Unlike a `Direction` this
/// includes the explicit wait and the not-yet-decided marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AgentAction {
    North,
    East,
    South,
    West,
    Stay,
    Unassigned,
}

impl AgentAction {
    fn from_direction(d: Direction) -> Self {
        match d {
            Direction::North => AgentAction::North,
            Direction::East => AgentAction::East,
            Direction::South => AgentAction::South,
            Direction::West => AgentAction::West,
        }
    }

    fn direction(self) -> Option<Direction> {
        match self {
            AgentAction::North => Some(Direction::North),
            AgentAction::East => Some(Direction::East),
            AgentAction::South => Some(Direction::South),
            AgentAction::West => Some(Direction::West),
            AgentAction::Stay | AgentAction::Unassigned => None,
        }
    }
}

/// Post-move position of one agent plus the action that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AgentStateRecord {
    position: Position,
    id: AgentId,
    action: AgentAction,
}

impl AgentStateRecord {
    /// Where the agent stood before its assigned move.
    fn pre_move_position(&self) -> Position {
        match self.action.direction() {
            Some(d) => translate(self.position, d.inverse()),
            None => self.position,
        }
    }
}

/// A joint state mid-round: agents before `next_agent` carry this round's
/// assignment, the rest still hold their previous positions. The state is
/// full when `next_agent` is 0 and every action is `Unassigned`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AgentsState {
    agents: Vec<AgentStateRecord>,
    next_agent: usize,
}

impl AgentsState {
    fn is_full(&self) -> bool {
        self.next_agent == 0
    }
}

fn make_full(state: &mut AgentsState) {
    debug_assert_eq!(state.next_agent, 0);
    for agent in &mut state.agents {
        agent.action = AgentAction::Unassigned;
    }
}

/// Open-set coordinate: the joint state at its depth, compared under
/// partial-state equivalence. Two mid-round states that agree on every
/// `(position, id)` and on `next_agent` are interchangeable - unless an
/// agent still to move sits next to one of the differing pre-move cells, in
/// which case the pre-move layout affects its legal moves and the states
/// must stay distinct.
#[derive(Debug, Clone, Eq)]
struct OdCoord {
    state: AgentsState,
    time: Cost,
}

impl PartialEq for OdCoord {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && partial_state_equal(&self.state, &other.state)
    }
}

impl Hash for OdCoord {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        for agent in &self.state.agents {
            agent.position.hash(hasher);
            agent.id.hash(hasher);
        }
        self.state.next_agent.hash(hasher);
        self.time.hash(hasher);
    }
}

fn partial_state_equal(lhs: &AgentsState, rhs: &AgentsState) -> bool {
    if lhs.agents.len() != rhs.agents.len() || lhs.next_agent != rhs.next_agent {
        return false;
    }

    for i in 0..lhs.agents.len() {
        let (a, b) = (&lhs.agents[i], &rhs.agents[i]);
        if a.position != b.position || a.id != b.id {
            return false;
        }

        if a.action != b.action {
            // Same post-move cell, different action: the pre-move cells
            // differ. Any unassigned agent adjacent to either pre-move cell
            // sees different legal moves.
            let lhs_pre = a.pre_move_position();
            let rhs_pre = b.pre_move_position();

            for j in i + 1..lhs.agents.len() {
                if lhs.agents[j].action != AgentAction::Unassigned {
                    continue;
                }
                if neighbours(lhs.agents[j].position, lhs_pre)
                    || neighbours(rhs.agents[j].position, rhs_pre)
                {
                    return false;
                }
            }
        }
    }

    true
}

/// Expands only the agent at `next_agent`: one child per legal direction
/// plus a stay, checking the moves already assigned this round for vertex
/// and edge conflicts.
fn od_successors(state: &AgentsState, world: &World, out: &mut Vec<AgentsState>) {
    let agent = state.agents[state.next_agent];
    debug_assert_eq!(agent.action, AgentAction::Unassigned);

    let mut add = |action: AgentAction, destination: Position| {
        let mut child = state.clone();
        child.agents[state.next_agent].action = action;
        child.agents[state.next_agent].position = destination;
        child.next_agent = (child.next_agent + 1) % child.agents.len();
        if child.next_agent == 0 {
            make_full(&mut child);
        }
        out.push(child);
    };

    for d in ALL_DIRECTIONS {
        let destination = translate(agent.position, d);
        if !world.map().in_bounds(destination) || world.get(destination) == Tile::Wall {
            continue;
        }

        let mut possible = true;
        for other in &state.agents {
            if other.action == AgentAction::Unassigned {
                break;
            }

            if other.action == AgentAction::Stay {
                if destination == other.position {
                    possible = false;
                    break;
                }
            } else {
                let came_from = other.pre_move_position();
                if destination == other.position
                    || (destination == came_from && other.position == agent.position)
                {
                    possible = false;
                    break;
                }
            }
        }

        if possible {
            add(AgentAction::from_direction(d), destination);
        }
    }

    // Staying is illegal when an already-moved agent ends up on this cell.
    let mut needs_vacate = false;
    for other in &state.agents {
        if other.action == AgentAction::Unassigned {
            break;
        }
        if other.position == agent.position && other.id != agent.id {
            needs_vacate = true;
            break;
        }
    }
    if !needs_vacate {
        add(AgentAction::Stay, agent.position);
    }
}

struct OdDomain<'a> {
    start: AgentsState,
    targets: HashMap<AgentId, Position>,
    heuristics: &'a mut HashMap<AgentId, ReverseSearch>,
    predictor: Option<SharedPredictor>,
    threshold: f64,
}

impl SearchDomain for OdDomain<'_> {
    type State = AgentsState;
    type Coord = OdCoord;

    fn successors(&mut self, state: &AgentsState, world: &World, out: &mut Vec<AgentsState>) {
        od_successors(state, world, out);
    }

    fn passable(
        &mut self,
        to: &AgentsState,
        _from: &AgentsState,
        world: &World,
        distance: Cost,
    ) -> bool {
        let steps = 1 + distance / to.agents.len() as Cost;

        for agent in &to.agents {
            if let Some(predictor) = &self.predictor {
                let probability = predictor
                    .borrow_mut()
                    .predict_obstacle(PositionTime::new(agent.position, world.tick() + steps));
                if probability > self.threshold {
                    return false;
                }
            }

            // A cell currently under an obstacle is usable only far from the
            // agent's starting position.
            if world.get(agent.position) == Tile::Obstacle {
                if let Some(from_agent) =
                    self.start.agents.iter().find(|a| a.id == agent.id)
                {
                    if neighbours(from_agent.position, agent.position) {
                        return false;
                    }
                }
            }
        }

        true
    }

    /// Sum of per-agent reverse distances; admissible because the agents are
    /// independent in the relaxation.
    fn heuristic(&mut self, state: &AgentsState, world: &World, _distance: Cost) -> Cost {
        let mut total: Cost = 0;
        for agent in &state.agents {
            let search = self
                .heuristics
                .get_mut(&agent.id)
                .expect("heuristic search exists for every agent");
            total = total.saturating_add(search.find_distance(agent.position, world));
        }
        total
    }

    fn coordinate(state: &AgentsState, g: Cost) -> OdCoord {
        OdCoord {
            state: state.clone(),
            time: g,
        }
    }

    fn close_full(state: &AgentsState) -> bool {
        state.is_full()
    }

    fn is_goal(&self, state: &AgentsState, _world: &World) -> bool {
        state.is_full()
            && state
                .agents
                .iter()
                .all(|a| self.targets[&a.id] == a.position)
    }
}

/// Agents planned jointly; the plan is reversed with the current state last.
struct Group {
    plan: Vec<AgentsState>,
    starting_positions: Vec<Position>,
}

type GroupId = usize;

#[derive(Debug, Clone, Copy)]
struct GroupReservation {
    group: GroupId,
    from: Option<Position>,
}

#[derive(Debug, Clone, Copy)]
struct GroupPermanent {
    group: GroupId,
    from_time: Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Admissibility {
    Admissible,
    Incomplete,
    Invalid,
}

/// Operator decomposition with dynamic grouping: agents start in singleton
/// groups, each group plans a joint path one agent-move at a time, and
/// groups that conflict in the reservation tables are merged and replanned.
pub struct OperatorDecomposition {
    groups: Vec<Option<Group>>,
    reservation_table: HashMap<PositionTime, GroupReservation>,
    permanent_table: HashMap<Position, GroupPermanent>,
    last_nonpermanent_reservation: Tick,
    heuristics: HashMap<AgentId, ReverseSearch>,
    predictor: Option<SharedPredictor>,
    window: u32,
    obstacle_penalty: Cost,
    obstacle_threshold: f64,
    replans: u32,
    plan_invalid: u32,
    nodes_primary: usize,
    nodes_heuristic: usize,
    max_group_size: u32,
    fallback_plans: u32,
    should_stop: StopFlag,
}

impl OperatorDecomposition {
    pub fn new(
        window: u32,
        predictor: Option<SharedPredictor>,
        obstacle_penalty: Cost,
        obstacle_threshold: f64,
        should_stop: StopFlag,
    ) -> Self {
        OperatorDecomposition {
            groups: Vec::new(),
            reservation_table: HashMap::new(),
            permanent_table: HashMap::new(),
            last_nonpermanent_reservation: 0,
            heuristics: HashMap::new(),
            predictor,
            window,
            obstacle_penalty,
            obstacle_threshold,
            replans: 0,
            plan_invalid: 0,
            nodes_primary: 0,
            nodes_heuristic: 0,
            max_group_size: 0,
            fallback_plans: 0,
            should_stop,
        }
    }

    fn live_groups(&self) -> impl Iterator<Item = (GroupId, &Group)> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(id, g)| g.as_ref().map(|g| (id, g)))
    }

    fn stop_requested(&self) -> bool {
        self.should_stop.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Whether the final state of a stub plan already has every member
    /// standing on its goal.
    fn finished(state: &AgentsState, world: &World) -> bool {
        state.agents.iter().all(|agent| {
            world
                .get_agent(agent.position)
                .is_some_and(|a| a.target == agent.position)
        })
    }

    /// - admissible: every group can take its next transition;
    /// - incomplete: some group lacks a plan and is not at its final state;
    /// - invalid: an obstacle now sits on a next-step cell. Forces a replan.
    fn plans_admissible(&self, world: &World) -> Admissibility {
        let mut result = Admissibility::Admissible;

        for (_, group) in self.live_groups() {
            if group.plan.len() < 2 {
                match group.plan.first() {
                    Some(state) if Self::finished(state, world) => {}
                    _ => result = result.max(Admissibility::Incomplete),
                }
                continue;
            }

            let next_state = &group.plan[group.plan.len() - 2];
            for agent in &next_state.agents {
                if world.get(agent.position) == Tile::Obstacle {
                    return Admissibility::Invalid;
                }
            }
        }

        result
    }

    fn make_heuristic_searches(&mut self, world: &World) {
        self.heuristics.clear();
        for (&pos, agent) in world.agents() {
            self.heuristics.insert(
                agent.id,
                ReverseSearch::new(
                    agent.target,
                    pos,
                    self.predictor.clone(),
                    self.obstacle_penalty,
                    world.tick(),
                    Arc::clone(&self.should_stop),
                ),
            );
        }
    }

    fn heuristic_nodes(&self) -> usize {
        self.heuristics.values().map(|s| s.nodes_expanded()).sum()
    }

    #[instrument(skip_all, name = "od_replan", level = "debug")]
    fn replan(&mut self, world: &World) {
        self.replans += 1;
        self.groups.clear();
        self.reservation_table.clear();
        self.permanent_table.clear();
        self.last_nonpermanent_reservation = 0;

        self.make_heuristic_searches(world);
        let old_nodes_heuristic = self.heuristic_nodes();

        let mut starts: Vec<Position> = world.agents().keys().copied().collect();
        starts.sort();
        for pos in starts {
            self.groups.push(Some(Group {
                plan: Vec::new(),
                starting_positions: vec![pos],
            }));
        }

        loop {
            let conflicted = self.replan_groups(world);
            if !conflicted || self.stop_requested() {
                break;
            }
        }

        self.nodes_heuristic += self.heuristic_nodes() - old_nodes_heuristic;
    }

    /// One pass over the groups: plan every group that lacks a plan, check
    /// it against the reservation tables, and either record it or merge the
    /// conflicting groups and report that another pass is needed.
    fn replan_groups(&mut self, world: &World) -> bool {
        for id in 0..self.groups.len() {
            let Some(group) = &self.groups[id] else {
                continue;
            };
            if !group.plan.is_empty() {
                continue;
            }

            let starting_positions = group.starting_positions.clone();
            let plan = self.replan_group(world, &starting_positions);
            if self.stop_requested() {
                return false;
            }

            let mut conflicts: Vec<GroupId> = Vec::new();
            let length = plan.len();
            for (offset, state) in plan.iter().rev().enumerate() {
                let time = world.tick() + offset as Tick;
                let is_final = offset == length - 1;

                for (i, agent) in state.agents.iter().enumerate() {
                    let from = if offset > 0 {
                        Some(plan[length - offset].agents[i].position)
                    } else {
                        None
                    };

                    let mut conflicting =
                        self.find_conflict(agent.position, from, time, is_final);
                    if conflicting.is_none() && is_final {
                        conflicting = self.find_permanent_conflict(agent.position, time);
                    }
                    debug_assert_ne!(conflicting, Some(id));

                    if let Some(other) = conflicting {
                        if !conflicts.contains(&other) {
                            conflicts.push(other);
                        }
                    }
                }
            }

            if conflicts.is_empty() {
                self.reserve(&plan, id, world.tick());
                self.groups[id].as_mut().expect("live group").plan = plan;
            } else {
                debug!(group = id, merged = conflicts.len(), "group conflict");
                self.groups[id].as_mut().expect("live group").plan = plan;
                conflicts.push(id);
                self.merge_groups(&conflicts);
                return true;
            }
        }

        false
    }

    fn replan_group(&mut self, world: &World, starting_positions: &[Position]) -> Vec<AgentsState> {
        self.max_group_size = self.max_group_size.max(starting_positions.len() as u32);

        let mut current = AgentsState {
            agents: Vec::new(),
            next_agent: 0,
        };
        let mut targets = HashMap::new();
        for &pos in starting_positions {
            let agent = world.get_agent(pos).expect("group member present");
            current.agents.push(AgentStateRecord {
                position: pos,
                id: agent.id,
                action: AgentAction::Unassigned,
            });
            targets.insert(agent.id, agent.target);
        }

        let window = self.window;
        let domain = OdDomain {
            start: current.clone(),
            targets,
            heuristics: &mut self.heuristics,
            predictor: self.predictor.clone(),
            threshold: self.obstacle_threshold,
        };
        let mut search = Search::new(current.clone(), domain, Arc::clone(&self.should_stop));
        let path = if window > 0 {
            let horizon = window * starting_positions.len() as u32;
            search.find_path_window(world, horizon)
        } else {
            search.find_path(world)
        };
        let expanded = search.nodes_expanded();
        drop(search);
        self.nodes_primary += expanded;

        if self.stop_requested() {
            return Vec::new();
        }

        // Only full states survive into the plan; mid-round states are
        // search bookkeeping.
        let mut plan: Vec<AgentsState> = path.into_iter().filter(|s| s.is_full()).collect();

        if plan.is_empty() {
            // No full-state path at all. A one-state everyone-stays plan
            // keeps the group visible to conflict detection and the
            // reservation tables.
            self.fallback_plans += 1;
            plan.push(current);
        }

        plan
    }

    fn merge_groups(&mut self, ids: &[GroupId]) {
        let target = ids[0];
        self.unreserve(target);
        self.groups[target].as_mut().expect("live group").plan = Vec::new();

        for &other in &ids[1..] {
            self.unreserve(other);
            let absorbed = self.groups[other].take().expect("live group");
            self.groups[target]
                .as_mut()
                .expect("live group")
                .starting_positions
                .extend(absorbed.starting_positions);
        }
    }

    fn reserve(&mut self, plan: &[AgentsState], group: GroupId, start: Tick) {
        let mut time = start;
        let length = plan.len();

        for (offset, state) in plan.iter().rev().enumerate() {
            for (i, agent) in state.agents.iter().enumerate() {
                let from = if offset > 0 {
                    Some(plan[length - offset].agents[i].position)
                } else {
                    None
                };

                self.reservation_table
                    .insert(PositionTime::new(agent.position, time), GroupReservation {
                        group,
                        from,
                    });
                self.last_nonpermanent_reservation = self.last_nonpermanent_reservation.max(time);
            }
            time += 1;
        }

        let Some(final_state) = plan.first() else {
            return;
        };
        for agent in &final_state.agents {
            debug_assert!(!self.permanent_table.contains_key(&agent.position));
            self.permanent_table.insert(agent.position, GroupPermanent {
                group,
                from_time: time,
            });
        }
    }

    fn unreserve(&mut self, group: GroupId) {
        self.reservation_table.retain(|_, r| r.group != group);
        self.permanent_table.retain(|_, r| r.group != group);
    }

    fn find_conflict(
        &self,
        to: Position,
        from: Option<Position>,
        time: Tick,
        permanent: bool,
    ) -> Option<GroupId> {
        if let Some(conflict) = self.reservation_table.get(&PositionTime::new(to, time)) {
            return Some(conflict.group);
        }

        // Swap detected through the symmetric back-pointer: whoever reserved
        // our source cell at the arrival time came from our destination.
        if let Some(from) = from {
            if let Some(vacated) = self.reservation_table.get(&PositionTime::new(from, time)) {
                if vacated.from == Some(to) {
                    return Some(vacated.group);
                }
            }
        }

        if let Some(conflict) = self.permanent_table.get(&to) {
            if permanent || conflict.from_time <= time {
                return Some(conflict.group);
            }
        }

        None
    }

    /// A plan's final cell also clashes with any later reservation another
    /// group still holds on that cell.
    fn find_permanent_conflict(&self, position: Position, since: Tick) -> Option<GroupId> {
        for t in since..self.last_nonpermanent_reservation {
            if let Some(conflict) = self.reservation_table.get(&PositionTime::new(position, t)) {
                return Some(conflict.group);
            }
        }
        None
    }

    fn make_action(from: &AgentsState, to: &AgentsState) -> JointAction {
        debug_assert_eq!(from.agents.len(), to.agents.len());

        let mut result = JointAction::new();
        for (a, b) in from.agents.iter().zip(&to.agents) {
            debug_assert_eq!(a.id, b.id);
            if a.position != b.position {
                result.add(Action::new(a.position, direction_to(a.position, b.position)));
            }
        }
        result
    }
}

impl Solver for OperatorDecomposition {
    fn step(&mut self, world: &mut World, _rng: &mut StdRng) {
        if let Some(predictor) = &self.predictor {
            predictor.borrow_mut().update_obstacles(world);
        }

        let admissibility = self.plans_admissible(world);
        if self.live_groups().next().is_none() || admissibility != Admissibility::Admissible {
            if admissibility == Admissibility::Invalid {
                self.plan_invalid += 1;
            }
            self.replan(world);
        }

        if self.stop_requested() {
            return;
        }

        let mut joint = JointAction::new();
        for group in self.groups.iter_mut().flatten() {
            if group.plan.len() < 2 {
                continue;
            }
            let current = group.plan.pop().expect("checked length");
            let next = group.plan.last().expect("checked length");
            joint.extend(Self::make_action(&current, next));
        }

        apply(&joint, world);
    }

    fn name(&self) -> &'static str {
        "OD"
    }

    fn stat_names(&self) -> Vec<&'static str> {
        vec![
            "Replans",
            "Plan invalid",
            "Nodes primary",
            "Nodes heuristic",
            "Total nodes expanded",
            "Max group size",
            "Fallback plans",
        ]
    }

    fn stat_values(&self) -> Vec<String> {
        vec![
            self.replans.to_string(),
            self.plan_invalid.to_string(),
            self.nodes_primary.to_string(),
            self.nodes_heuristic.to_string(),
            (self.nodes_primary + self.nodes_heuristic).to_string(),
            self.max_group_size.to_string(),
            self.fallback_plans.to_string(),
        ]
    }

    fn get_path(&self, agent: AgentId) -> Vec<Position> {
        let mut result = Vec::new();
        for (_, group) in self.live_groups() {
            for state in &group.plan {
                for record in &state.agents {
                    if record.id == agent {
                        result.push(record.position);
                    }
                }
            }
        }
        result
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
