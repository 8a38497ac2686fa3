use std::collections::{HashMap, HashSet};

use crate::common::{translate, Direction, Position};
use crate::map::traversable;
use crate::world::World;

/// A single-agent move: the agent at `from` steps one cell in `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub from: Position,
    pub direction: Direction,
}

impl Action {
    pub fn new(from: Position, direction: Direction) -> Self {
        Action { from, direction }
    }

    pub fn destination(&self) -> Position {
        translate(self.from, self.direction)
    }
}

/// Whether `a` can be applied to `w` on its own: `from` holds an agent and
/// the destination is an in-bounds free cell. Interactions within a joint
/// move are the caller's concern; solvers validate against a scratch world
/// they update action by action.
pub fn valid(a: Action, w: &World) -> bool {
    let dest = a.destination();
    w.get_agent(a.from).is_some() && w.map().in_bounds(dest) && traversable(w.get(dest))
}

/// The moves chosen simultaneously for all agents in one tick. Agents
/// without an action stay in place.
#[derive(Debug, Clone, Default)]
pub struct JointAction {
    actions: Vec<Action>,
}

impl JointAction {
    pub fn new() -> Self {
        JointAction::default()
    }

    pub fn add(&mut self, a: Action) {
        debug_assert!(
            self.actions.iter().all(|other| other.from != a.from),
            "joint action already moves the agent at {}",
            a.from
        );
        self.actions.push(a);
    }

    pub fn extend(&mut self, other: JointAction) {
        for a in other.actions {
            self.add(a);
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// Applies one action in place. The destination must already be free.
pub fn apply_action(a: Action, w: &mut World) {
    let agent = w.remove_agent(a.from);
    w.put_agent(a.destination(), agent);
}

/// Applies a joint action by moving every named agent at once: all movers
/// leave their cells first, then re-enter at their destinations, so an agent
/// may step into a cell vacated in the same move. Duplicate sources,
/// colliding destinations and swaps across an edge are programmer errors.
pub fn apply(joint: &JointAction, w: &mut World) {
    let mut edges: HashMap<Position, Position> = HashMap::new();
    let mut destinations: HashSet<Position> = HashSet::new();

    for a in joint.actions() {
        let dest = a.destination();
        assert!(
            edges.insert(a.from, dest).is_none(),
            "joint action moves {} twice",
            a.from
        );
        assert!(
            destinations.insert(dest),
            "joint action has colliding destination {dest}"
        );
    }
    for (&from, &dest) in &edges {
        assert!(
            edges.get(&dest) != Some(&from),
            "joint action swaps agents across {from} - {dest}"
        );
    }

    let mut movers = Vec::with_capacity(joint.actions().len());
    for a in joint.actions() {
        movers.push((a.destination(), w.remove_agent(a.from)));
    }
    for (dest, agent) in movers {
        w.put_agent(dest, agent);
    }
}
