use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{translate, Agent, AgentId, Direction, Position, Tick};
use crate::map::{traversable, Map, Tile};

/// A temporary moving blocker. Between moves it waits a normally-distributed
/// number of ticks.
#[derive(Debug, Clone)]
pub struct Obstacle {
    pub next_move: Tick,
    move_delay: Normal<f64>,
}

impl Obstacle {
    pub fn new(move_delay: Normal<f64>) -> Self {
        Obstacle {
            next_move: 0,
            move_delay,
        }
    }

    pub fn sample_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Tick {
        (self.move_delay.sample(rng).round() as i64).max(1) as Tick
    }
}

/// The shared grid world: a static map plus agents, obstacles and the tick
/// counter.
///
/// Invariants enforced by the mutators: at most one agent and one obstacle
/// per position, never both on the same cell, and every occupied cell is an
/// in-bounds free map tile. Violations are programmer errors and panic.
#[derive(Debug, Clone)]
pub struct World {
    map: Arc<Map>,
    agents: HashMap<Position, Agent>,
    obstacles: HashMap<Position, Obstacle>,
    tick: Tick,
    next_agent_id: AgentId,
}

impl World {
    pub fn new(map: Arc<Map>) -> Self {
        World {
            map,
            agents: HashMap::new(),
            obstacles: HashMap::new(),
            tick: 0,
            next_agent_id: 0,
        }
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn map_shared(&self) -> Arc<Map> {
        Arc::clone(&self.map)
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Agent if an agent is at `p`, else obstacle, else the map tile.
    pub fn get(&self, p: Position) -> Tile {
        if self.agents.contains_key(&p) {
            Tile::Agent
        } else if self.obstacles.contains_key(&p) {
            Tile::Obstacle
        } else {
            self.map.get(p)
        }
    }

    pub fn get_agent(&self, p: Position) -> Option<&Agent> {
        self.agents.get(&p)
    }

    pub fn agents(&self) -> &HashMap<Position, Agent> {
        &self.agents
    }

    pub fn obstacles(&self) -> &HashMap<Position, Obstacle> {
        &self.obstacles
    }

    /// Allocates a dense agent id. The caller places the agent with
    /// `put_agent`.
    pub fn create_agent(&mut self, target: Position) -> Agent {
        let agent = Agent {
            id: self.next_agent_id,
            target,
        };
        self.next_agent_id += 1;
        agent
    }

    pub fn put_agent(&mut self, p: Position, agent: Agent) {
        assert!(
            self.get(p) == Tile::Free,
            "put_agent: position {p} not empty"
        );
        self.agents.insert(p, agent);
    }

    pub fn remove_agent(&mut self, p: Position) -> Agent {
        self.agents
            .remove(&p)
            .unwrap_or_else(|| panic!("remove_agent: no agent at {p}"))
    }

    pub fn put_obstacle(&mut self, p: Position, o: Obstacle) {
        assert!(
            self.get(p) == Tile::Free,
            "put_obstacle: position {p} not empty"
        );
        self.obstacles.insert(p, o);
    }

    pub fn remove_obstacle(&mut self, p: Position) -> Obstacle {
        self.obstacles
            .remove(&p)
            .unwrap_or_else(|| panic!("remove_obstacle: no obstacle at {p}"))
    }

    /// Advances time one tick. Each obstacle whose `next_move` equals the new
    /// tick makes a single attempt to step to a uniformly-random adjacent
    /// cell; on success its next-move delay is resampled.
    pub fn next_tick<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.tick += 1;

        let due: Vec<Position> = self
            .obstacles
            .iter()
            .filter(|(_, o)| o.next_move == self.tick)
            .map(|(&p, _)| p)
            .collect();

        for pos in due {
            let d = Direction::from_ordinal(rng.gen_range(0..4));
            let new_pos = translate(pos, d);
            if self.map.in_bounds(new_pos) && traversable(self.get(new_pos)) {
                let mut o = self.remove_obstacle(pos);
                o.next_move = self.tick + o.sample_delay(rng);
                self.put_obstacle(new_pos, o);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::parse_map;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn open_world(width: i32, height: i32) -> World {
        World::new(Arc::new(Map::open(width, height)))
    }

    fn test_obstacle(next_move: Tick) -> Obstacle {
        let mut o = Obstacle::new(Normal::new(5.0, 1.0).unwrap());
        o.next_move = next_move;
        o
    }

    #[test]
    fn test_get_precedence() {
        let mut w = open_world(3, 3);
        let agent = w.create_agent(Position::new(2, 2));
        w.put_agent(Position::new(0, 0), agent);
        w.put_obstacle(Position::new(1, 0), test_obstacle(1));

        assert_eq!(w.get(Position::new(0, 0)), Tile::Agent);
        assert_eq!(w.get(Position::new(1, 0)), Tile::Obstacle);
        assert_eq!(w.get(Position::new(2, 0)), Tile::Free);
        assert_eq!(w.get_agent(Position::new(0, 0)).unwrap().id, 0);
        assert!(w.get_agent(Position::new(1, 0)).is_none());
    }

    #[test]
    #[should_panic(expected = "put_agent")]
    fn test_put_agent_on_occupied_panics() {
        let mut w = open_world(2, 2);
        let a = w.create_agent(Position::new(1, 1));
        let b = w.create_agent(Position::new(0, 0));
        w.put_agent(Position::new(0, 0), a);
        w.put_agent(Position::new(0, 0), b);
    }

    #[test]
    #[should_panic(expected = "put_obstacle")]
    fn test_put_obstacle_on_wall_panics() {
        let map = parse_map("type octile\nheight 1\nwidth 2\nmap\n.@").unwrap();
        let mut w = World::new(Arc::new(map));
        w.put_obstacle(Position::new(1, 0), test_obstacle(1));
    }

    #[test]
    fn test_next_tick_moves_due_obstacle() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut w = open_world(3, 3);
        let center = Position::new(1, 1);
        w.put_obstacle(center, test_obstacle(1));

        w.next_tick(&mut rng);
        assert_eq!(w.tick(), 1);
        let (&pos, o) = w.obstacles().iter().next().unwrap();
        assert_ne!(pos, center);
        assert_eq!(crate::common::manhattan(pos, center), 1);
        assert!(o.next_move > 1);
    }

    #[test]
    fn test_next_tick_skips_not_due_obstacle() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut w = open_world(3, 3);
        w.put_obstacle(Position::new(1, 1), test_obstacle(5));

        w.next_tick(&mut rng);
        assert!(w.obstacles().contains_key(&Position::new(1, 1)));
    }

    #[test]
    fn test_enclosed_obstacle_stays() {
        let map = parse_map(concat!(
            "type octile\n",
            "height 3\n",
            "width 3\n",
            "map\n",
            ".@.\n",
            "@.@\n",
            ".@.\n"
        ))
        .unwrap();
        let mut w = World::new(Arc::new(map));
        w.put_obstacle(Position::new(1, 1), test_obstacle(1));

        let mut rng = StdRng::seed_from_u64(3);
        w.next_tick(&mut rng);
        assert!(w.obstacles().contains_key(&Position::new(1, 1)));
    }
}
