use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::common::{translate, Position, PositionTime, Tick, ALL_DIRECTIONS};
use crate::map::{traversable, Map};
use crate::world::World;

/// Estimates the probability that a cell is obstacle-occupied at a future
/// tick. `update_obstacles` is called once per planning call; predictions
/// are relative to that snapshot.
pub trait Predictor {
    fn update_obstacles(&mut self, world: &World);
    fn predict_obstacle(&mut self, pt: PositionTime) -> f64;
    fn field(&self) -> HashMap<PositionTime, f64>;
}

/// Predictors are shared between a solver and the searches it constructs,
/// all single-threaded.
pub type SharedPredictor = Rc<RefCell<dyn Predictor>>;

pub fn shared(predictor: impl Predictor + 'static) -> SharedPredictor {
    Rc::new(RefCell::new(predictor))
}

/// Predicts no obstacles anywhere.
pub struct NullPredictor;

impl Predictor for NullPredictor {
    fn update_obstacles(&mut self, _world: &World) {}

    fn predict_obstacle(&mut self, _pt: PositionTime) -> f64 {
        0.0
    }

    fn field(&self) -> HashMap<PositionTime, f64> {
        HashMap::new()
    }
}

/// Evolves the observed obstacle occupancy one tick at a time: each tick an
/// obstacle attempts a move with probability `move_probability`, picking one
/// of the four directions uniformly and staying put when the pick is blocked.
/// Layers are computed lazily up to `horizon` ticks ahead; beyond that the
/// estimate saturates at the last computed layer.
pub struct DiffusionPredictor {
    move_probability: f64,
    horizon: Tick,
    base_tick: Tick,
    map: Option<Arc<Map>>,
    layers: Vec<HashMap<Position, f64>>,
}

impl DiffusionPredictor {
    pub fn new(move_probability: f64, horizon: Tick) -> Self {
        DiffusionPredictor {
            move_probability: move_probability.clamp(0.0, 1.0),
            horizon: horizon.max(1),
            base_tick: 0,
            map: None,
            layers: Vec::new(),
        }
    }

    fn ensure_layer(&mut self, dt: usize) {
        let map = match &self.map {
            Some(map) => Arc::clone(map),
            None => return,
        };

        while self.layers.len() <= dt {
            let last = self.layers.last().expect("seeded at update_obstacles");
            let mut next: HashMap<Position, f64> = HashMap::new();

            for (&pos, &mass) in last {
                let free: Vec<Position> = ALL_DIRECTIONS
                    .iter()
                    .map(|&d| translate(pos, d))
                    .filter(|&q| map.in_bounds(q) && traversable(map.get(q)))
                    .collect();

                // A blocked direction pick leaves the obstacle in place.
                let leave = self.move_probability * free.len() as f64 / 4.0;
                *next.entry(pos).or_insert(0.0) += mass * (1.0 - leave);
                for q in free {
                    *next.entry(q).or_insert(0.0) += mass * self.move_probability / 4.0;
                }
            }

            for mass in next.values_mut() {
                *mass = mass.min(1.0);
            }
            self.layers.push(next);
        }
    }
}

impl Predictor for DiffusionPredictor {
    fn update_obstacles(&mut self, world: &World) {
        self.base_tick = world.tick();
        self.map = Some(world.map_shared());
        let mut base = HashMap::new();
        for &pos in world.obstacles().keys() {
            base.insert(pos, 1.0);
        }
        self.layers = vec![base];
    }

    fn predict_obstacle(&mut self, pt: PositionTime) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        let dt = pt.time.saturating_sub(self.base_tick).min(self.horizon) as usize;
        self.ensure_layer(dt);
        self.layers[dt]
            .get(&pt.position())
            .copied()
            .unwrap_or(0.0)
    }

    fn field(&self) -> HashMap<PositionTime, f64> {
        let mut field = HashMap::new();
        for (dt, layer) in self.layers.iter().enumerate() {
            for (&pos, &mass) in layer {
                field.insert(PositionTime::new(pos, self.base_tick + dt as Tick), mass);
            }
        }
        field
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::Normal;

    use crate::world::Obstacle;

    fn world_with_obstacle(at: Position) -> World {
        let mut w = World::new(Arc::new(Map::open(5, 5)));
        let mut o = Obstacle::new(Normal::new(5.0, 1.0).unwrap());
        o.next_move = 1;
        w.put_obstacle(at, o);
        w
    }

    #[test]
    fn test_null_predictor() {
        let mut p = NullPredictor;
        p.update_obstacles(&world_with_obstacle(Position::new(2, 2)));
        assert_eq!(p.predict_obstacle(PositionTime::new(Position::new(2, 2), 3)), 0.0);
        assert!(p.field().is_empty());
    }

    #[test]
    fn test_certain_now_spreads_later() {
        let w = world_with_obstacle(Position::new(2, 2));
        let mut p = DiffusionPredictor::new(0.2, 8);
        p.update_obstacles(&w);

        let here = Position::new(2, 2);
        assert_eq!(p.predict_obstacle(PositionTime::new(here, 0)), 1.0);

        let in_one = p.predict_obstacle(PositionTime::new(here, 1));
        assert!(in_one > 0.7 && in_one < 1.0);

        let east = p.predict_obstacle(PositionTime::new(Position::new(3, 2), 1));
        assert!((east - 0.05).abs() < 1e-9);

        // Mass never appears on cells the obstacle cannot reach in time.
        assert_eq!(p.predict_obstacle(PositionTime::new(Position::new(0, 0), 1)), 0.0);
    }

    #[test]
    fn test_horizon_saturates() {
        let w = world_with_obstacle(Position::new(2, 2));
        let mut p = DiffusionPredictor::new(0.5, 3);
        p.update_obstacles(&w);

        let far = p.predict_obstacle(PositionTime::new(Position::new(2, 2), 100));
        let at_horizon = p.predict_obstacle(PositionTime::new(Position::new(2, 2), 3));
        assert_eq!(far, at_horizon);
    }

    #[test]
    fn test_update_resets_snapshot() {
        let mut p = DiffusionPredictor::new(0.2, 4);
        p.update_obstacles(&world_with_obstacle(Position::new(1, 1)));
        assert_eq!(p.predict_obstacle(PositionTime::new(Position::new(1, 1), 0)), 1.0);

        p.update_obstacles(&world_with_obstacle(Position::new(3, 3)));
        assert_eq!(p.predict_obstacle(PositionTime::new(Position::new(1, 1), 0)), 0.0);
        assert_eq!(p.predict_obstacle(PositionTime::new(Position::new(3, 3), 0)), 1.0);
    }
}
