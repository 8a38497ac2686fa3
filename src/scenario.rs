use rand::Rng;
use rand_distr::Normal;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::common::Position;
use crate::map::{Map, MapFormatError, Tile};
use crate::world::{Obstacle, World};

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("bad scenario file format: {0}")]
    Bad(String),
    #[error(transparent)]
    Map(#[from] MapFormatError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct AgentSpec {
    pub position: [i32; 2],
    /// Absent goal means the agent's goal is its starting position.
    pub goal: Option<[i32; 2]>,
}

#[derive(Debug, Deserialize)]
pub struct NormalSpec {
    pub parameters: [f64; 2],
}

#[derive(Debug, Deserialize)]
pub struct ObstacleMovementSpec {
    pub move_probability: NormalSpec,
}

#[derive(Debug, Deserialize)]
pub struct ObstaclesSpec {
    pub tile_probability: f64,
    pub obstacle_movement: ObstacleMovementSpec,
}

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub map: String,
    pub agents: Vec<AgentSpec>,
    pub obstacles: Option<ObstaclesSpec>,
}

impl Scenario {
    pub fn from_json_str(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

/// Loads a scenario file and builds the initial world. The map path is
/// resolved relative to the scenario file's directory.
pub fn load_world<R: Rng + ?Sized>(
    path: impl AsRef<Path>,
    rng: &mut R,
) -> Result<World, ScenarioError> {
    let path = path.as_ref();
    let scenario = Scenario::load(path)?;

    let map_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(scenario.map.trim());
    let map = Map::from_file(map_path)?;

    build_world(&scenario, map, rng)
}

pub fn build_world<R: Rng + ?Sized>(
    scenario: &Scenario,
    map: Map,
    rng: &mut R,
) -> Result<World, ScenarioError> {
    let mut world = World::new(Arc::new(map));

    for spec in &scenario.agents {
        let pos = Position::new(spec.position[0], spec.position[1]);
        let goal = spec
            .goal
            .map(|g| Position::new(g[0], g[1]))
            .unwrap_or(pos);

        for p in [pos, goal] {
            if !world.map().in_bounds(p) || world.map().get(p) != Tile::Free {
                return Err(ScenarioError::Bad(format!(
                    "agent position {p} is not a free in-bounds tile"
                )));
            }
        }
        if world.get_agent(pos).is_some() {
            return Err(ScenarioError::Bad(format!("two agents start at {pos}")));
        }

        let agent = world.create_agent(goal);
        world.put_agent(pos, agent);
    }

    if let Some(obstacles) = &scenario.obstacles {
        make_obstacles(&mut world, obstacles, rng)?;
    }

    info!(
        agents = world.agents().len(),
        obstacles = world.obstacles().len(),
        "world loaded"
    );
    Ok(world)
}

/// Seeds moving obstacles: every free tile independently becomes an obstacle
/// with `tile_probability`, with its first move scheduled from the configured
/// delay distribution.
fn make_obstacles<R: Rng + ?Sized>(
    world: &mut World,
    spec: &ObstaclesSpec,
    rng: &mut R,
) -> Result<(), ScenarioError> {
    let [mean, std_dev] = spec.obstacle_movement.move_probability.parameters;
    let delay = Normal::new(mean, std_dev)
        .map_err(|e| ScenarioError::Bad(format!("invalid obstacle delay distribution: {e}")))?;

    let candidates: Vec<Position> = world
        .map()
        .positions()
        .filter(|&p| world.get(p) == Tile::Free)
        .collect();

    for p in candidates {
        if rng.gen::<f64>() < spec.tile_probability {
            let mut o = Obstacle::new(delay);
            o.next_move = world.tick() + o.sample_delay(rng);
            world.put_obstacle(p, o);
        }
    }

    Ok(())
}
