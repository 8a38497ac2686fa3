use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete simulation time.
pub type Tick = u32;

pub type AgentId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Position { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// The four grid moves, with canonical ordinals 0..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North = 0,
    East = 1,
    South = 2,
    West = 3,
}

pub const ALL_DIRECTIONS: [Direction; 4] = [
    Direction::North,
    Direction::East,
    Direction::South,
    Direction::West,
];

impl Direction {
    pub fn from_ordinal(ordinal: u32) -> Self {
        ALL_DIRECTIONS[ordinal as usize % 4]
    }

    pub fn inverse(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }
}

pub fn translate(p: Position, d: Direction) -> Position {
    match d {
        Direction::North => Position::new(p.x, p.y - 1),
        Direction::East => Position::new(p.x + 1, p.y),
        Direction::South => Position::new(p.x, p.y + 1),
        Direction::West => Position::new(p.x - 1, p.y),
    }
}

/// Direction of the single-cell move `from -> to`. The two positions must be
/// edge-adjacent.
pub fn direction_to(from: Position, to: Position) -> Direction {
    match (to.x - from.x, to.y - from.y) {
        (0, -1) => Direction::North,
        (1, 0) => Direction::East,
        (0, 1) => Direction::South,
        (-1, 0) => Direction::West,
        _ => panic!("direction_to: {from} and {to} are not neighbours"),
    }
}

pub fn neighbours(a: Position, b: Position) -> bool {
    manhattan(a, b) == 1
}

pub fn manhattan(a: Position, b: Position) -> u32 {
    a.x.abs_diff(b.x) + a.y.abs_diff(b.y)
}

/// A cell at a point in time; the key type of space-time reservation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionTime {
    pub x: i32,
    pub y: i32,
    pub time: Tick,
}

impl PositionTime {
    pub fn new(p: Position, time: Tick) -> Self {
        PositionTime {
            x: p.x,
            y: p.y,
            time,
        }
    }

    pub fn position(self) -> Position {
        Position::new(self.x, self.y)
    }
}

impl fmt::Display for PositionTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}] @ {}", self.x, self.y, self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub target: Position,
}
