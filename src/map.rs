use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use crate::common::Position;

/// What occupies a cell. Maps only ever store `Free` and `Wall`; the other
/// two are produced by world lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tile {
    Free,
    Wall,
    Obstacle,
    Agent,
}

pub fn traversable(t: Tile) -> bool {
    t == Tile::Free
}

#[derive(Error, Debug)]
pub enum MapFormatError {
    #[error("bad map file format: {0}")]
    Bad(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Immutable rectangular grid of permanent tiles.
#[derive(Debug, Clone)]
pub struct Map {
    width: i32,
    height: i32,
    tiles: Vec<Tile>,
}

fn char_to_tile(c: char) -> Option<Tile> {
    match c {
        '.' | 'G' => Some(Tile::Free),
        '@' | 'O' | 'T' | 'S' | 'W' => Some(Tile::Wall),
        _ => None,
    }
}

fn expect_directive(line: Option<Result<String, std::io::Error>>, word: &str) -> Result<u32, MapFormatError> {
    let line = line.ok_or_else(|| MapFormatError::Bad(format!("expected {word}")))??;
    let mut parts = line.split_whitespace();
    if parts.next() != Some(word) {
        return Err(MapFormatError::Bad(format!("expected {word}")));
    }
    parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| MapFormatError::Bad(format!("expected {word} value")))
}

impl Map {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MapFormatError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Parses the `type octile` map format: a fixed header followed by
    /// `height * width` tile characters. Line breaks within the payload are
    /// ignored.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, MapFormatError> {
        let mut lines = reader.lines();

        match lines.next() {
            Some(Ok(line)) if line.trim_end() == "type octile" => {}
            _ => return Err(MapFormatError::Bad("expected 'type octile'".to_owned())),
        }
        let height = expect_directive(lines.next(), "height")? as i32;
        let width = expect_directive(lines.next(), "width")? as i32;
        match lines.next() {
            Some(Ok(line)) if line.trim_end() == "map" => {}
            _ => return Err(MapFormatError::Bad("expected 'map'".to_owned())),
        }

        let max = (width as usize) * (height as usize);
        let mut tiles = Vec::with_capacity(max);
        for line in lines {
            for c in line?.chars() {
                let tile = char_to_tile(c)
                    .ok_or_else(|| MapFormatError::Bad(format!("not a valid tile character: {c}")))?;
                if tiles.len() >= max {
                    return Err(MapFormatError::Bad("too many tiles".to_owned()));
                }
                tiles.push(tile);
            }
        }

        if tiles.len() < max {
            return Err(MapFormatError::Bad("too few tiles".to_owned()));
        }

        Ok(Map {
            width,
            height,
            tiles,
        })
    }

    /// An all-free map, used by obstacle seeding tests and programmatic
    /// scenario construction.
    pub fn open(width: i32, height: i32) -> Self {
        Map {
            width,
            height,
            tiles: vec![Tile::Free; (width as usize) * (height as usize)],
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn get(&self, p: Position) -> Tile {
        assert!(self.in_bounds(p), "map lookup out of bounds: {p}");
        self.tiles[(p.y * self.width + p.x) as usize]
    }

    pub fn in_bounds(&self, p: Position) -> bool {
        p.x >= 0 && p.y >= 0 && p.x < self.width && p.y < self.height
    }

    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.height).flat_map(move |y| (0..self.width).map(move |x| Position::new(x, y)))
    }
}

/// Parses a map from an in-memory string; test and fixture helper.
pub fn parse_map(text: &str) -> Result<Map, MapFormatError> {
    Map::from_reader(BufReader::new(text.as_bytes()))
}
