mod astar;
mod reverse;

pub(crate) use astar::{Cost, Search, SearchDomain, StopFlag};
pub(crate) use reverse::ReverseSearch;

use crate::common::{translate, Position, ALL_DIRECTIONS};
use crate::map::{traversable, Map};

/// Enumerates the in-bounds, non-wall grid neighbours of `p`; dynamic
/// occupancy is the passability policies' concern.
pub(crate) fn grid_successors(map: &Map, p: Position, include_stay: bool, out: &mut Vec<Position>) {
    out.clear();
    for d in ALL_DIRECTIONS {
        let q = translate(p, d);
        if map.in_bounds(q) && traversable(map.get(q)) {
            out.push(q);
        }
    }
    if include_stay {
        out.push(p);
    }
}
