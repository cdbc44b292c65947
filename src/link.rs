//! Block neighborhoods.
//!
//! A [`Link`] is the ordered list of a block's neighbors as `(gid, rank)`
//! records. Regular decompositions annotate every neighbor with its core and
//! ghosted bounds, the direction it lies in, and a wrap vector that is
//! non-zero along axes where the neighbor was reached across a periodic
//! boundary. The three flavors form a closed sum type so links can be cloned,
//! compared and persisted without dynamic dispatch.

use crate::assigner::Assigner;
use crate::block_error::BlockError;
use crate::serialization::MemoryBuffer;
use crate::types::{BlockID, Direction, Gid};
use num_traits::{Num, NumCast};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Scalar type of a regular grid axis.
pub trait Coordinate:
    Copy + PartialOrd + Num + NumCast + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Discrete grids share boundary vertices differently from continuous ones.
    const DISCRETE: bool;
}

impl Coordinate for i64 {
    const DISCRETE: bool = true;
}

impl Coordinate for f64 {
    const DISCRETE: bool = false;
}

/// Axis-aligned box; `min` and `max` are both inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds<C> {
    pub min: Vec<C>,
    pub max: Vec<C>,
}

impl<C: Coordinate> Bounds<C> {
    /// A zero box of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            min: vec![C::zero(); dim],
            max: vec![C::zero(); dim],
        }
    }

    pub fn from_corners(min: Vec<C>, max: Vec<C>) -> Self {
        debug_assert_eq!(min.len(), max.len());
        Self { min, max }
    }

    pub fn dim(&self) -> usize {
        self.min.len()
    }

    pub fn contains(&self, point: &[C]) -> bool {
        point.len() == self.dim()
            && point
                .iter()
                .zip(self.min.iter().zip(&self.max))
                .all(|(p, (lo, hi))| lo <= p && p <= hi)
    }
}

/// Neighbor list without geometry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlainLink {
    neighbors: Vec<BlockID>,
}

impl PlainLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_neighbors(neighbors: Vec<BlockID>) -> Self {
        Self { neighbors }
    }

    pub fn add_neighbor(&mut self, id: BlockID) {
        self.neighbors.push(id);
    }
}

/// Neighbor list of a block in a regular grid decomposition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegularLink<C> {
    dim: usize,
    core: Bounds<C>,
    bounds: Bounds<C>,
    neighbors: Vec<BlockID>,
    nbr_cores: Vec<Bounds<C>>,
    nbr_bounds: Vec<Bounds<C>>,
    directions: Vec<Direction>,
    wraps: Vec<Direction>,
}

impl<C: Coordinate> RegularLink<C> {
    pub fn new(dim: usize, core: Bounds<C>, bounds: Bounds<C>) -> Self {
        Self {
            dim,
            core,
            bounds,
            neighbors: Vec::new(),
            nbr_cores: Vec::new(),
            nbr_bounds: Vec::new(),
            directions: Vec::new(),
            wraps: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Exclusive sub-box owned by this block.
    pub fn core(&self) -> &Bounds<C> {
        &self.core
    }

    /// Core grown by the ghost widths.
    pub fn bounds(&self) -> &Bounds<C> {
        &self.bounds
    }

    pub fn neighbors(&self) -> &[BlockID] {
        &self.neighbors
    }

    pub fn size(&self) -> usize {
        self.neighbors.len()
    }

    pub fn add_neighbor(
        &mut self,
        id: BlockID,
        direction: Direction,
        core: Bounds<C>,
        bounds: Bounds<C>,
        wrap: Direction,
    ) {
        self.neighbors.push(id);
        self.directions.push(direction);
        self.nbr_cores.push(core);
        self.nbr_bounds.push(bounds);
        self.wraps.push(wrap);
    }

    pub fn neighbor_core(&self, i: usize) -> &Bounds<C> {
        &self.nbr_cores[i]
    }

    pub fn neighbor_bounds(&self, i: usize) -> &Bounds<C> {
        &self.nbr_bounds[i]
    }

    pub fn direction(&self, i: usize) -> &Direction {
        &self.directions[i]
    }

    pub fn wrap(&self, i: usize) -> &Direction {
        &self.wraps[i]
    }

    /// Index of the neighbor lying in `dir`.
    pub fn find_direction(&self, dir: &Direction) -> Option<usize> {
        self.directions.iter().position(|d| d == dir)
    }

    fn push_bare(&mut self, id: BlockID) {
        let dim = self.dim;
        self.add_neighbor(
            id,
            Direction::zeros(dim),
            Bounds::new(dim),
            Bounds::new(dim),
            Direction::zeros(dim),
        );
    }
}

/// A block's neighborhood.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Link {
    Plain(PlainLink),
    Discrete(RegularLink<i64>),
    Continuous(RegularLink<f64>),
}

impl Default for Link {
    fn default() -> Self {
        Link::Plain(PlainLink::default())
    }
}

impl From<PlainLink> for Link {
    fn from(l: PlainLink) -> Self {
        Link::Plain(l)
    }
}

impl From<RegularLink<i64>> for Link {
    fn from(l: RegularLink<i64>) -> Self {
        Link::Discrete(l)
    }
}

impl From<RegularLink<f64>> for Link {
    fn from(l: RegularLink<f64>) -> Self {
        Link::Continuous(l)
    }
}

impl Link {
    pub fn neighbors(&self) -> &[BlockID] {
        match self {
            Link::Plain(l) => &l.neighbors,
            Link::Discrete(l) => &l.neighbors,
            Link::Continuous(l) => &l.neighbors,
        }
    }

    fn neighbors_mut(&mut self) -> &mut [BlockID] {
        match self {
            Link::Plain(l) => &mut l.neighbors,
            Link::Discrete(l) => &mut l.neighbors,
            Link::Continuous(l) => &mut l.neighbors,
        }
    }

    /// Number of neighbor records (a gid reached through two wraps counts twice).
    pub fn size(&self) -> usize {
        self.neighbors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors().is_empty()
    }

    /// Number of distinct neighbor gids.
    pub fn size_unique(&self) -> usize {
        self.neighbors()
            .iter()
            .map(|n| n.gid)
            .collect::<BTreeSet<Gid>>()
            .len()
    }

    /// Distinct neighbor records in first-seen order.
    pub fn unique_targets(&self) -> Vec<BlockID> {
        let mut seen = BTreeSet::new();
        self.neighbors()
            .iter()
            .filter(|n| seen.insert(n.gid))
            .copied()
            .collect()
    }

    pub fn target(&self, i: usize) -> BlockID {
        self.neighbors()[i]
    }

    /// Index of the first neighbor record with this gid.
    pub fn find(&self, gid: Gid) -> Option<usize> {
        self.neighbors().iter().position(|n| n.gid == gid)
    }

    /// Append a neighbor. Regular links record it with an empty geometry.
    pub fn add_neighbor(&mut self, id: BlockID) {
        match self {
            Link::Plain(l) => l.add_neighbor(id),
            Link::Discrete(l) => l.push_bare(id),
            Link::Continuous(l) => l.push_bare(id),
        }
    }

    /// Refresh every neighbor's rank from `assigner`.
    pub fn fix(&mut self, assigner: &dyn Assigner) {
        for n in self.neighbors_mut() {
            n.proc = assigner.rank(n.gid);
        }
    }

    /// Grid dimension for regular links.
    pub fn dim(&self) -> Option<usize> {
        match self {
            Link::Plain(_) => None,
            Link::Discrete(l) => Some(l.dim()),
            Link::Continuous(l) => Some(l.dim()),
        }
    }

    pub fn direction(&self, i: usize) -> Option<&Direction> {
        match self {
            Link::Plain(_) => None,
            Link::Discrete(l) => l.directions.get(i),
            Link::Continuous(l) => l.directions.get(i),
        }
    }

    pub fn wrap(&self, i: usize) -> Option<&Direction> {
        match self {
            Link::Plain(_) => None,
            Link::Discrete(l) => l.wraps.get(i),
            Link::Continuous(l) => l.wraps.get(i),
        }
    }

    pub fn find_direction(&self, dir: &Direction) -> Option<usize> {
        match self {
            Link::Plain(_) => None,
            Link::Discrete(l) => l.find_direction(dir),
            Link::Continuous(l) => l.find_direction(dir),
        }
    }

    pub fn as_discrete(&self) -> Option<&RegularLink<i64>> {
        match self {
            Link::Discrete(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_continuous(&self) -> Option<&RegularLink<f64>> {
        match self {
            Link::Continuous(l) => Some(l),
            _ => None,
        }
    }

    /// Append the tagged encoding of this link.
    pub fn save(&self, buf: &mut MemoryBuffer) -> Result<(), BlockError> {
        buf.save(self)
    }

    pub fn load(buf: &mut MemoryBuffer) -> Result<Self, BlockError> {
        buf.load()
    }
}
