//! Regular grid decomposition.
//!
//! A [`RegularDecomposer`] cuts an axis-aligned domain into a grid of
//! `nblocks` boxes. Block coordinates map to gids with the first axis varying
//! fastest. Every block's [`RegularLink`] lists all grid neighbors reachable
//! by an offset in `{-1, 0, 1}^dim`, wrapping across periodic axes.
//!
//! ```
//! use parablock::decomposer::RegularDecomposer;
//! use parablock::link::Bounds;
//!
//! let domain = Bounds::from_corners(vec![0i64, 0], vec![99, 99]);
//! let dec = RegularDecomposer::builder(domain, 6).build().unwrap();
//! assert_eq!(dec.divisions(), &[3, 2]);
//! ```

use crate::algs::communicator::Communicator;
use crate::assigner::Assigner;
use crate::block_error::BlockError;
use crate::link::{Bounds, Coordinate, Link, RegularLink};
use crate::master::Master;
use crate::serialization::Block;
use crate::types::{BlockID, Direction, Gid};
use itertools::Itertools;
use num_traits::{NumCast, ToPrimitive};
use std::cmp::Ordering;

/// Builder for [`RegularDecomposer`]; every per-axis vector defaults to "off".
#[derive(Clone, Debug)]
pub struct RegularDecomposerBuilder<C> {
    domain: Bounds<C>,
    nblocks: usize,
    share_face: Option<Vec<bool>>,
    wrap: Option<Vec<bool>>,
    ghosts: Option<Vec<C>>,
    divisions: Option<Vec<usize>>,
}

impl<C: Coordinate> RegularDecomposerBuilder<C> {
    /// Neighbors share their boundary vertices (discrete grids only).
    pub fn share_face(mut self, share_face: Vec<bool>) -> Self {
        self.share_face = Some(share_face);
        self
    }

    /// Periodic axes.
    pub fn wrap(mut self, wrap: Vec<bool>) -> Self {
        self.wrap = Some(wrap);
        self
    }

    /// Ghost width per axis.
    pub fn ghosts(mut self, ghosts: Vec<C>) -> Self {
        self.ghosts = Some(ghosts);
        self
    }

    /// Fixed number of divisions per axis; `0` leaves an axis unconstrained.
    pub fn divisions(mut self, divisions: Vec<usize>) -> Self {
        self.divisions = Some(divisions);
        self
    }

    pub fn build(self) -> Result<RegularDecomposer<C>, BlockError> {
        let dim = self.domain.dim();
        if dim == 0 || self.domain.max.len() != dim {
            return Err(BlockError::InvalidDecomposition(
                "domain must have matching, non-empty corners".into(),
            ));
        }
        if self.nblocks == 0 {
            return Err(BlockError::InvalidDecomposition(
                "at least one block is required".into(),
            ));
        }
        let check = |name: &str, len: Option<usize>| match len {
            Some(n) if n != dim => Err(BlockError::InvalidDecomposition(format!(
                "{name} has {n} entries for a {dim}-dimensional domain"
            ))),
            _ => Ok(()),
        };
        check("share_face", self.share_face.as_ref().map(Vec::len))?;
        check("wrap", self.wrap.as_ref().map(Vec::len))?;
        check("ghosts", self.ghosts.as_ref().map(Vec::len))?;
        check("divisions", self.divisions.as_ref().map(Vec::len))?;

        let divisions = fill_divisions(
            &self.domain,
            self.nblocks,
            &self.divisions.unwrap_or_else(|| vec![0; dim]),
        )?;
        Ok(RegularDecomposer {
            dim,
            domain: self.domain,
            nblocks: self.nblocks,
            share_face: self.share_face.unwrap_or_else(|| vec![false; dim]),
            wrap: self.wrap.unwrap_or_else(|| vec![false; dim]),
            ghosts: self.ghosts.unwrap_or_else(|| vec![C::zero(); dim]),
            divisions,
        })
    }
}

/// Regular grid of blocks over a rectangular domain.
#[derive(Clone, Debug)]
pub struct RegularDecomposer<C> {
    dim: usize,
    domain: Bounds<C>,
    nblocks: usize,
    share_face: Vec<bool>,
    wrap: Vec<bool>,
    ghosts: Vec<C>,
    divisions: Vec<usize>,
}

fn cast<C: Coordinate>(v: usize) -> C {
    <C as NumCast>::from(v).unwrap_or_else(C::zero)
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Complete `divisions` so that their product equals `nblocks`.
///
/// Prime factors of the unconstrained part are applied largest first, each to
/// the free axis whose current block extent is largest; ties go to the axis
/// with fewer divisions, then to the lower axis. Axes of zero extent are
/// never split.
pub fn fill_divisions<C: Coordinate>(
    domain: &Bounds<C>,
    nblocks: usize,
    divisions: &[usize],
) -> Result<Vec<usize>, BlockError> {
    let err = || BlockError::Factorization {
        nblocks,
        divisions: divisions.to_vec(),
    };
    let mut divs = divisions.to_vec();
    let fixed: usize = divs.iter().filter(|&&d| d != 0).product();
    let free: Vec<usize> = (0..divs.len()).filter(|&a| divs[a] == 0).collect();

    if nblocks % fixed != 0 {
        return Err(err());
    }
    if free.is_empty() {
        return if fixed == nblocks { Ok(divs) } else { Err(err()) };
    }
    for &a in &free {
        divs[a] = 1;
    }

    let pad = if C::DISCRETE { 1.0 } else { 0.0 };
    let extents: Vec<Option<f64>> = (0..divs.len())
        .map(|a| {
            let span = (domain.max[a] - domain.min[a]).to_f64().unwrap_or(0.0);
            (span > 0.0).then_some(span + pad)
        })
        .collect();

    let mut factors = prime_factors(nblocks / fixed);
    factors.sort_unstable_by(|a, b| b.cmp(a));
    for f in factors {
        let axis = free
            .iter()
            .copied()
            .filter_map(|a| extents[a].map(|e| (a, e / divs[a] as f64)))
            .max_by(|&(a, ea), &(b, eb)| {
                ea.partial_cmp(&eb)
                    .unwrap_or(Ordering::Equal)
                    .then(divs[b].cmp(&divs[a]))
                    .then(b.cmp(&a))
            })
            .map(|(a, _)| a)
            .ok_or_else(err)?;
        divs[axis] *= f;
    }
    Ok(divs)
}

impl<C: Coordinate> RegularDecomposer<C> {
    pub fn builder(domain: Bounds<C>, nblocks: usize) -> RegularDecomposerBuilder<C> {
        RegularDecomposerBuilder {
            domain,
            nblocks,
            share_face: None,
            wrap: None,
            ghosts: None,
            divisions: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn domain(&self) -> &Bounds<C> {
        &self.domain
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn divisions(&self) -> &[usize] {
        &self.divisions
    }

    pub fn wrap(&self) -> &[bool] {
        &self.wrap
    }

    /// Grid coordinates of `gid`, first axis fastest.
    pub fn gid_to_coords(&self, gid: Gid) -> Vec<usize> {
        let mut rest = gid as usize;
        self.divisions
            .iter()
            .map(|&d| {
                let c = rest % d;
                rest /= d;
                c
            })
            .collect()
    }

    pub fn coords_to_gid(&self, coords: &[usize]) -> Gid {
        coords
            .iter()
            .zip(&self.divisions)
            .rev()
            .fold(0usize, |gid, (&c, &d)| gid * d + c) as Gid
    }

    fn split(&self, axis: usize, i: usize) -> (C, C) {
        let n = self.divisions[axis];
        let min = self.domain.min[axis];
        let max = self.domain.max[axis];
        if C::DISCRETE {
            let width = (max - min + C::one()) / cast(n);
            let from = min + width * cast(i);
            let to = if i + 1 == n {
                max
            } else {
                let next = min + width * cast(i + 1);
                if self.share_face[axis] {
                    next
                } else {
                    next - C::one()
                }
            };
            (from, to)
        } else {
            let width = (max - min) / cast(n);
            let from = min + width * cast(i);
            let to = if i + 1 == n {
                max
            } else {
                min + width * cast(i + 1)
            };
            (from, to)
        }
    }

    fn core_of(&self, coords: &[usize]) -> Bounds<C> {
        let (min, max) = (0..self.dim).map(|a| self.split(a, coords[a])).unzip();
        Bounds::from_corners(min, max)
    }

    fn grow(&self, core: &Bounds<C>) -> Bounds<C> {
        let mut bounds = core.clone();
        for a in 0..self.dim {
            bounds.min[a] = core.min[a] - self.ghosts[a];
            bounds.max[a] = core.max[a] + self.ghosts[a];
            if !self.wrap[a] {
                if bounds.min[a] < self.domain.min[a] {
                    bounds.min[a] = self.domain.min[a];
                }
                if bounds.max[a] > self.domain.max[a] {
                    bounds.max[a] = self.domain.max[a];
                }
            }
        }
        bounds
    }

    /// Exclusive sub-box of `gid`.
    pub fn core(&self, gid: Gid) -> Bounds<C> {
        self.core_of(&self.gid_to_coords(gid))
    }

    /// Core of `gid` grown by the ghosts, clipped to the domain on non-periodic axes.
    pub fn bounds(&self, gid: Gid) -> Bounds<C> {
        self.grow(&self.core(gid))
    }

    /// Build the neighborhood of `gid`; neighbor ranks come from `assigner`.
    pub fn link(&self, gid: Gid, assigner: &dyn Assigner) -> RegularLink<C> {
        let coords = self.gid_to_coords(gid);
        let core = self.core_of(&coords);
        let bounds = self.grow(&core);
        let mut link = RegularLink::new(self.dim, core, bounds);

        for offset in (0..self.dim).map(|_| -1i32..=1).multi_cartesian_product() {
            if offset.iter().all(|&o| o == 0) {
                continue;
            }
            let mut nbr = Vec::with_capacity(self.dim);
            let mut wrap = vec![0i32; self.dim];
            let mut inside = true;
            for a in 0..self.dim {
                let d = self.divisions[a] as i64;
                let mut c = coords[a] as i64 + offset[a] as i64;
                if c < 0 {
                    if !self.wrap[a] {
                        inside = false;
                        break;
                    }
                    c = d - 1;
                    wrap[a] = -1;
                } else if c >= d {
                    if !self.wrap[a] {
                        inside = false;
                        break;
                    }
                    c = 0;
                    wrap[a] = 1;
                }
                nbr.push(c as usize);
            }
            if !inside {
                continue;
            }
            let nbr_gid = self.coords_to_gid(&nbr);
            let nbr_core = self.core_of(&nbr);
            let nbr_bounds = self.grow(&nbr_core);
            link.add_neighbor(
                BlockID::new(nbr_gid, assigner.rank(nbr_gid)),
                Direction(offset),
                nbr_core,
                nbr_bounds,
                Direction(wrap),
            );
        }
        link
    }

    /// The gid whose core contains `point` (points outside the domain clamp to the edge).
    pub fn point_to_gid(&self, point: &[C]) -> Gid {
        let coords: Vec<usize> = (0..self.dim)
            .map(|a| {
                let n = self.divisions[a];
                (0..n)
                    .find(|&i| point[a] <= self.split(a, i).1)
                    .unwrap_or(n - 1)
            })
            .collect();
        self.coords_to_gid(&coords)
    }

    /// Call `create(gid, core, bounds, domain, link)` for every block `assigner` gives to `rank`.
    pub fn decompose<F>(
        &self,
        rank: usize,
        assigner: &dyn Assigner,
        mut create: F,
    ) -> Result<(), BlockError>
    where
        F: FnMut(Gid, &Bounds<C>, &Bounds<C>, &Bounds<C>, RegularLink<C>) -> Result<(), BlockError>,
    {
        if assigner.nblocks() != self.nblocks {
            return Err(BlockError::InvalidDecomposition(format!(
                "assigner covers {} blocks, decomposition has {}",
                assigner.nblocks(),
                self.nblocks
            )));
        }
        for gid in assigner.local_gids(rank) {
            let link = self.link(gid, assigner);
            let core = link.core().clone();
            let bounds = link.bounds().clone();
            create(gid, &core, &bounds, &self.domain, link)?;
        }
        Ok(())
    }

    /// Populate `master` with this worker's blocks.
    pub fn decompose_into<B, Comm, F>(
        &self,
        master: &mut Master<B, Comm>,
        assigner: &dyn Assigner,
        mut create: F,
    ) -> Result<(), BlockError>
    where
        B: Block,
        Comm: Communicator,
        RegularLink<C>: Into<Link>,
        F: FnMut(Gid, &Bounds<C>, &Bounds<C>, &Bounds<C>) -> B,
    {
        let rank = master.communicator().rank();
        self.decompose(rank, assigner, |gid, core, bounds, domain, link| {
            let block = create(gid, core, bounds, domain);
            master.add(gid, block, link.into()).map(|_| ())
        })
    }
}
