//! Adaptive signed-distance fields
//!
//! An [`Asdf`] is an octree of [`Cell`]s, stored in a flat arena and
//! addressed by [`CellIndex`]. Every cell covers a box of voxels from a
//! [`Lattice`], tracked as a range of lattice indices on each axis, and
//! stores the field value at its eight corners.
//!
//! Cells may be split along any subset of the three axes, so the tree is not
//! necessarily a regular octree; children are indexed by octant bits
//! (bit 2 = +X, bit 1 = +Y, bit 0 = +Z), and a branch only holds children for
//! the octants which exist.
//!
//! The usual lifecycle is [`build_asdf`], then [`repair`] (which runs
//! [`make_consistent`] to a fixed point) before meshing.
use crate::{
    context::indexed::{IndexVec, define_index},
    region::Lattice,
    types::Interval,
};
use std::collections::HashMap;

mod build;
mod io;
mod neighbors;
mod simplify;

pub use build::{Settings, build_asdf};
pub use io::Encoding;
pub use neighbors::{
    Neighbor, VirtualCell, edge_crossings, edge_inconsistency, get_neighbor_v,
    inconsistency, make_consistent, repair,
};
pub(crate) use neighbors::same_face;

define_index!(CellIndex, "Index of a cell in an [`Asdf`] arena");

/// Cached field values, keyed by lattice index
///
/// Adjacent cells look up shared corners here, so they always agree on the
/// value at a given lattice point.
pub type CornerCache = HashMap<[u32; 3], f32>;

/// An edge between two lattice points, as a sorted pair of lattice indexes
pub type EdgeKey = ([u32; 3], [u32; 3]);

/// Builds the key for the edge between two lattice points
pub(crate) fn edge_key(a: [u32; 3], b: [u32; 3]) -> EdgeKey {
    if a < b { (a, b) } else { (b, a) }
}

/// One of the six faces of a cell
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Face {
    /// Axis normal to this face (0 = X, 1 = Y, 2 = Z)
    pub axis: usize,
    /// Whether this is the face on the positive side
    pub upper: bool,
}

impl Face {
    /// Iterates over all six faces, in [`Face::index`] order
    pub fn all() -> impl Iterator<Item = Face> {
        (0..6).map(Face::from_index)
    }

    /// Builds a face from an index in the `0..6` range
    pub fn from_index(i: usize) -> Self {
        Face {
            axis: i / 2,
            upper: i % 2 == 1,
        }
    }

    /// Returns an index in the `0..6` range
    pub fn index(&self) -> usize {
        self.axis * 2 + self.upper as usize
    }

    /// Returns the face on the opposite side of the cell
    pub fn opposite(&self) -> Self {
        Face {
            axis: self.axis,
            upper: !self.upper,
        }
    }

    /// Returns the octant bit for this face's axis
    pub fn bit(&self) -> usize {
        4 >> self.axis
    }

    /// Returns the two in-plane axes, forming a right-handed frame with the
    /// face axis
    pub fn plane_axes(&self) -> (usize, usize) {
        ((self.axis + 1) % 3, (self.axis + 2) % 3)
    }

    /// Returns the corners on this face, counter-clockwise when viewed from
    /// outside the cell
    pub fn corners(&self) -> [usize; 4] {
        let (u, v) = self.plane_axes();
        let (bu, bv) = (4 >> u, 4 >> v);
        if self.upper {
            let a = self.bit();
            [a, a | bu, a | bu | bv, a | bv]
        } else {
            [0, bv, bu | bv, bu]
        }
    }
}

/// State of a single cell
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellState {
    /// Every sample is negative (inside the shape)
    Filled,
    /// Every sample is non-negative (outside the shape)
    Empty,
    /// Corner samples have mixed signs
    Leaf,
    /// The cell is subdivided; missing octants are `None`
    Branch([Option<CellIndex>; 8]),
}

impl CellState {
    /// Classifies a non-branch cell from its corner samples
    pub fn from_samples(d: &[f32; 8]) -> Self {
        if d.iter().all(|v| *v < 0.0) {
            CellState::Filled
        } else if d.iter().all(|v| *v >= 0.0) {
            CellState::Empty
        } else {
            CellState::Leaf
        }
    }
}

/// Returns the octant bits along which a set of children is split
pub(crate) fn split_mask(children: &[Option<CellIndex>; 8]) -> usize {
    children
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_some())
        .fold(0, |m, (i, _)| m | i)
}

/// A single cell in an [`Asdf`]
#[derive(Clone, Debug)]
pub struct Cell {
    /// Lattice index range on each axis, as `[lo, hi]`
    pub index: [[u32; 2]; 3],
    /// World-space bounds
    pub bounds: [Interval; 3],
    /// Corner samples, indexed by octant bits
    pub d: [f32; 8],
    pub state: CellState,
}

impl Cell {
    pub(crate) fn new(index: [[u32; 2]; 3], lattice: &Lattice) -> Self {
        let bounds = std::array::from_fn(|a| {
            let axis = lattice.axis(a);
            Interval::new(
                axis[index[a][0] as usize],
                axis[index[a][1] as usize],
            )
        });
        Cell {
            index,
            bounds,
            d: [0.0; 8],
            state: CellState::Empty,
        }
    }

    /// Checks whether this cell has children
    pub fn is_branch(&self) -> bool {
        matches!(self.state, CellState::Branch(..))
    }

    /// Returns the number of voxels spanned along the given axis
    pub fn extent(&self, axis: usize) -> u32 {
        self.index[axis][1] - self.index[axis][0]
    }

    /// Returns the number of voxels spanned by this cell
    pub fn voxels(&self) -> u64 {
        (0..3).map(|a| self.extent(a) as u64).product()
    }

    /// Returns the lattice index of the given corner
    pub fn corner_index(&self, corner: usize) -> [u32; 3] {
        std::array::from_fn(|a| {
            let side = (corner & (4 >> a) != 0) as usize;
            self.index[a][side]
        })
    }

    /// Returns the world-space position of the given corner
    pub fn corner_pos(&self, corner: usize) -> [f32; 3] {
        std::array::from_fn(|a| {
            if corner & (4 >> a) != 0 {
                self.bounds[a].upper()
            } else {
                self.bounds[a].lower()
            }
        })
    }

    /// Returns the world-space volume of this cell
    pub fn volume(&self) -> f32 {
        self.bounds.iter().map(|b| b.width()).product()
    }

    /// Returns fractional coordinates of a point within the cell, clamped to
    /// the `[0, 1]` range
    fn frac(&self, p: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|a| {
            let b = self.bounds[a];
            ((p[a] - b.lower()) / b.width()).clamp(0.0, 1.0)
        })
    }

    /// Evaluates the trilinear interpolation of corner samples at a point
    pub fn interpolate(&self, p: [f32; 3]) -> f32 {
        let f = self.frac(p);
        (0..8)
            .map(|c| {
                let w: f32 = (0..3)
                    .map(|a| if c & (4 >> a) != 0 { f[a] } else { 1.0 - f[a] })
                    .product();
                w * self.d[c]
            })
            .sum()
    }

    /// Returns the gradient of the trilinear interpolation at a point
    pub fn gradient(&self, p: [f32; 3]) -> nalgebra::Vector3<f32> {
        let f = self.frac(p);
        let mut out = nalgebra::Vector3::zeros();
        for axis in 0..3 {
            let mut g = 0.0;
            for c in 0..8 {
                let mut w = if c & (4 >> axis) != 0 { 1.0 } else { -1.0 };
                for a in (0..3).filter(|a| *a != axis) {
                    w *= if c & (4 >> a) != 0 { f[a] } else { 1.0 - f[a] };
                }
                g += w * self.d[c];
            }
            out[axis] = g / self.bounds[axis].width();
        }
        out
    }

    /// Checks whether the point is within the cell's bounds (inclusive)
    pub fn contains(&self, p: [f32; 3]) -> bool {
        (0..3).all(|a| self.bounds[a].contains(p[a]))
    }
}

/// Statistics about an [`Asdf`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub filled: usize,
    pub empty: usize,
    pub leaf: usize,
    pub branch: usize,
    /// Depth of the deepest cell (the root has depth 0)
    pub max_depth: usize,
}

impl Stats {
    /// Total number of reachable cells
    pub fn total(&self) -> usize {
        self.filled + self.empty + self.leaf + self.branch
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cells ({} filled, {} empty, {} leaf, {} branch), depth {}",
            self.total(),
            self.filled,
            self.empty,
            self.leaf,
            self.branch,
            self.max_depth
        )
    }
}

/// An adaptively-sampled signed-distance field
#[derive(Clone, Debug)]
pub struct Asdf {
    cells: IndexVec<Cell, CellIndex>,
    root: CellIndex,
    lattice: Lattice,
}

impl Asdf {
    /// Builds an empty tree, with a root cell that covers the entire lattice
    pub(crate) fn new(lattice: Lattice) -> Self {
        let res = lattice.resolution();
        let index = std::array::from_fn(|a| [0, res[a] as u32]);
        let mut cells = IndexVec::new();
        let root = cells.push(Cell::new(index, &lattice));
        Self {
            cells,
            root,
            lattice,
        }
    }

    /// Returns the root cell index
    pub fn root(&self) -> CellIndex {
        self.root
    }

    /// Returns the underlying sampling lattice
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    /// Returns the world-space bounds of the field
    pub fn bounds(&self) -> [Interval; 3] {
        self.cells[self.root].bounds
    }

    /// Returns the number of cells in the arena
    ///
    /// This may include orphaned cells; see [`Asdf::compact`].
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Checks whether the arena is empty (which is never true)
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Looks up a cell by index
    pub fn cell(&self, i: CellIndex) -> &Cell {
        &self.cells[i]
    }

    pub(crate) fn cell_mut(&mut self, i: CellIndex) -> &mut Cell {
        &mut self.cells[i]
    }

    pub(crate) fn push(&mut self, cell: Cell) -> CellIndex {
        self.cells.push(cell)
    }

    pub(crate) fn set_root(&mut self, root: CellIndex) {
        self.root = root;
    }

    /// Returns every cell reachable from the root, in depth-first preorder
    pub fn reachable(&self) -> Vec<CellIndex> {
        let mut out = vec![];
        let mut todo = vec![self.root];
        while let Some(i) = todo.pop() {
            out.push(i);
            if let CellState::Branch(children) = &self.cells[i].state {
                todo.extend(children.iter().rev().flatten());
            }
        }
        out
    }

    /// Returns every reachable cell which is not a branch
    pub fn terminals(&self) -> Vec<CellIndex> {
        self.reachable()
            .into_iter()
            .filter(|i| !self.cells[*i].is_branch())
            .collect()
    }

    /// Computes the corner samples of a branch from its children
    pub(crate) fn d_from_children(
        &self,
        children: &[Option<CellIndex>; 8],
    ) -> [f32; 8] {
        let mask = split_mask(children);
        std::array::from_fn(|c| {
            children[c & mask]
                .map(|i| self.cells[i].d[c])
                .unwrap_or(f32::NAN)
        })
    }

    /// Finds the deepest cell containing the given point
    ///
    /// Points outside the field's bounds are clamped to the nearest boundary.
    pub fn find(&self, p: [f32; 3]) -> CellIndex {
        let p = self.clamp(p);
        let mut i = self.root;
        while let CellState::Branch(children) = &self.cells[i].state {
            match children
                .iter()
                .flatten()
                .find(|c| self.cells[**c].contains(p))
            {
                Some(c) => i = *c,
                None => break,
            }
        }
        i
    }

    fn clamp(&self, p: [f32; 3]) -> [f32; 3] {
        let b = self.bounds();
        std::array::from_fn(|a| p[a].clamp(b[a].lower(), b[a].upper()))
    }

    /// Samples the field at a point, using trilinear interpolation within the
    /// deepest cell that contains it
    pub fn sample(&self, x: f32, y: f32, z: f32) -> f32 {
        let p = self.clamp([x, y, z]);
        self.cells[self.find(p)].interpolate(p)
    }

    /// Returns the gradient of the interpolated field at a point
    pub fn gradient(&self, x: f32, y: f32, z: f32) -> nalgebra::Vector3<f32> {
        let p = self.clamp([x, y, z]);
        self.cells[self.find(p)].gradient(p)
    }

    /// Returns an approximation of the filled volume
    ///
    /// `Leaf` cells contribute in proportion to their negative corners.
    pub fn volume(&self) -> f32 {
        self.terminals()
            .into_iter()
            .map(|i| {
                let c = &self.cells[i];
                match c.state {
                    CellState::Filled => c.volume(),
                    CellState::Leaf => {
                        let n = c.d.iter().filter(|v| **v < 0.0).count();
                        c.volume() * n as f32 / 8.0
                    }
                    _ => 0.0,
                }
            })
            .sum()
    }

    /// Counts reachable cells by state
    pub fn stats(&self) -> Stats {
        let mut out = Stats::default();
        let mut todo = vec![(self.root, 0)];
        while let Some((i, depth)) = todo.pop() {
            out.max_depth = out.max_depth.max(depth);
            match &self.cells[i].state {
                CellState::Filled => out.filled += 1,
                CellState::Empty => out.empty += 1,
                CellState::Leaf => out.leaf += 1,
                CellState::Branch(children) => {
                    out.branch += 1;
                    todo.extend(children.iter().flatten().map(|c| (*c, depth + 1)));
                }
            }
        }
        out
    }

    /// Drops unreachable cells from the arena, returning how many were removed
    ///
    /// All existing [`CellIndex`] handles are invalidated.
    pub fn compact(&mut self) -> usize {
        let order = self.reachable();
        let removed = self.cells.len() - order.len();
        if removed == 0 {
            return 0;
        }
        let mut remap = HashMap::with_capacity(order.len());
        for (new, old) in order.iter().enumerate() {
            remap.insert(*old, CellIndex::from(new));
        }
        let mut cells = IndexVec::new();
        for old in &order {
            let mut c = self.cells[*old].clone();
            if let CellState::Branch(children) = &mut c.state {
                for child in children.iter_mut().flatten() {
                    *child = remap[&*child];
                }
            }
            cells.push(c);
        }
        self.cells = cells;
        self.root = CellIndex::from(0);
        removed
    }

    /// Builds a cache of every known corner sample
    pub fn corner_cache(&self) -> CornerCache {
        let mut out = CornerCache::new();
        for i in self.terminals() {
            let c = &self.cells[i];
            for corner in 0..8 {
                out.insert(c.corner_index(corner), c.d[corner]);
            }
        }
        out
    }

    /// Splits a non-branch cell in two along the given axis
    ///
    /// The split happens at the cell's midpoint lattice index. New corner
    /// samples come from `cache` when the lattice point is already known, and
    /// otherwise from trilinear interpolation of the original cell (in which
    /// case they are added to the cache).
    ///
    /// Returns `false` if the cell is a branch or cannot be split along that
    /// axis.
    pub fn split_cell(
        &mut self,
        cell: CellIndex,
        axis: usize,
        cache: &mut CornerCache,
    ) -> bool {
        let parent = self.cells[cell].clone();
        if parent.is_branch() || parent.extent(axis) < 2 {
            return false;
        }
        let [lo, hi] = parent.index[axis];
        let mid = lo + (hi - lo) / 2;
        let bit = 4 >> axis;

        let mut children = [None; 8];
        for (side, range) in [(0, [lo, mid]), (bit, [mid, hi])] {
            let mut index = parent.index;
            index[axis] = range;
            let mut child = Cell::new(index, &self.lattice);
            for corner in 0..8 {
                let key = child.corner_index(corner);
                let p = self.lattice.pos(key);
                child.d[corner] =
                    *cache.entry(key).or_insert_with(|| parent.interpolate(p));
            }
            child.state = CellState::from_samples(&child.d);
            children[side] = Some(self.cells.push(child));
        }
        self.cells[cell].state = CellState::Branch(children);
        true
    }
}
