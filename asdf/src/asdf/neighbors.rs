//! Face neighbors across depth boundaries
//!
//! Neighbors are resolved top-down: a cell's neighbor across a face is either
//! its sibling (if the parent was split along that face's axis) or found
//! within the parent's neighbor on that face. When the cells on the far side
//! are finer than the querying cell, they're gathered into a
//! [`VirtualCell`], which borrows the tree and can't outlive it.
//!
//! A coarse cell may stay next to finer cells, as long as the finer cells'
//! contours on the shared face can be stitched to its own (see
//! [`inconsistency`]) and no edge crosses the surface more than once (see
//! [`edge_inconsistency`]).
use super::{
    Asdf, Cell, CellIndex, CellState, CornerCache, EdgeKey, Face, edge_key,
    split_mask,
};
use crate::{
    Error,
    mesh::{face_edges, face_segments},
};
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum number of [`make_consistent`] passes run by [`repair`]
const MAX_REPAIR_PASSES: usize = 256;

/// The neighbor of a cell across one face
#[derive(Clone, Debug)]
pub enum Neighbor<'a> {
    /// The face is on the boundary of the field
    None,
    /// A single non-branch cell covers the entire face
    Real(CellIndex),
    /// The face is covered by several smaller cells
    Virtual(VirtualCell<'a>),
}

/// A temporary view of the finer cells on the far side of a face
#[derive(Clone, Debug)]
pub struct VirtualCell<'a> {
    asdf: &'a Asdf,
    face: Face,
    cells: Vec<CellIndex>,
}

impl<'a> VirtualCell<'a> {
    /// Returns the non-branch cells that touch the face
    pub fn cells(&self) -> &[CellIndex] {
        &self.cells
    }

    /// Returns the face (from the querying cell's side) that this view covers
    pub fn face(&self) -> Face {
        self.face
    }

    /// Iterates over the samples on the shared plane, from the far side
    pub fn plane_samples(&self) -> impl Iterator<Item = f32> + '_ {
        let opposite = self.face.opposite().corners();
        self.cells.iter().flat_map(move |c| {
            let cell = self.asdf.cell(*c);
            opposite.map(|i| cell.d[i])
        })
    }

    /// Checks whether every cell in this view lies within the given cell's
    /// face
    pub fn nested_in(&self, cell: &Cell) -> bool {
        let (u, v) = self.face.plane_axes();
        self.cells.iter().all(|n| {
            let n = self.asdf.cell(*n);
            [u, v].into_iter().all(|a| {
                n.index[a][0] >= cell.index[a][0]
                    && n.index[a][1] <= cell.index[a][1]
            })
        })
    }

    /// Iterates over the far side's marching-squares segments on the shared
    /// plane, as pairs of lattice edges
    ///
    /// Segments are reversed, so they run in the querying cell's direction.
    pub fn segments(&self) -> impl Iterator<Item = (EdgeKey, EdgeKey)> + '_ {
        let face = self.face.opposite();
        self.cells.iter().flat_map(move |c| {
            face_segments(self.asdf.cell(*c), face).map(|(a, b)| (b, a))
        })
    }

    /// Links [`segments`](Self::segments) into open chains, returning the
    /// first and last edge of each
    ///
    /// Edges are reduced to the sub-edge holding their crossing (see
    /// [`edge_crossings`]). Returns `None` if an edge doesn't have exactly
    /// one crossing, or if the segments branch or close into loops.
    pub fn chains(
        &self,
        corners: &CornerCache,
    ) -> Option<Vec<(EdgeKey, EdgeKey)>> {
        let crossing = |(a, b): EdgeKey| {
            match edge_crossings(corners, a, b)[..] {
                [k] => Some(k),
                _ => None,
            }
        };
        let mut next = HashMap::new();
        for (a, b) in self.segments() {
            if next.insert(crossing(a)?, crossing(b)?).is_some() {
                return None;
            }
        }
        let targets: HashSet<EdgeKey> = next.values().copied().collect();
        if targets.len() != next.len() {
            return None;
        }
        let mut out = vec![];
        let mut steps = 0;
        for &start in next.keys().filter(|k| !targets.contains(*k)) {
            let mut cur = start;
            while let Some(&n) = next.get(&cur) {
                cur = n;
                steps += 1;
            }
            out.push((start, cur));
        }
        (steps == next.len()).then_some(out)
    }
}

/// Finds the sign changes along the edge between two lattice points
///
/// The edge is divided at every lattice point with a sample in `corners`, so
/// a coarse cell's edge reports the same crossings as the finer cells along
/// it. Returns the sub-edges whose ends differ in sign, in order along the
/// edge.
pub fn edge_crossings(
    corners: &CornerCache,
    a: [u32; 3],
    b: [u32; 3],
) -> Vec<EdgeKey> {
    let (a, b) = edge_key(a, b);
    let Some(axis) = (0..3).find(|i| a[*i] != b[*i]) else {
        return vec![];
    };
    let mut out = vec![];
    let mut prev: Option<([u32; 3], f32)> = None;
    for t in a[axis]..=b[axis] {
        let mut p = a;
        p[axis] = t;
        let Some(&d) = corners.get(&p) else {
            continue;
        };
        if let Some((q, e)) = prev {
            if (e < 0.0) != (d < 0.0) {
                out.push((q, p));
            }
        }
        prev = Some((p, d));
    }
    out
}

/// Checks whether two lattice index ranges overlap with nonzero length
fn overlaps(a: [u32; 2], b: [u32; 2]) -> bool {
    a[0] < b[1] && b[0] < a[1]
}

/// Finds the neighbor of a child cell across a face
///
/// `parent` must be a branch and `child` the octant of the child within it;
/// `parent_neighbor` is the parent's own neighbor across the same face.
pub fn get_neighbor_v<'a>(
    asdf: &'a Asdf,
    parent: CellIndex,
    child: usize,
    face: Face,
    parent_neighbor: &Neighbor<'a>,
) -> Neighbor<'a> {
    let CellState::Branch(children) = &asdf.cell(parent).state else {
        return Neighbor::None;
    };
    let Some(me) = children[child] else {
        return Neighbor::None;
    };
    let bit = face.bit();
    let start = if split_mask(children) & bit != 0
        && (child & bit != 0) != face.upper
    {
        children[child ^ bit].into_iter().collect()
    } else {
        match parent_neighbor {
            Neighbor::None => return Neighbor::None,
            Neighbor::Real(c) => vec![*c],
            Neighbor::Virtual(v) => v.cells.clone(),
        }
    };
    resolve(asdf, me, face, start)
}

/// Descends from candidate cells to the non-branch cells touching a face
fn resolve<'a>(
    asdf: &'a Asdf,
    me: CellIndex,
    face: Face,
    mut todo: Vec<CellIndex>,
) -> Neighbor<'a> {
    let cell = asdf.cell(me);
    let plane = cell.index[face.axis][face.upper as usize];
    let (u, v) = face.plane_axes();
    let mut found = vec![];
    while let Some(i) = todo.pop() {
        let c = asdf.cell(i);
        if c.index[face.axis][!face.upper as usize] != plane
            || !overlaps(c.index[u], cell.index[u])
            || !overlaps(c.index[v], cell.index[v])
        {
            continue;
        }
        match &c.state {
            CellState::Branch(children) => todo.extend(children.iter().flatten()),
            _ => found.push(i),
        }
    }
    match found.len() {
        0 => Neighbor::None,
        1 => Neighbor::Real(found[0]),
        _ => {
            found.sort();
            Neighbor::Virtual(VirtualCell {
                asdf,
                face,
                cells: found,
            })
        }
    }
}

impl Asdf {
    /// Calls `f` on every non-branch cell, along with its six face neighbors
    /// (indexed by [`Face::index`])
    pub fn for_each_with_neighbors<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(CellIndex, &[Neighbor<'a>; 6]),
    {
        let none: [Neighbor; 6] = std::array::from_fn(|_| Neighbor::None);
        let mut todo = vec![(self.root(), none)];
        while let Some((i, neighbors)) = todo.pop() {
            match &self.cell(i).state {
                CellState::Branch(children) => {
                    for (c, child) in children.iter().enumerate() {
                        let Some(child) = child else { continue };
                        let n = std::array::from_fn(|k| {
                            get_neighbor_v(
                                self,
                                i,
                                c,
                                Face::from_index(k),
                                &neighbors[k],
                            )
                        });
                        todo.push((*child, n));
                    }
                }
                _ => f(i, &neighbors),
            }
        }
    }
}

/// Checks whether a non-branch cell disagrees with its neighbor across a face
///
/// Only faces covered by finer cells are checked, and only where the samples
/// on the shared plane change sign. The cell is consistent if the finer
/// cells' segments on the plane link into chains which enter and leave the
/// face on the same edges as the cell's own segments; the cell then borrows
/// those segments when meshing. Returns the in-plane axis along which the
/// cell should be split, or `None` if the cell is consistent.
pub fn inconsistency(
    asdf: &Asdf,
    corners: &CornerCache,
    cell: CellIndex,
    face: Face,
    neighbor: &Neighbor,
) -> Option<usize> {
    let Neighbor::Virtual(v) = neighbor else {
        return None;
    };
    let c = asdf.cell(cell);
    let mut inside = false;
    let mut outside = false;
    for s in face.corners().map(|i| c.d[i]).into_iter().chain(v.plane_samples())
    {
        if s < 0.0 {
            inside = true;
        } else {
            outside = true;
        }
    }
    if !(inside && outside) {
        return None;
    }
    if v.nested_in(c) && stitches(c, corners, face, v) {
        return None;
    }
    let finer = |axis: usize| {
        v.cells
            .iter()
            .any(|n| asdf.cell(*n).extent(axis) < c.extent(axis))
    };
    let (u, w) = face.plane_axes();
    [u, w]
        .into_iter()
        .filter(|a| c.extent(*a) >= 2 && finer(*a))
        .max_by_key(|a| (c.extent(*a), std::cmp::Reverse(*a)))
}

/// Checks that the chains on the far side of a face start and end on the
/// same face edges as the cell's own segments
fn stitches(
    cell: &Cell,
    corners: &CornerCache,
    face: Face,
    v: &VirtualCell,
) -> bool {
    let Some(chains) = v.chains(corners) else {
        return false;
    };
    let mut theirs = vec![];
    for (a, b) in chains {
        match (face_edge(cell, face, a), face_edge(cell, face, b)) {
            (Some(a), Some(b)) => theirs.push((a, b)),
            _ => return false,
        }
    }
    let mut ours = face_edges(cell, face).to_vec();
    theirs.sort();
    ours.sort();
    theirs == ours
}

/// Returns the edge of a face (numbered as in [`Face::corners`]) which
/// contains a lattice edge
fn face_edge(cell: &Cell, face: Face, (p, q): EdgeKey) -> Option<usize> {
    let cs = face.corners().map(|c| cell.corner_index(c));
    (0..4).find(|&k| {
        let (a, b) = (cs[k], cs[(k + 1) % 4]);
        [p, q].into_iter().all(|x| {
            (0..3).all(|i| (a[i].min(b[i])..=a[i].max(b[i])).contains(&x[i]))
        })
    })
}

/// Returns the twelve edges of a cell, as `(axis, lower corner, upper
/// corner)`
fn cell_edges() -> impl Iterator<Item = (usize, usize, usize)> {
    (0..3).flat_map(|axis| {
        let bit = 4 >> axis;
        (0..8)
            .filter(move |c| c & bit == 0)
            .map(move |c| (axis, c, c | bit))
    })
}

/// Checks whether any edge of a non-branch cell crosses the surface more
/// than once, counting samples from neighboring cells along the edge
///
/// Returns the axis of the first such edge.
pub fn edge_inconsistency(
    asdf: &Asdf,
    corners: &CornerCache,
    cell: CellIndex,
) -> Option<usize> {
    let c = asdf.cell(cell);
    cell_edges()
        .filter(|(axis, ..)| c.extent(*axis) >= 2)
        .find(|&(_, lo, hi)| {
            edge_crossings(corners, c.corner_index(lo), c.corner_index(hi))
                .len()
                > 1
        })
        .map(|(axis, ..)| axis)
}

/// Runs a single consistency pass, splitting every inconsistent cell once
///
/// New corner samples are drawn from (and added to) `cache`. Returns the
/// number of cells that were split; callers should repeat until this is 0,
/// or use [`repair`].
pub fn make_consistent(asdf: &mut Asdf, cache: &mut CornerCache) -> usize {
    let mut splits = vec![];
    let corners: &CornerCache = cache;
    asdf.for_each_with_neighbors(|i, neighbors| {
        let split = Face::all()
            .find_map(|f| {
                inconsistency(asdf, corners, i, f, &neighbors[f.index()])
            })
            .or_else(|| edge_inconsistency(asdf, corners, i));
        if let Some(axis) = split {
            splits.push((i, axis));
        }
    });
    for &(i, axis) in &splits {
        trace!("splitting {:?} along axis {axis}", asdf.cell(i).index);
        asdf.split_cell(i, axis, cache);
    }
    splits.len()
}

/// Runs [`make_consistent`] until no further splits are needed
///
/// Returns the total number of splits.
pub fn repair(asdf: &mut Asdf, cancel: &AtomicBool) -> Result<usize, Error> {
    let mut cache = asdf.corner_cache();
    let mut total = 0;
    for pass in 0..MAX_REPAIR_PASSES {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let n = make_consistent(asdf, &mut cache);
        if n == 0 {
            debug!("consistent after {pass} passes ({total} splits)");
            return Ok(total);
        }
        total += n;
    }
    Err(Error::Inconsistent(MAX_REPAIR_PASSES))
}

/// Checks that a cell's face corners match its neighbor's, where the
/// neighbor has an identical face
pub(crate) fn same_face(a: &Cell, b: &Cell, face: Face) -> bool {
    let (u, v) = face.plane_axes();
    a.index[u] == b.index[u] && a.index[v] == b.index[v]
}
