use super::{Asdf, Cell, CellIndex, CellState, split_mask};
use log::debug;

/// Maximum error when merging two `Leaf` cells
///
/// This is an absolute distance, in world units, between the original
/// samples on the shared face and the merged cell's interpolation there.
pub const MERGE_EPSILON: f32 = 1e-3;

impl Asdf {
    /// Merges sibling cells wherever that doesn't lose information
    ///
    /// Siblings are merged pairwise along one axis at a time, largest extent
    /// first:
    /// - `Filled` + `Filled` and `Empty` + `Empty` always merge
    /// - `Branch` + `Branch` merge if they are split along the same axes (not
    ///   including the merge axis); the merged cell adopts all of their
    ///   children
    /// - `Leaf` + `Leaf` merge if `merge_leaves` is set and trilinear
    ///   interpolation over the merged cell reproduces the samples on the
    ///   shared face within [`MERGE_EPSILON`], with no change in sign
    ///
    /// A branch which is left with a single child adopts it.
    ///
    /// Runs to a fixed point and returns the number of changes; running it
    /// again on the result returns 0. Orphaned cells are dropped from the
    /// arena if anything changed.
    pub fn simplify(&mut self, merge_leaves: bool) -> usize {
        let mut total = 0;
        loop {
            let mut changes = 0;
            let branches: Vec<_> = self
                .reachable()
                .into_iter()
                .filter(|i| self.cell(*i).is_branch())
                .collect();
            // Children before parents
            for i in branches.into_iter().rev() {
                changes += self.simplify_cell(i, merge_leaves);
            }
            if changes == 0 {
                break;
            }
            total += changes;
        }
        if total > 0 {
            let removed = self.compact();
            debug!("simplify: {total} changes, {removed} cells removed");
        }
        total
    }

    /// Simplifies a single branch, assuming its children are already simple
    pub(crate) fn simplify_cell(
        &mut self,
        i: CellIndex,
        merge_leaves: bool,
    ) -> usize {
        let mut changes = 0;
        loop {
            let cell = self.cell(i);
            let CellState::Branch(children) = cell.state else {
                return changes;
            };
            let mask = split_mask(&children);
            let mut axes: Vec<usize> =
                (0..3).filter(|a| mask & (4 >> a) != 0).collect();
            axes.sort_by_key(|a| std::cmp::Reverse(cell.extent(*a)));

            let merged = axes
                .into_iter()
                .any(|a| self.try_merge(i, a, merge_leaves));
            if merged {
                changes += 1;
            } else {
                break;
            }
        }

        if let CellState::Branch(children) = self.cell(i).state {
            let mut iter = children.iter().flatten();
            if let (Some(only), None) = (iter.next(), iter.next()) {
                let child = self.cell(*only).clone();
                let c = self.cell_mut(i);
                c.state = child.state;
                c.d = child.d;
                changes += 1;
            }
        }
        changes
    }

    /// Attempts to merge every pair of children along the given axis
    fn try_merge(&mut self, i: CellIndex, axis: usize, merge_leaves: bool) -> bool {
        let CellState::Branch(children) = self.cell(i).state else {
            return false;
        };
        let bit = 4 >> axis;
        let pairs: Vec<(usize, CellIndex, CellIndex)> = (0..8)
            .filter(|c| c & bit == 0)
            .filter_map(|c| Some((c, children[c]?, children[c | bit]?)))
            .collect();
        if pairs.is_empty()
            || !pairs
                .iter()
                .all(|(_, lo, hi)| self.can_merge(*lo, *hi, axis, merge_leaves))
        {
            return false;
        }

        let mut out = children;
        for (c, lo, hi) in pairs {
            out[c] = Some(self.merge(lo, hi, axis, merge_leaves));
            out[c | bit] = None;
        }
        self.cell_mut(i).state = CellState::Branch(out);
        true
    }

    fn can_merge(
        &self,
        lo: CellIndex,
        hi: CellIndex,
        axis: usize,
        merge_leaves: bool,
    ) -> bool {
        let (a, b) = (self.cell(lo), self.cell(hi));
        match (&a.state, &b.state) {
            (CellState::Filled, CellState::Filled)
            | (CellState::Empty, CellState::Empty) => true,
            (CellState::Branch(x), CellState::Branch(y)) => {
                let m = split_mask(x);
                m == split_mask(y) && m & (4 >> axis) == 0
            }
            (CellState::Leaf, CellState::Leaf) => {
                merge_leaves && leaves_mergeable(a, b, axis)
            }
            _ => false,
        }
    }

    /// Merges two cells along an axis, returning the new cell
    fn merge(
        &mut self,
        lo: CellIndex,
        hi: CellIndex,
        axis: usize,
        merge_leaves: bool,
    ) -> CellIndex {
        let (a, b) = (self.cell(lo).clone(), self.cell(hi).clone());
        let bit = 4 >> axis;
        let mut index = a.index;
        index[axis][1] = b.index[axis][1];
        let mut cell = Cell::new(index, self.lattice());
        cell.d = merged_corners(&a, &b, axis);
        cell.state = match (a.state, b.state) {
            (CellState::Branch(x), CellState::Branch(y)) => {
                let mut children = x;
                for (c, child) in y.iter().enumerate() {
                    if child.is_some() {
                        children[c | bit] = *child;
                    }
                }
                CellState::Branch(children)
            }
            (s, _) => {
                if s == CellState::Leaf {
                    CellState::from_samples(&cell.d)
                } else {
                    s
                }
            }
        };
        let out = self.push(cell);
        self.simplify_cell(out, merge_leaves);
        out
    }
}

/// Corner samples of the cell formed by merging `a` (below) and `b` (above)
fn merged_corners(a: &Cell, b: &Cell, axis: usize) -> [f32; 8] {
    let bit = 4 >> axis;
    std::array::from_fn(|c| if c & bit == 0 { a.d[c] } else { b.d[c] })
}

/// Checks whether two `Leaf` cells can be replaced by their union
fn leaves_mergeable(a: &Cell, b: &Cell, axis: usize) -> bool {
    let bit = 4 >> axis;
    let d = merged_corners(a, b, axis);
    let lo = a.bounds[axis].lower();
    let width = b.bounds[axis].upper() - lo;
    let t = (a.bounds[axis].upper() - lo) / width;
    (0..8).filter(|c| c & bit != 0).all(|c| {
        let interp = d[c ^ bit] * (1.0 - t) + d[c] * t;
        let actual = a.d[c];
        (interp - actual).abs() < MERGE_EPSILON
            && (interp < 0.0) == (actual < 0.0)
            && b.d[c ^ bit] == actual
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        asdf::{Settings, build_asdf},
        context::Context,
        eval::PackedTree,
        region::Lattice,
        types::Interval,
    };
    use std::sync::atomic::AtomicBool;

    fn build(
        ctx: &Context,
        root: crate::context::Node,
        n: usize,
        merge_leaves: bool,
    ) -> Asdf {
        let tree = PackedTree::new(ctx, root).unwrap();
        let b = Interval::new(-1.0, 1.0);
        let lattice = Lattice::new([b, b, b], [n, n, n]).unwrap();
        let settings = Settings {
            merge_leaves,
            ..Default::default()
        };
        build_asdf(&tree, &lattice, &settings, &AtomicBool::new(false)).unwrap()
    }

    #[test]
    fn test_plane_merges_leaves() {
        // A plane is exactly reproduced by trilinear interpolation, so leaves
        // along it can be merged
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let y = ctx.mul(y, 0.01).unwrap();
        let root = ctx.add(x, y).unwrap();
        let root = ctx.sub(root, 0.3).unwrap();

        let merged = build(&ctx, root, 16, true);
        let unmerged = build(&ctx, root, 16, false);
        assert!(merged.stats().leaf < unmerged.stats().leaf);
        assert!((merged.volume() - unmerged.volume()).abs() < 1e-3);
    }

    #[test]
    fn test_uniform_collapses() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let root = ctx.add(x, 10.0).unwrap();
        let asdf = build(&ctx, root, 16, true);
        assert_eq!(asdf.stats().total(), 1);
        assert_eq!(asdf.cell(asdf.root()).state, CellState::Empty);
    }

    #[test]
    fn test_simplify_idempotent() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let s = ctx.sqrt(s).unwrap();
        let root = ctx.sub(s, 0.6).unwrap();
        for merge_leaves in [false, true] {
            let mut asdf = build(&ctx, root, 32, merge_leaves);
            let before = asdf.stats();
            assert_eq!(asdf.simplify(merge_leaves), 0);
            assert_eq!(asdf.stats(), before);
        }
    }

    #[test]
    fn test_leaf_merge_rules() {
        let lattice = {
            let b = Interval::new(0.0, 2.0);
            Lattice::new([b, b, b], [2, 2, 2]).unwrap()
        };
        let leaf = |x: [u32; 2], f: &dyn Fn([f32; 3]) -> f32| {
            let mut c = Cell::new([x, [0, 2], [0, 2]], &lattice);
            c.d = std::array::from_fn(|i| f(c.corner_pos(i)));
            c.state = CellState::from_samples(&c.d);
            c
        };
        let plane = |p: [f32; 3]| p[1] - 1.0;
        let a = leaf([0, 1], &plane);
        let b = leaf([1, 2], &plane);
        assert!(leaves_mergeable(&a, &b, 0));

        // A bump in the middle can't be represented by the merged cell
        let bump = |p: [f32; 3]| p[1] - 1.0 + (1.0 - (p[0] - 1.0).abs()) * 0.5;
        let a = leaf([0, 1], &bump);
        let b = leaf([1, 2], &bump);
        assert!(!leaves_mergeable(&a, &b, 0));
    }
}
