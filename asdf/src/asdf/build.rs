use super::{Asdf, Cell, CellIndex, CellState};
use crate::{
    Error,
    eval::{Evaluator, PackedTree},
    region::{Lattice, Region},
};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};

/// Settings when building an [`Asdf`]
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    /// Merge adjacent `Leaf` cells when the merged cell's trilinear
    /// interpolation reproduces the original samples
    pub merge_leaves: bool,

    /// Maximum recursion depth
    ///
    /// Past this depth, cells are classified from their corner samples
    /// without further subdivision.
    pub max_depth: u8,

    /// Regions with at most this many voxels are sampled in a single batch
    /// rather than by interval arithmetic
    pub min_volume: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            merge_leaves: true,
            max_depth: 24,
            min_volume: 64,
        }
    }
}

/// Builds an adaptive distance field by recursively sampling a tree
///
/// Large regions are classified with interval arithmetic and pruned before
/// subdivision; a region is only split along axes which the pruned tree
/// still depends on. Small regions are sampled in one batch, then
/// subdivided using those samples. Each new branch is simplified before
/// returning.
///
/// `cancel` is checked on entry to every recursive call; if it is set, the
/// partial tree is dropped and [`Error::Cancelled`] is returned.
pub fn build_asdf(
    tree: &PackedTree,
    lattice: &Lattice,
    settings: &Settings,
    cancel: &AtomicBool,
) -> Result<Asdf, Error> {
    let mut eval = Evaluator::new(tree);
    let mut b = Builder {
        asdf: Asdf::new(lattice.clone()),
        settings,
        cancel,
    };
    let root = b.recurse(&mut eval, lattice.region(), 0)?;
    let mut asdf = b.asdf;
    asdf.set_root(root);
    let removed = asdf.compact();
    debug!("built ASDF: {} ({removed} orphans removed)", asdf.stats());
    Ok(asdf)
}

struct Builder<'a> {
    asdf: Asdf,
    settings: &'a Settings,
    cancel: &'a AtomicBool,
}

impl Builder<'_> {
    fn recurse(
        &mut self,
        eval: &mut Evaluator,
        r: Region,
        depth: u8,
    ) -> Result<CellIndex, Error> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        if r.volume() <= self.settings.min_volume {
            let axes = eval.active_axes();
            let samples = eval.eval_region(&r).to_vec();
            return Ok(self.from_samples(&r, r, &samples, axes, depth));
        }

        let i = eval.eval_interval_region(&r);
        let d = corners(eval, &r);
        if i.upper() < 0.0 && d.iter().all(|v| *v < 0.0) {
            return Ok(self.push(&r, d, CellState::Filled));
        } else if i.lower() >= 0.0 && d.iter().all(|v| *v >= 0.0) {
            return Ok(self.push(&r, d, CellState::Empty));
        }
        if depth >= self.settings.max_depth {
            warn!("depth limit reached at {:?}", r.corner_index());
            return Ok(self.push(&r, d, CellState::from_samples(&d)));
        }

        let mut p = eval.prune();
        let active = p.active_axes();
        let size = r.size();
        let axes: [bool; 3] =
            std::array::from_fn(|a| active[a] && size[a] >= 2);
        if !axes.contains(&true) {
            // The field doesn't vary along any axis that we could split
            return Ok(self.push(&r, d, CellState::from_samples(&d)));
        }

        let mut children = [None; 8];
        for (i, sub) in r.octsect(axes).into_iter().enumerate() {
            if let Some(sub) = sub {
                children[i] = Some(self.recurse(&mut p, sub, depth + 1)?);
            }
        }
        Ok(self.push_branch(&r, children))
    }

    /// Builds a subtree from batch samples over `base`
    ///
    /// `r` must be a sub-region of `base`; it is only split along the given
    /// axes.
    fn from_samples(
        &mut self,
        base: &Region,
        r: Region,
        samples: &[f32],
        axes: [bool; 3],
        depth: u8,
    ) -> CellIndex {
        let at = |i: usize, j: usize, k: usize| {
            let i = i - base.imin;
            let j = j - base.jmin;
            let k = k - base.kmin;
            samples[(i * (base.nj() + 1) + j) * (base.nk() + 1) + k]
        };
        let size = r.size();
        let d: [f32; 8] = std::array::from_fn(|c| {
            let [i, j, k] = std::array::from_fn(|a| {
                r.corner_index()[a] + if c & (4 >> a) != 0 { size[a] } else { 0 }
            });
            at(i, j, k)
        });

        let mut inside = false;
        let mut outside = false;
        for i in r.imin..=r.imin + size[0] {
            for j in r.jmin..=r.jmin + size[1] {
                for k in r.kmin..=r.kmin + size[2] {
                    if at(i, j, k) < 0.0 {
                        inside = true;
                    } else {
                        outside = true;
                    }
                }
            }
        }
        if !(inside && outside) {
            let state = if inside {
                CellState::Filled
            } else {
                CellState::Empty
            };
            return self.push(&r, d, state);
        }

        let axes: [bool; 3] = std::array::from_fn(|a| axes[a] && size[a] >= 2);
        if !axes.contains(&true) || depth >= self.settings.max_depth {
            return self.push(&r, d, CellState::from_samples(&d));
        }
        let mut children = [None; 8];
        for (i, sub) in r.octsect(axes).into_iter().enumerate() {
            if let Some(sub) = sub {
                children[i] =
                    Some(self.from_samples(base, sub, samples, axes, depth + 1));
            }
        }
        self.push_branch(&r, children)
    }

    fn push(&mut self, r: &Region, d: [f32; 8], state: CellState) -> CellIndex {
        let mut cell = Cell::new(index_range(r), self.asdf.lattice());
        cell.d = d;
        cell.state = state;
        self.asdf.push(cell)
    }

    fn push_branch(
        &mut self,
        r: &Region,
        children: [Option<CellIndex>; 8],
    ) -> CellIndex {
        let d = self.asdf.d_from_children(&children);
        let i = self.push(r, d, CellState::Branch(children));
        self.asdf.simplify_cell(i, self.settings.merge_leaves);
        i
    }
}

/// Returns the lattice index range covered by a region
fn index_range(r: &Region) -> [[u32; 2]; 3] {
    let lo = r.corner_index();
    let size = r.size();
    std::array::from_fn(|a| [lo[a] as u32, (lo[a] + size[a]) as u32])
}

/// Samples the eight corners of a region
fn corners(eval: &mut Evaluator, r: &Region) -> [f32; 8] {
    let mut xs = [0.0; 8];
    let mut ys = [0.0; 8];
    let mut zs = [0.0; 8];
    for c in 0..8 {
        let pick = |axis: &[f32], bit: usize| {
            if c & bit != 0 { axis[axis.len() - 1] } else { axis[0] }
        };
        xs[c] = pick(r.x, 4);
        ys[c] = pick(r.y, 2);
        zs[c] = pick(r.z, 1);
    }
    let out = eval.eval_batch(&xs, &ys, &zs);
    std::array::from_fn(|i| out[i])
}
