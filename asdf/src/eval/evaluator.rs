use super::{Choice, PackedTree, TreeOp};
use crate::{
    context::{BinaryOpcode, UnaryOpcode},
    region::Region,
    types::{Grad, Interval},
};

/// Saved pruning state, restored by [`Evaluator::enable_nodes`]
#[derive(Debug)]
struct Frame {
    active: Vec<usize>,
    choices: Vec<Choice>,
    fixed: Vec<Option<f32>>,
}

/// Evaluation context for a [`PackedTree`]
///
/// The evaluator owns every piece of mutable state used during evaluation:
/// result caches for each mode, the active set (a permutation of each rank
/// level, with active nodes at the front), and the stack of pruning frames.
/// The tree itself is never modified, so any number of evaluators can share
/// one tree across threads.
///
/// Pruning is scoped: [`Evaluator::prune`] returns a [`Pruned`] guard which
/// restores the previous active set when dropped.
#[derive(Debug)]
pub struct Evaluator<'t> {
    tree: &'t PackedTree,

    /// Per-level node lists; the first `active[i]` nodes in `levels[i]` are
    /// active
    levels: Vec<Vec<usize>>,
    active: Vec<usize>,

    /// Committed choice at each min/max node
    choices: Vec<Choice>,

    /// Nodes which have been collapsed to a constant sign
    fixed: Vec<Option<f32>>,

    stack: Vec<Frame>,

    // Result caches
    f: Vec<f32>,
    iv: Vec<Interval>,
    ichoice: Vec<Choice>,
    batch: Vec<f32>,
    grad: Vec<Grad>,
    points: [Vec<f32>; 3],

    // Scratch data for pruning
    reach: Vec<bool>,
    boolean: Vec<bool>,
}

impl<'t> Evaluator<'t> {
    /// Builds a new evaluator with every node active
    pub fn new(tree: &'t PackedTree) -> Self {
        let n = tree.len();
        let levels = tree.levels().to_vec();
        let active = levels.iter().map(|l| l.len()).collect();
        Self {
            tree,
            levels,
            active,
            choices: vec![Choice::Both; n],
            fixed: vec![None; n],
            stack: vec![],
            f: vec![0.0; n],
            iv: vec![Interval::from(0.0); n],
            ichoice: vec![Choice::Both; n],
            batch: vec![],
            grad: vec![],
            points: Default::default(),
            reach: vec![false; n],
            boolean: vec![false; n],
        }
    }

    /// Returns the tree being evaluated
    pub fn tree(&self) -> &'t PackedTree {
        self.tree
    }

    /// Returns the number of active nodes
    pub fn active_count(&self) -> usize {
        self.active.iter().sum()
    }

    /// Returns the number of pruning frames currently in effect
    pub fn prune_depth(&self) -> usize {
        self.stack.len()
    }

    /// Iterates over active node slots in ascending rank order
    fn active_slots<'a>(
        levels: &'a [Vec<usize>],
        active: &'a [usize],
    ) -> impl Iterator<Item = usize> + 'a {
        levels
            .iter()
            .zip(active)
            .flat_map(|(level, n)| level[..*n].iter().copied())
    }

    /// Evaluates the tree at a single point
    pub fn eval_scalar(&mut self, x: f32, y: f32, z: f32) -> f32 {
        let xyz = [x, y, z];
        let Self {
            tree,
            levels,
            active,
            choices,
            fixed,
            f,
            ..
        } = self;
        for s in Self::active_slots(levels, active) {
            f[s] = if let Some(c) = fixed[s] {
                c
            } else {
                match tree.op(s) {
                    TreeOp::Input(v) => xyz[v.index()],
                    TreeOp::Const(c) => c,
                    TreeOp::Unary(op, a) => unary_f32(op, f[a]),
                    TreeOp::Binary(op, a, b) => match choices[s] {
                        Choice::Left => f[a],
                        Choice::Right => f[b],
                        _ => binary_f32(op, f[a], f[b]),
                    },
                }
            };
        }
        f[tree.root()]
    }

    /// Evaluates a conservative bound of the tree over a box
    ///
    /// The choice made by each min/max node is recorded, and is used by a
    /// subsequent call to [`disable_nodes`](Self::disable_nodes).
    pub fn eval_interval(
        &mut self,
        x: Interval,
        y: Interval,
        z: Interval,
    ) -> Interval {
        let xyz = [x, y, z];
        let Self {
            tree,
            levels,
            active,
            choices,
            fixed,
            iv,
            ichoice,
            ..
        } = self;
        for s in Self::active_slots(levels, active) {
            ichoice[s] = Choice::Both;
            iv[s] = if let Some(c) = fixed[s] {
                c.into()
            } else {
                match tree.op(s) {
                    TreeOp::Input(v) => xyz[v.index()],
                    TreeOp::Const(c) => c.into(),
                    TreeOp::Unary(op, a) => unary_interval(op, iv[a]),
                    TreeOp::Binary(op, a, b) => match choices[s] {
                        Choice::Left => {
                            ichoice[s] = Choice::Left;
                            iv[a]
                        }
                        Choice::Right => {
                            ichoice[s] = Choice::Right;
                            iv[b]
                        }
                        _ => match op {
                            BinaryOpcode::Min => {
                                let (v, c) = iv[a].min_choice(iv[b]);
                                ichoice[s] = c;
                                v
                            }
                            BinaryOpcode::Max => {
                                let (v, c) = iv[a].max_choice(iv[b]);
                                ichoice[s] = c;
                                v
                            }
                            op => binary_interval(op, iv[a], iv[b]),
                        },
                    },
                }
            };
        }
        iv[tree.root()]
    }

    /// Evaluates a region-wide bound, using the region's bounding box
    pub fn eval_interval_region(&mut self, r: &Region) -> Interval {
        let [x, y, z] = r.bounds();
        self.eval_interval(x, y, z)
    }

    /// Evaluates the tree at many points in a single pass
    ///
    /// # Panics
    /// If the slices have different lengths
    pub fn eval_batch(&mut self, xs: &[f32], ys: &[f32], zs: &[f32]) -> &[f32] {
        assert_eq!(xs.len(), ys.len());
        assert_eq!(xs.len(), zs.len());
        for (p, src) in self.points.iter_mut().zip([xs, ys, zs]) {
            p.clear();
            p.extend_from_slice(src);
        }
        self.run_batch()
    }

    /// Evaluates the tree at every lattice point of a region
    ///
    /// Results are ordered with Z varying fastest, then Y, then X, i.e. the
    /// point `(i, j, k)` is at index `(i * (nj + 1) + j) * (nk + 1) + k`.
    pub fn eval_region(&mut self, r: &Region) -> &[f32] {
        for p in self.points.iter_mut() {
            p.clear();
        }
        for &x in r.x {
            for &y in r.y {
                for &z in r.z {
                    self.points[0].push(x);
                    self.points[1].push(y);
                    self.points[2].push(z);
                }
            }
        }
        self.run_batch()
    }

    fn run_batch(&mut self) -> &[f32] {
        let n = self.points[0].len();
        self.batch.resize(self.tree.len() * n, 0.0);
        let Self {
            tree,
            levels,
            active,
            choices,
            fixed,
            batch,
            points,
            ..
        } = self;
        for s in Self::active_slots(levels, active) {
            let (lo, hi) = batch.split_at_mut(s * n);
            let out = &mut hi[..n];
            if let Some(c) = fixed[s] {
                out.fill(c);
                continue;
            }
            match tree.op(s) {
                TreeOp::Input(v) => out.copy_from_slice(&points[v.index()]),
                TreeOp::Const(c) => out.fill(c),
                TreeOp::Unary(op, a) => {
                    for (o, a) in out.iter_mut().zip(chunk(lo, a, n)) {
                        *o = unary_f32(op, *a);
                    }
                }
                TreeOp::Binary(op, a, b) => match choices[s] {
                    Choice::Left => out.copy_from_slice(chunk(lo, a, n)),
                    Choice::Right => out.copy_from_slice(chunk(lo, b, n)),
                    _ => {
                        let (a, b) = (chunk(lo, a, n), chunk(lo, b, n));
                        for ((o, a), b) in out.iter_mut().zip(a).zip(b) {
                            *o = binary_f32(op, *a, *b);
                        }
                    }
                },
            }
        }
        chunk(batch, tree.root(), n)
    }

    /// Evaluates values and partial derivatives at many points
    ///
    /// # Panics
    /// If the slices have different lengths
    pub fn eval_derivative(
        &mut self,
        xs: &[f32],
        ys: &[f32],
        zs: &[f32],
    ) -> &[Grad] {
        assert_eq!(xs.len(), ys.len());
        assert_eq!(xs.len(), zs.len());
        let n = xs.len();
        self.grad.resize(self.tree.len() * n, Grad::default());
        let Self {
            tree,
            levels,
            active,
            choices,
            fixed,
            grad,
            ..
        } = self;
        for s in Self::active_slots(levels, active) {
            let (lo, hi) = grad.split_at_mut(s * n);
            let out = &mut hi[..n];
            if let Some(c) = fixed[s] {
                out.fill(Grad::constant(c));
                continue;
            }
            match tree.op(s) {
                TreeOp::Input(v) => {
                    let src = [xs, ys, zs][v.index()];
                    for (o, p) in out.iter_mut().zip(src) {
                        let mut g = Grad::constant(*p);
                        match v.index() {
                            0 => g.dx = 1.0,
                            1 => g.dy = 1.0,
                            _ => g.dz = 1.0,
                        }
                        *o = g;
                    }
                }
                TreeOp::Const(c) => out.fill(Grad::constant(c)),
                TreeOp::Unary(op, a) => {
                    for (o, a) in out.iter_mut().zip(chunk(lo, a, n)) {
                        *o = unary_grad(op, *a);
                    }
                }
                TreeOp::Binary(op, a, b) => match choices[s] {
                    Choice::Left => out.copy_from_slice(chunk(lo, a, n)),
                    Choice::Right => out.copy_from_slice(chunk(lo, b, n)),
                    _ => {
                        let (a, b) = (chunk(lo, a, n), chunk(lo, b, n));
                        for ((o, a), b) in out.iter_mut().zip(a).zip(b) {
                            *o = binary_grad(op, *a, *b);
                        }
                    }
                },
            }
        }
        chunk(grad, tree.root(), n)
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Deactivates every node which can't affect the result within the box
    /// passed to the most recent [`eval_interval`](Self::eval_interval)
    ///
    /// Each call must be paired with exactly one
    /// [`enable_nodes`](Self::enable_nodes); prefer [`prune`](Self::prune),
    /// which enforces this pairing.
    pub fn disable_nodes(&mut self) {
        self.disable_inner(false)
    }

    /// Like [`disable_nodes`](Self::disable_nodes), but also collapses
    /// subtrees of known sign into constants
    ///
    /// This is only valid when the caller needs the *sign* of the result,
    /// not its value (e.g. for inside / outside classification).
    pub fn disable_nodes_binary(&mut self) {
        self.disable_inner(true)
    }

    fn disable_inner(&mut self, binary: bool) {
        self.stack.push(Frame {
            active: self.active.clone(),
            choices: self.choices.clone(),
            fixed: self.fixed.clone(),
        });
        let Self {
            tree,
            levels,
            active,
            choices,
            fixed,
            iv,
            ichoice,
            reach,
            boolean,
            ..
        } = self;

        reach.fill(false);
        let root = tree.root();
        reach[root] = true;
        boolean[root] = binary;

        // Parents have strictly higher rank than their children, so walking
        // levels in descending order visits every parent before its children.
        for (level, n) in levels.iter().zip(active.iter()).rev() {
            for &s in &level[..*n] {
                if !reach[s] || fixed[s].is_some() {
                    continue;
                }
                let i = iv[s];
                if boolean[s] && !i.has_nan() {
                    if i.upper() < 0.0 {
                        fixed[s] = Some(-1.0);
                        continue;
                    } else if i.lower() > 0.0 {
                        fixed[s] = Some(1.0);
                        continue;
                    }
                }
                let b = boolean[s];
                match tree.op(s) {
                    TreeOp::Binary(
                        BinaryOpcode::Min | BinaryOpcode::Max,
                        lhs,
                        rhs,
                    ) => {
                        choices[s] = choices[s].narrow(ichoice[s]);
                        match choices[s] {
                            Choice::Left => mark(lhs, b, reach, boolean),
                            Choice::Right => mark(rhs, b, reach, boolean),
                            _ => {
                                mark(lhs, b, reach, boolean);
                                mark(rhs, b, reach, boolean);
                            }
                        }
                    }
                    TreeOp::Binary(_, lhs, rhs) => {
                        mark(lhs, false, reach, boolean);
                        mark(rhs, false, reach, boolean);
                    }
                    TreeOp::Unary(UnaryOpcode::Neg, a) => {
                        mark(a, b, reach, boolean)
                    }
                    TreeOp::Unary(_, a) => mark(a, false, reach, boolean),
                    TreeOp::Input(..) | TreeOp::Const(..) => (),
                }
            }
        }

        // Swap unreachable nodes to the tail of each level
        for (level, n) in levels.iter_mut().zip(active.iter_mut()) {
            let mut w = 0;
            for r in 0..*n {
                if reach[level[r]] {
                    level.swap(w, r);
                    w += 1;
                }
            }
            *n = w;
        }
    }

    /// Restores the active set saved by the matching
    /// [`disable_nodes`](Self::disable_nodes) call
    ///
    /// # Panics
    /// If there is no matching call to `disable_nodes`
    pub fn enable_nodes(&mut self) {
        let Some(frame) = self.stack.pop() else {
            panic!("enable_nodes called without matching disable_nodes");
        };
        self.active = frame.active;
        self.choices = frame.choices;
        self.fixed = frame.fixed;
    }

    /// Prunes the tree based on the most recent interval evaluation,
    /// returning a guard which restores it when dropped
    pub fn prune(&mut self) -> Pruned<'_, 't> {
        self.disable_nodes();
        Pruned { eval: self }
    }

    /// Prunes the tree for sign-only queries, returning a guard which
    /// restores it when dropped
    pub fn prune_binary(&mut self) -> Pruned<'_, 't> {
        self.disable_nodes_binary();
        Pruned { eval: self }
    }

    /// Returns which of the X, Y, Z inputs can still affect the result
    pub fn active_axes(&self) -> [bool; 3] {
        let mut out = [false; 3];
        for &s in &self.levels[0][..self.active[0]] {
            if let (TreeOp::Input(v), None) = (self.tree.op(s), self.fixed[s]) {
                out[v.index()] = true;
            }
        }
        out
    }
}

fn mark(c: usize, b: bool, reach: &mut [bool], boolean: &mut [bool]) {
    if reach[c] {
        boolean[c] &= b;
    } else {
        reach[c] = true;
        boolean[c] = b;
    }
}

fn chunk<T>(buf: &[T], slot: usize, n: usize) -> &[T] {
    &buf[slot * n..(slot + 1) * n]
}

/// Scoped pruning guard
///
/// Dereferences to the underlying [`Evaluator`]; when dropped, the active set
/// from before the prune is restored.
pub struct Pruned<'e, 't> {
    eval: &'e mut Evaluator<'t>,
}

impl<'t> std::ops::Deref for Pruned<'_, 't> {
    type Target = Evaluator<'t>;
    fn deref(&self) -> &Self::Target {
        &*self.eval
    }
}

impl std::ops::DerefMut for Pruned<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.eval
    }
}

impl Drop for Pruned<'_, '_> {
    fn drop(&mut self) {
        self.eval.enable_nodes();
    }
}

////////////////////////////////////////////////////////////////////////////////

pub(crate) fn unary_f32(op: UnaryOpcode, a: f32) -> f32 {
    match op {
        UnaryOpcode::Neg => -a,
        UnaryOpcode::Abs => a.abs(),
        UnaryOpcode::Square => a * a,
        UnaryOpcode::Sqrt => a.max(0.0).sqrt(),
        UnaryOpcode::Sin => a.sin(),
        UnaryOpcode::Cos => a.cos(),
        UnaryOpcode::Tan => a.tan(),
        UnaryOpcode::Asin => a.clamp(-1.0, 1.0).asin(),
        UnaryOpcode::Acos => a.clamp(-1.0, 1.0).acos(),
        UnaryOpcode::Atan => a.atan(),
        UnaryOpcode::Exp => a.exp(),
    }
}

pub(crate) fn binary_f32(op: BinaryOpcode, a: f32, b: f32) -> f32 {
    match op {
        BinaryOpcode::Add => a + b,
        BinaryOpcode::Sub => a - b,
        BinaryOpcode::Mul => a * b,
        BinaryOpcode::Div => a / b,
        BinaryOpcode::Min => a.min(b),
        BinaryOpcode::Max => a.max(b),
        BinaryOpcode::Pow => {
            if b.fract() == 0.0 {
                a.powi(b as i32)
            } else {
                a.max(0.0).powf(b)
            }
        }
        BinaryOpcode::Atan2 => a.atan2(b),
    }
}

fn unary_interval(op: UnaryOpcode, a: Interval) -> Interval {
    match op {
        UnaryOpcode::Neg => -a,
        UnaryOpcode::Abs => a.abs(),
        UnaryOpcode::Square => a.square(),
        UnaryOpcode::Sqrt => a.sqrt(),
        UnaryOpcode::Sin => a.sin(),
        UnaryOpcode::Cos => a.cos(),
        UnaryOpcode::Tan => a.tan(),
        UnaryOpcode::Asin => a.asin(),
        UnaryOpcode::Acos => a.acos(),
        UnaryOpcode::Atan => a.atan(),
        UnaryOpcode::Exp => a.exp(),
    }
}

fn binary_interval(op: BinaryOpcode, a: Interval, b: Interval) -> Interval {
    match op {
        BinaryOpcode::Add => a + b,
        BinaryOpcode::Sub => a - b,
        BinaryOpcode::Mul => a * b,
        BinaryOpcode::Div => a / b,
        BinaryOpcode::Min => a.min_choice(b).0,
        BinaryOpcode::Max => a.max_choice(b).0,
        BinaryOpcode::Pow => a.pow(b),
        BinaryOpcode::Atan2 => a.atan2(b),
    }
}

fn unary_grad(op: UnaryOpcode, a: Grad) -> Grad {
    match op {
        UnaryOpcode::Neg => -a,
        UnaryOpcode::Abs => a.abs(),
        UnaryOpcode::Square => a.square(),
        UnaryOpcode::Sqrt => a.sqrt(),
        UnaryOpcode::Sin => a.sin(),
        UnaryOpcode::Cos => a.cos(),
        UnaryOpcode::Tan => a.tan(),
        UnaryOpcode::Asin => a.asin(),
        UnaryOpcode::Acos => a.acos(),
        UnaryOpcode::Atan => a.atan(),
        UnaryOpcode::Exp => a.exp(),
    }
}

fn binary_grad(op: BinaryOpcode, a: Grad, b: Grad) -> Grad {
    match op {
        BinaryOpcode::Add => a + b,
        BinaryOpcode::Sub => a - b,
        BinaryOpcode::Mul => a * b,
        BinaryOpcode::Div => a / b,
        BinaryOpcode::Min => a.min(b),
        BinaryOpcode::Max => a.max(b),
        BinaryOpcode::Pow => a.pow(b),
        BinaryOpcode::Atan2 => a.atan2(b),
    }
}
