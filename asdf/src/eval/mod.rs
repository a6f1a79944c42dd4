//! Evaluation of expression graphs
//!
//! A [`PackedTree`] is an immutable, rank-ordered copy of a subgraph from a
//! [`Context`](crate::context::Context). Evaluation happens through an
//! [`Evaluator`], which owns all scratch state and offers four modes:
//!
//! - [`eval_scalar`](Evaluator::eval_scalar): a single point
//! - [`eval_interval`](Evaluator::eval_interval): a conservative bound over a
//!   box, used for culling and pruning
//! - [`eval_batch`](Evaluator::eval_batch) and
//!   [`eval_region`](Evaluator::eval_region): many points in a single pass
//! - [`eval_derivative`](Evaluator::eval_derivative): values and partial
//!   derivatives, used for surface normals
//!
//! ```rust
//! use asdf::{context::Context, eval::{Evaluator, PackedTree}};
//! use asdf::types::Interval;
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let y = ctx.add(y, 10.0).unwrap();
//! let root = ctx.min(x, y).unwrap();
//!
//! let tree = PackedTree::new(&ctx, root).unwrap();
//! let mut eval = Evaluator::new(&tree);
//! let i = Interval::new(-1.0, 1.0);
//! eval.eval_interval(i, i, i);
//! {
//!     // Within this box, `x` is always less than `y + 10`
//!     let pruned = eval.prune();
//!     assert_eq!(pruned.active_axes(), [true, false, false]);
//! }
//! assert_eq!(eval.active_axes(), [true, true, false]);
//! ```
mod choice;
mod evaluator;
mod tree;

pub use choice::Choice;
pub use evaluator::{Evaluator, Pruned};
pub use tree::{PackedTree, TreeOp};

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        context::{BinaryOpcode, Context, Node, UnaryOpcode},
        types::{Grad, Interval},
    };
    use rand::{Rng, SeedableRng};
    use strum::IntoEnumIterator;

    fn sphere(ctx: &mut Context) -> Node {
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let r = ctx.sqrt(s).unwrap();
        ctx.sub(r, 1.0).unwrap()
    }

    fn random_interval(rng: &mut impl Rng, lo: f32, hi: f32) -> Interval {
        let a = rng.gen_range(lo..hi);
        let b = rng.gen_range(lo..hi);
        Interval::new(a.min(b), a.max(b))
    }

    fn check_sound(i: Interval, v: f32, what: &str) {
        if v.is_nan() || i.has_nan() {
            return;
        }
        let tol = 1e-4 * v.abs().max(1.0);
        assert!(
            i.lower() - tol <= v && v <= i.upper() + tol,
            "{what}: {v} is not in {i}"
        );
    }

    #[test]
    fn test_interval_soundness_unary() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1234);
        for op in UnaryOpcode::iter() {
            let mut ctx = Context::new();
            let x = ctx.x();
            let root = ctx.unary(op, x).unwrap();
            let tree = PackedTree::new(&ctx, root).unwrap();
            let mut eval = Evaluator::new(&tree);
            for _ in 0..256 {
                let a = random_interval(&mut rng, -4.0, 4.0);
                let out = eval.eval_interval(a, 0.0.into(), 0.0.into());
                for _ in 0..8 {
                    let x = a.lerp(rng.r#gen());
                    let v = eval.eval_scalar(x, 0.0, 0.0);
                    check_sound(out, v, &format!("{op}({a})"));
                }
                check_sound(out, eval.eval_scalar(a.lower(), 0.0, 0.0), "lo");
                check_sound(out, eval.eval_scalar(a.upper(), 0.0, 0.0), "hi");
            }
        }
    }

    #[test]
    fn test_interval_soundness_binary() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5678);
        for op in BinaryOpcode::iter() {
            let mut ctx = Context::new();
            let x = ctx.x();
            let y = ctx.y();
            let root = ctx.binary(op, x, y).unwrap();
            let tree = PackedTree::new(&ctx, root).unwrap();
            let mut eval = Evaluator::new(&tree);
            for _ in 0..256 {
                let a = random_interval(&mut rng, -4.0, 4.0);
                let b = if op == BinaryOpcode::Pow {
                    random_interval(&mut rng, 0.1, 3.0)
                } else {
                    random_interval(&mut rng, -4.0, 4.0)
                };
                let out = eval.eval_interval(a, b, 0.0.into());
                for _ in 0..8 {
                    let x = a.lerp(rng.r#gen());
                    let y = b.lerp(rng.r#gen());
                    let v = eval.eval_scalar(x, y, 0.0);
                    check_sound(out, v, &format!("{op}({a}, {b})"));
                    // Integer exponents take the powi path
                    if op == BinaryOpcode::Pow && b.contains(y.round()) {
                        let v = eval.eval_scalar(x, y.round(), 0.0);
                        check_sound(out, v, &format!("{op}({a}, {b})"));
                    }
                }
            }
        }
    }

    #[test]
    fn test_batch_matches_scalar() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);

        let xs = [0.0, 1.0, 0.5, -2.0, 0.25];
        let ys = [0.0, 0.0, 0.5, 1.0, -0.75];
        let zs = [0.0, 0.0, 0.5, 0.0, 1.5];
        let out = eval.eval_batch(&xs, &ys, &zs).to_vec();
        for i in 0..xs.len() {
            let v = eval.eval_scalar(xs[i], ys[i], zs[i]);
            assert_eq!(out[i], v);
        }
        assert_eq!(out[0], -1.0);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_region_order() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let xy = ctx.mul(x, 100.0).unwrap();
        let yz = ctx.mul(y, 10.0).unwrap();
        let root = ctx.add(xy, yz).unwrap();
        let root = ctx.add(root, z).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);

        let b = Interval::new(0.0, 2.0);
        let lat = crate::region::Lattice::new([b, b, b], [2, 2, 2]).unwrap();
        let out = eval.eval_region(&lat.region());
        assert_eq!(out.len(), 27);
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    let v = out[(i * 3 + j) * 3 + k];
                    assert_eq!(v, (i * 100 + j * 10 + k) as f32);
                }
            }
        }
    }

    #[test]
    fn test_derivative() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);

        let out = eval.eval_derivative(&[2.0, 0.0], &[0.0, 3.0], &[0.0, 0.0]);
        assert_eq!(out[0], Grad::new(1.0, 1.0, 0.0, 0.0));
        assert_eq!(out[1], Grad::new(2.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn test_prune_restores() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let a = ctx.add(y, 10.0).unwrap();
        let b = ctx.sub(z, 10.0).unwrap();
        let m = ctx.min(x, a).unwrap();
        let root = ctx.max(m, b).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);
        let total = eval.active_count();

        let i = Interval::new(-1.0, 1.0);
        eval.eval_interval(i, i, i);
        {
            let mut p = eval.prune();
            assert_eq!(p.prune_depth(), 1);
            assert_eq!(p.active_axes(), [true, false, false]);
            assert!(p.active_count() < total);
            assert_eq!(p.eval_scalar(0.5, 0.0, 0.0), 0.5);

            // Nested pruning is a no-op here, but must still be paired
            p.eval_interval(i, i, i);
            let q = p.prune();
            assert_eq!(q.prune_depth(), 2);
        }
        assert_eq!(eval.prune_depth(), 0);
        assert_eq!(eval.active_count(), total);
        assert_eq!(eval.eval_scalar(20.0, 0.0, 0.0), 10.0);
    }

    #[test]
    fn test_prune_binary() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let a = ctx.sub(x, 5.0).unwrap();
        let root = ctx.min(a, y).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);

        eval.eval_interval([0.0, 1.0].into(), [-1.0, 1.0].into(), 0.0.into());
        {
            let mut p = eval.prune_binary();
            assert_eq!(p.active_axes(), [false; 3]);
            assert_eq!(p.eval_scalar(0.5, 0.5, 0.0), -1.0);
        }
        {
            let mut p = eval.prune();
            assert_eq!(p.active_axes(), [true, false, false]);
            assert_eq!(p.eval_scalar(0.5, 0.5, 0.0), -4.5);
        }
        assert_eq!(eval.eval_scalar(0.5, -6.0, 0.0), -6.0);
    }
}
