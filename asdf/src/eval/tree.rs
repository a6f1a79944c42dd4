use crate::{
    Error,
    context::{BinaryOpcode, Context, Node, Op, UnaryOpcode, Var},
};
use std::collections::HashMap;

/// A single operation in a [`PackedTree`], with arguments stored as slot
/// indices into the same tree
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TreeOp {
    Input(Var),
    Const(f32),
    Unary(UnaryOpcode, usize),
    Binary(BinaryOpcode, usize, usize),
}

impl TreeOp {
    /// Iterates over argument slots
    pub fn args(&self) -> impl Iterator<Item = usize> + use<> {
        let out = match *self {
            TreeOp::Binary(_, a, b) => [Some(a), Some(b)],
            TreeOp::Unary(_, a) => [Some(a), None],
            TreeOp::Input(..) | TreeOp::Const(..) => [None, None],
        };
        out.into_iter().flatten()
    }
}

/// An immutable expression graph, with nodes bucketed by rank
///
/// The rank of a node is the length of the longest chain of operands below
/// it; inputs and constants have rank 0. Evaluating levels in ascending order
/// guarantees that every operand is ready before its dependents.
///
/// Nodes are stored in postorder, so every argument slot is strictly less
/// than the slot of the node that uses it.
///
/// A `PackedTree` holds no evaluation state, so it may be shared between
/// threads; each thread builds its own [`Evaluator`](super::Evaluator).
#[derive(Clone, Debug)]
pub struct PackedTree {
    ops: Vec<TreeOp>,
    ranks: Vec<usize>,
    levels: Vec<Vec<usize>>,
    root: usize,
}

impl PackedTree {
    /// Flattens the subgraph under `root` into a packed tree
    ///
    /// Only nodes reachable from `root` are included.
    pub fn new(ctx: &Context, root: Node) -> Result<Self, Error> {
        let mut slots: HashMap<Node, usize> = HashMap::new();
        let mut ops = vec![];
        let mut ranks: Vec<usize> = vec![];

        // Depth-first recursion on the heap, to protect against stack overflows
        enum Action {
            Down,
            Up,
        }
        let mut todo = vec![(Action::Down, root)];
        while let Some((action, node)) = todo.pop() {
            if slots.contains_key(&node) {
                continue;
            }
            let op = ctx.get_op(node).ok_or(Error::BadNode)?;
            match action {
                Action::Down => {
                    todo.push((Action::Up, node));
                    todo.extend(op.iter_children().map(|c| (Action::Down, c)));
                }
                Action::Up => {
                    let slot = |n: &Node| slots.get(n).copied().ok_or(Error::BadNode);
                    let (op, rank) = match op {
                        Op::Input(v) => (TreeOp::Input(*v), 0),
                        Op::Const(c) => (TreeOp::Const(c.0 as f32), 0),
                        Op::Unary(u, a) => {
                            let a = slot(a)?;
                            (TreeOp::Unary(*u, a), ranks[a] + 1)
                        }
                        Op::Binary(b, lhs, rhs) => {
                            let lhs = slot(lhs)?;
                            let rhs = slot(rhs)?;
                            let rank = ranks[lhs].max(ranks[rhs]) + 1;
                            (TreeOp::Binary(*b, lhs, rhs), rank)
                        }
                    };
                    slots.insert(node, ops.len());
                    ops.push(op);
                    ranks.push(rank);
                }
            }
        }

        let root = slots.get(&root).copied().ok_or(Error::BadNode)?;
        let mut levels = vec![vec![]; ranks[root] + 1];
        for (i, r) in ranks.iter().enumerate() {
            levels[*r].push(i);
        }
        Ok(Self {
            ops,
            ranks,
            levels,
            root,
        })
    }

    /// Returns the number of nodes in the tree
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the tree is empty (which is never true)
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the slot of the root node
    pub fn root(&self) -> usize {
        self.root
    }

    /// Returns the operation at the given slot
    pub fn op(&self, slot: usize) -> TreeOp {
        self.ops[slot]
    }

    /// Returns the rank of the node at the given slot
    pub fn rank(&self, slot: usize) -> usize {
        self.ranks[slot]
    }

    /// Returns the per-rank node lists
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ranks() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let s = ctx.add(x2, y).unwrap();
        let r = ctx.sqrt(s).unwrap();
        let out = ctx.sub(r, 1.0).unwrap();
        let _unused = ctx.z();

        let t = PackedTree::new(&ctx, out).unwrap();
        assert_eq!(t.len(), 7);
        assert_eq!(t.levels().len(), 5);
        assert_eq!(t.rank(t.root()), 4);
        for (rank, level) in t.levels().iter().enumerate() {
            for &s in level {
                assert_eq!(t.rank(s), rank);
                assert!(t.op(s).args().all(|a| a < s && t.rank(a) < rank));
            }
        }
        assert!(
            t.levels()[0]
                .iter()
                .all(|s| !matches!(t.op(*s), TreeOp::Input(Var::Z)))
        );
    }

    #[test]
    fn test_shared_subtree() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let x2 = ctx.square(x).unwrap();
        let a = ctx.add(x2, 1.0).unwrap();
        let b = ctx.mul(x2, 3.0).unwrap();
        let m = ctx.min(a, b).unwrap();
        let t = PackedTree::new(&ctx, m).unwrap();
        // x, x², 1, 3, +, *, min
        assert_eq!(t.len(), 7);
    }
}
