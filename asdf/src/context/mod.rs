//! Infrastructure for representing math expressions as graphs
pub(crate) mod indexed;
mod op;

use indexed::{IndexMap, IndexVec, define_index};
pub use op::{BinaryOpcode, Op, UnaryOpcode, Var};

use crate::Error;

use std::collections::BTreeMap;
use std::fmt::Write;
use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;

use ordered_float::OrderedFloat;

define_index!(Node, "An index in the `Context::ops` map");

/// A `Context` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then frees
/// all of its contents when dropped.
///
/// Operations whose arguments are all constant are folded into a single
/// constant at construction, so a constant subtree is never evaluated twice.
#[derive(Debug, Default)]
pub struct Context {
    ops: IndexMap<Op, Node>,
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the context
    ///
    /// All [`Node`] handles from this context are invalidated.
    ///
    /// ```
    /// # use asdf::context::Context;
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// ctx.clear();
    /// assert!(ctx.eval_xyz(x, 1.0, 0.0, 0.0).is_err());
    /// ```
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Returns the number of [`Op`] nodes in the context
    ///
    /// ```
    /// # use asdf::context::Context;
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// assert_eq!(ctx.len(), 1);
    /// let y = ctx.y();
    /// assert_eq!(ctx.len(), 2);
    /// ctx.clear();
    /// assert_eq!(ctx.len(), 0);
    /// ```
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Checks whether the given [`Node`] is valid in this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).ok_or(Error::BadNode).map(|_| ())
    }

    /// Erases the most recently added node from the tree.
    ///
    /// Only used to delete temporary nodes during constant folding; such
    /// nodes have no outstanding handles and are guaranteed to be unique.
    fn pop(&mut self) -> Result<(), Error> {
        self.ops.pop().map(|_| ())
    }

    /// Looks up the constant associated with the given node.
    ///
    /// If the node is invalid for this tree, returns an error; if the node is
    /// not a constant, returns `Ok(None)`.
    pub fn const_value(&self, n: Node) -> Result<Option<f64>, Error> {
        match self.get_op(n) {
            Some(Op::Const(c)) => Ok(Some(c.0)),
            Some(_) => Ok(None),
            _ => Err(Error::BadNode),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Primitives
    /// Constructs or finds the `X` input node
    /// ```
    /// # use asdf::context::Context;
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// let v = ctx.eval_xyz(x, 1.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 1.0);
    /// ```
    pub fn x(&mut self) -> Node {
        self.ops.insert(Op::Input(Var::X))
    }

    /// Constructs or finds the `Y` input node
    pub fn y(&mut self) -> Node {
        self.ops.insert(Op::Input(Var::Y))
    }

    /// Constructs or finds the `Z` input node
    pub fn z(&mut self) -> Node {
        self.ops.insert(Op::Input(Var::Z))
    }

    /// Returns a node representing the given constant value.
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let v = ctx.constant(3.0);
    /// assert_eq!(ctx.eval_xyz(v, 0.0, 0.0, 0.0).unwrap(), 3.0);
    /// ```
    pub fn constant(&mut self, f: f64) -> Node {
        self.ops.insert(Op::Const(OrderedFloat(f)))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Helper functions to create nodes with constant folding
    /// Find or create a [`Node`] for the given unary operation, with constant
    /// folding.
    pub fn unary<A: IntoNode>(
        &mut self,
        op: UnaryOpcode,
        a: A,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let op_a = *self.get_op(a).ok_or(Error::BadNode)?;
        let n = self.ops.insert(Op::Unary(op, a));
        let out = if matches!(op_a, Op::Const(_)) {
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            self.pop()?; // removes `n`
            self.constant(v)
        } else {
            n
        };
        Ok(out)
    }

    /// Find or create a [`Node`] for the given binary operation, with
    /// constant folding.
    ///
    /// Commutative operations have their arguments sorted, which encourages
    /// deduplication.
    pub fn binary<A: IntoNode, B: IntoNode>(
        &mut self,
        op: BinaryOpcode,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        let (a, b) = if op.is_commutative() {
            (a.min(b), a.max(b))
        } else {
            (a, b)
        };
        let op_a = *self.get_op(a).ok_or(Error::BadNode)?;
        let op_b = *self.get_op(b).ok_or(Error::BadNode)?;

        // This call to `insert` should always insert the node, because we
        // don't permanently store operations in the tree that could be
        // constant-folded (indeed, we pop the node right afterwards)
        let n = self.ops.insert(Op::Binary(op, a, b));
        let out = if matches!((op_a, op_b), (Op::Const(_), Op::Const(_))) {
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            self.pop()?; // removes `n`
            self.constant(v)
        } else {
            n
        };
        Ok(out)
    }

    /// Builds an addition node
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.add(x, 1.0).unwrap();
    /// let v = ctx.eval_xyz(op, 1.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 2.0);
    /// ```
    pub fn add<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            self.mul(a, 2.0)
        } else {
            match (self.const_value(a)?, self.const_value(b)?) {
                (Some(zero), _) if zero == 0.0 => Ok(b),
                (_, Some(zero)) if zero == 0.0 => Ok(a),
                _ => self.binary(BinaryOpcode::Add, a, b),
            }
        }
    }

    /// Builds a multiplication node
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.mul(x, 5.0).unwrap();
    /// let v = ctx.eval_xyz(op, 2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 10.0);
    /// ```
    pub fn mul<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            self.square(a)
        } else {
            match (self.const_value(a)?, self.const_value(b)?) {
                (Some(one), _) if one == 1.0 => Ok(b),
                (_, Some(one)) if one == 1.0 => Ok(a),
                (Some(zero), _) if zero == 0.0 => Ok(a),
                (_, Some(zero)) if zero == 0.0 => Ok(b),
                _ => self.binary(BinaryOpcode::Mul, a, b),
            }
        }
    }

    /// Builds a `min` node
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.min(x, 5.0).unwrap();
    /// let v = ctx.eval_xyz(op, 2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 2.0);
    /// ```
    pub fn min<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.binary(BinaryOpcode::Min, a, b)
        }
    }

    /// Builds a `max` node
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.max(x, 5.0).unwrap();
    /// let v = ctx.eval_xyz(op, 2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 5.0);
    /// ```
    pub fn max<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.binary(BinaryOpcode::Max, a, b)
        }
    }

    /// Builds a node which performs subtraction.
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let op = ctx.sub(x, y).unwrap();
    /// let v = ctx.eval_xyz(op, 3.0, 2.0, 0.0).unwrap();
    /// assert_eq!(v, 1.0);
    /// ```
    pub fn sub<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;

        match (self.const_value(a)?, self.const_value(b)?) {
            (Some(zero), _) if zero == 0.0 => self.neg(b),
            (_, Some(zero)) if zero == 0.0 => Ok(a),
            _ => self.binary(BinaryOpcode::Sub, a, b),
        }
    }

    /// Builds a node which performs division.
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let op = ctx.div(x, y).unwrap();
    /// let v = ctx.eval_xyz(op, 3.0, 2.0, 0.0).unwrap();
    /// assert_eq!(v, 1.5);
    /// ```
    pub fn div<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;

        match (self.const_value(a)?, self.const_value(b)?) {
            (Some(zero), _) if zero == 0.0 => Ok(a),
            (_, Some(one)) if one == 1.0 => Ok(a),
            _ => self.binary(BinaryOpcode::Div, a, b),
        }
    }

    /// Builds a node which raises `a` to the power `b`
    ///
    /// Integer exponents keep the sign of the base; otherwise, the base is
    /// clamped to be non-negative.
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.pow(x, 3.0).unwrap();
    /// let v = ctx.eval_xyz(op, -2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, -8.0);
    /// ```
    pub fn pow<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        match self.const_value(b)? {
            Some(one) if one == 1.0 => Ok(a),
            Some(two) if two == 2.0 => self.square(a),
            _ => self.binary(BinaryOpcode::Pow, a, b),
        }
    }

    /// Builds a four-quadrant arctangent node, `atan2(y, x)`
    pub fn atan2<A: IntoNode, B: IntoNode>(
        &mut self,
        y: A,
        x: B,
    ) -> Result<Node, Error> {
        self.binary(BinaryOpcode::Atan2, y, x)
    }

    /// Builds a unary negation node
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.neg(x).unwrap();
    /// let v = ctx.eval_xyz(op, 2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, -2.0);
    /// ```
    pub fn neg<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Neg, a)
    }

    /// Builds a node which calculates the absolute value of its input
    pub fn abs<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Abs, a)
    }

    /// Builds a node which squares its input
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let op = ctx.square(x).unwrap();
    /// let v = ctx.eval_xyz(op, 2.0, 0.0, 0.0).unwrap();
    /// assert_eq!(v, 4.0);
    /// ```
    pub fn square<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Square, a)
    }

    /// Builds a node which calculates the square root of its input
    pub fn sqrt<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Sqrt, a)
    }

    /// Builds a sine node
    pub fn sin<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Sin, a)
    }

    /// Builds a cosine node
    pub fn cos<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Cos, a)
    }

    /// Builds a tangent node
    pub fn tan<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Tan, a)
    }

    /// Builds an arcsine node (input clamped to `[-1, 1]`)
    pub fn asin<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Asin, a)
    }

    /// Builds an arccosine node (input clamped to `[-1, 1]`)
    pub fn acos<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Acos, a)
    }

    /// Builds an arctangent node
    pub fn atan<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Atan, a)
    }

    /// Builds an exponential node
    pub fn exp<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        self.unary(UnaryOpcode::Exp, a)
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Evaluates the given node with the provided values for X, Y, and Z.
    ///
    /// This is extremely inefficient; consider building a
    /// [`PackedTree`](crate::eval::PackedTree) and an
    /// [`Evaluator`](crate::eval::Evaluator) instead.
    ///
    /// ```
    /// # let mut ctx = asdf::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let z = ctx.z();
    /// let op = ctx.mul(x, y).unwrap();
    /// let op = ctx.div(op, z).unwrap();
    /// let v = ctx.eval_xyz(op, 3.0, 5.0, 2.0).unwrap();
    /// assert_eq!(v, 7.5); // (3.0 * 5.0) / 2.0
    /// ```
    pub fn eval_xyz(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        let mut cache = vec![None; self.ops.len()].into();
        self.eval_inner(root, [x, y, z], &mut cache)
    }

    fn eval_inner(
        &self,
        node: Node,
        xyz: [f64; 3],
        cache: &mut IndexVec<Option<f64>, Node>,
    ) -> Result<f64, Error> {
        if node.get() >= cache.len() {
            return Err(Error::BadNode);
        }
        if let Some(v) = cache[node] {
            return Ok(v);
        }
        let v = match *self.get_op(node).ok_or(Error::BadNode)? {
            Op::Input(v) => xyz[v.index()],
            Op::Const(c) => c.0,
            Op::Binary(op, a, b) => {
                let a = self.eval_inner(a, xyz, cache)?;
                let b = self.eval_inner(b, xyz, cache)?;
                op.apply(a, b)
            }
            Op::Unary(op, a) => op.apply(self.eval_inner(a, xyz, cache)?),
        };
        cache[node] = Some(v);
        Ok(v)
    }

    /// Parses a flat text representation of a math tree. For example, the
    /// circle `(- (sqrt (+ (square x) (square y))) 1)` can be parsed from
    /// ```
    /// # use asdf::context::Context;
    /// let txt = "
    /// ## This is a comment!
    /// 0x600000b90000 var-x
    /// 0x600000b900a0 square 0x600000b90000
    /// 0x600000b90050 var-y
    /// 0x600000b900f0 square 0x600000b90050
    /// 0x600000b90140 add 0x600000b900a0 0x600000b900f0
    /// 0x600000b90190 sqrt 0x600000b90140
    /// 0x600000b901e0 const 1
    /// 0x600000b90230 sub 0x600000b90190 0x600000b901e0
    /// ";
    /// let (ctx, root) = Context::from_text(&mut txt.as_bytes()).unwrap();
    /// assert_eq!(ctx.len(), 8);
    /// assert_eq!(ctx.eval_xyz(root, 3.0, 4.0, 0.0).unwrap(), 4.0);
    /// ```
    ///
    /// Each line is `name opcode [args...]`, where the arguments of an
    /// operation are names defined on earlier lines. The last line defines
    /// the root. Opcode names are the snake-case names of [`UnaryOpcode`]
    /// and [`BinaryOpcode`], plus `const`, `var-x`, `var-y`, and `var-z`.
    pub fn from_text<R: Read>(r: R) -> Result<(Self, Node), Error> {
        let reader = BufReader::new(r);
        let mut ctx = Self::new();
        let mut seen = BTreeMap::new();
        let mut last = None;

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_err = |msg: &str| Error::ParseError {
                line: i + 1,
                msg: msg.to_owned(),
            };
            let mut iter = line.split_whitespace();
            let name = iter
                .next()
                .ok_or_else(|| parse_err("missing name"))?
                .to_owned();
            let opcode = iter.next().ok_or_else(|| parse_err("missing opcode"))?;

            let node = match opcode {
                "const" => {
                    let v = iter
                        .next()
                        .and_then(|t| t.parse::<f64>().ok())
                        .ok_or_else(|| parse_err("invalid constant"))?;
                    ctx.constant(v)
                }
                "var-x" => ctx.x(),
                "var-y" => ctx.y(),
                "var-z" => ctx.z(),
                op => {
                    let mut arg = || -> Result<Node, Error> {
                        let txt = iter
                            .next()
                            .ok_or_else(|| parse_err("missing argument"))?;
                        seen.get(txt)
                            .cloned()
                            .ok_or_else(|| Error::UnknownVariable(txt.into()))
                    };
                    if let Ok(u) = UnaryOpcode::from_str(op) {
                        let a = arg()?;
                        ctx.unary(u, a)?
                    } else if let Ok(b) = BinaryOpcode::from_str(op) {
                        let lhs = arg()?;
                        let rhs = arg()?;
                        ctx.binary(b, lhs, rhs)?
                    } else {
                        return Err(Error::UnknownOpcode(op.to_owned()));
                    }
                }
            };
            seen.insert(name, node);
            last = Some(node);
        }
        match last {
            Some(node) => Ok((ctx, node)),
            None => Err(Error::EmptyFile),
        }
    }

    /// Converts the entire context into a GraphViz drawing
    pub fn dot(&self) -> String {
        let mut out = "digraph mygraph{\n".to_owned();
        for node in self.ops.keys() {
            let Some(op) = self.get_op(node) else {
                continue;
            };
            out += &self.dot_node(node);
            out += &op.dot_edges(node);
        }
        out += "}\n";
        out
    }

    /// Converts the given node into a GraphViz node
    pub fn dot_node(&self, i: Node) -> String {
        let mut out = format!(r#"n{} [label = ""#, i.get());
        let Some(op) = self.get_op(i) else {
            return out + "?\"]\n";
        };
        // Writing to a `String` is infallible
        let _ = match op {
            Op::Const(c) => write!(out, "{c}"),
            Op::Input(v) => write!(out, "{v}"),
            Op::Binary(op, ..) => write!(out, "{op}"),
            Op::Unary(op, ..) => write!(out, "{op}"),
        };
        let _ = writeln!(
            out,
            r#"" color="{0}1" shape="{1}" fontcolor="{0}4"]"#,
            op.dot_node_color(),
            op.dot_node_shape()
        );
        out
    }

    /// Looks up an operation by `Node` handle
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get_by_index(node)
    }
}

////////////////////////////////////////////////////////////////////////////////
/// Helper trait for things that can be converted into a [`Node`] given a
/// [`Context`].
///
/// This trait allows you to write
/// ```
/// # let mut ctx = asdf::context::Context::new();
/// let x = ctx.x();
/// let sum = ctx.add(x, 1.0).unwrap();
/// ```
/// instead of the more verbose
/// ```
/// # let mut ctx = asdf::context::Context::new();
/// let x = ctx.x();
/// let num = ctx.constant(1.0);
/// let sum = ctx.add(x, num).unwrap();
/// ```
pub trait IntoNode {
    /// Converts the given values into a node
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for f32 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self as f64))
    }
}

impl IntoNode for f64 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    // This can't be in a doctest, because it uses a private function
    #[test]
    fn test_get_op() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let op_x = ctx.get_op(x).unwrap();
        assert!(matches!(op_x, Op::Input(Var::X)));
    }

    #[test]
    fn test_dedupe() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let a = ctx.add(x, y).unwrap();
        let b = ctx.add(y, x).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_constant_folding() {
        let mut ctx = Context::new();
        let a = ctx.constant(2.0);
        let b = ctx.sqrt(16.0).unwrap();
        let c = ctx.mul(a, b).unwrap();
        assert_eq!(ctx.const_value(c).unwrap(), Some(8.0));
        let d = ctx.sin(0.0).unwrap();
        assert_eq!(ctx.const_value(d).unwrap(), Some(0.0));

        // Folded nodes never leave temporaries behind
        assert!(ctx.ops.keys().all(|n| {
            matches!(ctx.get_op(n), Some(Op::Const(..)))
        }));
    }

    #[test]
    fn test_domain_clamping() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let s = ctx.sqrt(x).unwrap();
        assert_eq!(ctx.eval_xyz(s, -4.0, 0.0, 0.0).unwrap(), 0.0);
        let a = ctx.asin(x).unwrap();
        assert_eq!(
            ctx.eval_xyz(a, 2.0, 0.0, 0.0).unwrap(),
            std::f64::consts::FRAC_PI_2
        );
        let p = ctx.pow(x, 0.5).unwrap();
        assert_eq!(ctx.eval_xyz(p, -4.0, 0.0, 0.0).unwrap(), 0.0);
        assert_eq!(ctx.eval_xyz(p, 4.0, 0.0, 0.0).unwrap(), 2.0);
    }

    #[test]
    fn test_from_text() {
        let txt = "
            a var-x
            b var-z
            c atan2 a b
            d const 2.5
            e pow a d
            f max c e
        ";
        let (ctx, root) = Context::from_text(txt.as_bytes()).unwrap();
        assert!(matches!(
            ctx.get_op(root),
            Some(Op::Binary(BinaryOpcode::Max, ..))
        ));
        let v = ctx.eval_xyz(root, 1.0, 0.0, 1.0).unwrap();
        assert_eq!(v, 1.0f64.atan2(1.0).max(1.0));

        assert!(matches!(
            Context::from_text("a frob".as_bytes()),
            Err(Error::UnknownOpcode(..))
        ));
        assert!(matches!(
            Context::from_text("a square b".as_bytes()),
            Err(Error::UnknownVariable(..))
        ));
        assert!(matches!(
            Context::from_text("a const".as_bytes()),
            Err(Error::ParseError { line: 1, .. })
        ));
        assert!(matches!(
            Context::from_text("# nothing\n".as_bytes()),
            Err(Error::EmptyFile)
        ));
    }

    #[test]
    fn test_dot() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        ctx.min(x, y).unwrap();
        let d = ctx.dot();
        assert!(d.contains("label = \"min\""));
        assert!(d.contains("label = \"X\""));
        assert!(d.starts_with("digraph"));
    }
}
