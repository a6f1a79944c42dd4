use crate::context::Node;
use ordered_float::OrderedFloat;

/// One of the three spatial inputs
#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    strum::Display,
    strum::EnumString,
)]
pub enum Var {
    /// The X axis
    X,
    /// The Y axis
    Y,
    /// The Z axis
    Z,
}

impl Var {
    /// Returns the axis index (0-2)
    pub fn index(self) -> usize {
        match self {
            Var::X => 0,
            Var::Y => 1,
            Var::Z => 2,
        }
    }
}

/// A one-argument math operation
#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOpcode {
    Neg,
    Abs,
    Square,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
}

impl UnaryOpcode {
    /// Applies this operation to a double-precision value
    ///
    /// Domain errors are clamped (e.g. `sqrt(-1) = 0`), matching the
    /// evaluators in [`crate::eval`].
    pub fn apply(self, a: f64) -> f64 {
        match self {
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
}

/// A two-argument math operation
#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Pow,
    #[strum(serialize = "atan2")]
    Atan2,
}

impl BinaryOpcode {
    /// Applies this operation to a pair of double-precision values
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
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

    /// Checks whether `a op b == b op a`
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOpcode::Add
                | BinaryOpcode::Mul
                | BinaryOpcode::Min
                | BinaryOpcode::Max
        )
    }
}

/// Represents an operation in a math expression.
///
/// `Op`s should be constructed by calling functions on
/// [`Context`](crate::context::Context), e.g.
/// [`Context::add`](crate::context::Context::add) will generate an
/// `Op::Binary(BinaryOpcode::Add, .., ..)` node and return an opaque handle.
///
/// Each `Op` is tightly coupled to the [`Context`](crate::context::Context)
/// which generated it, and will not be valid for a different `Context`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Op {
    Input(Var),
    Const(OrderedFloat<f64>),
    Binary(BinaryOpcode, Node, Node),
    Unary(UnaryOpcode, Node),
}

fn dot_color_to_rgb(s: &str) -> &'static str {
    match s {
        "red" => "#FF0000",
        "green" => "#00FF00",
        "goldenrod" => "#DAA520",
        "dodgerblue" => "#1E90FF",
        _ => "#000000",
    }
}

impl Op {
    /// Returns the color to be used in a GraphViz drawing for this node
    pub fn dot_node_color(&self) -> &str {
        match self {
            Op::Const(..) => "green",
            Op::Input(..) => "red",
            Op::Binary(BinaryOpcode::Min | BinaryOpcode::Max, ..) => {
                "dodgerblue"
            }
            Op::Binary(..) | Op::Unary(..) => "goldenrod",
        }
    }

    /// Returns the shape to be used in a GraphViz drawing for this node
    pub fn dot_node_shape(&self) -> &str {
        match self {
            Op::Const(..) => "oval",
            Op::Input(..) => "circle",
            Op::Binary(..) | Op::Unary(..) => "box",
        }
    }

    /// Iterates over children, producing 0, 1, or 2 values
    pub fn iter_children(&self) -> impl Iterator<Item = Node> + use<> {
        let out = match self {
            Op::Binary(_, a, b) => [Some(*a), Some(*b)],
            Op::Unary(_, a) => [Some(*a), None],
            Op::Input(..) | Op::Const(..) => [None, None],
        };
        out.into_iter().flatten()
    }

    /// Returns a GraphViz string of edges from this node to its children
    pub fn dot_edges(&self, i: Node) -> String {
        let mut out = String::new();
        for c in self.iter_children() {
            let color =
                dot_color_to_rgb(self.dot_node_color()).to_owned() + "FF";
            out += &format!(
                "n{} -> n{} [color = \"{color}\"]\n",
                i.get(),
                c.get()
            );
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dot_colors() {
        assert_eq!(dot_color_to_rgb("dodgerblue"), "#1E90FF");
        assert_eq!(dot_color_to_rgb("mauve"), "#000000");
        let op = Op::Binary(BinaryOpcode::Min, Node::from(0), Node::from(1));
        let edges = op.dot_edges(Node::from(2));
        assert!(edges.contains("#1E90FFFF"), "{edges}");
    }
}
