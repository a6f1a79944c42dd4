/// A single choice made at a min/max node.
///
/// Note that this is a bitfield such that
/// ```rust
/// # use asdf::eval::Choice;
/// # assert!(
/// Choice::Both as u8 == Choice::Left as u8 | Choice::Right as u8
/// # );
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Choice {
    /// This operation has not picked either left or right-hand input
    None = 0,

    /// The operation always picks the left-hand input
    Left = 1,

    /// The operation always picks the right-hand input
    Right = 2,

    /// The operation may pick either input
    #[default]
    Both = 3,
}

impl Choice {
    /// Narrows an existing choice with a new one
    ///
    /// A node which has already committed to one side stays committed; a
    /// node which could pick either side takes the new choice.
    pub fn narrow(self, other: Choice) -> Choice {
        match self {
            Choice::Both => other,
            c => c,
        }
    }
}

impl std::ops::BitOrAssign<Choice> for Choice {
    fn bitor_assign(&mut self, other: Self) {
        *self = match (*self as u8) | (other as u8) {
            0 => Self::None,
            1 => Self::Left,
            2 => Self::Right,
            _ => Self::Both,
        }
    }
}
