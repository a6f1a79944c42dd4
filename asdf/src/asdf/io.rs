//! Binary file format for [`Asdf`] trees
//!
//! All values are little-endian. The file begins with a header:
//!
//! | Field        | Type       |
//! |--------------|------------|
//! | Magic        | `b"ASDF"`  |
//! | Version      | 2 × `u8`   |
//! | Bounds       | 6 × `f32`  |
//! | Resolution   | 3 × `i32`  |
//! | Scale        | `f32` (version 1.1 only) |
//!
//! Bounds are stored as `xmin, xmax, ymin, ymax, zmin, zmax`. The body is a
//! depth-first walk of the tree, starting at the root. Each cell begins with
//! a tag byte: `B` (followed by a bitmask of present children, then each
//! child in octant order), or `F`, `E`, or `L` (followed by corner samples).
//!
//! Corner samples are only written the first time their lattice point is
//! seen; readers track the same cache and look up repeated corners. Version
//! 1.0 stores samples as raw `f32`; version 1.1 stores them as `i16` values
//! multiplied by the per-file scale.
//!
//! Cell geometry is not stored: every split happens at the midpoint lattice
//! index of the cell, so children are reconstructed from their parent.
use super::{Asdf, Cell, CellIndex, CellState, CornerCache, split_mask};
use crate::{Error, region::Lattice, types::Interval};
use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Write};

const MAGIC: &[u8; 4] = b"ASDF";
const MAJOR: u8 = 1;

/// Encoding of corner samples in a saved file
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    /// Raw 32-bit floats (version 1.0)
    F32,
    /// 16-bit integers with a global scale (version 1.1)
    #[default]
    I16,
}

impl Encoding {
    fn minor(&self) -> u8 {
        match self {
            Encoding::F32 => 0,
            Encoding::I16 => 1,
        }
    }
}

impl Asdf {
    /// Writes the tree to the given output, using the default encoding
    pub fn write<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        self.write_with(out, Encoding::default())
    }

    /// Writes the tree to the given output
    pub fn write_with<W: Write>(
        &self,
        out: &mut W,
        encoding: Encoding,
    ) -> Result<(), Error> {
        let mut out = BufWriter::new(out);
        out.write_all(MAGIC)?;
        out.write_all(&[MAJOR, encoding.minor()])?;
        for b in self.bounds() {
            out.write_all(&b.lower().to_le_bytes())?;
            out.write_all(&b.upper().to_le_bytes())?;
        }
        for r in self.lattice().resolution() {
            out.write_all(&(r as i32).to_le_bytes())?;
        }

        let scale = self
            .terminals()
            .into_iter()
            .flat_map(|i| self.cell(i).d)
            .filter(|d| d.is_finite())
            .fold(0.0f32, |m, d| m.max(d.abs()))
            / i16::MAX as f32;
        let scale = if scale > 0.0 { scale } else { 1.0 };
        if encoding == Encoding::I16 {
            out.write_all(&scale.to_le_bytes())?;
        }

        let mut seen = HashSet::new();
        let mut todo = vec![self.root()];
        while let Some(i) = todo.pop() {
            let cell = self.cell(i);
            let tag = match &cell.state {
                CellState::Branch(children) => {
                    out.write_all(&[b'B', split_bits(children)])?;
                    todo.extend(children.iter().rev().flatten());
                    continue;
                }
                CellState::Filled => b'F',
                CellState::Empty => b'E',
                CellState::Leaf => b'L',
            };
            out.write_all(&[tag])?;
            for c in 0..8 {
                if !seen.insert(cell.corner_index(c)) {
                    continue;
                }
                let d = cell.d[c];
                match encoding {
                    Encoding::F32 => out.write_all(&d.to_le_bytes())?,
                    Encoding::I16 => {
                        out.write_all(&quantize(d, scale).to_le_bytes())?
                    }
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Reads a tree from the given input
    pub fn read<R: Read>(inp: &mut R) -> Result<Self, Error> {
        let mut inp = BufReader::new(inp);
        let mut magic = [0u8; 4];
        inp.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::BadHeader);
        }
        let mut version = [0u8; 2];
        inp.read_exact(&mut version)?;
        let encoding = match version {
            [MAJOR, 0] => Encoding::F32,
            [MAJOR, 1] => Encoding::I16,
            [major, minor] => return Err(Error::UnsupportedVersion(major, minor)),
        };

        let mut bounds = [Interval::new(0.0, 0.0); 3];
        for b in bounds.iter_mut() {
            let lo = read_f32(&mut inp)?;
            let hi = read_f32(&mut inp)?;
            if !(lo < hi) {
                return Err(Error::BadHeader);
            }
            *b = Interval::new(lo, hi);
        }
        let mut res = [0usize; 3];
        for r in res.iter_mut() {
            let v = read_i32(&mut inp)?;
            *r = usize::try_from(v).map_err(|_| Error::BadHeader)?;
        }
        let lattice = Lattice::new(bounds, res)?;
        let scale = match encoding {
            Encoding::F32 => 1.0,
            Encoding::I16 => read_f32(&mut inp)?,
        };

        let mut asdf = Asdf::new(lattice);
        let root = asdf.root();
        let index = asdf.cell(root).index;
        let mut reader = Reader {
            inp: &mut inp,
            encoding,
            scale,
            corners: CornerCache::new(),
        };
        let root = reader.cell(&mut asdf, index)?;
        asdf.set_root(root);
        asdf.compact();
        Ok(asdf)
    }
}

/// Packs a set of children into a bitmask of which octants are present
fn split_bits(children: &[Option<CellIndex>; 8]) -> u8 {
    children
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_some())
        .fold(0, |m, (i, _)| m | (1 << i))
}

/// Quantizes a sample, preserving its sign
fn quantize(d: f32, scale: f32) -> i16 {
    let q = (d / scale)
        .round()
        .clamp(-(i16::MAX as f32), i16::MAX as f32) as i16;
    if d < 0.0 && q == 0 { -1 } else { q }
}

fn read_f32<R: Read>(inp: &mut R) -> Result<f32, Error> {
    let mut b = [0u8; 4];
    inp.read_exact(&mut b)?;
    Ok(f32::from_le_bytes(b))
}

fn read_i32<R: Read>(inp: &mut R) -> Result<i32, Error> {
    let mut b = [0u8; 4];
    inp.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

struct Reader<'a, R> {
    inp: &'a mut R,
    encoding: Encoding,
    scale: f32,
    corners: CornerCache,
}

impl<R: Read> Reader<'_, R> {
    fn byte(&mut self) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.inp.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn sample(&mut self) -> Result<f32, Error> {
        Ok(match self.encoding {
            Encoding::F32 => read_f32(&mut *self.inp)?,
            Encoding::I16 => {
                let mut b = [0u8; 2];
                self.inp.read_exact(&mut b)?;
                i16::from_le_bytes(b) as f32 * self.scale
            }
        })
    }

    fn cell(
        &mut self,
        asdf: &mut Asdf,
        index: [[u32; 2]; 3],
    ) -> Result<CellIndex, Error> {
        let mut cell = Cell::new(index, asdf.lattice());
        match self.byte()? {
            b'B' => {
                let bits = self.byte()?;
                let mut children = [None; 8];
                for c in (0..8).filter(|c| bits & (1 << c) != 0) {
                    children[c] = Some(CellIndex::from(usize::MAX));
                }
                let mask = split_mask(&children);
                if mask == 0
                    || bits & 1 == 0
                    || bits.count_ones() != 1 << mask.count_ones()
                {
                    return Err(Error::BadTag(bits));
                }
                for (c, child) in children.iter_mut().enumerate() {
                    if child.is_none() {
                        continue;
                    }
                    let mut sub = index;
                    for a in (0..3).filter(|a| mask & (4 >> a) != 0) {
                        let [lo, hi] = index[a];
                        if hi - lo < 2 {
                            return Err(Error::BadTag(bits));
                        }
                        let mid = lo + (hi - lo) / 2;
                        sub[a] = if c & (4 >> a) != 0 { [mid, hi] } else { [lo, mid] };
                    }
                    *child = Some(self.cell(asdf, sub)?);
                }
                cell.d = asdf.d_from_children(&children);
                cell.state = CellState::Branch(children);
            }
            tag @ (b'F' | b'E' | b'L') => {
                for c in 0..8 {
                    let key = cell.corner_index(c);
                    cell.d[c] = match self.corners.get(&key) {
                        Some(d) => *d,
                        None => {
                            let d = self.sample()?;
                            self.corners.insert(key, d);
                            d
                        }
                    };
                }
                cell.state = match tag {
                    b'F' => CellState::Filled,
                    b'E' => CellState::Empty,
                    _ => CellState::Leaf,
                };
            }
            tag => return Err(Error::BadTag(tag)),
        }
        Ok(asdf.push(cell))
    }
}
