//! Surface extraction
//!
//! There are two mesh generators:
//! - [`triangulate`] runs cubical marching squares over an [`Asdf`], producing
//!   a watertight mesh even where neighboring cells are at different depths
//! - [`triangulate_tree`] runs marching tetrahedra over a uniform lattice,
//!   with optional sharp-feature detection
//!
//! In addition, [`contour`] extracts 2D polylines from the bottom plane of an
//! [`Asdf`].
//!
//! [`Asdf`]: crate::asdf::Asdf
use crate::{Error, eval::Evaluator};
use std::io::{BufReader, BufWriter, Read, Write};

mod cms;
mod contour;
mod output;
mod qef;
mod tables;
mod tetra;

pub use cms::{MeshSettings, triangulate};
pub(crate) use cms::{face_edges, face_segments};
pub use contour::{Contour, contour};
pub use tetra::{TetraSettings, triangulate_tree};

/// An indexed 3D mesh, with per-vertex normals
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    /// Triangles, as counter-clockwise (outward-facing) indexes into
    /// `vertices`
    pub triangles: Vec<nalgebra::Vector3<usize>>,
    /// Vertex positions
    pub vertices: Vec<nalgebra::Vector3<f32>>,
    /// Unit normals, one per vertex (may be zero for degenerate vertices)
    pub normals: Vec<nalgebra::Vector3<f32>>,
}

impl Mesh {
    /// Builds a new empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the axis-aligned bounding box of the vertices, as
    /// `(min, max)`, or `None` if the mesh is empty
    pub fn bounds(
        &self,
    ) -> Option<(nalgebra::Vector3<f32>, nalgebra::Vector3<f32>)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(lo, hi), v| {
            (lo.inf(v), hi.sup(v))
        }))
    }

    /// Returns the volume enclosed by the mesh
    ///
    /// This is only meaningful for closed meshes; it's positive when the
    /// triangles face outwards.
    pub fn volume(&self) -> f32 {
        self.triangles
            .iter()
            .map(|t| {
                let a = self.vertices[t.x];
                let b = self.vertices[t.y];
                let c = self.vertices[t.z];
                a.dot(&b.cross(&c)) / 6.0
            })
            .sum()
    }

    /// Writes the mesh in the native binary format
    ///
    /// The format is little-endian: `6 × f32` bounds (`xmin, xmax, ymin, ymax,
    /// zmin, zmax`), `u32` triangle count, `u32` vertex count, `3 × u32`
    /// indexes per triangle, then `6 × f32` (position and normal) per vertex.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        let mut out = BufWriter::new(out);
        let (lo, hi) = self
            .bounds()
            .unwrap_or((nalgebra::Vector3::zeros(), nalgebra::Vector3::zeros()));
        for a in 0..3 {
            out.write_all(&lo[a].to_le_bytes())?;
            out.write_all(&hi[a].to_le_bytes())?;
        }
        out.write_all(&(self.triangles.len() as u32).to_le_bytes())?;
        out.write_all(&(self.vertices.len() as u32).to_le_bytes())?;
        for t in &self.triangles {
            for i in t {
                out.write_all(&(*i as u32).to_le_bytes())?;
            }
        }
        for (v, n) in self.vertices.iter().zip(&self.normals) {
            for p in v.iter().chain(n.iter()) {
                out.write_all(&p.to_le_bytes())?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Reads a mesh in the native binary format
    pub fn read<R: Read>(inp: &mut R) -> Result<Self, Error> {
        let mut inp = BufReader::new(inp);
        let mut word = || -> Result<[u8; 4], Error> {
            let mut b = [0u8; 4];
            inp.read_exact(&mut b)?;
            Ok(b)
        };
        for _ in 0..6 {
            word()?;
        }
        let tri_count = u32::from_le_bytes(word()?) as usize;
        let vert_count = u32::from_le_bytes(word()?) as usize;
        let mut out = Mesh::new();
        for _ in 0..tri_count {
            let mut t = nalgebra::Vector3::zeros();
            for i in t.iter_mut() {
                *i = u32::from_le_bytes(word()?) as usize;
                if *i >= vert_count {
                    return Err(Error::BadHeader);
                }
            }
            out.triangles.push(t);
        }
        for _ in 0..vert_count {
            let mut v = [0f32; 6];
            for p in v.iter_mut() {
                *p = f32::from_le_bytes(word()?);
            }
            out.vertices.push(nalgebra::Vector3::new(v[0], v[1], v[2]));
            out.normals.push(nalgebra::Vector3::new(v[3], v[4], v[5]));
        }
        Ok(out)
    }
}

/// Number of points sampled per round of edge search
const EDGE_SEARCH_SIZE: usize = 16;

/// Finds the surface crossing between an inside and an outside point
///
/// Without an evaluator (or with `depth == 0`), this linearly interpolates
/// the two samples. Otherwise, it runs an N-ary search along the edge,
/// narrowing to the first inside-to-outside transition on each round, and
/// falls back to the linear estimate if the evaluator disagrees about the
/// endpoints.
pub(crate) fn zero_crossing(
    eval: Option<&mut Evaluator>,
    depth: usize,
    inside: (nalgebra::Vector3<f32>, f32),
    outside: (nalgebra::Vector3<f32>, f32),
) -> nalgebra::Vector3<f32> {
    let (pa, da) = inside;
    let (pb, db) = outside;
    let t = if da != db {
        (da / (da - db)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let linear = pa + (pb - pa) * t;
    let Some(eval) = eval else {
        return linear;
    };
    if depth == 0 {
        return linear;
    }

    let mut xs = [0.0; EDGE_SEARCH_SIZE];
    let mut ys = [0.0; EDGE_SEARCH_SIZE];
    let mut zs = [0.0; EDGE_SEARCH_SIZE];
    let (mut start, mut end) = (pa, pb);
    for _ in 0..depth {
        for j in 0..EDGE_SEARCH_SIZE {
            let f = j as f32 / (EDGE_SEARCH_SIZE - 1) as f32;
            let p = start + (end - start) * f;
            xs[j] = p.x;
            ys[j] = p.y;
            zs[j] = p.z;
        }
        let out = eval.eval_batch(&xs, &ys, &zs);
        if !(out[0] < 0.0) || out[EDGE_SEARCH_SIZE - 1] < 0.0 {
            return linear;
        }
        let Some(frac) = out.iter().position(|v| *v >= 0.0) else {
            return linear;
        };
        let f = |j: usize| start + (end - start) * (j as f32 / (EDGE_SEARCH_SIZE - 1) as f32);
        let (a, b) = (f(frac - 1), f(frac));
        start = a;
        end = b;
    }
    (start + end) / 2.0
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Vector3;

    fn tetrahedron() -> Mesh {
        Mesh {
            vertices: vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
                Vector3::new(0.0, 0.0, 1.0),
            ],
            normals: vec![Vector3::zeros(); 4],
            triangles: vec![
                Vector3::new(0, 2, 1),
                Vector3::new(0, 1, 3),
                Vector3::new(0, 3, 2),
                Vector3::new(1, 2, 3),
            ],
        }
    }

    #[test]
    fn test_volume() {
        let m = tetrahedron();
        assert!((m.volume() - 1.0 / 6.0).abs() < 1e-6);
        let (lo, hi) = m.bounds().unwrap();
        assert_eq!(lo, Vector3::zeros());
        assert_eq!(hi, Vector3::new(1.0, 1.0, 1.0));
        assert!(Mesh::new().bounds().is_none());
    }

    #[test]
    fn test_mesh_round_trip() {
        let m = tetrahedron();
        let mut buf = vec![];
        m.write(&mut buf).unwrap();
        assert_eq!(buf.len(), 24 + 8 + 4 * 12 + 4 * 24);
        let out = Mesh::read(&mut buf.as_slice()).unwrap();
        assert_eq!(out.triangles, m.triangles);
        assert_eq!(out.vertices, m.vertices);
        assert_eq!(out.normals, m.normals);

        // Corrupt an index
        buf[32] = 7;
        assert!(matches!(
            Mesh::read(&mut buf.as_slice()),
            Err(Error::BadHeader)
        ));
    }

    #[test]
    fn test_zero_crossing_linear() {
        let a = (Vector3::new(0.0, 0.0, 0.0), -1.0);
        let b = (Vector3::new(1.0, 0.0, 0.0), 3.0);
        let p = zero_crossing(None, 4, a, b);
        assert_eq!(p, Vector3::new(0.25, 0.0, 0.0));
    }

    #[test]
    fn test_zero_crossing_search() {
        use crate::{context::Context, eval::PackedTree};
        let mut ctx = Context::new();
        let x = ctx.x();
        let x2 = ctx.square(x).unwrap();
        let root = ctx.sub(x2, 0.25).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let mut eval = Evaluator::new(&tree);

        // Linear interpolation of the endpoints is off; searching isn't
        let a = (Vector3::new(0.0, 0.0, 0.0), -0.25);
        let b = (Vector3::new(1.0, 0.0, 0.0), 0.75);
        assert_eq!(zero_crossing(None, 4, a, b).x, 0.25);
        let p = zero_crossing(Some(&mut eval), 4, a, b);
        assert!((p.x - 0.5).abs() < 1e-3, "{p}");
    }
}
