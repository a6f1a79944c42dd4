//! STL export
use super::Mesh;
use std::io::{BufWriter, Write};

impl Mesh {
    /// Writes a binary STL to the given output
    ///
    /// Facet normals are recomputed from each triangle's winding; per-vertex
    /// normals are not stored in STL files.
    pub fn write_stl<F: Write>(&self, out: &mut F) -> Result<(), crate::Error> {
        let mut out = BufWriter::new(out);
        const HEADER: &[u8] = b"Binary STL exported from an adaptive distance field";
        static_assertions::const_assert!(HEADER.len() <= 80);
        out.write_all(HEADER)?;
        out.write_all(&[0u8; 80 - HEADER.len()])?;
        out.write_all(&(self.triangles.len() as u32).to_le_bytes())?;
        for t in &self.triangles {
            let a = self.vertices[t.x];
            let b = self.vertices[t.y];
            let c = self.vertices[t.z];
            let normal = (b - a).cross(&(c - a));
            let normal = normal.try_normalize(0.0).unwrap_or(normal);
            for p in &normal {
                out.write_all(&p.to_le_bytes())?;
            }
            for v in t {
                for p in &self.vertices[*v] {
                    out.write_all(&p.to_le_bytes())?;
                }
            }
            out.write_all(&[0u8; std::mem::size_of::<u16>()])?; // attributes
        }
        out.flush()?;
        Ok(())
    }
}
