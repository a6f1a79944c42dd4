//! Lookup tables for marching squares and marching tetrahedra

/// Segments for marching squares on a single face
///
/// The face's corners are numbered counter-clockwise (viewed from outside
/// the cell), and edge `k` runs from corner `k` to corner `k + 1`. The table
/// is indexed by a mask with bit `k` set if corner `k` is inside the shape;
/// each segment is `(from, to)` as a pair of edges, oriented so that the
/// inside is on the right-hand side when viewed from outside.
///
/// Masks 5 and 10 are ambiguous; this table separates the inside corners,
/// and [`CONNECTED`] holds the alternative.
pub const SEGMENTS: [&[(usize, usize)]; 16] = [
    &[],
    &[(3, 0)],
    &[(0, 1)],
    &[(3, 1)],
    &[(1, 2)],
    &[(3, 0), (1, 2)],
    &[(0, 2)],
    &[(3, 2)],
    &[(2, 3)],
    &[(2, 0)],
    &[(0, 1), (2, 3)],
    &[(2, 1)],
    &[(1, 3)],
    &[(1, 0)],
    &[(0, 3)],
    &[],
];

/// Segments for the ambiguous masks when the inside corners are connected
/// through the center of the face
pub const CONNECTED: [(u8, [(usize, usize); 2]); 2] =
    [(5, [(3, 2), (1, 0)]), (10, [(0, 3), (2, 1)])];

/// Returns the marching-squares segments for a face
pub fn segments(mask: u8, connected: bool) -> &'static [(usize, usize)] {
    if connected {
        if let Some((_, s)) = CONNECTED.iter().find(|(m, _)| *m == mask) {
            return s;
        }
    }
    SEGMENTS[mask as usize]
}

/// Splits a cube into six tetrahedra around the main diagonal (0 to 7)
///
/// Corners use octant bits (bit 2 = +X, bit 1 = +Y, bit 0 = +Z). Every
/// cube uses the same split, so faces of adjacent cubes are divided along
/// matching diagonals.
pub const CUBE_TETS: [[usize; 4]; 6] = [
    [0, 4, 6, 7],
    [0, 6, 2, 7],
    [0, 2, 3, 7],
    [0, 3, 1, 7],
    [0, 1, 5, 7],
    [0, 5, 4, 7],
];

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_segments_balanced() {
        // Every crossed edge is used exactly once, as a start or end
        for mask in 0..16u8 {
            for connected in [false, true] {
                let mut starts = [0; 4];
                let mut ends = [0; 4];
                for (a, b) in segments(mask, connected) {
                    starts[*a] += 1;
                    ends[*b] += 1;
                }
                for k in 0..4 {
                    let inside = |c: usize| mask & (1 << (c % 4)) != 0;
                    let crossed = inside(k) != inside(k + 1);
                    assert_eq!(starts[k] + ends[k], crossed as usize);
                    // An edge that goes from outside to inside starts a
                    // segment
                    if crossed {
                        assert_eq!(starts[k] == 1, inside(k + 1));
                    }
                }
            }
        }
    }

    #[test]
    fn test_tets_cover_cube() {
        // Each tetrahedron has volume 1/6 of the unit cube, and all share
        // the main diagonal
        let pos = |c: usize| {
            nalgebra::Vector3::new(
                (c >> 2 & 1) as f32,
                (c >> 1 & 1) as f32,
                (c & 1) as f32,
            )
        };
        for t in CUBE_TETS {
            let [a, b, c, d] = t.map(pos);
            let v = (b - a).dot(&(c - a).cross(&(d - a))) / 6.0;
            assert!((v.abs() - 1.0 / 6.0).abs() < 1e-6);
            assert_eq!(t[0], 0);
            assert_eq!(t[3], 7);
        }
    }
}
