//! 2D contours from the bottom plane of an [`Asdf`]
use super::{cms::face_segments, zero_crossing};
use crate::{
    Error,
    asdf::{Asdf, CellState, EdgeKey, Face, edge_crossings, repair},
};
use log::debug;
use nalgebra::{Vector2, Vector3};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// A single polyline
#[derive(Clone, Debug, Default)]
pub struct Contour {
    /// Points along the contour
    pub points: Vec<Vector2<f32>>,
    /// Whether the last point connects back to the first
    pub closed: bool,
}

impl Contour {
    /// Returns the signed area enclosed by a closed contour
    ///
    /// Contours run counter-clockwise around the inside of the shape, so this
    /// is positive for solid regions and negative for holes.
    pub fn area(&self) -> f32 {
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let (a, b) = (self.points[i], self.points[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f32>()
            / 2.0
    }
}

/// Extracts contours from the lowest Z plane of an [`Asdf`]
///
/// The tree is made consistent first, which may split cells. Contours run
/// counter-clockwise around the inside of the shape (viewed from +Z); they
/// are open where the shape crosses the edge of the lattice.
pub fn contour(asdf: &mut Asdf, cancel: &AtomicBool) -> Result<Vec<Contour>, Error> {
    repair(asdf, cancel)?;

    let face = Face {
        axis: 2,
        upper: false,
    };
    let tree: &Asdf = asdf;
    let corners = tree.corner_cache();
    let lattice = tree.lattice();
    let mut verts: HashMap<EdgeKey, usize> = HashMap::new();
    let mut points: Vec<Vector2<f32>> = vec![];
    let mut next = BTreeMap::new();
    let mut out = Ok(());

    tree.for_each_with_neighbors(|i, _neighbors| {
        if out.is_err() {
            return;
        }
        if cancel.load(Ordering::Relaxed) {
            out = Err(Error::Cancelled);
            return;
        }
        let cell = tree.cell(i);
        if cell.index[2][0] != 0 || cell.state != CellState::Leaf {
            return;
        }
        for (a, b) in face_segments(cell, face) {
            // Vertices are keyed by the sub-edge holding the crossing, so
            // cells of different sizes meet at the same point
            let mut vertex = |(p, q): EdgeKey| {
                let &[key] = &edge_crossings(&corners, p, q)[..] else {
                    return None;
                };
                let sample = |k: [u32; 3]| {
                    Some((Vector3::from(lattice.pos(k)), *corners.get(&k)?))
                };
                let (s, t) = (sample(key.0)?, sample(key.1)?);
                let (inside, outside) = if s.1 < 0.0 { (s, t) } else { (t, s) };
                Some(*verts.entry(key).or_insert_with(|| {
                    let pos = zero_crossing(None, 0, inside, outside);
                    points.push(pos.xy());
                    points.len() - 1
                }))
            };
            match (vertex(a), vertex(b)) {
                (Some(va), Some(vb)) => {
                    next.insert(va, vb);
                }
                _ => {
                    out = Err(Error::Inconsistent(0));
                    return;
                }
            }
        }
    });
    out?;

    let out = stitch(&next, &points);
    debug!(
        "extracted {} contours ({} points)",
        out.len(),
        points.len()
    );
    Ok(out)
}

/// Chains directed segments into polylines
///
/// Open chains (starting at points with no predecessor) come first, then
/// closed loops, each in order of their lowest point index.
fn stitch(next: &BTreeMap<usize, usize>, points: &[Vector2<f32>]) -> Vec<Contour> {
    let has_prev: BTreeSet<usize> = next.values().copied().collect();
    let mut used = BTreeSet::new();
    let mut out = vec![];

    let starts = next
        .keys()
        .filter(|k| !has_prev.contains(k))
        .chain(next.keys())
        .copied()
        .collect::<Vec<_>>();
    for start in starts {
        if used.contains(&start) {
            continue;
        }
        let mut c = Contour::default();
        let mut cur = start;
        loop {
            used.insert(cur);
            c.points.push(points[cur]);
            match next.get(&cur) {
                Some(&n) if n == start => {
                    c.closed = true;
                    break;
                }
                Some(&n) if !used.contains(&n) => cur = n,
                _ => break,
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        asdf::{Settings, build_asdf},
        context::Context,
        eval::PackedTree,
        region::Lattice,
        types::Interval,
    };

    fn lattice_2d(n: usize) -> Lattice {
        let b = Interval::new(-1.0, 1.0);
        Lattice::new([b, b, Interval::new(0.0, 0.1)], [n, n, 1]).unwrap()
    }

    #[test]
    fn test_circle() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let r = ctx.add(x2, y2).unwrap();
        let r = ctx.sqrt(r).unwrap();
        let root = ctx.sub(r, 0.5).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let cancel = AtomicBool::new(false);
        let mut asdf =
            build_asdf(&tree, &lattice_2d(64), &Settings::default(), &cancel)
                .unwrap();

        let cs = contour(&mut asdf, &cancel).unwrap();
        assert_eq!(cs.len(), 1);
        let c = &cs[0];
        assert!(c.closed);
        assert!(c.points.len() > 16);
        for p in &c.points {
            assert!((p.norm() - 0.5).abs() < 0.01, "{p}");
        }
        let expected = std::f32::consts::PI * 0.25;
        let area = c.area();
        assert!((area - expected).abs() / expected < 0.02, "{area}");
    }

    #[test]
    fn test_open_line() {
        // Solid below the line y = 0.3
        let mut ctx = Context::new();
        let y = ctx.y();
        let root = ctx.sub(y, 0.3).unwrap();
        let tree = PackedTree::new(&ctx, root).unwrap();
        let cancel = AtomicBool::new(false);
        let mut asdf =
            build_asdf(&tree, &lattice_2d(16), &Settings::default(), &cancel)
                .unwrap();

        let cs = contour(&mut asdf, &cancel).unwrap();
        assert_eq!(cs.len(), 1);
        let c = &cs[0];
        assert!(!c.closed);
        for p in &c.points {
            assert!((p.y - 0.3).abs() < 1e-5, "{p}");
        }
        // Counter-clockwise around the solid runs towards -X along its top
        let (first, last) = (c.points[0], c.points[c.points.len() - 1]);
        assert_eq!(first.x, 1.0);
        assert_eq!(last.x, -1.0);
    }

    #[test]
    fn test_stitch() {
        let points: Vec<_> = (0..6).map(|i| Vector2::new(i as f32, 0.0)).collect();
        let next: BTreeMap<usize, usize> =
            [(0, 1), (1, 2), (2, 0), (4, 3), (3, 5)].into_iter().collect();
        let cs = stitch(&next, &points);
        assert_eq!(cs.len(), 2);
        assert!(!cs[0].closed);
        assert_eq!(cs[0].points.len(), 3);
        assert_eq!(cs[0].points[0].x, 4.0);
        assert!(cs[1].closed);
        assert_eq!(cs[1].points.len(), 3);
    }
}
