//! Marching tetrahedra on a uniform lattice
//!
//! Each voxel is split into six tetrahedra around its main diagonal, and each
//! tetrahedron contributes zero, one, or two triangles. Vertices are keyed by
//! the lattice indexes of their edge, so the output is watertight.
//!
//! With feature detection enabled, each voxel's patch of triangles is checked
//! for clusters of distinct normals (an edge or corner of the shape). If it
//! has more than one cluster, the patch is replaced by a fan around a feature
//! point placed with a [`QuadraticErrorSolver`].
use super::{Mesh, qef::QuadraticErrorSolver, tables::CUBE_TETS, zero_crossing};
use crate::{
    Error,
    eval::{Evaluator, PackedTree},
    region::Lattice,
};
use arrayvec::ArrayVec;
use log::debug;
use nalgebra::Vector3;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

/// Settings for marching tetrahedra
#[derive(Copy, Clone, Debug)]
pub struct TetraSettings {
    /// Place extra vertices on sharp edges and corners
    pub detect_features: bool,
    /// Normals whose dot product is below this value belong to different
    /// clusters when detecting features
    pub feature_cos: f32,
    /// Rounds of N-ary search when locating vertices
    pub refine: usize,
}

impl Default for TetraSettings {
    fn default() -> Self {
        Self {
            detect_features: false,
            feature_cos: 0.9,
            refine: 4,
        }
    }
}

/// Triangles generated within a single voxel
struct Patch {
    voxel: [u32; 3],
    tris: Range<usize>,
}

/// Builds a mesh by marching tetrahedra over every voxel of a lattice
pub fn triangulate_tree(
    tree: &PackedTree,
    lattice: &Lattice,
    settings: &TetraSettings,
    cancel: &AtomicBool,
) -> Result<Mesh, Error> {
    let mut m = Marcher {
        eval: Evaluator::new(tree),
        lattice,
        settings,
        verts: HashMap::new(),
        mesh: Mesh::new(),
        patches: vec![],
    };
    m.run(cancel)?;
    let pts = m.mesh.vertices.clone();
    m.mesh.normals = m.gradients(&pts);
    if settings.detect_features {
        m.features(cancel)?;
    }
    let mut mesh = m.mesh;
    drop_unused(&mut mesh);
    for n in mesh.normals.iter_mut() {
        let len = n.norm();
        if len > 0.0 {
            *n /= len;
        }
    }
    debug!(
        "marched {} triangles, {} vertices",
        mesh.triangles.len(),
        mesh.vertices.len()
    );
    Ok(mesh)
}

/// Returns the lattice index of a voxel corner (in octant order)
fn corner_index(voxel: [u32; 3], c: usize) -> [u32; 3] {
    [
        voxel[0] + (c >> 2 & 1) as u32,
        voxel[1] + (c >> 1 & 1) as u32,
        voxel[2] + (c & 1) as u32,
    ]
}

struct Marcher<'a> {
    eval: Evaluator<'a>,
    lattice: &'a Lattice,
    settings: &'a TetraSettings,
    verts: HashMap<([u32; 3], [u32; 3]), usize>,
    mesh: Mesh,
    patches: Vec<Patch>,
}

impl Marcher<'_> {
    /// Evaluates every lattice point with the given X index
    ///
    /// Results are indexed by `j * (nk + 1) + k`.
    fn plane(&mut self, i: usize) -> Vec<f32> {
        let x = self.lattice.axis(0)[i];
        let ys = self.lattice.axis(1);
        let zs = self.lattice.axis(2);
        let n = ys.len() * zs.len();
        let mut px = Vec::with_capacity(n);
        let mut py = Vec::with_capacity(n);
        let mut pz = Vec::with_capacity(n);
        for &y in ys {
            for &z in zs {
                px.push(x);
                py.push(y);
                pz.push(z);
            }
        }
        self.eval.eval_batch(&px, &py, &pz).to_vec()
    }

    fn run(&mut self, cancel: &AtomicBool) -> Result<(), Error> {
        let [ni, nj, nk] = self.lattice.resolution();
        let mut prev = self.plane(0);
        for i in 0..ni {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let next = self.plane(i + 1);
            for j in 0..nj {
                for k in 0..nk {
                    let d: [f32; 8] = std::array::from_fn(|c| {
                        let plane = if c & 4 != 0 { &next } else { &prev };
                        plane[(j + (c >> 1 & 1)) * (nk + 1) + k + (c & 1)]
                    });
                    if d.iter().all(|v| *v < 0.0) || d.iter().all(|v| *v >= 0.0)
                    {
                        continue;
                    }
                    let voxel = [i as u32, j as u32, k as u32];
                    let start = self.mesh.triangles.len();
                    for tet in CUBE_TETS {
                        self.tet(voxel, &d, tet);
                    }
                    let end = self.mesh.triangles.len();
                    if end > start {
                        self.patches.push(Patch {
                            voxel,
                            tris: start..end,
                        });
                    }
                }
            }
            prev = next;
        }
        Ok(())
    }

    fn tet(&mut self, voxel: [u32; 3], d: &[f32; 8], tet: [usize; 4]) {
        let inside: ArrayVec<usize, 4> =
            tet.iter().copied().filter(|c| d[*c] < 0.0).collect();
        let outside: ArrayVec<usize, 4> =
            tet.iter().copied().filter(|c| d[*c] >= 0.0).collect();
        let mut v = |a: usize, b: usize| self.vertex(voxel, d, a, b);
        let tris: ArrayVec<[usize; 3], 2> = match inside.len() {
            1 => [[
                v(inside[0], outside[0]),
                v(inside[0], outside[1]),
                v(inside[0], outside[2]),
            ]]
            .into_iter()
            .collect(),
            3 => [[
                v(inside[0], outside[0]),
                v(inside[1], outside[0]),
                v(inside[2], outside[0]),
            ]]
            .into_iter()
            .collect(),
            2 => {
                let (p, q) = (inside[0], inside[1]);
                let (r, s) = (outside[0], outside[1]);
                let quad = [v(p, r), v(p, s), v(q, s), v(q, r)];
                [[quad[0], quad[1], quad[2]], [quad[0], quad[2], quad[3]]]
                    .into_iter()
                    .collect()
            }
            _ => return,
        };

        // Orient triangles to face from the inside corners to the outside
        let centroid = |cs: &[usize]| {
            cs.iter()
                .map(|c| Vector3::from(self.lattice.pos(corner_index(voxel, *c))))
                .sum::<Vector3<f32>>()
                / cs.len() as f32
        };
        let dir = centroid(&outside) - centroid(&inside);
        for [a, b, c] in tris {
            let pa = self.mesh.vertices[a];
            let n = (self.mesh.vertices[b] - pa).cross(&(self.mesh.vertices[c] - pa));
            let t = if n.dot(&dir) < 0.0 { [a, c, b] } else { [a, b, c] };
            self.mesh.triangles.push(t.into());
        }
    }

    /// Looks up or creates the vertex between an inside and outside corner
    fn vertex(&mut self, voxel: [u32; 3], d: &[f32; 8], a: usize, b: usize) -> usize {
        let (ka, kb) = (corner_index(voxel, a), corner_index(voxel, b));
        let key = if ka < kb { (ka, kb) } else { (kb, ka) };
        if let Some(v) = self.verts.get(&key) {
            return *v;
        }
        let pa = Vector3::from(self.lattice.pos(ka));
        let pb = Vector3::from(self.lattice.pos(kb));
        let pos = zero_crossing(
            Some(&mut self.eval),
            self.settings.refine,
            (pa, d[a]),
            (pb, d[b]),
        );
        let i = self.mesh.vertices.len();
        self.mesh.vertices.push(pos);
        self.verts.insert(key, i);
        i
    }

    /// Returns the (unnormalized) field gradient at each point
    fn gradients(&mut self, pts: &[Vector3<f32>]) -> Vec<Vector3<f32>> {
        const CHUNK: usize = 256;
        let mut out = Vec::with_capacity(pts.len());
        for chunk in pts.chunks(CHUNK) {
            let xs: Vec<f32> = chunk.iter().map(|p| p.x).collect();
            let ys: Vec<f32> = chunk.iter().map(|p| p.y).collect();
            let zs: Vec<f32> = chunk.iter().map(|p| p.z).collect();
            let g = self.eval.eval_derivative(&xs, &ys, &zs);
            out.extend(g.iter().map(|g| g.xyz()));
        }
        out
    }

    /// Replaces patches that span sharp features with fans around a feature
    /// point
    fn features(&mut self, cancel: &AtomicBool) -> Result<(), Error> {
        let mut fans = HashMap::new();
        for (p, patch) in self.patches.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let tris = &self.mesh.triangles[patch.tris.clone()];
            let mut verts: Vec<usize> =
                tris.iter().flat_map(|t| t.iter().copied()).collect();
            verts.sort();
            verts.dedup();

            let mut clusters: Vec<Vector3<f32>> = vec![];
            for v in &verts {
                let Some(n) = self.mesh.normals[*v].try_normalize(1e-12) else {
                    continue;
                };
                if !clusters
                    .iter()
                    .any(|c| c.dot(&n) >= self.settings.feature_cos)
                {
                    clusters.push(n);
                }
            }
            if clusters.len() < 2 {
                continue;
            }
            let Some(boundary) = boundary_loop(tris) else {
                continue;
            };

            let mut qef = QuadraticErrorSolver::new();
            for v in &verts {
                qef.add(self.mesh.vertices[*v], self.mesh.normals[*v]);
            }
            let Some((pos, _err)) = qef.solve() else {
                continue;
            };
            if !pos.iter().all(|v| v.is_finite()) {
                continue;
            }
            let lo = Vector3::from(self.lattice.pos(patch.voxel));
            let hi = Vector3::from(self.lattice.pos(corner_index(patch.voxel, 7)));
            fans.insert(p, (pos.sup(&lo).inf(&hi), boundary));
        }

        let feature_points: Vec<Vector3<f32>> =
            fans.values().map(|(pos, _)| *pos).collect();
        debug!("placed {} feature points", feature_points.len());
        if feature_points.is_empty() {
            return Ok(());
        }

        let mut triangles = Vec::with_capacity(self.mesh.triangles.len());
        let mut prev_end = 0;
        for (p, patch) in self.patches.iter().enumerate() {
            triangles.extend_from_slice(&self.mesh.triangles[prev_end..patch.tris.start]);
            prev_end = patch.tris.end;
            match fans.get(&p) {
                Some((pos, boundary)) => {
                    let f = self.mesh.vertices.len();
                    self.mesh.vertices.push(*pos);
                    self.mesh.normals.push(Vector3::zeros());
                    triangles.extend(
                        boundary.iter().map(|&(a, b)| Vector3::new(a, b, f)),
                    );
                }
                None => triangles
                    .extend_from_slice(&self.mesh.triangles[patch.tris.clone()]),
            }
        }
        triangles.extend_from_slice(&self.mesh.triangles[prev_end..]);
        self.mesh.triangles = triangles;

        // Feature points were appended after every existing vertex
        let first = self.mesh.vertices.len() - feature_points.len();
        let pts = self.mesh.vertices[first..].to_vec();
        let normals = self.gradients(&pts);
        self.mesh.normals[first..].copy_from_slice(&normals);
        Ok(())
    }
}

/// Returns the directed boundary edges of a patch, in order, if they form a
/// single closed loop
fn boundary_loop(tris: &[Vector3<usize>]) -> Option<Vec<(usize, usize)>> {
    let edges: HashSet<(usize, usize)> = tris
        .iter()
        .flat_map(|t| (0..3).map(move |k| (t[k], t[(k + 1) % 3])))
        .collect();
    let mut next = HashMap::new();
    for &(a, b) in &edges {
        if !edges.contains(&(b, a)) && next.insert(a, b).is_some() {
            return None;
        }
    }
    let (&start, _) = next.iter().min()?;
    let mut out = Vec::with_capacity(next.len());
    let mut cur = start;
    loop {
        let n = *next.get(&cur)?;
        out.push((cur, n));
        cur = n;
        if cur == start {
            break;
        }
        if out.len() > next.len() {
            return None;
        }
    }
    (out.len() == next.len()).then_some(out)
}

/// Removes vertices that aren't referenced by any triangle
fn drop_unused(mesh: &mut Mesh) {
    let mut remap = vec![usize::MAX; mesh.vertices.len()];
    let mut vertices = vec![];
    let mut normals = vec![];
    for t in mesh.triangles.iter_mut() {
        for v in t.iter_mut() {
            if remap[*v] == usize::MAX {
                remap[*v] = vertices.len();
                vertices.push(mesh.vertices[*v]);
                normals.push(mesh.normals[*v]);
            }
            *v = remap[*v];
        }
    }
    mesh.vertices = vertices;
    mesh.normals = normals;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        context::{Context, Node},
        types::Interval,
    };

    fn lattice(n: usize) -> Lattice {
        let b = Interval::new(-1.0, 1.0);
        Lattice::new([b, b, b], [n, n, n]).unwrap()
    }

    fn sphere(ctx: &mut Context, r: f64) -> Node {
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let s = ctx.sqrt(s).unwrap();
        ctx.sub(s, r).unwrap()
    }

    /// Box with half-sizes (0.45, 0.41, 0.43)
    fn cuboid(ctx: &mut Context) -> Node {
        let mut out = None;
        for (v, h) in [(ctx.x(), 0.45), (ctx.y(), 0.41), (ctx.z(), 0.43)] {
            let a = ctx.abs(v).unwrap();
            let d = ctx.sub(a, h).unwrap();
            out = Some(match out {
                Some(prev) => ctx.max(prev, d).unwrap(),
                None => d,
            });
        }
        out.unwrap()
    }

    fn check_watertight(mesh: &Mesh) {
        let mut edges: HashMap<(usize, usize), usize> = HashMap::new();
        for t in &mesh.triangles {
            for k in 0..3 {
                *edges.entry((t[k], t[(k + 1) % 3])).or_default() += 1;
            }
        }
        for ((a, b), n) in &edges {
            assert_eq!(*n, 1, "edge {a} -> {b} used {n} times");
            assert_eq!(edges.get(&(*b, *a)), Some(&1), "edge {a} -> {b} is open");
        }
    }

    fn nearest(mesh: &Mesh, p: Vector3<f32>) -> f32 {
        mesh.vertices
            .iter()
            .map(|v| (v - p).norm())
            .fold(f32::INFINITY, f32::min)
    }

    #[test]
    fn test_sphere() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.6);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let cancel = AtomicBool::new(false);
        for detect_features in [false, true] {
            let settings = TetraSettings {
                detect_features,
                ..Default::default()
            };
            let mesh =
                triangulate_tree(&tree, &lattice(16), &settings, &cancel).unwrap();
            check_watertight(&mesh);
            for (p, n) in mesh.vertices.iter().zip(&mesh.normals) {
                assert!((p.norm() - 0.6).abs() < 1e-3, "{p}");
                assert!(n.dot(&p.normalize()) > 0.99, "{n} at {p}");
            }
            let expected = 4.0 / 3.0 * std::f32::consts::PI * 0.6f32.powi(3);
            let v = mesh.volume();
            assert!((v - expected).abs() / expected < 0.05, "{v} vs {expected}");
        }
    }

    #[test]
    fn test_sharp_corner() {
        let mut ctx = Context::new();
        let root = cuboid(&mut ctx);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let cancel = AtomicBool::new(false);
        let corner = Vector3::new(0.45, 0.41, 0.43);

        let plain = triangulate_tree(
            &tree,
            &lattice(16),
            &TetraSettings::default(),
            &cancel,
        )
        .unwrap();
        check_watertight(&plain);
        assert!(nearest(&plain, corner) > 0.02);

        let sharp = triangulate_tree(
            &tree,
            &lattice(16),
            &TetraSettings {
                detect_features: true,
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();
        check_watertight(&sharp);
        assert!(nearest(&sharp, corner) < 0.01);

        let expected = 8.0 * 0.45 * 0.41 * 0.43;
        assert!((sharp.volume() - expected).abs() < (plain.volume() - expected).abs());
    }

    #[test]
    fn test_boundary_loop() {
        // Two separate loops
        let tris = [Vector3::new(0, 1, 2), Vector3::new(3, 4, 5)];
        assert_eq!(boundary_loop(&tris), None);
        let tris = [
            Vector3::new(0, 1, 4),
            Vector3::new(1, 2, 4),
            Vector3::new(2, 3, 4),
            Vector3::new(3, 0, 4),
        ];
        assert_eq!(
            boundary_loop(&tris),
            Some(vec![(0, 1), (1, 2), (2, 3), (3, 0)])
        );
    }

    #[test]
    fn test_cancel() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.5);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let out = triangulate_tree(
            &tree,
            &lattice(8),
            &TetraSettings::default(),
            &AtomicBool::new(true),
        );
        assert!(matches!(out, Err(Error::Cancelled)));
    }
}
