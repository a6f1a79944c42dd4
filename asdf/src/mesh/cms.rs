//! Cubical marching squares
//!
//! Each `Leaf` cell is contoured one face at a time with marching squares;
//! segments are then linked into closed loops around the cell, and loops are
//! triangulated. Vertices live on lattice edges. An edge is keyed by the
//! sub-edge (between adjacent known samples) holding its crossing, so cells
//! of different depths which share part of an edge share its vertex.
//!
//! Where a face is covered by finer cells, the coarse cell borrows their
//! segments on the shared plane, so both sides pass through the same
//! vertices. This only produces a watertight mesh after the tree has been
//! made consistent (see [`repair`](crate::asdf::repair)), which
//! [`triangulate`] does before extraction.
use super::{Mesh, tables, zero_crossing};
use crate::{
    Error,
    asdf::{
        Asdf, Cell, CellIndex, CellState, CornerCache, EdgeKey, Face,
        Neighbor, edge_crossings, edge_key, repair, same_face,
    },
    eval::{Evaluator, PackedTree},
};
use log::{debug, warn};
use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Settings for cubical marching squares
#[derive(Copy, Clone, Debug)]
pub struct MeshSettings {
    /// Rounds of N-ary search when locating vertices with an evaluator
    ///
    /// This is ignored if no tree is passed to [`triangulate`].
    pub refine: usize,

    /// Number of extraction attempts
    ///
    /// When extraction finds a cell whose loops don't close, that cell is
    /// split, the tree is repaired, and extraction runs again.
    pub max_attempts: usize,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            refine: 4,
            max_attempts: 4,
        }
    }
}

/// Builds a mesh from an [`Asdf`]
///
/// The tree is first made consistent with [`repair`], which may split cells.
/// If `tree` is provided, vertex positions are refined against the original
/// expression; otherwise, they're placed by linear interpolation of the
/// corner samples.
pub fn triangulate(
    asdf: &mut Asdf,
    tree: Option<&PackedTree>,
    settings: &MeshSettings,
    cancel: &AtomicBool,
) -> Result<Mesh, Error> {
    let attempts = settings.max_attempts.max(1);
    for attempt in 1..=attempts {
        repair(asdf, cancel)?;
        let mut m = Extractor::new(asdf, tree, settings);
        let Some(bad) = m.run(cancel)? else {
            let mesh = m.finish();
            debug!(
                "meshed {} triangles, {} vertices",
                mesh.triangles.len(),
                mesh.vertices.len()
            );
            return Ok(mesh);
        };
        warn!(
            "inconsistent topology in cell {:?} (attempt {attempt})",
            asdf.cell(bad).index
        );
        if !split_longest(asdf, bad) {
            return Err(Error::Inconsistent(attempt));
        }
    }
    Err(Error::Inconsistent(attempts))
}

/// Splits a cell in two along its longest axis
///
/// Returns `false` if the cell is a single voxel.
fn split_longest(asdf: &mut Asdf, i: CellIndex) -> bool {
    let c = asdf.cell(i);
    let Some(axis) = (0..3)
        .filter(|a| c.extent(*a) >= 2)
        .max_by_key(|a| (c.extent(*a), std::cmp::Reverse(*a)))
    else {
        return false;
    };
    let mut cache = asdf.corner_cache();
    asdf.split_cell(i, axis, &mut cache)
}

/// Returns the marching-squares segments for one face of a cell, as pairs of
/// face edges (numbered as in [`Face::corners`])
pub(crate) fn face_edges(cell: &Cell, face: Face) -> &'static [(usize, usize)] {
    let d = face.corners().map(|c| cell.d[c]);
    let mask = (0..4)
        .filter(|k| d[*k] < 0.0)
        .fold(0u8, |m, k| m | (1 << k));
    let connected = (mask == 5 || mask == 10) && face_center(d) < 0.0;
    tables::segments(mask, connected)
}

/// Returns the marching-squares segments for one face of a cell, as pairs of
/// lattice edges
pub(crate) fn face_segments(
    cell: &Cell,
    face: Face,
) -> impl Iterator<Item = (EdgeKey, EdgeKey)> + '_ {
    let corners = face.corners();
    let edge = move |k: usize| {
        edge_key(
            cell.corner_index(corners[k]),
            cell.corner_index(corners[(k + 1) % 4]),
        )
    };
    face_edges(cell, face)
        .iter()
        .map(move |&(a, b)| (edge(a), edge(b)))
}

struct Extractor<'a> {
    asdf: &'a Asdf,
    corners: CornerCache,
    eval: Option<Evaluator<'a>>,
    settings: &'a MeshSettings,
    verts: HashMap<EdgeKey, usize>,
    mesh: Mesh,
}

impl<'a> Extractor<'a> {
    fn new(
        asdf: &'a Asdf,
        tree: Option<&'a PackedTree>,
        settings: &'a MeshSettings,
    ) -> Self {
        Self {
            asdf,
            corners: asdf.corner_cache(),
            eval: tree.map(Evaluator::new),
            settings,
            verts: HashMap::new(),
            mesh: Mesh::new(),
        }
    }

    /// Contours every leaf, returning the first cell that couldn't be
    /// contoured (if any)
    fn run(&mut self, cancel: &AtomicBool) -> Result<Option<CellIndex>, Error> {
        let asdf = self.asdf;
        let mut out = Ok(None);
        asdf.for_each_with_neighbors(|i, neighbors| {
            if !matches!(out, Ok(None)) {
                return;
            }
            if cancel.load(Ordering::Relaxed) {
                out = Err(Error::Cancelled);
                return;
            }
            if asdf.cell(i).state != CellState::Leaf {
                return;
            }
            match self.cell(i, neighbors) {
                Ok(()) => (),
                Err(Error::Inconsistent(..)) => out = Ok(Some(i)),
                Err(e) => out = Err(e),
            }
        });
        out
    }

    /// Contours a single cell
    fn cell(
        &mut self,
        i: CellIndex,
        neighbors: &[Neighbor; 6],
    ) -> Result<(), Error> {
        let asdf = self.asdf;
        let cell = asdf.cell(i);
        let mut segs = vec![];
        for face in Face::all() {
            let n = &neighbors[face.index()];
            segs.extend(self.merge_faces(cell, face, n)?);
        }
        for lp in link_loops(&segs)? {
            self.record_normals(cell, &lp);
            self.triangulate_loop(cell, &lp);
        }
        Ok(())
    }

    /// Runs marching squares on one face, returning directed segments between
    /// vertex indexes
    fn gen_face(
        &mut self,
        cell: &Cell,
        face: Face,
    ) -> Result<Vec<(usize, usize)>, Error> {
        let mut out = vec![];
        for (a, b) in face_segments(cell, face) {
            out.push((self.vertex(a)?, self.vertex(b)?));
        }
        Ok(out)
    }

    /// Picks the segments for one face of a cell
    ///
    /// Where the far side is covered by finer cells within the face, their
    /// segments are used (reversed). Faces shared exactly with a neighbor
    /// must have the same segments in the opposite direction. Otherwise, the
    /// cell's own segments are used; these must be empty if the far side
    /// is finer but spills past the face.
    fn merge_faces(
        &mut self,
        cell: &Cell,
        face: Face,
        neighbor: &Neighbor,
    ) -> Result<Vec<(usize, usize)>, Error> {
        let asdf = self.asdf;
        match neighbor {
            Neighbor::Virtual(v) if v.nested_in(cell) => {
                let mut out = vec![];
                for (a, b) in v.segments() {
                    out.push((self.vertex(a)?, self.vertex(b)?));
                }
                Ok(out)
            }
            Neighbor::Virtual(v) => {
                let ours = self.gen_face(cell, face)?;
                if ours.is_empty() && v.segments().next().is_none() {
                    Ok(ours)
                } else {
                    Err(Error::Inconsistent(0))
                }
            }
            Neighbor::Real(n) if same_face(cell, asdf.cell(*n), face) => {
                let mut ours = self.gen_face(cell, face)?;
                let mut theirs: Vec<_> = self
                    .gen_face(asdf.cell(*n), face.opposite())?
                    .into_iter()
                    .map(|(a, b)| (b, a))
                    .collect();
                theirs.sort();
                ours.sort();
                if theirs == ours {
                    Ok(ours)
                } else {
                    Err(Error::Inconsistent(0))
                }
            }
            Neighbor::Real(..) | Neighbor::None => self.gen_face(cell, face),
        }
    }

    /// Looks up or creates the vertex on a lattice edge
    ///
    /// The edge must cross the surface exactly once.
    fn vertex(&mut self, (a, b): EdgeKey) -> Result<usize, Error> {
        let key = match edge_crossings(&self.corners, a, b)[..] {
            [k] => k,
            _ => return Err(Error::Inconsistent(0)),
        };
        if let Some(v) = self.verts.get(&key) {
            return Ok(*v);
        }
        let lattice = self.asdf.lattice();
        let sample = |k: [u32; 3]| -> Result<(Vector3<f32>, f32), Error> {
            let d = self.corners.get(&k).ok_or(Error::Inconsistent(0))?;
            Ok((Vector3::from(lattice.pos(k)), *d))
        };
        let (p, q) = (sample(key.0)?, sample(key.1)?);
        let (inside, outside) = if p.1 < 0.0 { (p, q) } else { (q, p) };
        let pos = zero_crossing(
            self.eval.as_mut(),
            self.settings.refine,
            inside,
            outside,
        );
        let i = self.mesh.vertices.len();
        self.mesh.vertices.push(pos);
        self.mesh.normals.push(Vector3::zeros());
        self.verts.insert(key, i);
        Ok(i)
    }

    /// Accumulates the field gradient at each vertex of a loop
    fn record_normals(&mut self, cell: &Cell, lp: &[usize]) {
        for &v in lp {
            let p = self.mesh.vertices[v];
            self.mesh.normals[v] += cell.gradient(p.into());
        }
    }

    /// Triangulates a single loop, adding a center vertex if it has more
    /// than three vertices
    fn triangulate_loop(&mut self, cell: &Cell, lp: &[usize]) {
        if let &[a, b, c] = lp {
            self.mesh.triangles.push(Vector3::new(a, b, c));
            return;
        }
        let center = lp
            .iter()
            .map(|v| self.mesh.vertices[*v])
            .sum::<Vector3<f32>>()
            / lp.len() as f32;
        let c = self.mesh.vertices.len();
        self.mesh.vertices.push(center);
        self.mesh.normals.push(cell.gradient(center.into()));
        for k in 0..lp.len() {
            let next = lp[(k + 1) % lp.len()];
            self.mesh.triangles.push(Vector3::new(lp[k], next, c));
        }
    }

    fn finish(self) -> Mesh {
        let mut mesh = self.mesh;
        for n in mesh.normals.iter_mut() {
            let len = n.norm();
            if len > 0.0 {
                *n /= len;
            }
        }
        mesh
    }
}

/// Returns the average of a face's corner samples
///
/// Samples are summed in sorted order, so that both cells sharing a face
/// make the same decision.
pub(super) fn face_center(mut d: [f32; 4]) -> f32 {
    d.sort_by(|a, b| a.total_cmp(b));
    d.iter().sum::<f32>() / 4.0
}

/// Links directed segments into closed loops
fn link_loops(segs: &[(usize, usize)]) -> Result<Vec<Vec<usize>>, Error> {
    let mut remaining = segs.to_vec();
    let mut out = vec![];
    while !remaining.is_empty() {
        let (start, mut cur) = remaining.swap_remove(0);
        let mut lp = vec![start];
        while cur != start {
            let k = remaining
                .iter()
                .position(|s| s.0 == cur)
                .ok_or(Error::Inconsistent(0))?;
            lp.push(cur);
            cur = remaining.swap_remove(k).1;
        }
        if lp.len() < 3 {
            return Err(Error::Inconsistent(0));
        }
        out.push(lp);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        asdf::{Settings, build_asdf, make_consistent},
        context::{Context, Node},
        region::Lattice,
        types::Interval,
    };
    use std::collections::HashSet;

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

    fn check_watertight(mesh: &Mesh) {
        let mut edges: HashMap<(usize, usize), usize> = HashMap::new();
        for t in &mesh.triangles {
            for k in 0..3 {
                let (a, b) = (t[k], t[(k + 1) % 3]);
                *edges.entry((a, b)).or_default() += 1;
            }
        }
        for ((a, b), n) in &edges {
            assert_eq!(*n, 1, "edge {a} -> {b} used {n} times");
            assert_eq!(edges.get(&(*b, *a)), Some(&1), "edge {a} -> {b} is open");
        }
    }

    /// Builds a single-cell tree over `[0, 1]³` sampling `z - 0.4`
    fn plane(res: [usize; 3]) -> Asdf {
        let b = Interval::new(0.0, 1.0);
        let mut asdf = Asdf::new(Lattice::new([b, b, b], res).unwrap());
        let root = asdf.root();
        let c = asdf.cell_mut(root);
        for corner in 0..8 {
            c.d[corner] = c.corner_pos(corner)[2] - 0.4;
        }
        c.state = CellState::from_samples(&c.d);
        asdf
    }

    fn children(asdf: &Asdf, i: CellIndex) -> [Option<CellIndex>; 8] {
        match asdf.cell(i).state {
            CellState::Branch(c) => c,
            s => panic!("not a branch: {s:?}"),
        }
    }

    #[test]
    fn test_cross_depth_face_shares_vertices() {
        // One cell on the -X side, facing two smaller cells on the +X side
        let mut asdf = plane([2, 2, 1]);
        let mut cache = asdf.corner_cache();
        let root = asdf.root();
        asdf.split_cell(root, 0, &mut cache);
        let hi = children(&asdf, root)[4].unwrap();
        asdf.split_cell(hi, 1, &mut cache);
        assert_eq!(make_consistent(&mut asdf, &mut cache), 0);
        assert_eq!(asdf.stats().leaf, 3);

        let cancel = AtomicBool::new(false);
        let mesh =
            triangulate(&mut asdf, None, &MeshSettings::default(), &cancel)
                .unwrap();
        assert_eq!(asdf.stats().leaf, 3);

        // The crossing in the middle of the shared face is a single vertex,
        // used by triangles on both sides
        let shared: Vec<usize> = (0..mesh.vertices.len())
            .filter(|i| {
                (mesh.vertices[*i] - Vector3::new(0.5, 0.5, 0.4)).norm() < 1e-5
            })
            .collect();
        assert_eq!(shared.len(), 1);
        let sides: HashSet<bool> = mesh
            .triangles
            .iter()
            .filter(|t| t.iter().any(|i| *i == shared[0]))
            .map(|t| t.iter().map(|i| mesh.vertices[*i].x).sum::<f32>() > 1.5)
            .collect();
        assert_eq!(sides.len(), 2);

        // Edges on the shared face are used once in each direction
        let mut edges: HashMap<(usize, usize), usize> = HashMap::new();
        for t in &mesh.triangles {
            for k in 0..3 {
                *edges.entry((t[k], t[(k + 1) % 3])).or_default() += 1;
            }
        }
        let on_face = |i: usize| mesh.vertices[i].x == 0.5;
        for (&(a, b), n) in &edges {
            assert_eq!(*n, 1);
            if on_face(a) && on_face(b) {
                assert_eq!(edges.get(&(b, a)), Some(&1), "edge {a} -> {b}");
            }
        }
    }

    #[test]
    fn test_split_longest() {
        let mut asdf = plane([4, 2, 1]);
        let root = asdf.root();
        assert!(split_longest(&mut asdf, root));
        let hi = children(&asdf, root)[4].unwrap();
        assert_eq!(asdf.cell(hi).index, [[2, 4], [0, 2], [0, 1]]);

        let mut asdf = plane([1, 1, 1]);
        let root = asdf.root();
        assert!(!split_longest(&mut asdf, root));
    }

    #[test]
    fn test_retry_stops_at_single_voxels() {
        // Two single-voxel cells which disagree about a shared corner can't
        // be fixed by splitting
        let mut asdf = plane([2, 1, 1]);
        let mut cache = asdf.corner_cache();
        let root = asdf.root();
        asdf.split_cell(root, 0, &mut cache);
        let hi = children(&asdf, root)[4].unwrap();
        asdf.cell_mut(hi).d[0] = 1.0;

        let settings = MeshSettings {
            max_attempts: 8,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let out = triangulate(&mut asdf, None, &settings, &cancel);
        assert!(matches!(out, Err(Error::Inconsistent(..))));
        assert_eq!(asdf.stats().leaf, 2);
    }

    #[test]
    fn test_link_loops() {
        let loops = link_loops(&[(1, 2), (5, 6), (2, 3), (6, 4), (3, 1), (4, 5)])
            .unwrap();
        assert_eq!(loops.len(), 2);
        assert!(loops.iter().all(|l| l.len() == 3));
        assert!(link_loops(&[(1, 2), (2, 3)]).is_err());
    }

    #[test]
    fn test_face_center() {
        assert_eq!(face_center([1.0, -2.0, 3.0, -0.5]), 0.375);
        assert_eq!(
            face_center([1e8, -1e8, 1.0, 0.0]),
            face_center([0.0, 1.0, -1e8, 1e8])
        );
    }

    #[test]
    fn test_sphere() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.6);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let b = Interval::new(-1.0, 1.0);
        let lattice = Lattice::new([b, b, b], [32, 32, 32]).unwrap();
        let cancel = AtomicBool::new(false);
        for merge_leaves in [false, true] {
            let settings = Settings {
                merge_leaves,
                ..Default::default()
            };
            let mut asdf = build_asdf(&tree, &lattice, &settings, &cancel).unwrap();
            let mesh =
                triangulate(&mut asdf, None, &MeshSettings::default(), &cancel)
                    .unwrap();
            assert!(!mesh.triangles.is_empty());
            check_watertight(&mesh);

            let expected = 4.0 / 3.0 * std::f32::consts::PI * 0.6f32.powi(3);
            let v = mesh.volume();
            assert!((v - expected).abs() / expected < 0.05, "{v} vs {expected}");

            let h = 2.0 / 32.0;
            for (p, n) in mesh.vertices.iter().zip(&mesh.normals) {
                assert!((p.norm() - 0.6).abs() < h, "{p}");
                assert!(n.dot(&p.normalize()) > 0.5, "{n} at {p}");
            }
        }
    }

    #[test]
    fn test_refined_vertices() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.55);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let b = Interval::new(-1.0, 1.0);
        let lattice = Lattice::new([b, b, b], [16, 16, 16]).unwrap();
        let cancel = AtomicBool::new(false);
        let mut asdf =
            build_asdf(&tree, &lattice, &Settings::default(), &cancel).unwrap();
        let settings = MeshSettings::default();
        let linear = triangulate(&mut asdf, None, &settings, &cancel).unwrap();
        let refined =
            triangulate(&mut asdf, Some(&tree), &settings, &cancel).unwrap();
        check_watertight(&refined);
        assert_eq!(linear.triangles, refined.triangles);

        let err = |m: &Mesh| -> f32 {
            m.vertices.iter().map(|p| (p.norm() - 0.55).abs()).sum()
        };
        assert!(err(&refined) < err(&linear));
    }

    #[test]
    fn test_cancel() {
        let mut ctx = Context::new();
        let root = sphere(&mut ctx, 0.5);
        let tree = PackedTree::new(&ctx, root).unwrap();
        let b = Interval::new(-1.0, 1.0);
        let lattice = Lattice::new([b, b, b], [8, 8, 8]).unwrap();
        let mut asdf = build_asdf(
            &tree,
            &lattice,
            &Settings::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        let out = triangulate(
            &mut asdf,
            None,
            &MeshSettings::default(),
            &AtomicBool::new(true),
        );
        assert!(matches!(out, Err(Error::Cancelled)));
    }
}
