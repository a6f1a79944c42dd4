use asdf::{
    Error,
    asdf::{Asdf, CellState, Encoding, Settings, build_asdf},
    context::{Context, Node},
    eval::{Evaluator, PackedTree},
    mesh::{Mesh, MeshSettings, triangulate},
    region::Lattice,
    types::Interval,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

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

fn torus(ctx: &mut Context) -> Node {
    let x = ctx.x();
    let y = ctx.y();
    let z = ctx.z();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let xy = ctx.add(x2, y2).unwrap();
    let xy = ctx.sqrt(xy).unwrap();
    let q = ctx.sub(xy, 0.55).unwrap();
    let q2 = ctx.square(q).unwrap();
    let z2 = ctx.square(z).unwrap();
    let d = ctx.add(q2, z2).unwrap();
    let d = ctx.sqrt(d).unwrap();
    ctx.sub(d, 0.2).unwrap()
}

fn cube_lattice(n: usize) -> Lattice {
    let b = Interval::new(-1.0, 1.0);
    Lattice::new([b, b, b], [n, n, n]).unwrap()
}

fn build(tree: &PackedTree, lattice: &Lattice, merge_leaves: bool) -> Asdf {
    let settings = Settings {
        merge_leaves,
        ..Default::default()
    };
    build_asdf(tree, lattice, &settings, &AtomicBool::new(false)).unwrap()
}

/// Checks that every directed edge is used once, and its reverse once
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

#[test]
fn sphere_cells() {
    let mut ctx = Context::new();
    let root = sphere(&mut ctx, 0.5);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let asdf = build(&tree, &cube_lattice(32), true);

    let core = asdf.find([0.01, 0.01, 0.01]);
    assert_eq!(asdf.cell(core).state, CellState::Filled);
    let corner = asdf.find([0.95, 0.95, 0.95]);
    assert_eq!(asdf.cell(corner).state, CellState::Empty);

    let mut leaves = 0;
    for i in asdf.terminals() {
        let cell = asdf.cell(i);
        if cell.state != CellState::Leaf {
            continue;
        }
        leaves += 1;
        let center = cell.bounds.map(|b| (b.lower() + b.upper()) / 2.0);
        let diag = cell
            .bounds
            .iter()
            .map(|b| b.width().powi(2))
            .sum::<f32>()
            .sqrt();
        let r = center.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((r - 0.5).abs() <= diag, "leaf at {center:?} is off the surface");
    }
    assert!(leaves > 0);
}

#[test]
fn cylinder_not_split_along_z() {
    let mut ctx = Context::new();
    let x = ctx.x();
    let y = ctx.y();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let r = ctx.add(x2, y2).unwrap();
    let r = ctx.sqrt(r).unwrap();
    let root = ctx.sub(r, 0.5).unwrap();
    let tree = PackedTree::new(&ctx, root).unwrap();
    let asdf = build(&tree, &cube_lattice(32), true);
    for i in asdf.reachable() {
        assert_eq!(asdf.cell(i).index[2], [0, 32]);
    }
}

#[test]
fn sampling_agrees_with_evaluator() {
    let mut ctx = Context::new();
    let root = torus(&mut ctx);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let lattice = cube_lattice(16);
    let asdf = build(&tree, &lattice, false);
    let mut eval = Evaluator::new(&tree);

    for i in 0..=16u32 {
        for j in 0..=16u32 {
            for k in 0..=16u32 {
                let p = lattice.pos([i, j, k]);
                let expected = eval.eval_scalar(p[0], p[1], p[2]);
                let cell = asdf.cell(asdf.find(p));
                let actual = asdf.sample(p[0], p[1], p[2]);
                if (0..8).any(|c| cell.corner_index(c) == [i, j, k]) {
                    assert_eq!(actual, expected, "at {p:?}");
                } else if cell.state != CellState::Leaf {
                    assert_eq!(actual < 0.0, expected < 0.0, "at {p:?}");
                }
            }
        }
    }
}

#[test]
fn simplify_is_idempotent() {
    let mut ctx = Context::new();
    let root = torus(&mut ctx);
    let tree = PackedTree::new(&ctx, root).unwrap();
    for merge_leaves in [false, true] {
        let mut asdf = build(&tree, &cube_lattice(32), merge_leaves);
        let before = asdf.stats();
        assert_eq!(asdf.simplify(merge_leaves), 0);
        assert_eq!(asdf.stats(), before);
    }
}

#[test]
fn torus_is_watertight() {
    let mut ctx = Context::new();
    let root = torus(&mut ctx);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let cancel = AtomicBool::new(false);
    for merge_leaves in [false, true] {
        let mut asdf = build(&tree, &cube_lattice(64), merge_leaves);
        let mesh =
            triangulate(&mut asdf, Some(&tree), &MeshSettings::default(), &cancel)
                .unwrap();
        check_watertight(&mesh);
        // Volume of a torus is 2π²Rr²
        let expected = 2.0 * std::f32::consts::PI.powi(2) * 0.55 * 0.2f32.powi(2);
        let v = mesh.volume();
        assert!((v - expected).abs() / expected < 0.05, "{v} vs {expected}");
    }
}

#[test]
fn cross_depth_neighbors_share_vertices() {
    // A sphere that's off-center relative to the octree, so that merged
    // leaves end up next to unmerged ones
    let mut ctx = Context::new();
    let x = ctx.x();
    let x = ctx.sub(x, 0.13).unwrap();
    let y = ctx.y();
    let y = ctx.add(y, 0.07).unwrap();
    let z = ctx.z();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let z2 = ctx.square(z).unwrap();
    let s = ctx.add(x2, y2).unwrap();
    let s = ctx.add(s, z2).unwrap();
    let s = ctx.sqrt(s).unwrap();
    let root = ctx.sub(s, 0.7).unwrap();
    let tree = PackedTree::new(&ctx, root).unwrap();
    let mut asdf = build(&tree, &cube_lattice(64), true);

    let cancel = AtomicBool::new(false);
    let mesh =
        triangulate(&mut asdf, None, &MeshSettings::default(), &cancel).unwrap();

    let sizes: std::collections::HashSet<_> = asdf
        .terminals()
        .into_iter()
        .map(|i| asdf.cell(i))
        .filter(|c| c.state == CellState::Leaf)
        .map(|c| c.voxels())
        .collect();
    assert!(sizes.len() > 1, "expected leaves at several depths");
    check_watertight(&mesh);
}

#[test]
fn merged_leaves_survive_meshing() {
    let mut ctx = Context::new();
    let root = torus(&mut ctx);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let cancel = AtomicBool::new(false);
    let leaf_sizes = |asdf: &Asdf| -> Vec<u64> {
        let mut out: Vec<u64> = asdf
            .terminals()
            .into_iter()
            .map(|i| asdf.cell(i))
            .filter(|c| c.state == CellState::Leaf)
            .map(|c| c.voxels())
            .collect();
        out.sort();
        out.dedup();
        out
    };

    let mut flat = build(&tree, &cube_lattice(64), false);
    triangulate(&mut flat, None, &MeshSettings::default(), &cancel).unwrap();

    let mut merged = build(&tree, &cube_lattice(64), true);
    assert!(leaf_sizes(&merged).len() > 1);
    let mesh =
        triangulate(&mut merged, None, &MeshSettings::default(), &cancel)
            .unwrap();
    check_watertight(&mesh);
    assert!(leaf_sizes(&merged).len() > 1, "merged leaves were split");
    assert!(merged.stats().leaf < flat.stats().leaf);
}

#[test]
fn file_round_trip_meshes_identically() {
    let mut ctx = Context::new();
    let root = torus(&mut ctx);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let cancel = AtomicBool::new(false);
    let asdf = build(&tree, &cube_lattice(24), true);

    let mut buf = vec![];
    asdf.write_with(&mut buf, Encoding::F32).unwrap();
    let mut loaded = Asdf::read(&mut buf.as_slice()).unwrap();
    assert_eq!(loaded.stats(), asdf.stats());

    let mut original = asdf;
    let settings = MeshSettings::default();
    let a = triangulate(&mut original, None, &settings, &cancel).unwrap();
    let b = triangulate(&mut loaded, None, &settings, &cancel).unwrap();
    assert_eq!(a.triangles, b.triangles);
    assert_eq!(a.vertices, b.vertices);

    let mut mesh_buf = vec![];
    a.write(&mut mesh_buf).unwrap();
    let c = Mesh::read(&mut mesh_buf.as_slice()).unwrap();
    assert_eq!(c.triangles, a.triangles);
}

#[test]
fn cancelled_build() {
    let mut ctx = Context::new();
    let root = sphere(&mut ctx, 0.5);
    let tree = PackedTree::new(&ctx, root).unwrap();
    let out = build_asdf(
        &tree,
        &cube_lattice(32),
        &Settings::default(),
        &AtomicBool::new(true),
    );
    assert!(matches!(out, Err(Error::Cancelled)));
}
