use asdf::{
    asdf::{Settings, build_asdf},
    context::Context,
    eval::PackedTree,
    mesh::{MeshSettings, TetraSettings, triangulate, triangulate_tree},
    region::Lattice,
    render::{RenderConfig, ThreadPool, render_asdf, render_tree},
    types::Interval,
};
use criterion::{
    BenchmarkId, Criterion, black_box, criterion_group, criterion_main,
};
use std::sync::atomic::AtomicBool;

fn sphere() -> PackedTree {
    let mut ctx = Context::new();
    let x = ctx.x();
    let y = ctx.y();
    let z = ctx.z();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let z2 = ctx.square(z).unwrap();
    let s = ctx.add(x2, y2).unwrap();
    let s = ctx.add(s, z2).unwrap();
    let s = ctx.sqrt(s).unwrap();
    let root = ctx.sub(s, 0.6).unwrap();
    PackedTree::new(&ctx, root).unwrap()
}

fn lattice(n: usize) -> Lattice {
    let b = Interval::new(-1.0, 1.0);
    Lattice::new([b, b, b], [n, n, n]).unwrap()
}

pub fn build(c: &mut Criterion) {
    let tree = &sphere();
    let cancel = &AtomicBool::new(false);
    let mut group = c.benchmark_group("build");
    for n in [32, 64, 128] {
        let lattice = &lattice(n);
        group.bench_function(BenchmarkId::new("sphere", n), |b| {
            b.iter(|| {
                black_box(
                    build_asdf(tree, lattice, &Settings::default(), cancel)
                        .unwrap(),
                )
            })
        });
    }
}

pub fn mesh(c: &mut Criterion) {
    let tree = &sphere();
    let cancel = &AtomicBool::new(false);
    let mut group = c.benchmark_group("mesh");
    for n in [32, 64] {
        let lattice = &lattice(n);
        let asdf =
            build_asdf(tree, lattice, &Settings::default(), cancel).unwrap();
        group.bench_function(BenchmarkId::new("cms", n), |b| {
            b.iter(|| {
                let mut a = asdf.clone();
                black_box(
                    triangulate(&mut a, None, &MeshSettings::default(), cancel)
                        .unwrap(),
                )
            })
        });
        group.bench_function(BenchmarkId::new("tetra", n), |b| {
            b.iter(|| {
                black_box(
                    triangulate_tree(
                        tree,
                        lattice,
                        &TetraSettings::default(),
                        cancel,
                    )
                    .unwrap(),
                )
            })
        });
    }
}

pub fn render(c: &mut Criterion) {
    let tree = &sphere();
    let cancel = &AtomicBool::new(false);
    let lattice = &lattice(256);
    let asdf =
        &build_asdf(tree, lattice, &Settings::default(), cancel).unwrap();

    let mut group = c.benchmark_group("render");
    for threads in [1, 4, 8] {
        let pool = &ThreadPool::Custom(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap(),
        );
        let config = &RenderConfig {
            shaded: true,
            threads: Some(pool),
            progress: None,
        };
        group.bench_function(BenchmarkId::new("tree", threads), |b| {
            b.iter(|| black_box(render_tree(tree, lattice, config, cancel)))
        });
        group.bench_function(BenchmarkId::new("asdf", threads), |b| {
            b.iter(|| black_box(render_asdf(asdf, config, cancel)))
        });
    }
}

criterion_group!(benches, build, mesh, render);
criterion_main!(benches);
