//! Height-map rendering
//!
//! Images are rendered looking down the -Z axis: each pixel is one column of
//! the lattice, and stores the luminosity of the highest filled voxel (see
//! [`Region::l`]), or 0 if the column is empty.
//!
//! The image is divided into square tiles, which are rendered independently
//! (in parallel, if a thread pool is provided). Within a tile, rendering
//! recurses from the top of the lattice downwards, skipping any region whose
//! footprint is already covered by something higher.
use crate::{
    Error,
    asdf::{Asdf, CellIndex, CellState},
    eval::{Evaluator, PackedTree},
    region::{Lattice, Region},
};
use log::debug;
use nalgebra::Vector3;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Side length of a render tile, in pixels
const TILE_SIZE: usize = 64;

/// Regions with at most this many voxels are evaluated voxel-by-voxel
const MIN_VOLUME: usize = 64;

/// Thread pool to use for multithreaded rendering
///
/// Most users will use the global Rayon pool, but it's possible to provide your
/// own as well.
pub enum ThreadPool {
    /// User-provided pool
    Custom(rayon::ThreadPool),
    /// Global Rayon pool
    Global,
}

impl ThreadPool {
    /// Runs a function across the thread pool
    pub fn run<F: FnOnce() -> V + Send, V: Send>(&self, f: F) -> V {
        match self {
            ThreadPool::Custom(p) => p.install(f),
            ThreadPool::Global => f(),
        }
    }

    /// Returns the number of threads in the pool
    pub fn thread_count(&self) -> usize {
        match self {
            ThreadPool::Custom(p) => p.current_num_threads(),
            ThreadPool::Global => rayon::current_num_threads(),
        }
    }
}

/// Settings for rendering
#[derive(Copy, Clone)]
pub struct RenderConfig<'a> {
    /// Also compute normals and a shaded image
    pub shaded: bool,

    /// Thread pool, or `None` to render in the calling thread
    pub threads: Option<&'a ThreadPool>,

    /// Called with the fraction of tiles completed, after each tile
    pub progress: Option<&'a (dyn Fn(f32) + Sync)>,
}

impl Default for RenderConfig<'_> {
    fn default() -> Self {
        Self {
            shaded: false,
            threads: Some(&ThreadPool::Global),
            progress: None,
        }
    }
}

/// Rendered output
///
/// Pixels are stored in rows of increasing Y, i.e. pixel `(i, j)` is at index
/// `j * width + i`.
#[derive(Clone, Debug)]
pub struct Image {
    /// Width in pixels (the number of X voxels)
    pub width: usize,
    /// Height in pixels (the number of Y voxels)
    pub height: usize,
    /// Height map, as luminosity (0 is empty)
    pub depth: Vec<u16>,
    /// Shaded image, if requested
    pub shaded: Option<Vec<u16>>,
    /// Surface normals encoded as RGB, if requested
    pub normals: Option<Vec<[u8; 3]>>,
}

impl Image {
    /// Returns the depth of a single pixel
    pub fn depth_at(&self, i: usize, j: usize) -> u16 {
        self.depth[j * self.width + i]
    }
}

/// Renders a tree over the given lattice
pub fn render_tree(
    tree: &PackedTree,
    lattice: &Lattice,
    config: &RenderConfig,
    cancel: &AtomicBool,
) -> Result<Image, Error> {
    let full = lattice.region();
    render_tiles(
        lattice.resolution(),
        config,
        || Evaluator::new(tree),
        |eval, tile| {
            let r = Region {
                imin: tile.imin,
                jmin: tile.jmin,
                x: &full.x[tile.imin..=tile.imin + tile.ni],
                y: &full.y[tile.jmin..=tile.jmin + tile.nj],
                ..full
            };
            recurse_tree(eval, tile, r, cancel)
        },
    )
}

/// Renders an [`Asdf`] over its own lattice
///
/// Leaf cells are sampled at voxel centers with trilinear interpolation.
pub fn render_asdf(
    asdf: &Asdf,
    config: &RenderConfig,
    cancel: &AtomicBool,
) -> Result<Image, Error> {
    let l = asdf.lattice().region().l;
    render_tiles(
        asdf.lattice().resolution(),
        config,
        || (),
        |_, tile| recurse_asdf(asdf, tile, asdf.root(), l, cancel),
    )
}

////////////////////////////////////////////////////////////////////////////////

/// Pixel data for a single tile
struct Tile {
    imin: usize,
    jmin: usize,
    ni: usize,
    nj: usize,
    shaded: bool,
    depth: Vec<u16>,
    normals: Vec<Vector3<f32>>,
}

impl Tile {
    fn new(imin: usize, jmin: usize, ni: usize, nj: usize, shaded: bool) -> Self {
        Self {
            imin,
            jmin,
            ni,
            nj,
            shaded,
            depth: vec![0; ni * nj],
            normals: if shaded {
                vec![Vector3::zeros(); ni * nj]
            } else {
                vec![]
            },
        }
    }

    /// Clips a range of global X and Y voxel indexes to this tile, returning
    /// tile-local ranges
    fn clip(
        &self,
        x: [usize; 2],
        y: [usize; 2],
    ) -> Option<(std::ops::Range<usize>, std::ops::Range<usize>)> {
        let i0 = x[0].max(self.imin) - self.imin;
        let i1 = x[1].min(self.imin + self.ni).saturating_sub(self.imin);
        let j0 = y[0].max(self.jmin) - self.jmin;
        let j1 = y[1].min(self.jmin + self.nj).saturating_sub(self.jmin);
        (i0 < i1 && j0 < j1).then_some((i0..i1, j0..j1))
    }

    /// Checks whether every pixel in a footprint is at or above `z`
    fn covered(&self, x: [usize; 2], y: [usize; 2], z: u16) -> bool {
        let Some((is, js)) = self.clip(x, y) else {
            return true;
        };
        js.into_iter().all(|j| {
            is.clone().all(|i| self.depth[j * self.ni + i] >= z)
        })
    }

    /// Raises every pixel in a footprint to at least `z`
    fn fill(&mut self, x: [usize; 2], y: [usize; 2], z: u16) {
        let Some((is, js)) = self.clip(x, y) else {
            return;
        };
        for j in js {
            for i in is.clone() {
                self.set_local(i, j, z, Vector3::z());
            }
        }
    }

    /// Sets a pixel (in global coordinates) if `z` is above its current value
    fn set(&mut self, i: usize, j: usize, z: u16, normal: Vector3<f32>) {
        self.set_local(i - self.imin, j - self.jmin, z, normal);
    }

    fn set_local(&mut self, i: usize, j: usize, z: u16, normal: Vector3<f32>) {
        let o = j * self.ni + i;
        if z > self.depth[o] {
            self.depth[o] = z;
            if self.shaded {
                self.normals[o] = normal;
            }
        }
    }
}

fn region_x(r: &Region) -> [usize; 2] {
    [r.imin, r.imin + r.ni()]
}

fn region_y(r: &Region) -> [usize; 2] {
    [r.jmin, r.jmin + r.nj()]
}

/// Splits the image into tiles, renders each one, and assembles the result
fn render_tiles<W, I, F>(
    res: [usize; 3],
    config: &RenderConfig,
    init: I,
    render: F,
) -> Result<Image, Error>
where
    I: Fn() -> W + Send + Sync,
    F: Fn(&mut W, &mut Tile) -> Result<(), Error> + Send + Sync,
{
    use rayon::prelude::*;

    let [width, height, _] = res;
    let mut tiles = vec![];
    for j in (0..height).step_by(TILE_SIZE) {
        for i in (0..width).step_by(TILE_SIZE) {
            tiles.push(Tile::new(
                i,
                j,
                TILE_SIZE.min(width - i),
                TILE_SIZE.min(height - j),
                config.shaded,
            ));
        }
    }

    let total = tiles.len();
    let done = AtomicUsize::new(0);
    let progress = config.progress;
    let report = || {
        if let Some(f) = progress {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            f(n as f32 / total as f32);
        }
    };

    let tiles = match config.threads {
        None => {
            let mut w = init();
            tiles
                .into_iter()
                .map(|mut tile| {
                    render(&mut w, &mut tile)?;
                    report();
                    Ok(tile)
                })
                .collect::<Result<Vec<_>, Error>>()?
        }
        Some(p) => p.run(|| {
            tiles
                .into_par_iter()
                .map_init(&init, |w, mut tile| {
                    render(w, &mut tile)?;
                    report();
                    Ok(tile)
                })
                .collect::<Result<Vec<_>, Error>>()
        })?,
    };
    debug!("rendered {} tiles", tiles.len());

    let mut depth = vec![0; width * height];
    let n = if config.shaded { width * height } else { 0 };
    let mut normals = vec![Vector3::zeros(); n];
    for tile in tiles {
        for j in 0..tile.nj {
            let src = j * tile.ni;
            let dst = (tile.jmin + j) * width + tile.imin;
            depth[dst..dst + tile.ni]
                .copy_from_slice(&tile.depth[src..src + tile.ni]);
            if config.shaded {
                normals[dst..dst + tile.ni]
                    .copy_from_slice(&tile.normals[src..src + tile.ni]);
            }
        }
    }

    let (shaded, normals) = if config.shaded {
        let shaded = depth
            .iter()
            .zip(&normals)
            .map(|(d, n)| if *d > 0 { shade(*n) } else { 0 })
            .collect();
        let normals = depth
            .iter()
            .zip(&normals)
            .map(|(d, n)| {
                if *d > 0 { to_rgb(*n) } else { [0; 3] }
            })
            .collect();
        (Some(shaded), Some(normals))
    } else {
        (None, None)
    };
    Ok(Image {
        width,
        height,
        depth,
        shaded,
        normals,
    })
}

/// Computes a lighting intensity from a surface normal
fn shade(n: Vector3<f32>) -> u16 {
    let Some(n) = n.try_normalize(1e-12) else {
        return 0;
    };
    let lights = [
        (Vector3::new(5.0, -5.0, 10.0), 0.5),
        (Vector3::new(-5.0, 0.0, 10.0), 0.15),
        (Vector3::new(0.0, -5.0, 10.0), 0.15),
    ];
    let mut accum = 0.2; // ambient
    for (dir, weight) in lights {
        accum += dir.normalize().dot(&n).max(0.0) * weight;
    }
    (accum.clamp(0.0, 1.0) * u16::MAX as f32) as u16
}

/// Encodes a normal as an RGB color, mapping `[-1, 1]` to `[0, 255]`
fn to_rgb(n: Vector3<f32>) -> [u8; 3] {
    match n.try_normalize(1e-12) {
        Some(n) => n.map(|v| ((v + 1.0) / 2.0 * 255.0).round() as u8).into(),
        None => [0; 3],
    }
}

////////////////////////////////////////////////////////////////////////////////

fn recurse_tree(
    eval: &mut Evaluator,
    tile: &mut Tile,
    r: Region,
    cancel: &AtomicBool,
) -> Result<(), Error> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }
    let top = r.l[r.nk()];
    if tile.covered(region_x(&r), region_y(&r), top) {
        return Ok(());
    }
    if r.volume() <= MIN_VOLUME {
        voxels(eval, tile, &r);
        return Ok(());
    }

    let i = eval.eval_interval_region(&r);
    if i.upper() < 0.0 {
        tile.fill(region_x(&r), region_y(&r), top);
        return Ok(());
    } else if i.lower() >= 0.0 {
        return Ok(());
    }

    let mut p = eval.prune();
    match r.bisect() {
        Some((lo, hi)) => {
            // Render the upper half first, so the lower half can be skipped
            recurse_tree(&mut p, tile, hi, cancel)?;
            recurse_tree(&mut p, tile, lo, cancel)
        }
        None => {
            voxels(&mut p, tile, &r);
            Ok(())
        }
    }
}

/// Evaluates every voxel center in a region, keeping the highest filled
/// voxel in each column
fn voxels(eval: &mut Evaluator, tile: &mut Tile, r: &Region) {
    let [ni, nj, nk] = r.size();
    let center = |s: &[f32], i: usize| (s[i] + s[i + 1]) / 2.0;
    let mut xs = Vec::with_capacity(r.volume());
    let mut ys = Vec::with_capacity(r.volume());
    let mut zs = Vec::with_capacity(r.volume());
    for i in 0..ni {
        for j in 0..nj {
            for k in 0..nk {
                xs.push(center(r.x, i));
                ys.push(center(r.y, j));
                zs.push(center(r.z, k));
            }
        }
    }

    let mut hits = vec![];
    let out = eval.eval_batch(&xs, &ys, &zs);
    for i in 0..ni {
        for j in 0..nj {
            let col = &out[(i * nj + j) * nk..][..nk];
            if let Some(k) = col.iter().rposition(|v| *v < 0.0) {
                hits.push((i, j, k));
            }
        }
    }

    let normals: Vec<Vector3<f32>> = if tile.shaded && !hits.is_empty() {
        let px: Vec<f32> = hits.iter().map(|(i, _, _)| center(r.x, *i)).collect();
        let py: Vec<f32> = hits.iter().map(|(_, j, _)| center(r.y, *j)).collect();
        let pz: Vec<f32> = hits.iter().map(|(_, _, k)| center(r.z, *k)).collect();
        eval.eval_derivative(&px, &py, &pz)
            .iter()
            .map(|g| g.xyz())
            .collect()
    } else {
        vec![Vector3::zeros(); hits.len()]
    };
    for ((i, j, k), n) in hits.into_iter().zip(normals) {
        tile.set(r.imin + i, r.jmin + j, r.l[k + 1], n);
    }
}

/// Children in the order they're rendered (upper Z first)
const RENDER_ORDER: [usize; 8] = [1, 3, 5, 7, 0, 2, 4, 6];

fn recurse_asdf(
    asdf: &Asdf,
    tile: &mut Tile,
    i: CellIndex,
    l: &[u16],
    cancel: &AtomicBool,
) -> Result<(), Error> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }
    let cell = asdf.cell(i);
    let [x, y, z] = cell.index.map(|[lo, hi]| [lo as usize, hi as usize]);
    let top = l[z[1]];
    if tile.covered(x, y, top) {
        return Ok(());
    }
    match &cell.state {
        CellState::Empty => (),
        CellState::Filled => tile.fill(x, y, top),
        CellState::Leaf => {
            let lattice = asdf.lattice();
            let center = |a: usize, i: usize| {
                let s = lattice.axis(a);
                (s[i] + s[i + 1]) / 2.0
            };
            let Some((is, js)) = tile.clip(x, y) else {
                return Ok(());
            };
            for j in js {
                for i in is.clone() {
                    let (gi, gj) = (i + tile.imin, j + tile.jmin);
                    for k in (z[0]..z[1]).rev() {
                        let p = [center(0, gi), center(1, gj), center(2, k)];
                        if cell.interpolate(p) < 0.0 {
                            tile.set(gi, gj, l[k + 1], cell.gradient(p));
                            break;
                        }
                    }
                }
            }
        }
        CellState::Branch(children) => {
            for c in RENDER_ORDER {
                if let Some(child) = children[c] {
                    recurse_asdf(asdf, tile, child, l, cancel)?;
                }
            }
        }
    }
    Ok(())
}
