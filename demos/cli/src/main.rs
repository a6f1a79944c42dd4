use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, info};

use asdf::{
    asdf::{Asdf, Encoding, Settings, build_asdf},
    context::Context,
    eval::PackedTree,
    mesh::{MeshSettings, TetraSettings, contour, triangulate, triangulate_tree},
    region::Lattice,
    render::{RenderConfig, ThreadPool, render_asdf, render_tree},
    types::Interval,
};

/// Builds, renders, and meshes adaptive distance fields
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Input file, either an expression in text format or a saved `.asdf`
    #[clap(short, long)]
    input: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Builds an ASDF and saves it to a file
    Build {
        #[clap(flatten)]
        lattice: LatticeSettings,

        /// Name of a `.asdf` file to write
        #[clap(short, long)]
        out: PathBuf,

        /// Sample encoding
        #[clap(long, value_enum, default_value_t = EncodingArg::I16)]
        encoding: EncodingArg,
    },

    /// Renders a height map
    Render {
        #[clap(flatten)]
        lattice: LatticeSettings,

        /// Name of a `.png` file to write
        #[clap(short, long)]
        out: Option<PathBuf>,

        /// Render with shading
        #[clap(long)]
        shaded: bool,

        /// Render surface normals as colors
        #[clap(long, conflicts_with = "shaded")]
        normals: bool,

        /// Number of threads to use
        #[clap(short, long)]
        threads: Option<NonZeroUsize>,
    },

    /// Builds a triangle mesh
    Mesh {
        #[clap(flatten)]
        lattice: LatticeSettings,

        /// Name of a `.stl` file to write
        #[clap(short, long)]
        out: Option<PathBuf>,

        /// Use marching tetrahedra on a uniform lattice, rather than
        /// marching squares on the ASDF
        #[clap(long)]
        tetra: bool,

        /// Detect sharp features (with `--tetra`)
        #[clap(long, requires = "tetra")]
        features: bool,
    },

    /// Extracts 2D contours from the bottom of the field
    Contour {
        #[clap(flatten)]
        lattice: LatticeSettings,

        /// Name of a text file to write, with one `x y` pair per line
        #[clap(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum EncodingArg {
    F32,
    I16,
}

#[derive(Parser)]
struct LatticeSettings {
    /// Half-size of the (centered) bounding box
    #[clap(short, long, default_value_t = 1.0)]
    bounds: f32,

    /// Voxels per axis
    #[clap(short, long, default_value_t = 128)]
    res: usize,

    /// Use a single voxel along Z (for 2D shapes)
    #[clap(long)]
    flat: bool,

    /// Don't merge leaf cells when building
    #[clap(long)]
    no_merge: bool,
}

impl LatticeSettings {
    fn lattice(&self) -> Result<Lattice> {
        let b = Interval::new(-self.bounds, self.bounds);
        let nz = if self.flat { 1 } else { self.res };
        Ok(Lattice::new([b, b, b], [self.res, self.res, nz])?)
    }

    fn settings(&self) -> Settings {
        Settings {
            merge_leaves: !self.no_merge,
            ..Default::default()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Input shape, either as an expression or a prebuilt field
enum Input {
    Tree(PackedTree),
    Asdf(Asdf),
}

impl Input {
    fn load(path: &PathBuf) -> Result<Self> {
        let now = Instant::now();
        let mut file = std::fs::File::open(path)?;
        let out = if path.extension().is_some_and(|e| e == "asdf") {
            let asdf = Asdf::read(&mut file)?;
            info!("Loaded ASDF ({}) in {:?}", asdf.stats(), now.elapsed());
            Input::Asdf(asdf)
        } else {
            let (ctx, root) = Context::from_text(&mut file)?;
            let tree = PackedTree::new(&ctx, root)?;
            info!("Loaded {} nodes in {:?}", tree.len(), now.elapsed());
            Input::Tree(tree)
        };
        Ok(out)
    }

    /// Returns an ASDF, building one if necessary
    fn into_asdf(
        self,
        lattice: &LatticeSettings,
        cancel: &AtomicBool,
    ) -> Result<Asdf> {
        match self {
            Input::Asdf(a) => Ok(a),
            Input::Tree(tree) => {
                let start = Instant::now();
                let asdf = build_asdf(
                    &tree,
                    &lattice.lattice()?,
                    &lattice.settings(),
                    cancel,
                )?;
                info!("Built ASDF ({}) in {:?}", asdf.stats(), start.elapsed());
                Ok(asdf)
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let input = Input::load(&args.input)?;
    let cancel = AtomicBool::new(false);

    match args.cmd {
        Command::Build {
            lattice,
            out,
            encoding,
        } => {
            let asdf = input.into_asdf(&lattice, &cancel)?;
            let encoding = match encoding {
                EncodingArg::F32 => Encoding::F32,
                EncodingArg::I16 => Encoding::I16,
            };
            info!("Writing ASDF to {out:?}");
            asdf.write_with(&mut std::fs::File::create(out)?, encoding)?;
        }
        Command::Render {
            lattice,
            out,
            shaded,
            normals,
            threads,
        } => {
            let global = ThreadPool::Global;
            let pool: Option<ThreadPool>;
            let threads = match threads {
                Some(n) if n.get() == 1 => None,
                Some(n) => {
                    pool = Some(ThreadPool::Custom(
                        rayon::ThreadPoolBuilder::new()
                            .num_threads(n.get())
                            .build()?,
                    ));
                    pool.as_ref()
                }
                None => Some(&global),
            };
            let progress = |f: f32| debug!("rendered {:.0}%", f * 100.0);
            let config = RenderConfig {
                shaded: shaded || normals,
                threads,
                progress: Some(&progress),
            };

            let start = Instant::now();
            let image = match &input {
                Input::Tree(tree) => {
                    render_tree(tree, &lattice.lattice()?, &config, &cancel)?
                }
                Input::Asdf(asdf) => render_asdf(asdf, &config, &cancel)?,
            };
            info!("Rendered in {:?}", start.elapsed());

            let z_max = image.depth.iter().max().cloned().unwrap_or(1).max(1);
            let pixel = |o: usize| -> [u8; 4] {
                if image.depth[o] == 0 {
                    return [0, 0, 0, 0];
                }
                if let Some(n) = image.normals.as_ref().filter(|_| normals) {
                    let [r, g, b] = n[o];
                    return [r, g, b, 255];
                }
                let v = match &image.shaded {
                    Some(s) => (s[o] >> 8) as u8,
                    None => (image.depth[o] as u32 * 255 / z_max as u32) as u8,
                };
                [v, v, v, 255]
            };
            // Flip rows so that +Y is up
            let width = image.width;
            let buffer: Vec<u8> = (0..image.height)
                .rev()
                .flat_map(|j| (0..width).map(move |i| j * width + i))
                .flat_map(pixel)
                .collect();

            if let Some(out) = out {
                info!("Writing image to {out:?}");
                image::save_buffer(
                    out,
                    &buffer,
                    image.width as u32,
                    image.height as u32,
                    image::ColorType::Rgba8,
                )?;
            }
        }
        Command::Mesh {
            lattice,
            out,
            tetra,
            features,
        } => {
            let start = Instant::now();
            let mesh = if tetra {
                let Input::Tree(tree) = &input else {
                    bail!("marching tetrahedra requires an expression input");
                };
                let settings = TetraSettings {
                    detect_features: features,
                    ..Default::default()
                };
                triangulate_tree(tree, &lattice.lattice()?, &settings, &cancel)?
            } else {
                let tree = match &input {
                    Input::Tree(t) => Some(t.clone()),
                    Input::Asdf(..) => None,
                };
                let mut asdf = input.into_asdf(&lattice, &cancel)?;
                triangulate(
                    &mut asdf,
                    tree.as_ref(),
                    &MeshSettings::default(),
                    &cancel,
                )?
            };
            info!(
                "Meshed {} triangles in {:?}",
                mesh.triangles.len(),
                start.elapsed()
            );
            if let Some(out) = out {
                info!("Writing STL to {out:?}");
                mesh.write_stl(&mut std::fs::File::create(out)?)?;
            }
        }
        Command::Contour { lattice, out } => {
            let start = Instant::now();
            let mut asdf = input.into_asdf(&lattice, &cancel)?;
            let contours = contour(&mut asdf, &cancel)?;
            info!("Found {} contours in {:?}", contours.len(), start.elapsed());
            if let Some(out) = out {
                info!("Writing contours to {out:?}");
                let mut f = std::io::BufWriter::new(std::fs::File::create(out)?);
                for c in &contours {
                    for p in &c.points {
                        writeln!(f, "{} {}", p.x, p.y)?;
                    }
                    if c.closed {
                        if let Some(p) = c.points.first() {
                            writeln!(f, "{} {}", p.x, p.y)?;
                        }
                    }
                    writeln!(f)?;
                }
            }
        }
    }

    Ok(())
}
