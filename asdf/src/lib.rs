//! Adaptive signed-distance fields for closed-form implicit surfaces
//!
//! A shape is written as an expression in a [`Context`](context::Context),
//! where negative values are inside the shape. From there, it can be
//! - built into an [`Asdf`](asdf::Asdf), an octree of distance samples that
//!   is only subdivided near the surface
//! - rendered into a height map with [`render`]
//! - triangulated into a watertight [`Mesh`](mesh::Mesh), either from an
//!   [`Asdf`](asdf::Asdf) or directly from the expression
//!
//! ```
//! use asdf::{
//!     asdf::{Settings, build_asdf},
//!     context::Context,
//!     eval::PackedTree,
//!     mesh::{MeshSettings, triangulate},
//!     region::Lattice,
//!     types::Interval,
//! };
//! use std::sync::atomic::AtomicBool;
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let z = ctx.z();
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let z2 = ctx.square(z)?;
//! let r = ctx.add(x2, y2)?;
//! let r = ctx.add(r, z2)?;
//! let r = ctx.sqrt(r)?;
//! let sphere = ctx.sub(r, 0.5)?;
//!
//! let tree = PackedTree::new(&ctx, sphere)?;
//! let b = Interval::new(-1.0, 1.0);
//! let lattice = Lattice::new([b, b, b], [32, 32, 32])?;
//! let cancel = AtomicBool::new(false);
//!
//! let mut asdf = build_asdf(&tree, &lattice, &Settings::default(), &cancel)?;
//! assert!(asdf.sample(0.0, 0.0, 0.0) < 0.0);
//! assert!(asdf.sample(0.9, 0.9, 0.9) > 0.0);
//!
//! let mesh = triangulate(&mut asdf, None, &MeshSettings::default(), &cancel)?;
//! assert!(!mesh.triangles.is_empty());
//! # Ok::<(), asdf::Error>(())
//! ```
pub mod asdf;
pub mod context;
pub mod eval;
pub mod mesh;
pub mod region;
pub mod render;
pub mod types;

mod error;

pub use error::Error;
