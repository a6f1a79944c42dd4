//! Rectangular sampling lattices
//!
//! A [`Lattice`] owns the coordinate arrays for a voxel grid; a [`Region`] is
//! a cheap, copyable view of some sub-box of that grid. Subdividing a region
//! never reallocates: children borrow slices of their parent's arrays.
use crate::{Error, types::Interval};

/// Owned coordinate arrays for a voxel grid
///
/// Coordinate arrays store cell *boundaries*, so an axis with `n` voxels has
/// `n + 1` coordinates.
#[derive(Clone, Debug)]
pub struct Lattice {
    x: Vec<f32>,
    y: Vec<f32>,
    z: Vec<f32>,
    l: Vec<u16>,
}

impl Lattice {
    /// Builds a lattice covering `bounds` with the given number of voxels on
    /// each axis
    pub fn new(bounds: [Interval; 3], res: [usize; 3]) -> Result<Self, Error> {
        if res.iter().any(|n| *n == 0) {
            return Err(Error::BadRegion("every axis needs at least one voxel"));
        }
        if bounds.iter().any(|b| !(b.width() > 0.0) || !b.width().is_finite())
        {
            return Err(Error::BadRegion("bounds must be finite and non-empty"));
        }
        let axis = |b: Interval, n: usize| -> Vec<f32> {
            (0..=n).map(|i| b.lerp(i as f32 / n as f32)).collect()
        };
        let nk = res[2];
        // Luminosity increases with height, so that a depth image has the
        // highest surface as the brightest pixel; 0 is reserved for "empty".
        let l = (0..=nk)
            .map(|k| {
                let frac = (k + 1) as f32 / (nk + 1) as f32;
                (frac * u16::MAX as f32).round() as u16
            })
            .collect();
        Ok(Self {
            x: axis(bounds[0], res[0]),
            y: axis(bounds[1], res[1]),
            z: axis(bounds[2], res[2]),
            l,
        })
    }

    /// Builds a lattice with the given number of voxels per unit length
    ///
    /// Each axis has at least one voxel.
    pub fn with_scale(bounds: [Interval; 3], scale: f32) -> Result<Self, Error> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(Error::BadRegion("scale must be positive"));
        }
        let res = bounds.map(|b| ((b.width() * scale).ceil() as usize).max(1));
        Self::new(bounds, res)
    }

    /// Returns the number of voxels on each axis
    pub fn resolution(&self) -> [usize; 3] {
        [self.x.len() - 1, self.y.len() - 1, self.z.len() - 1]
    }

    /// Returns the boundary coordinates along the given axis
    pub fn axis(&self, axis: usize) -> &[f32] {
        match axis {
            0 => &self.x,
            1 => &self.y,
            _ => &self.z,
        }
    }

    /// Returns the world-space position of a lattice point
    pub fn pos(&self, index: [u32; 3]) -> [f32; 3] {
        [
            self.x[index[0] as usize],
            self.y[index[1] as usize],
            self.z[index[2] as usize],
        ]
    }

    /// Returns the world-space bounds of the lattice
    pub fn bounds(&self) -> [Interval; 3] {
        self.region().bounds()
    }

    /// Returns a region covering the entire lattice
    pub fn region(&self) -> Region<'_> {
        Region {
            imin: 0,
            jmin: 0,
            kmin: 0,
            x: &self.x,
            y: &self.y,
            z: &self.z,
            l: &self.l,
        }
    }
}

/// A sub-box of a [`Lattice`]
///
/// `x`, `y`, and `z` are the boundary coordinates of the region's voxels;
/// `l` is the luminosity of each Z boundary, used by renderers.
#[derive(Copy, Clone, Debug)]
pub struct Region<'a> {
    /// Index of the first X coordinate within the parent lattice
    pub imin: usize,
    /// Index of the first Y coordinate within the parent lattice
    pub jmin: usize,
    /// Index of the first Z coordinate within the parent lattice
    pub kmin: usize,
    /// X boundary coordinates (`ni + 1` values)
    pub x: &'a [f32],
    /// Y boundary coordinates (`nj + 1` values)
    pub y: &'a [f32],
    /// Z boundary coordinates (`nk + 1` values)
    pub z: &'a [f32],
    /// Luminosity for each Z boundary (`nk + 1` values)
    pub l: &'a [u16],
}

impl<'a> Region<'a> {
    /// Number of voxels along X
    pub fn ni(&self) -> usize {
        self.x.len() - 1
    }
    /// Number of voxels along Y
    pub fn nj(&self) -> usize {
        self.y.len() - 1
    }
    /// Number of voxels along Z
    pub fn nk(&self) -> usize {
        self.z.len() - 1
    }

    /// Returns the voxel count along each axis
    pub fn size(&self) -> [usize; 3] {
        [self.ni(), self.nj(), self.nk()]
    }

    /// Returns the lattice index of the region's lower corner
    pub fn corner_index(&self) -> [usize; 3] {
        [self.imin, self.jmin, self.kmin]
    }

    /// Number of voxels in the region
    pub fn volume(&self) -> usize {
        self.ni() * self.nj() * self.nk()
    }

    /// Number of lattice points (voxel corners) in the region
    pub fn points(&self) -> usize {
        self.x.len() * self.y.len() * self.z.len()
    }

    /// Returns the world-space bounds of the region
    pub fn bounds(&self) -> [Interval; 3] {
        let b = |v: &[f32]| Interval::new(v[0], v[v.len() - 1]);
        [b(self.x), b(self.y), b(self.z)]
    }

    /// Returns the coordinate array along the given axis
    pub fn axis(&self, axis: usize) -> &'a [f32] {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    /// Looks up the position of a lattice point, given region-local indices
    pub fn pos(&self, i: usize, j: usize, k: usize) -> [f32; 3] {
        [self.x[i], self.y[j], self.z[k]]
    }

    /// Splits the region in two along the given axis
    ///
    /// Returns `None` if the region has a single voxel along that axis.
    pub fn split(&self, axis: usize) -> Option<(Region<'a>, Region<'a>)> {
        let n = self.size()[axis];
        if n < 2 {
            return None;
        }
        let half = n / 2;
        let mut lo = *self;
        let mut hi = *self;
        match axis {
            0 => {
                lo.x = &self.x[..=half];
                hi.x = &self.x[half..];
                hi.imin += half;
            }
            1 => {
                lo.y = &self.y[..=half];
                hi.y = &self.y[half..];
                hi.jmin += half;
            }
            _ => {
                lo.z = &self.z[..=half];
                lo.l = &self.l[..=half];
                hi.z = &self.z[half..];
                hi.l = &self.l[half..];
                hi.kmin += half;
            }
        }
        Some((lo, hi))
    }

    /// Splits the region in two along its largest axis (by voxel count)
    ///
    /// Returns `None` if the region is a single voxel.
    pub fn bisect(&self) -> Option<(Region<'a>, Region<'a>)> {
        let size = self.size();
        let axis = (0..3).max_by_key(|a| (size[*a], 3 - a))?;
        self.split(axis)
    }

    /// Splits the region into octants along the active axes
    ///
    /// Children are indexed by octant bits (bit 2 = +X, bit 1 = +Y,
    /// bit 0 = +Z). Axes which are inactive, or which have a single voxel, are
    /// not split, so the corresponding children are `None`.
    pub fn octsect(&self, active: [bool; 3]) -> [Option<Region<'a>>; 8] {
        let mut out = [None; 8];
        out[0] = Some(*self);
        for axis in 0..3 {
            if !active[axis] {
                continue;
            }
            let bit = 4 >> axis;
            for i in 0..8 {
                if i & bit != 0 {
                    continue;
                }
                if let Some(r) = out[i] {
                    if let Some((lo, hi)) = r.split(axis) {
                        out[i] = Some(lo);
                        out[i | bit] = Some(hi);
                    }
                }
            }
        }
        out
    }
}
