//! Feature-point placement by minimizing a quadratic error function
use nalgebra::{Matrix3, Vector3, Vector4};

/// Accumulates plane constraints `(n · x = n · p)` and solves for the point
/// that best satisfies all of them
#[derive(Copy, Clone, Debug)]
pub struct QuadraticErrorSolver {
    /// A^T A term
    ata: Matrix3<f32>,

    /// A^T B term
    atb: Vector3<f32>,

    /// B^T B term
    btb: f32,

    /// Sum of positions, stored as XYZ / W
    mass_point: Vector4<f32>,
}

impl Default for QuadraticErrorSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl QuadraticErrorSolver {
    pub fn new() -> Self {
        Self {
            ata: Matrix3::zeros(),
            atb: Vector3::zeros(),
            btb: 0.0,
            mass_point: Vector4::zeros(),
        }
    }

    /// Adds a surface sample at `pos` with the given (unnormalized) normal
    ///
    /// Samples with a zero normal only contribute to the mass point.
    pub fn add(&mut self, pos: Vector3<f32>, normal: Vector3<f32>) {
        self.mass_point += Vector4::new(pos.x, pos.y, pos.z, 1.0);
        let Some(n) = normal.try_normalize(1e-12) else {
            return;
        };
        self.ata += n * n.transpose();
        self.atb += n * n.dot(&pos);
        self.btb += n.dot(&pos).powi(2);
    }

    /// Returns the average position of every sample
    pub fn mass_point(&self) -> Option<Vector3<f32>> {
        (self.mass_point.w > 0.0)
            .then(|| self.mass_point.xyz() / self.mass_point.w)
    }

    /// Solves the QEF, minimizing towards the mass point
    ///
    /// Returns the position and the (clamped) residual error, or `None` if no
    /// samples have been added.
    pub fn solve(&self) -> Option<(Vector3<f32>, f32)> {
        let center = self.mass_point()?;
        let atb = self.atb - self.ata * center;

        let svd = nalgebra::linalg::SVD::new(self.ata, true, true);

        // Singular values aren't guaranteed to be sorted
        let mut singular_values =
            svd.singular_values.data.0[0].map(ordered_float::OrderedFloat);
        singular_values.sort();
        singular_values.reverse();
        let singular_values = singular_values.map(|o| o.0);

        // Eigenvalues far below the largest one are treated as zero, so that
        // near-planar patches don't produce points far from the surface.
        const EIGENVALUE_CUTOFF_RELATIVE: f32 = 1e-3;
        let cutoff = singular_values[0].abs() * EIGENVALUE_CUTOFF_RELATIVE;
        let rank = (0..3)
            .find(|i| singular_values[*i].abs() <= cutoff)
            .unwrap_or(3);

        let epsilon = singular_values.get(rank).cloned().unwrap_or(0.0);
        let sol = svd.solve(&atb, epsilon);
        let pos = sol.map(|c| c + center).unwrap_or(center);
        let err = ((pos.transpose() * self.ata * pos
            - 2.0 * pos.transpose() * self.atb)[0]
            + self.btb)
            .max(1e-6);
        Some((pos, err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_corner() {
        // Three orthogonal planes meeting at (0.5, 0.25, -0.1)
        let mut q = QuadraticErrorSolver::new();
        q.add(Vector3::new(0.5, 0.0, 0.0), Vector3::new(2.0, 0.0, 0.0));
        q.add(Vector3::new(0.5, 0.1, 0.2), Vector3::new(1.0, 0.0, 0.0));
        q.add(Vector3::new(0.0, 0.25, 0.0), Vector3::new(0.0, 1.0, 0.0));
        q.add(Vector3::new(0.3, 0.25, 0.1), Vector3::new(0.0, 1.0, 0.0));
        q.add(Vector3::new(0.0, 0.0, -0.1), Vector3::new(0.0, 0.0, 1.0));
        let (pos, err) = q.solve().unwrap();
        assert!((pos - Vector3::new(0.5, 0.25, -0.1)).norm() < 1e-4, "{pos}");
        assert!(err < 1e-5);
    }

    #[test]
    fn test_planar() {
        // A single plane is rank 1, so the point lands on the plane below the
        // mass point
        let mut q = QuadraticErrorSolver::new();
        q.add(Vector3::new(0.0, 0.0, 0.5), Vector3::z());
        q.add(Vector3::new(1.0, 0.0, 0.5), Vector3::z());
        q.add(Vector3::new(0.0, 1.0, 0.5), Vector3::z());
        let (pos, _err) = q.solve().unwrap();
        let expected = Vector3::new(1.0 / 3.0, 1.0 / 3.0, 0.5);
        assert!((pos - expected).norm() < 1e-5, "{pos}");
    }

    #[test]
    fn test_empty() {
        assert!(QuadraticErrorSolver::new().solve().is_none());
    }
}
