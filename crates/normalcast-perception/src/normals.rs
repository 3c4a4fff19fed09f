//! Surface Normal Estimation.
//!
//! Estimates a normal and a curvature value for every point of a cloud from
//! the point's local neighborhood:
//!
//! 1. gather neighbors with a [`KdTree`] (radius or k-nearest search, the
//!    query point included);
//! 2. build the 3×3 covariance matrix of the neighborhood around its
//!    centroid;
//! 3. take the eigenvector of the smallest eigenvalue as the normal and
//!    `λmin / (λ0 + λ1 + λ2)` as the surface variation ("curvature");
//! 4. flip the normal so it faces the viewpoint (the sensor origin by
//!    default).
//!
//! A point with fewer than three neighbors, or with a non-finite
//! coordinate, gets a NaN normal and curvature ([`SurfaceNormal::INVALID`]).
//!
//! # Example
//!
//! ```rust
//! use normalcast_perception::normals::{KdTreeNormalEstimator, Neighborhood, NormalEstimator};
//! use normalcast_types::PointXyz;
//!
//! let plane = [
//!     PointXyz::new(0.0, 0.0, 0.0),
//!     PointXyz::new(1.0, 0.0, 0.0),
//!     PointXyz::new(0.0, 1.0, 0.0),
//! ];
//! let normals = KdTreeNormalEstimator::default()
//!     .estimate(&plane, Neighborhood::Radius(2.0))
//!     .unwrap();
//! assert!((normals[0].normal[2].abs() - 1.0).abs() < 1e-5);
//! ```

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use normalcast_types::{NormalsError, PointNormal, PointXyz};
use tracing::debug;

use crate::kdtree::{KdTree, Neighbor};

/// Fewest neighbors (query point included) that define a plane.
const MIN_NEIGHBORS: usize = 3;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// How the neighborhood of a point is selected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Neighborhood {
    /// Every point within this distance.
    Radius(f64),
    /// The `k` closest points.
    Nearest(usize),
}

impl Neighborhood {
    /// Reject neighborhoods that can never produce a normal.
    pub fn validate(&self) -> Result<(), NormalsError> {
        match *self {
            Neighborhood::Radius(r) if !(r.is_finite() && r > 0.0) => Err(NormalsError::InvalidParameter {
                key: "search_radius".to_string(),
                reason: format!("must be a positive finite distance, got {r}"),
            }),
            Neighborhood::Nearest(k) if k < MIN_NEIGHBORS => Err(NormalsError::InvalidParameter {
                key: "k_search".to_string(),
                reason: format!("must be at least {MIN_NEIGHBORS}, got {k}"),
            }),
            _ => Ok(()),
        }
    }
}

/// Normal and curvature estimated for one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceNormal {
    /// Unit normal `[nx, ny, nz]`.
    pub normal: [f32; 3],
    pub curvature: f32,
}

impl SurfaceNormal {
    /// Marker for points whose normal could not be estimated.
    pub const INVALID: SurfaceNormal = SurfaceNormal {
        normal: [f32::NAN; 3],
        curvature: f32::NAN,
    };

    /// False for [`SurfaceNormal::INVALID`] and any other non-finite result.
    pub fn is_valid(&self) -> bool {
        self.normal.iter().all(|c| c.is_finite()) && self.curvature.is_finite()
    }

    /// Write the normal and curvature into an output record.
    pub fn apply_to(&self, point: &mut PointNormal) {
        point.normal_x = self.normal[0];
        point.normal_y = self.normal[1];
        point.normal_z = self.normal[2];
        point.curvature = self.curvature;
    }
}

/// Pluggable normal estimation back end.
///
/// Implementations must return exactly one [`SurfaceNormal`] per input
/// point, in input order.
pub trait NormalEstimator: Send + Sync {
    /// Estimate a normal for every point in `points`.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::InvalidParameter`] for an unusable
    /// `neighborhood`; implementations may add their own failure modes as
    /// [`NormalsError::Estimation`].
    fn estimate(
        &self,
        points: &[PointXyz],
        neighborhood: Neighborhood,
    ) -> Result<Vec<SurfaceNormal>, NormalsError>;
}

// ────────────────────────────────────────────────────────────────────────────
// KdTreeNormalEstimator
// ────────────────────────────────────────────────────────────────────────────

/// Covariance/eigenvector normal estimator over a [`KdTree`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdTreeNormalEstimator {
    viewpoint: [f64; 3],
}

impl Default for KdTreeNormalEstimator {
    fn default() -> Self {
        Self {
            viewpoint: [0.0; 3],
        }
    }
}

impl KdTreeNormalEstimator {
    /// Orient normals towards `viewpoint` instead of the origin.
    pub fn with_viewpoint(viewpoint: [f64; 3]) -> Self {
        Self { viewpoint }
    }

    fn fit(&self, points: &[PointXyz], query: PointXyz, neighbors: &[Neighbor]) -> SurfaceNormal {
        if neighbors.len() < MIN_NEIGHBORS {
            return SurfaceNormal::INVALID;
        }

        let to_vec = |p: PointXyz| Vector3::new(p.x as f64, p.y as f64, p.z as f64);

        let count = neighbors.len() as f64;
        let centroid = neighbors
            .iter()
            .fold(Vector3::zeros(), |acc, n| acc + to_vec(points[n.index]))
            / count;

        let mut covariance = Matrix3::<f64>::zeros();
        for n in neighbors {
            let d = to_vec(points[n.index]) - centroid;
            covariance += d * d.transpose();
        }
        covariance /= count;
        if covariance.iter().any(|v| !v.is_finite()) {
            return SurfaceNormal::INVALID;
        }

        let eigen = SymmetricEigen::new(covariance);
        // nalgebra does not order eigenvalues; pick the smallest explicitly.
        let mut min_idx = 0;
        for i in 1..3 {
            if eigen.eigenvalues[i] < eigen.eigenvalues[min_idx] {
                min_idx = i;
            }
        }
        let mut normal: Vector3<f64> = eigen.eigenvectors.column(min_idx).into_owned();

        let eigen_sum = eigen.eigenvalues.sum();
        let curvature = if eigen_sum != 0.0 {
            (eigen.eigenvalues[min_idx] / eigen_sum).abs()
        } else {
            0.0
        };

        let to_viewpoint = Vector3::from(self.viewpoint) - to_vec(query);
        if to_viewpoint.dot(&normal) < 0.0 {
            normal = -normal;
        }

        SurfaceNormal {
            normal: [normal.x as f32, normal.y as f32, normal.z as f32],
            curvature: curvature as f32,
        }
    }
}

impl NormalEstimator for KdTreeNormalEstimator {
    fn estimate(
        &self,
        points: &[PointXyz],
        neighborhood: Neighborhood,
    ) -> Result<Vec<SurfaceNormal>, NormalsError> {
        neighborhood.validate()?;

        let tree = KdTree::build(points);
        let normals: Vec<SurfaceNormal> = points
            .iter()
            .map(|&p| {
                if !p.is_finite() {
                    return SurfaceNormal::INVALID;
                }
                let neighbors = match neighborhood {
                    Neighborhood::Radius(r) => tree.radius_search(p, r as f32),
                    Neighborhood::Nearest(k) => tree.nearest_k(p, k),
                };
                self.fit(points, p, &neighbors)
            })
            .collect();

        debug!(
            points = points.len(),
            indexed = tree.len(),
            invalid = normals.iter().filter(|n| !n.is_valid()).count(),
            "estimated normals"
        );
        Ok(normals)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
