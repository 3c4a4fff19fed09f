//! `normalcast-perception` – Surface Geometry layer.
//!
//! Turns raw point positions into the local surface description downstream
//! consumers need: a normal and a curvature value per point.
//!
//! # Modules
//!
//! - [`kdtree`] – [`KdTree`][kdtree::KdTree]: balanced 3-D tree answering
//!   radius and k-nearest neighborhood queries over one cloud.
//! - [`normals`] – [`NormalEstimator`][normals::NormalEstimator]: the narrow
//!   estimation interface, and
//!   [`KdTreeNormalEstimator`][normals::KdTreeNormalEstimator], which fits a
//!   plane to each neighborhood by eigen-decomposing its covariance matrix.

pub mod kdtree;
pub mod normals;

pub use normals::{KdTreeNormalEstimator, Neighborhood, NormalEstimator, SurfaceNormal};
