//! `normalcast-types` – shared message and error types.
//!
//! Everything that crosses a crate boundary lives here: the point records,
//! the [`PointCloud`] container with its [`Header`], and the workspace-wide
//! [`NormalsError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata attached to every point cloud.
///
/// Copied verbatim from an input cloud to the cloud derived from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Monotonic sequence number assigned by the producer.
    #[serde(default)]
    pub seq: u32,
    /// Acquisition time of the cloud (Unix epoch when omitted).
    #[serde(default)]
    pub stamp: DateTime<Utc>,
    /// Coordinate frame the points are expressed in (e.g. "velodyne").
    #[serde(default)]
    pub frame_id: String,
}

/// A position-only point record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointXyz {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl PointXyz {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// True when all three coordinates are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// A point record augmented with a surface normal and curvature estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointNormal {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub normal_x: f32,
    pub normal_y: f32,
    pub normal_z: f32,
    /// Surface variation `λmin / (λ0 + λ1 + λ2)` of the neighborhood.
    pub curvature: f32,
}

impl PointNormal {
    /// Take the position of `p`; the normal and curvature start at zero.
    pub fn from_position(p: PointXyz) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            ..Self::default()
        }
    }

    pub fn position(&self) -> PointXyz {
        PointXyz::new(self.x, self.y, self.z)
    }

    pub fn normal(&self) -> [f32; 3] {
        [self.normal_x, self.normal_y, self.normal_z]
    }
}

/// An ordered cloud of point records.
///
/// `width` and `height` describe the layout of organized clouds (e.g. from a
/// depth camera); unorganized clouds have `height == 1` and
/// `width == points.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud<P> {
    pub header: Header,
    pub points: Vec<P>,
    pub width: u32,
    pub height: u32,
    /// True when no point contains a NaN or infinite value.
    pub is_dense: bool,
}

impl<P> Default for PointCloud<P> {
    fn default() -> Self {
        Self {
            header: Header::default(),
            points: Vec::new(),
            width: 0,
            height: 0,
            is_dense: true,
        }
    }
}

impl<P> PointCloud<P> {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Point count as a `width`, saturating at `u32::MAX`.
fn layout_width(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl PointCloud<PointXyz> {
    /// Build an unorganized cloud, deriving `is_dense` from the points.
    pub fn from_points(header: Header, points: Vec<PointXyz>) -> Self {
        let is_dense = points.iter().all(PointXyz::is_finite);
        Self {
            header,
            width: layout_width(points.len()),
            height: 1,
            points,
            is_dense,
        }
    }
}

/// Workspace-wide error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalsError {
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("Output is null")]
    NullOutput,

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Normal estimation failed: {0}")]
    Estimation(String),
}
