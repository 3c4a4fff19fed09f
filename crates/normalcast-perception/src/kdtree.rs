//! k-d tree neighborhood queries over one point cloud.
//!
//! Wraps a [`kiddo`] tree built once per cloud and queried once per point.
//! Results always refer back to the caller's slice and carry exact squared
//! distances computed on the original coordinates.
//!
//! kiddo's bucketed tree panics when more than a bucket's worth of items
//! share one coordinate on a split axis.  Positions are therefore indexed in
//! a fixed, generically rotated frame (a plane facing the sensor no longer
//! shares a coordinate) and exact duplicates are merged into one entry.
//!
//! # Key types
//!
//! | Type | Role |
//! |------|------|
//! | [`KdTree`]   | Spatial index over a borrowed slice of points.           |
//! | [`Neighbor`] | One query hit: input index plus squared distance.        |
//!
//! # Example
//!
//! ```rust
//! use normalcast_perception::kdtree::KdTree;
//! use normalcast_types::PointXyz;
//!
//! let points = [
//!     PointXyz::new(0.0, 0.0, 0.0),
//!     PointXyz::new(0.1, 0.0, 0.0),
//!     PointXyz::new(5.0, 0.0, 0.0),
//! ];
//! let tree = KdTree::build(&points);
//!
//! let hits = tree.radius_search(PointXyz::new(0.0, 0.0, 0.0), 0.5);
//! assert_eq!(hits.len(), 2);
//! assert_eq!(hits[0].index, 0);
//! assert_eq!(hits[1].index, 1);
//! ```

use std::collections::HashMap;

use kiddo::{KdTree as KiddoTree, SquaredEuclidean};
use nalgebra::{Matrix3, Rotation3, Unit, Vector3};
use normalcast_types::PointXyz;

/// Relative widening of the indexed search to absorb rotation rounding.
const ROTATION_TOLERANCE: f32 = 1e-5;
/// Extra candidates fetched by [`KdTree::nearest_k`] before exact re-ranking.
const NEAREST_OVERFETCH: usize = 8;

// ────────────────────────────────────────────────────────────────────────────
// Neighbor
// ────────────────────────────────────────────────────────────────────────────

/// A point returned by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index into the slice the tree was built from.
    pub index: usize,
    /// Squared Euclidean distance to the query point.
    pub squared_distance: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// KdTree
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D tree over a point slice.
///
/// Points with a NaN or infinite coordinate are left out of the index and
/// are never returned by a query.
pub struct KdTree<'a> {
    points: &'a [PointXyz],
    index: KiddoTree<f32, 3>,
    /// Input indices per distinct position; the kiddo item is the slot number.
    slots: Vec<Vec<usize>>,
    frame: Matrix3<f64>,
    indexed: usize,
}

impl std::fmt::Debug for KdTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdTree")
            .field("points", &self.points.len())
            .field("indexed", &self.indexed)
            .field("distinct", &self.slots.len())
            .finish()
    }
}

impl<'a> KdTree<'a> {
    /// Index every finite point of `points`.
    pub fn build(points: &'a [PointXyz]) -> Self {
        let frame = index_frame();
        let mut index: KiddoTree<f32, 3> = KiddoTree::new();
        let mut slots: Vec<Vec<usize>> = Vec::new();
        let mut slot_of: HashMap<[u32; 3], usize> = HashMap::new();
        let mut indexed = 0;

        for (i, p) in points.iter().enumerate().filter(|(_, p)| p.is_finite()) {
            indexed += 1;
            let slot = *slot_of.entry(position_key(*p)).or_insert_with(|| {
                index.add(&rotate(&frame, *p), slots.len() as u64);
                slots.push(Vec::new());
                slots.len() - 1
            });
            slots[slot].push(i);
        }

        Self {
            points,
            index,
            slots,
            frame,
            indexed,
        }
    }

    /// Number of indexed (finite) points.
    pub fn len(&self) -> usize {
        self.indexed
    }

    pub fn is_empty(&self) -> bool {
        self.indexed == 0
    }

    /// Every indexed point within `radius` of `query`, nearest first.
    ///
    /// The query point itself is included when it belongs to the cloud.
    pub fn radius_search(&self, query: PointXyz, radius: f32) -> Vec<Neighbor> {
        if radius < 0.0 || !query.is_finite() || self.slots.is_empty() {
            return Vec::new();
        }
        let scale = 1.0 + radius + query.x.abs().max(query.y.abs()).max(query.z.abs());
        let reach = radius + ROTATION_TOLERANCE * scale;
        let candidates = self
            .index
            .within::<SquaredEuclidean>(&rotate(&self.frame, query), reach * reach);

        let r2 = radius * radius;
        let mut hits = self.expand(query, candidates.iter().map(|c| c.item as usize));
        hits.retain(|n| n.squared_distance <= r2);
        hits
    }

    /// The `k` indexed points closest to `query`, nearest first.
    ///
    /// Returns every indexed point when `k` exceeds the cloud size.
    pub fn nearest_k(&self, query: PointXyz, k: usize) -> Vec<Neighbor> {
        if k == 0 || !query.is_finite() || self.slots.is_empty() {
            return Vec::new();
        }
        // Each slot holds at least one point, so `k` slots always cover `k`
        // points.
        let fetch = k.saturating_add(NEAREST_OVERFETCH).min(self.slots.len());
        let candidates = self
            .index
            .nearest_n::<SquaredEuclidean>(&rotate(&self.frame, query), fetch);

        let mut hits = self.expand(query, candidates.iter().map(|c| c.item as usize));
        hits.truncate(k);
        hits
    }

    /// Unfold slots into input indices with exact distances, nearest first.
    fn expand(&self, query: PointXyz, slots: impl Iterator<Item = usize>) -> Vec<Neighbor> {
        let q = query.to_array();
        let mut hits = Vec::new();
        for slot in slots {
            let members = &self.slots[slot];
            let Some(&first) = members.first() else { continue };
            let squared_distance = squared_distance(self.points[first].to_array(), q);
            hits.extend(members.iter().map(|&index| Neighbor {
                index,
                squared_distance,
            }));
        }
        hits.sort_by(|a, b| {
            a.squared_distance
                .total_cmp(&b.squared_distance)
                .then(a.index.cmp(&b.index))
        });
        hits
    }
}

/// Fixed rotation whose axes are not aligned with any sensor axis.
fn index_frame() -> Matrix3<f64> {
    let axis = Unit::new_normalize(Vector3::new(1.0, 2.0, 3.0));
    Rotation3::from_axis_angle(&axis, 0.7).into_inner()
}

fn rotate(frame: &Matrix3<f64>, p: PointXyz) -> [f32; 3] {
    let r = frame * Vector3::new(p.x as f64, p.y as f64, p.z as f64);
    [r.x as f32, r.y as f32, r.z as f32]
}

/// Bit pattern of a position, with `-0.0` folded into `0.0`.
fn position_key(p: PointXyz) -> [u32; 3] {
    [(p.x + 0.0).to_bits(), (p.y + 0.0).to_bits(), (p.z + 0.0).to_bits()]
}

fn squared_distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A 5×5×5 grid with unit spacing, starting at the origin.
    fn grid() -> Vec<PointXyz> {
        let mut pts = Vec::new();
        for ix in 0..5 {
            for iy in 0..5 {
                for iz in 0..5 {
                    pts.push(PointXyz::new(ix as f32, iy as f32, iz as f32));
                }
            }
        }
        pts
    }

    fn brute_force_radius(points: &[PointXyz], q: PointXyz, r: f32) -> Vec<usize> {
        let mut idx: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .filter(|(_, p)| squared_distance(p.to_array(), q.to_array()) <= r * r)
            .map(|(i, _)| i)
            .collect();
        idx.sort_unstable();
        idx
    }

    // ── construction ────────────────────────────────────────────────────────

    #[test]
    fn empty_tree_returns_nothing() {
        let tree = KdTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.radius_search(PointXyz::new(0.0, 0.0, 0.0), 10.0).is_empty());
        assert!(tree.nearest_k(PointXyz::new(0.0, 0.0, 0.0), 3).is_empty());
    }

    #[test]
    fn non_finite_points_are_not_indexed() {
        let pts = [
            PointXyz::new(0.0, 0.0, 0.0),
            PointXyz::new(f32::NAN, 0.0, 0.0),
            PointXyz::new(0.0, f32::INFINITY, 0.0),
        ];
        let tree = KdTree::build(&pts);
        assert_eq!(tree.len(), 1);
        let hits = tree.radius_search(PointXyz::new(0.0, 0.0, 0.0), 100.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 0);
    }

    #[test]
    fn large_flat_surface_and_repeated_points_are_indexed() {
        // A wall facing the sensor plus a burst of identical zero returns.
        let mut pts = Vec::new();
        for i in 0..60 {
            for j in 0..60 {
                pts.push(PointXyz::new(i as f32 * 0.01, j as f32 * 0.01, 2.0));
            }
        }
        pts.extend(std::iter::repeat_n(PointXyz::new(0.0, 0.0, 0.0), 200));

        let tree = KdTree::build(&pts);
        assert_eq!(tree.len(), 3800);

        let zeros = tree.radius_search(PointXyz::new(0.0, -0.0, 0.0), 0.0);
        assert_eq!(zeros.len(), 200);

        let q = PointXyz::new(0.3, 0.3, 2.0);
        let mut got: Vec<usize> = tree.radius_search(q, 0.025).iter().map(|n| n.index).collect();
        got.sort_unstable();
        assert_eq!(got, brute_force_radius(&pts, q, 0.025));
    }

    // ── radius search ───────────────────────────────────────────────────────

    #[test]
    fn radius_search_matches_brute_force() {
        let pts = grid();
        let tree = KdTree::build(&pts);
        for &(q, r) in &[
            (PointXyz::new(2.0, 2.0, 2.0), 1.0),
            (PointXyz::new(0.0, 0.0, 0.0), 1.5),
            (PointXyz::new(4.2, 3.7, 0.1), 2.0),
            (PointXyz::new(-3.0, 2.0, 2.0), 3.5),
        ] {
            let mut got: Vec<usize> = tree.radius_search(q, r).iter().map(|n| n.index).collect();
            got.sort_unstable();
            assert_eq!(got, brute_force_radius(&pts, q, r), "query {:?} r={}", q, r);
        }
    }

    #[test]
    fn radius_search_is_sorted_and_includes_query_point() {
        let pts = grid();
        let tree = KdTree::build(&pts);
        let hits = tree.radius_search(PointXyz::new(2.0, 2.0, 2.0), 1.0);
        // Centre plus its six face neighbours.
        assert_eq!(hits.len(), 7);
        assert_eq!(hits[0].squared_distance, 0.0);
        assert!(hits.windows(2).all(|w| w[0].squared_distance <= w[1].squared_distance));
    }

    #[test]
    fn duplicate_points_are_all_found() {
        let pts = vec![PointXyz::new(1.0, 1.0, 1.0); 6];
        let tree = KdTree::build(&pts);
        let hits = tree.radius_search(PointXyz::new(1.0, 1.0, 1.0), 0.0);
        let indices: Vec<usize> = hits.iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn negative_radius_finds_nothing() {
        let pts = grid();
        let tree = KdTree::build(&pts);
        assert!(tree.radius_search(PointXyz::new(2.0, 2.0, 2.0), -1.0).is_empty());
    }

    // ── k nearest ───────────────────────────────────────────────────────────

    #[test]
    fn nearest_k_returns_closest_points_in_order() {
        let pts = [
            PointXyz::new(0.0, 0.0, 0.0),
            PointXyz::new(3.0, 0.0, 0.0),
            PointXyz::new(1.0, 0.0, 0.0),
            PointXyz::new(10.0, 0.0, 0.0),
            PointXyz::new(2.0, 0.0, 0.0),
        ];
        let tree = KdTree::build(&pts);
        let hits: Vec<usize> = tree
            .nearest_k(PointXyz::new(0.1, 0.0, 0.0), 3)
            .iter()
            .map(|n| n.index)
            .collect();
        assert_eq!(hits, vec![0, 2, 4]);
    }

    #[test]
    fn nearest_k_caps_at_cloud_size() {
        let pts = [PointXyz::new(0.0, 0.0, 0.0), PointXyz::new(1.0, 0.0, 0.0)];
        let tree = KdTree::build(&pts);
        assert_eq!(tree.nearest_k(PointXyz::new(0.0, 0.0, 0.0), 10).len(), 2);
    }

    #[test]
    fn nearest_k_with_unbounded_k_returns_every_point() {
        let pts = grid();
        let tree = KdTree::build(&pts);
        let hits = tree.nearest_k(PointXyz::new(2.0, 2.0, 2.0), usize::MAX);
        assert_eq!(hits.len(), pts.len());
        assert_eq!(hits[0].index, 62);
    }

    #[test]
    fn nearest_k_counts_repeated_points_individually() {
        let mut pts = vec![PointXyz::new(0.0, 0.0, 0.0); 4];
        pts.push(PointXyz::new(1.0, 0.0, 0.0));
        let tree = KdTree::build(&pts);
        let hits: Vec<usize> = tree
            .nearest_k(PointXyz::new(0.0, 0.0, 0.0), 3)
            .iter()
            .map(|n| n.index)
            .collect();
        assert_eq!(hits, vec![0, 1, 2]);
    }

    #[test]
    fn nearest_k_matches_brute_force_distances() {
        let pts = grid();
        let tree = KdTree::build(&pts);
        let q = PointXyz::new(1.3, 2.6, 3.1);
        let got: Vec<f32> = tree.nearest_k(q, 8).iter().map(|n| n.squared_distance).collect();

        let mut all: Vec<f32> = pts
            .iter()
            .map(|p| squared_distance(p.to_array(), q.to_array()))
            .collect();
        all.sort_by(f32::total_cmp);
        assert_eq!(got, all[..8].to_vec());
    }
}
