//! [`NormalAugmenter`] – republishes point clouds with surface normals.
//!
//! The augmenter subscribes to raw clouds on `point_cloud`, estimates a
//! normal and curvature value for every point, and publishes the result on
//! `point_cloud_with_normals`.  Both topic names and the parameter key
//! resolve under the node's namespace.
//!
//! # Lifecycle
//!
//! 1. [`NormalAugmenter::initialize`] loads `normals/search_radius` (required,
//!    no default) and registers the two endpoints.  Any failure is logged
//!    with the node's diagnostic name and returned; the host is expected to
//!    abort startup.
//! 2. [`NormalAugmenter::spin`] feeds every incoming cloud, one at a time,
//!    to [`NormalAugmenter::on_point_cloud`].
//!
//! # Demand
//!
//! Estimating normals is skipped entirely while nobody subscribes to the
//! output topic.  [`NormalAugmenter::compute_normals`] checks the subscriber
//! count once more before publishing: subscribers attached over the
//! WebSocket bridge come and go on other tasks.
//!
//! # Example
//!
//! ```rust
//! use normalcast_middleware::{EventBus, ParameterStore};
//! use normalcast_node::{NodeContext, NormalAugmenter};
//!
//! let mut params = ParameterStore::default();
//! params.set("/normals/search_radius", 0.05);
//! let ctx = NodeContext::new("/", EventBus::new(), params);
//!
//! let augmenter = NormalAugmenter::initialize(&ctx).expect("startup failed");
//! assert_eq!(augmenter.name(), "/NormalAugmenter");
//! ```

use normalcast_middleware::{Publisher, Subscriber, names};
use normalcast_perception::{KdTreeNormalEstimator, Neighborhood, NormalEstimator};
use normalcast_types::{NormalsError, PointCloud, PointNormal, PointXyz};
use tracing::{debug, error, info, trace};

use crate::context::NodeContext;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Suffix appended to the namespace to form the diagnostic name.
pub const NODE_NAME: &str = "NormalAugmenter";

pub const SEARCH_RADIUS_PARAM: &str = "normals/search_radius";
/// Optional `[x, y, z]` the normals are oriented towards (default origin).
pub const VIEWPOINT_PARAM: &str = "normals/viewpoint";

pub const INPUT_TOPIC: &str = "point_cloud";
pub const INPUT_QUEUE_DEPTH: usize = 100;

pub const OUTPUT_TOPIC: &str = "point_cloud_with_normals";
pub const OUTPUT_QUEUE_DEPTH: usize = 10;
pub const OUTPUT_LATCHED: bool = false;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Startup configuration, immutable once loaded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmenterConfig {
    /// Neighborhood radius for normal estimation (distance units of the
    /// cloud).
    pub search_radius: f64,
    pub viewpoint: [f64; 3],
}

/// The transport handles registered at startup.
pub struct Endpoints {
    pub subscriber: Subscriber<PointCloud<PointXyz>>,
    pub publisher: Publisher<PointCloud<PointNormal>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// NormalAugmenter
// ─────────────────────────────────────────────────────────────────────────────

/// Per-message normal estimation node.
///
/// Holds no state between messages apart from its configuration.
pub struct NormalAugmenter<E = KdTreeNormalEstimator> {
    name: String,
    config: AugmenterConfig,
    estimator: E,
    publisher: Publisher<PointCloud<PointNormal>>,
    /// Taken by [`spin`][Self::spin].
    subscriber: Option<Subscriber<PointCloud<PointXyz>>>,
}

impl NormalAugmenter<KdTreeNormalEstimator> {
    /// Load configuration and register endpoints using the k-d tree
    /// estimator.
    ///
    /// # Errors
    ///
    /// * [`NormalsError::MissingParameter`] / [`NormalsError::InvalidParameter`]
    ///   when `normals/search_radius` is absent or unusable.
    /// * [`NormalsError::Channel`] when an endpoint cannot be registered.
    pub fn initialize(ctx: &NodeContext) -> Result<Self, NormalsError> {
        Self::initialize_with(ctx, |config| {
            KdTreeNormalEstimator::with_viewpoint(config.viewpoint)
        })
    }
}

impl<E: NormalEstimator> NormalAugmenter<E> {
    /// Like [`initialize`][NormalAugmenter::initialize], with the estimator
    /// built by `make_estimator` from the loaded configuration.
    pub fn initialize_with(
        ctx: &NodeContext,
        make_estimator: impl FnOnce(&AugmenterConfig) -> E,
    ) -> Result<Self, NormalsError> {
        let name = names::append(ctx.namespace(), NODE_NAME);

        let config = Self::load_configuration(ctx).inspect_err(|e| {
            error!(node = %name, error = %e, "failed to load parameters");
        })?;

        let endpoints = Self::register_endpoints(ctx).inspect_err(|e| {
            error!(node = %name, error = %e, "failed to register endpoints");
        })?;

        info!(
            node = %name,
            search_radius = config.search_radius,
            input = %endpoints.subscriber.topic(),
            output = %endpoints.publisher.topic(),
            "initialized"
        );

        Ok(Self {
            estimator: make_estimator(&config),
            name,
            config,
            publisher: endpoints.publisher,
            subscriber: Some(endpoints.subscriber),
        })
    }

    /// Read the node's parameters.
    ///
    /// `normals/search_radius` is required and must be a positive, finite
    /// number; no default is substituted.
    pub fn load_configuration(ctx: &NodeContext) -> Result<AugmenterConfig, NormalsError> {
        let search_radius: f64 = ctx.param(SEARCH_RADIUS_PARAM)?;
        if !(search_radius.is_finite() && search_radius > 0.0) {
            return Err(NormalsError::InvalidParameter {
                key: ctx.resolve(SEARCH_RADIUS_PARAM),
                reason: format!("must be a positive finite distance, got {search_radius}"),
            });
        }
        let viewpoint: [f64; 3] = ctx.param_or(VIEWPOINT_PARAM, [0.0; 3])?;
        Ok(AugmenterConfig {
            search_radius,
            viewpoint,
        })
    }

    /// Subscribe to the input topic and advertise the output topic.
    pub fn register_endpoints(ctx: &NodeContext) -> Result<Endpoints, NormalsError> {
        let subscriber = ctx
            .bus()
            .subscribe(&ctx.resolve(INPUT_TOPIC), INPUT_QUEUE_DEPTH)?;
        let publisher = ctx.bus().advertise(
            &ctx.resolve(OUTPUT_TOPIC),
            OUTPUT_QUEUE_DEPTH,
            OUTPUT_LATCHED,
        )?;
        Ok(Endpoints {
            subscriber,
            publisher,
        })
    }

    /// Handle one incoming cloud.
    ///
    /// Does nothing while the output topic has no subscribers.  The output
    /// cloud is published by [`compute_normals`][Self::compute_normals] and
    /// then dropped.
    pub fn on_point_cloud(&self, cloud: &PointCloud<PointXyz>) {
        if self.publisher.subscriber_count() == 0 {
            trace!(node = %self.name, seq = cloud.header.seq, "no subscribers; skipping cloud");
            return;
        }

        let mut points_with_normals = PointCloud::default();
        if let Err(e) = self.compute_normals(cloud, Some(&mut points_with_normals)) {
            error!(node = %self.name, seq = cloud.header.seq, error = %e, "failed to compute normals");
        }
    }

    /// Fill `points_with_normals` with the positions of `points` plus an
    /// estimated normal and curvature per point, then publish it if anyone
    /// is listening.
    ///
    /// The header and layout are copied verbatim, so the output has the same
    /// length and header as the input.  Points whose normal cannot be
    /// estimated carry NaN and mark the output as not dense.
    ///
    /// # Errors
    ///
    /// * [`NormalsError::NullOutput`] when no output is supplied; nothing is
    ///   copied.
    /// * Any estimator error, unchanged.  The output then holds the copied
    ///   header and positions without normals and is marked not dense.
    pub fn compute_normals(
        &self,
        points: &PointCloud<PointXyz>,
        points_with_normals: Option<&mut PointCloud<PointNormal>>,
    ) -> Result<(), NormalsError> {
        let Some(out) = points_with_normals else {
            error!(node = %self.name, "output is null");
            return Err(NormalsError::NullOutput);
        };

        out.header = points.header.clone();
        out.width = points.width;
        out.height = points.height;
        out.points = points
            .points
            .iter()
            .copied()
            .map(PointNormal::from_position)
            .collect();
        // Stays false unless every normal below turns out valid.
        out.is_dense = false;

        let normals = self
            .estimator
            .estimate(&points.points, Neighborhood::Radius(self.config.search_radius))?;
        if normals.len() != out.points.len() {
            return Err(NormalsError::Estimation(format!(
                "estimator returned {} normals for {} points",
                normals.len(),
                out.points.len()
            )));
        }

        for (point, normal) in out.points.iter_mut().zip(&normals) {
            normal.apply_to(point);
        }
        out.is_dense = normals.iter().all(|n| n.is_valid());

        if self.publisher.subscriber_count() > 0 {
            let delivered = self.publisher.publish(out.clone());
            debug!(
                node = %self.name,
                seq = out.header.seq,
                points = out.len(),
                delivered,
                "published cloud with normals"
            );
        }

        Ok(())
    }

    /// Dispatch incoming clouds to [`on_point_cloud`][Self::on_point_cloud]
    /// until the input topic closes.
    ///
    /// # Errors
    ///
    /// Returns [`NormalsError::Channel`] if called a second time.
    pub async fn spin(&mut self) -> Result<(), NormalsError> {
        let mut subscriber = self
            .subscriber
            .take()
            .ok_or_else(|| NormalsError::Channel(format!("{}: already spinning", self.name)))?;

        while let Some(cloud) = subscriber.recv().await {
            self.on_point_cloud(&cloud);
        }

        info!(node = %self.name, topic = %subscriber.topic(), "input topic closed");
        Ok(())
    }

    /// Diagnostic name: `<namespace>/NormalAugmenter`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AugmenterConfig {
        &self.config
    }

    pub fn output_topic(&self) -> &str {
        self.publisher.topic()
    }

    /// Number of consumers currently attached to the output topic.
    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use normalcast_middleware::{EventBus, ParameterStore};
    use normalcast_perception::SurfaceNormal;
    use normalcast_types::Header;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type InputCloud = PointCloud<PointXyz>;
    type OutputCloud = PointCloud<PointNormal>;

    /// Estimator that counts calls and returns upward normals.
    struct CountingEstimator {
        calls: Arc<AtomicUsize>,
    }

    impl NormalEstimator for CountingEstimator {
        fn estimate(
            &self,
            points: &[PointXyz],
            _neighborhood: Neighborhood,
        ) -> Result<Vec<SurfaceNormal>, NormalsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                SurfaceNormal {
                    normal: [0.0, 0.0, 1.0],
                    curvature: 0.0,
                };
                points.len()
            ])
        }
    }

    /// Estimator that always fails.
    struct FailingEstimator;

    impl NormalEstimator for FailingEstimator {
        fn estimate(
            &self,
            _points: &[PointXyz],
            _neighborhood: Neighborhood,
        ) -> Result<Vec<SurfaceNormal>, NormalsError> {
            Err(NormalsError::Estimation("solver diverged".to_string()))
        }
    }

    fn context(namespace: &str, radius: Option<f64>) -> NodeContext {
        let mut params = ParameterStore::default();
        if let Some(r) = radius {
            params.set(&names::append(namespace, SEARCH_RADIUS_PARAM), r);
        }
        NodeContext::new(namespace, EventBus::new(), params)
    }

    fn planar_cloud(seq: u32) -> InputCloud {
        PointCloud::from_points(
            Header {
                seq,
                frame_id: "lidar".to_string(),
                ..Header::default()
            },
            vec![
                PointXyz::new(0.0, 0.0, 1.0),
                PointXyz::new(1.0, 0.0, 1.0),
                PointXyz::new(0.0, 1.0, 1.0),
            ],
        )
    }

    fn counting(ctx: &NodeContext) -> (NormalAugmenter<CountingEstimator>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let estimator_calls = Arc::clone(&calls);
        let augmenter = NormalAugmenter::initialize_with(ctx, move |_| CountingEstimator {
            calls: estimator_calls,
        })
        .unwrap();
        (augmenter, calls)
    }

    // ── initialize / load_configuration ──────────────────────────────────────

    #[test]
    fn initialize_derives_name_and_topics_from_namespace() {
        let ctx = context("/robot", Some(0.5));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        assert_eq!(augmenter.name(), "/robot/NormalAugmenter");
        assert_eq!(augmenter.output_topic(), "/robot/point_cloud_with_normals");
        assert_eq!(augmenter.config().search_radius, 0.5);
        assert_eq!(augmenter.config().viewpoint, [0.0; 3]);
    }

    #[test]
    fn initialize_fails_without_search_radius() {
        let ctx = context("/robot", None);
        let result = NormalAugmenter::initialize(&ctx);
        assert!(matches!(
            result,
            Err(NormalsError::MissingParameter(ref key)) if key == "/robot/normals/search_radius"
        ));
    }

    #[test]
    fn radius_under_another_namespace_is_not_found() {
        let mut params = ParameterStore::default();
        params.set("/other/normals/search_radius", 0.5);
        let ctx = NodeContext::new("/robot", EventBus::new(), params);
        assert!(NormalAugmenter::initialize(&ctx).is_err());
    }

    #[test]
    fn initialize_rejects_non_numeric_radius() {
        let mut params = ParameterStore::default();
        params.set("/normals/search_radius", "wide");
        let ctx = NodeContext::new("/", EventBus::new(), params);
        assert!(matches!(
            NormalAugmenter::initialize(&ctx),
            Err(NormalsError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn initialize_rejects_non_positive_radius() {
        for radius in [0.0, -0.1] {
            let ctx = context("/", Some(radius));
            assert!(matches!(
                NormalAugmenter::initialize(&ctx),
                Err(NormalsError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn viewpoint_parameter_is_optional_and_loaded() {
        let mut params = ParameterStore::default();
        params.set("/normals/search_radius", 1.0);
        params.set("/normals/viewpoint", vec![0.0, 0.0, 5.0]);
        let ctx = NodeContext::new("/", EventBus::new(), params);
        let config = NormalAugmenter::<KdTreeNormalEstimator>::load_configuration(&ctx).unwrap();
        assert_eq!(config.viewpoint, [0.0, 0.0, 5.0]);
    }

    #[test]
    fn register_endpoints_fails_on_conflicting_topic_type() {
        let ctx = context("/", Some(0.5));
        let _squatter = ctx.bus().advertise::<u32>("/point_cloud_with_normals", 10, false).unwrap();
        assert!(matches!(
            NormalAugmenter::initialize(&ctx),
            Err(NormalsError::Channel(_))
        ));
    }

    // ── on_point_cloud ──────────────────────────────────────────────────────

    #[test]
    fn no_subscribers_means_no_work_and_no_publication() {
        let ctx = context("/", Some(2.0));
        let (augmenter, calls) = counting(&ctx);

        augmenter.on_point_cloud(&planar_cloud(1));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(augmenter.subscriber_count(), 0);
    }

    #[test]
    fn one_publication_per_input_with_a_subscriber() {
        let ctx = context("/", Some(2.0));
        let (augmenter, calls) = counting(&ctx);
        let mut rx = ctx
            .bus()
            .subscribe::<OutputCloud>("/point_cloud_with_normals", 10)
            .unwrap();

        for seq in 0..3 {
            augmenter.on_point_cloud(&planar_cloud(seq));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        for seq in 0..3 {
            let out = rx.try_recv().expect("one publication per input");
            assert_eq!(out.header.seq, seq);
        }
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn estimator_failure_is_logged_and_nothing_is_published() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize_with(&ctx, |_| FailingEstimator).unwrap();
        let mut rx = ctx
            .bus()
            .subscribe::<OutputCloud>("/point_cloud_with_normals", 10)
            .unwrap();

        augmenter.on_point_cloud(&planar_cloud(1));
        assert!(rx.try_recv().is_none());
    }

    // ── compute_normals ─────────────────────────────────────────────────────

    #[test]
    fn null_output_fails_without_work() {
        let ctx = context("/", Some(2.0));
        let (augmenter, calls) = counting(&ctx);
        let result = augmenter.compute_normals(&planar_cloud(1), None);
        assert_eq!(result, Err(NormalsError::NullOutput));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn output_has_input_header_length_and_positions() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        let input = planar_cloud(42);
        let mut out = OutputCloud::default();

        augmenter.compute_normals(&input, Some(&mut out)).unwrap();

        assert_eq!(out.header, input.header);
        assert_eq!(out.len(), input.len());
        assert_eq!((out.width, out.height), (input.width, input.height));
        for (o, i) in out.points.iter().zip(&input.points) {
            assert_eq!(o.position(), *i);
        }
    }

    #[test]
    fn planar_patch_gets_perpendicular_normals() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        let mut out = OutputCloud::default();

        augmenter.compute_normals(&planar_cloud(1), Some(&mut out)).unwrap();

        assert_eq!(out.len(), 3);
        assert!(out.is_dense);
        for p in &out.points {
            assert!(p.normal_x.abs() < 1e-4);
            assert!(p.normal_y.abs() < 1e-4);
            // Oriented towards the default viewpoint at the origin.
            assert!((p.normal_z + 1.0).abs() < 1e-4, "nz = {}", p.normal_z);
            assert!(p.curvature.abs() < 1e-4);
        }
    }

    #[test]
    fn compute_normals_is_idempotent() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        let input = planar_cloud(9);

        let mut first = OutputCloud::default();
        let mut second = OutputCloud::default();
        augmenter.compute_normals(&input, Some(&mut first)).unwrap();
        augmenter.compute_normals(&input, Some(&mut second)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn sparse_cloud_is_marked_not_dense() {
        let ctx = context("/", Some(0.1));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        let mut out = OutputCloud::default();

        augmenter.compute_normals(&planar_cloud(1), Some(&mut out)).unwrap();

        assert_eq!(out.len(), 3);
        assert!(!out.is_dense);
        assert!(out.points.iter().all(|p| p.normal_x.is_nan() && p.curvature.is_nan()));
    }

    #[test]
    fn compute_normals_without_subscribers_still_fills_output() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        let mut out = OutputCloud::default();
        augmenter.compute_normals(&planar_cloud(5), Some(&mut out)).unwrap();
        assert_eq!(out.header.seq, 5);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn estimator_error_propagates_from_compute_normals() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize_with(&ctx, |_| FailingEstimator).unwrap();
        let mut out = OutputCloud::default();
        let result = augmenter.compute_normals(&planar_cloud(1), Some(&mut out));
        assert!(matches!(result, Err(NormalsError::Estimation(_))));
    }

    #[test]
    fn failed_estimation_leaves_output_marked_not_dense() {
        let ctx = context("/", Some(2.0));
        let augmenter = NormalAugmenter::initialize_with(&ctx, |_| FailingEstimator).unwrap();
        let input = planar_cloud(4);
        let mut out = OutputCloud::default();
        assert!(out.is_dense);

        let result = augmenter.compute_normals(&input, Some(&mut out));

        assert!(matches!(result, Err(NormalsError::Estimation(_))));
        assert_eq!(out.header, input.header);
        assert_eq!(out.len(), input.len());
        assert!(!out.is_dense);
    }

    // ── spin ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn spin_dispatches_bus_messages() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = context("/robot", Some(2.0));
        let mut augmenter = NormalAugmenter::initialize(&ctx)?;
        let input = ctx.bus().advertise::<InputCloud>("/robot/point_cloud", 100, false)?;
        let mut output = ctx
            .bus()
            .subscribe::<OutputCloud>("/robot/point_cloud_with_normals", 10)?;

        let handle = tokio::spawn(async move { augmenter.spin().await });

        input.publish(planar_cloud(11));
        let out = tokio::time::timeout(Duration::from_secs(2), output.recv())
            .await?
            .ok_or("output topic closed")?;
        assert_eq!(out.header.seq, 11);
        assert_eq!(out.len(), 3);

        handle.abort();
        Ok(())
    }

    #[tokio::test]
    async fn spin_twice_is_an_error() {
        let ctx = context("/", Some(2.0));
        let mut augmenter = NormalAugmenter::initialize(&ctx).unwrap();
        // Simulate a spin that already owns the subscriber.
        let _taken = augmenter.subscriber.take();
        assert!(matches!(augmenter.spin().await, Err(NormalsError::Channel(_))));
    }
}
