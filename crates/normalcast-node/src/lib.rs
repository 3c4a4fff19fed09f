//! `normalcast-node` – The Normal Augmenter
//!
//! Hosts the node that turns raw point clouds into point clouds with
//! per-point surface normals and curvature.
//!
//! # Modules
//!
//! - [`context`] – [`NodeContext`]: the namespace, shared
//!   [`EventBus`][normalcast_middleware::EventBus] and parameter store handed
//!   to a node at startup.
//! - [`augmenter`] – [`NormalAugmenter`]: loads `normals/search_radius`,
//!   subscribes to `point_cloud`, advertises `point_cloud_with_normals` and
//!   republishes every cloud with normals while someone is listening.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to any OTLP-compatible collector.

pub mod augmenter;
pub mod context;
pub mod telemetry;

pub use augmenter::{AugmenterConfig, Endpoints, NormalAugmenter};
pub use context::NodeContext;
pub use telemetry::{TracerProviderGuard, init_tracing};
