//! `normalcast-middleware` – The Transport Layer
//!
//! Routes point clouds between producers, the normal augmenter, and external
//! clients without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels, with per-topic queue depth and optional latching.
//! - [`names`] – Resolution of `/`-separated graph names against a namespace.
//! - [`params`] – [`ParameterStore`]: hierarchical, namespace-aware
//!   parameters backed by a TOML table.
//! - [`ws_bridge`] – rosbridge-style WebSocket bridge that lets external
//!   clients publish raw clouds and subscribe to augmented ones as JSON.

pub mod bus;
pub mod names;
pub mod params;
pub mod ws_bridge;

pub use bus::{EventBus, Publisher, Subscriber};
pub use params::ParameterStore;
pub use ws_bridge::WsBridge;
