//! [`NodeContext`] – everything a node needs from its host process.
//!
//! The context bundles the node's namespace, the shared [`EventBus`] and the
//! read-only [`ParameterStore`].  It is built once at startup and passed to
//! a node's `initialize`; nodes never reach for process-global state.

use std::sync::Arc;

use normalcast_middleware::{EventBus, ParameterStore, names};
use normalcast_types::NormalsError;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct NodeContext {
    namespace: String,
    bus: EventBus,
    params: Arc<ParameterStore>,
}

impl NodeContext {
    /// Create a context rooted at `namespace` (made absolute if relative).
    pub fn new(namespace: &str, bus: EventBus, params: ParameterStore) -> Self {
        Self {
            namespace: names::resolve("/", namespace),
            bus,
            params: Arc::new(params),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Resolve a topic or parameter name under this context's namespace.
    pub fn resolve(&self, name: &str) -> String {
        names::resolve(&self.namespace, name)
    }

    /// Fetch a required parameter relative to the namespace.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T, NormalsError> {
        self.params.get(&self.namespace, key)
    }

    /// Fetch an optional parameter relative to the namespace.
    pub fn param_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, NormalsError> {
        self.params.get_or(&self.namespace, key, default)
    }
}
