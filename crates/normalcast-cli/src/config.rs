//! Process configuration – reads `normalcast.toml`.
//!
//! ```toml
//! [node]
//! namespace = "/robot"
//!
//! [bridge]
//! listen_addr = "127.0.0.1:9090"
//!
//! [params.robot.normals]
//! search_radius = 0.05
//! ```

use normalcast_middleware::ParameterStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env-var naming the config file when no CLI argument is given.
pub const CONFIG_ENV: &str = "NORMALCAST_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "normalcast.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Namespace the augmenter's topics and parameters resolve under.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Address the WebSocket bridge listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

/// Contents of `normalcast.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    /// Parameter tree handed to nodes; keys are absolute from the root.
    #[serde(default)]
    pub params: toml::Table,
}

fn default_namespace() -> String {
    "/".to_string()
}
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    pub fn parameter_store(&self) -> ParameterStore {
        ParameterStore::new(self.params.clone())
    }
}

/// Pick the config path: first CLI argument, then `NORMALCAST_CONFIG`, then
/// `./normalcast.toml`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist.  Env overrides are applied in both cases.
pub fn load(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `NORMALCAST_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `NORMALCAST_NAMESPACE` | `node.namespace` |
/// | `NORMALCAST_LISTEN_ADDR` | `bridge.listen_addr` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("NORMALCAST_NAMESPACE") {
        cfg.node.namespace = v;
    }
    if let Ok(v) = std::env::var("NORMALCAST_LISTEN_ADDR")
        && let Ok(addr) = v.parse::<SocketAddr>()
    {
        cfg.bridge.listen_addr = addr;
    }
}
