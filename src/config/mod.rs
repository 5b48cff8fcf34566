//! Agent configuration.
//!
//! # Components
//!
//! - [`store`] - durable key/value settings ([`ConfigStore`])
//! - [`AgentConfig`] - runtime parameters read from the environment
//!
//! # Environment
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `AGENT_PORT` | `8080` | Control channel TCP port |
//! | `AGENT_CONFIG_PATH` | `config.json` | Settings file |
//! | `AGENT_UPLOAD_DIR` | `.` | Directory receiving `load_file` uploads |
//! | `AGENT_DISCOVERY` | on | `0`/`false`/`off` disables the UDP responder |
//! | `AGENT_MAX_ASSOCIATION_SECS` | unbounded | Give up waiting for an IP after this long |
//! | `AGENT_PERSIST` | `immediate` | `deferred` batches writes until shutdown |

mod store;

pub use store::{ConfigStore, PersistPolicy};

use log::warn;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default control channel port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default settings file name.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Setting key that suppresses low-level debug output at startup.
pub const DISABLE_DEBUG_KEY: &str = "disable_debug";

/// Runtime parameters for the device agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Control channel TCP port.
    pub port: u16,
    /// Settings file backing the [`ConfigStore`].
    pub config_path: PathBuf,
    /// Directory uploaded files are written to.
    pub upload_dir: PathBuf,
    /// Run the UDP discovery responder.
    pub discovery: bool,
    /// Upper bound on a single association attempt. `None` waits forever.
    pub max_association_wait: Option<Duration>,
    /// When settings reach the backing file.
    pub persist: PersistPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            upload_dir: PathBuf::from("."),
            discovery: true,
            max_association_wait: None,
            persist: PersistPolicy::Immediate,
        }
    }
}

impl AgentConfig {
    /// Build the configuration from `AGENT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Values that fail to parse are logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "AGENT_PORT") {
            config.port = port;
        }
        if let Some(path) = lookup("AGENT_CONFIG_PATH").filter(|s| !s.is_empty()) {
            config.config_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("AGENT_UPLOAD_DIR").filter(|s| !s.is_empty()) {
            config.upload_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("AGENT_DISCOVERY") {
            config.discovery = !matches!(
                flag.trim().to_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "AGENT_MAX_ASSOCIATION_SECS") {
            config.max_association_wait = Some(Duration::from_secs(secs));
        }
        if let Some(policy) = parse_var(&lookup, "AGENT_PERSIST") {
            config.persist = policy;
        }

        config
    }

    /// Place relative settings and upload paths under `root`.
    ///
    /// Used on the device, where the working directory is not backed by
    /// flash and everything durable lives on the mounted data partition.
    pub fn rooted_at(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        if self.config_path.is_relative() {
            self.config_path = root.join(&self.config_path);
        }
        if self.upload_dir == Path::new(".") {
            self.upload_dir = root.to_path_buf();
        } else if self.upload_dir.is_relative() {
            self.upload_dir = root.join(&self.upload_dir);
        }
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring invalid {}='{}': {}", name, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.port, 8080);
        assert!(config.discovery);
        assert_eq!(config.max_association_wait, None);
    }

    #[test]
    fn test_overrides() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("AGENT_PORT", "9000"),
            ("AGENT_CONFIG_PATH", "/data/settings.json"),
            ("AGENT_UPLOAD_DIR", "/data/uploads"),
            ("AGENT_DISCOVERY", "off"),
            ("AGENT_MAX_ASSOCIATION_SECS", "30"),
            ("AGENT_PERSIST", "deferred"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.config_path, PathBuf::from("/data/settings.json"));
        assert_eq!(config.upload_dir, PathBuf::from("/data/uploads"));
        assert!(!config.discovery);
        assert_eq!(config.max_association_wait, Some(Duration::from_secs(30)));
        assert_eq!(config.persist, PersistPolicy::Deferred);
    }

    #[test]
    fn test_rooted_at_moves_relative_paths() {
        let config = AgentConfig::default().rooted_at("/storage");
        assert_eq!(config.config_path, PathBuf::from("/storage/config.json"));
        assert_eq!(config.upload_dir, PathBuf::from("/storage"));

        let config = AgentConfig::from_lookup(lookup_from(&[
            ("AGENT_CONFIG_PATH", "/nvs/settings.json"),
            ("AGENT_UPLOAD_DIR", "lib"),
        ]))
        .rooted_at("/storage");
        assert_eq!(config.config_path, PathBuf::from("/nvs/settings.json"));
        assert_eq!(config.upload_dir, PathBuf::from("/storage/lib"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = AgentConfig::from_lookup(lookup_from(&[
            ("AGENT_PORT", "eighty"),
            ("AGENT_PERSIST", "whenever"),
        ]));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.persist, PersistPolicy::Immediate);
    }
}
