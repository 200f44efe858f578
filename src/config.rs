//! Configuration: a `Config` loaded from `<data_dir>/config.json` with
//! missing keys merged in from defaults, and individual fields
//! overridable by environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::coordinator::{DEFAULT_SIGNATURE_WAIT_SECONDS, MAX_SIGNATURE_WAIT_SECONDS, MIN_SIGNATURE_WAIT_SECONDS};

pub const DEFAULT_PORT: u16 = 5000;
pub const MIN_PORT: u16 = 1024;
pub const RPC_COOKIE_FILE: &str = ".cookie";
pub const RPC_BIND_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading/writing config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config.json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("port {0} is out of the configurable range {MIN_PORT}..=65535")]
    PortOutOfRange(u16),
    #[error("signature_wait_seconds {0} is out of range {MIN_SIGNATURE_WAIT_SECONDS}..={MAX_SIGNATURE_WAIT_SECONDS}")]
    SignatureWaitOutOfRange(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownPeer {
    pub ip: String,
    pub port: u16,
}

/// Everything a node needs to find its peers and its own control
/// surface: gossip and RPC ports, known peers, its own identity, and
/// the signature wait this node's coordinator should use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub rpc_port: u16,
    pub known_peers: Vec<KnownPeer>,
    pub node_id: String,
    pub signature_wait_seconds: u16,
    /// Handed verbatim to the UI collaborator; the core never reads it.
    pub language: String,
    /// Handed verbatim to the UI collaborator; the core never reads it.
    pub logo_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            rpc_port: DEFAULT_PORT + 1,
            known_peers: Vec::new(),
            node_id: fresh_node_id(),
            signature_wait_seconds: DEFAULT_SIGNATURE_WAIT_SECONDS as u16,
            language: "en".to_string(),
            logo_path: String::new(),
        }
    }
}

fn fresh_node_id() -> String {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).expect("RNG failure");
    hex::encode(bytes)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.port < MIN_PORT {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        if !(MIN_SIGNATURE_WAIT_SECONDS as u16..=MAX_SIGNATURE_WAIT_SECONDS as u16)
            .contains(&self.signature_wait_seconds)
        {
            return Err(ConfigError::SignatureWaitOutOfRange(self.signature_wait_seconds));
        }
        Ok(())
    }

    /// Reads `<data_dir>/config.json`, merging in defaults for any key the
    /// file is missing. Writes the defaults back out if the file is
    /// absent entirely. Environment variables override individual fields
    /// last, so a multi-node test harness can run several nodes off one
    /// config file.
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let path = config_path(data_dir);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => merge_with_defaults(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = Config::default();
                defaults.save(data_dir)?;
                defaults
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let path = config_path(data_dir);
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var("LEDGERD_PORT") {
            if let Ok(port) = p.parse() {
                self.port = port;
            }
        }
        // Not one of the env vars enumerated above, but needed for the same
        // reason LEDGERD_PORT is: running more than one node against the
        // same binary (e.g. a multi-node test harness) needs independently
        // chosen RPC ports too.
        if let Ok(p) = std::env::var("LEDGERD_RPC_PORT") {
            if let Ok(port) = p.parse() {
                self.rpc_port = port;
            }
        }
        if let Ok(node_id) = std::env::var("LEDGERD_NODE_ID") {
            if !node_id.is_empty() {
                self.node_id = node_id;
            }
        }
        if let Ok(w) = std::env::var("LEDGERD_SIGNATURE_WAIT_SECONDS") {
            if let Ok(seconds) = w.parse() {
                self.signature_wait_seconds = seconds;
            }
        }
    }

    /// Appends a peer learned from an inbound `HELLO`, deduplicated by
    /// `(ip, port)`.
    pub fn add_peer(&mut self, ip: String, port: u16) {
        if !self.known_peers.iter().any(|p| p.ip == ip && p.port == port) {
            self.known_peers.push(KnownPeer { ip, port });
        }
    }
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}

/// Parses `raw` as a partial JSON object and fills any key it omits from
/// `Config::default()`, rather than failing the whole load because one
/// field (e.g. a config.json from an older version) is absent.
fn merge_with_defaults(raw: &str) -> Result<Config, ConfigError> {
    let mut value: serde_json::Value = serde_json::from_str(raw)?;
    let defaults = serde_json::to_value(Config::default())?;
    if let (Some(obj), Some(default_obj)) = (value.as_object_mut(), defaults.as_object()) {
        for (key, default_value) in default_obj {
            obj.entry(key.clone()).or_insert_with(|| default_value.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Default data directory: `<home>/.ledgerd/mainnet`, with a
/// `LEDGERD_DATA_DIR` override for environments that need a different path.
pub fn default_data_dir() -> PathBuf {
    if let Ok(d) = std::env::var("LEDGERD_DATA_DIR") {
        if !d.trim().is_empty() {
            return PathBuf::from(d);
        }
    }
    PathBuf::from(resolve_home_dir()).join(".ledgerd").join("mainnet")
}

fn resolve_home_dir() -> String {
    if let Ok(home) = std::env::var("HOME") {
        if !home.trim().is_empty() {
            return home;
        }
    }
    #[cfg(windows)]
    {
        if let Ok(home) = std::env::var("USERPROFILE") {
            if !home.trim().is_empty() {
                return home;
            }
        }
        let drive = std::env::var("HOMEDRIVE").unwrap_or_default();
        let path = std::env::var("HOMEPATH").unwrap_or_default();
        if !drive.is_empty() || !path.is_empty() {
            return format!("{drive}{path}");
        }
    }
    ".".to_string()
}
