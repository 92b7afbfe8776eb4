//! Service configuration
//!
//! TOML-backed configuration covering the server surface, authentication
//! secrets, metadata store selection, lock manager selection, backends,
//! replication and cluster discovery. Loading performs validation; a config
//! that passes [`Config::validate`] is safe to wire into the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{FsError, FsResult};

/// Placeholder values shipped in the sample config; both secrets must be
/// replaced before the server will start.
pub const PROXY_SECRET_PLACEHOLDER: &str = "change-me-internal-proxy-secret";
pub const LINK_SECRET_PLACEHOLDER: &str = "change-me-single-use-link-secret";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub metadata_store: MetadataStoreConfig,
    pub lock_manager: LockManagerConfig,
    pub backend: BackendConfig,
    pub ha: HaConfig,
    pub instance_discovery: InstanceDiscoveryConfig,
}

/// HTTP server surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// `http`, `https` or `auto`
    pub protocol: String,
    /// Externally reachable base URL, used when minting download links
    pub external_url: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Recognized for config compatibility; this build serves HTTP/1.1 and
    /// logs a warning when QUIC is requested
    pub enable_quic: bool,
    pub quic_listen_addr: Option<String>,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub file_op_timeout_secs: u64,
    pub metadata_op_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            protocol: "http".to_string(),
            external_url: "http://127.0.0.1:8080".to_string(),
            cert_file: None,
            key_file: None,
            enable_quic: false,
            quic_listen_addr: None,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            file_op_timeout_secs: 300,
            metadata_op_timeout_secs: 30,
        }
    }
}

/// Authentication material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// API keys as `user:key` pairs; each key maps to a distinct user
    pub api_keys: Vec<String>,
    /// Shared bearer for instance-to-instance and raft-internal calls
    pub internal_proxy_secret: String,
    /// HMAC secret binding single-use download links
    pub single_use_link_secret: String,
}

impl AuthConfig {
    /// Parse `api_keys` into (key → user) form.
    pub fn parsed_keys(&self) -> FsResult<HashMap<String, String>> {
        let mut map = HashMap::new();
        for entry in &self.api_keys {
            let (user, key) = entry.split_once(':').ok_or_else(|| {
                FsError::InvalidInput(
                    "auth.api_keys entries must be `user:key` pairs".to_string(),
                )
            })?;
            if user.is_empty() || key.is_empty() {
                return Err(FsError::InvalidInput(
                    "auth.api_keys entries must have a non-empty user and key".to_string(),
                ));
            }
            map.insert(key.to_string(), user.to_string());
        }
        Ok(map)
    }
}

/// Metadata store selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataStoreConfig {
    /// `memory`, `relational`, `embedded` or `replicated_log`
    pub store_type: String,
    /// Relational store DSN (sqlite or postgres URL)
    pub database_url: Option<String>,
    /// Embedded store directory
    pub data_dir: Option<PathBuf>,
    pub replicated_log: ReplicatedLogConfig,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            store_type: "memory".to_string(),
            database_url: None,
            data_dir: None,
            replicated_log: ReplicatedLogConfig::default(),
        }
    }
}

/// Replicated metadata log settings (when `store_type = "replicated_log"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatedLogConfig {
    pub node_id: String,
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Seed a single-member configuration on first start
    pub bootstrap: bool,
    /// node_id → raft address
    pub peers: HashMap<String, String>,
    /// node_id → HTTP api endpoint, used for leader forwarding
    pub api_peer_endpoints: HashMap<String, String>,
    pub apply_timeout_secs: u64,
    pub forward_timeout_secs: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_threshold: u64,
    pub retain_snapshot_count: usize,
}

impl Default for ReplicatedLogConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: "127.0.0.1:9090".to_string(),
            data_dir: PathBuf::from("./callfs-raft"),
            bootstrap: false,
            peers: HashMap::new(),
            api_peer_endpoints: HashMap::new(),
            apply_timeout_secs: 10,
            forward_timeout_secs: 15,
            snapshot_interval_secs: 600,
            snapshot_threshold: 8192,
            retain_snapshot_count: 3,
        }
    }
}

impl ReplicatedLogConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }
}

/// Lock manager selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// `local` or `redis`
    pub manager_type: String,
    pub redis_addr: Option<String>,
    pub redis_password: Option<String>,
    pub lease_secs: u64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            manager_type: "local".to_string(),
            redis_addr: None,
            redis_password: None,
            lease_secs: 30,
        }
    }
}

/// Backend drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `localfs` or `object_store`
    pub default_backend: String,
    pub localfs_root_path: PathBuf,
    pub object_store: ObjectStoreConfig,
    /// Skip TLS verification for peer-proxy calls (lab clusters only)
    pub peer_skip_tls_verify: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_backend: "localfs".to_string(),
            localfs_root_path: PathBuf::from("./callfs-data"),
            object_store: ObjectStoreConfig::default(),
            peer_skip_tls_verify: false,
        }
    }
}

/// Object store driver settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub enabled: bool,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores; AWS default when empty
    pub endpoint: Option<String>,
    /// Server-side encryption header value, e.g. `AES256` or `aws:kms`
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub acl: Option<String>,
    /// Write zero-byte `dir/` marker objects on directory create
    pub directory_markers: bool,
}

/// High-availability replication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub replication_enabled: bool,
    /// Secondary backend tag (`localfs` or `object_store`)
    pub replica_backend: Option<String>,
    /// Abort the request when the replica write fails
    pub require_replica_success: bool,
}

/// Cluster identity and peer addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceDiscoveryConfig {
    pub instance_id: String,
    /// instance_id → externally reachable base URL
    pub peer_endpoints: HashMap<String, String>,
}

impl Default for InstanceDiscoveryConfig {
    fn default() -> Self {
        Self {
            instance_id: "instance-1".to_string(),
            peer_endpoints: HashMap::new(),
        }
    }
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> FsResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FsError::InvalidInput(format!("cannot read config {path:?}: {e}")))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| FsError::InvalidInput(format!("cannot parse config {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> FsResult<()> {
        if self.auth.internal_proxy_secret.is_empty()
            || self.auth.internal_proxy_secret == PROXY_SECRET_PLACEHOLDER
        {
            return Err(FsError::InvalidInput(
                "auth.internal_proxy_secret must be set to a real secret".to_string(),
            ));
        }
        if self.auth.single_use_link_secret.is_empty()
            || self.auth.single_use_link_secret == LINK_SECRET_PLACEHOLDER
        {
            return Err(FsError::InvalidInput(
                "auth.single_use_link_secret must be set to a real secret".to_string(),
            ));
        }
        if self.auth.internal_proxy_secret == self.auth.single_use_link_secret {
            return Err(FsError::InvalidInput(
                "internal_proxy_secret and single_use_link_secret must differ".to_string(),
            ));
        }
        self.auth.parsed_keys()?;

        match self.server.protocol.as_str() {
            "http" | "https" | "auto" => {}
            other => {
                return Err(FsError::InvalidInput(format!(
                    "server.protocol must be http, https or auto, got {other:?}"
                )))
            }
        }

        match self.metadata_store.store_type.as_str() {
            "memory" | "embedded" | "replicated_log" => {}
            "relational" => {
                if self.metadata_store.database_url.is_none() {
                    return Err(FsError::InvalidInput(
                        "metadata_store.database_url is required for the relational store"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(FsError::InvalidInput(format!(
                    "unknown metadata_store.store_type {other:?}"
                )))
            }
        }

        match self.lock_manager.manager_type.as_str() {
            "local" => {}
            "redis" => {
                if self.lock_manager.redis_addr.is_none() {
                    return Err(FsError::InvalidInput(
                        "lock_manager.redis_addr is required for the redis lock manager"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(FsError::InvalidInput(format!(
                    "unknown lock_manager.manager_type {other:?}"
                )))
            }
        }

        match self.backend.default_backend.as_str() {
            "localfs" => {}
            "object_store" => {
                if !self.backend.object_store.enabled {
                    return Err(FsError::InvalidInput(
                        "backend.object_store must be enabled to be the default backend"
                            .to_string(),
                    ));
                }
            }
            other => {
                return Err(FsError::InvalidInput(format!(
                    "unknown backend.default_backend {other:?}"
                )))
            }
        }

        if self.ha.replication_enabled {
            match self.ha.replica_backend.as_deref() {
                None => {
                    return Err(FsError::InvalidInput(
                        "ha.replica_backend is required when replication is enabled".to_string(),
                    ))
                }
                Some(replica) if replica == self.backend.default_backend => {
                    return Err(FsError::InvalidInput(
                        "ha.replica_backend must differ from backend.default_backend".to_string(),
                    ))
                }
                Some("localfs") | Some("object_store") => {}
                Some(other) => {
                    return Err(FsError::InvalidInput(format!(
                        "unknown ha.replica_backend {other:?}"
                    )))
                }
            }
        }

        if self.instance_discovery.instance_id.is_empty() {
            return Err(FsError::InvalidInput(
                "instance_discovery.instance_id must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.auth.internal_proxy_secret = "proxy-secret".to_string();
        config.auth.single_use_link_secret = "link-secret".to_string();
        config.auth.api_keys = vec!["alice:key-a".to_string(), "bob:key-b".to_string()];
        config
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_placeholder_secrets_rejected() {
        let mut config = valid_config();
        config.auth.internal_proxy_secret = PROXY_SECRET_PLACEHOLDER.to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.auth.single_use_link_secret = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_equal_secrets_rejected() {
        let mut config = valid_config();
        config.auth.single_use_link_secret = config.auth.internal_proxy_secret.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_format() {
        let mut config = valid_config();
        config.auth.api_keys = vec!["bare-key".to_string()];
        assert!(config.validate().is_err());

        let keys = valid_config().auth.parsed_keys().unwrap();
        assert_eq!(keys.get("key-a").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_replica_must_differ() {
        let mut config = valid_config();
        config.ha.replication_enabled = true;
        config.ha.replica_backend = Some("localfs".to_string());
        assert!(config.validate().is_err());

        config.ha.replica_backend = Some("object_store".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_relational_requires_dsn() {
        let mut config = valid_config();
        config.metadata_store.store_type = "relational".to_string();
        assert!(config.validate().is_err());

        config.metadata_store.database_url = Some("sqlite::memory:".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let config = valid_config();
        let raw = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.server.listen_addr, config.server.listen_addr);
        assert_eq!(parsed.auth.api_keys, config.auth.api_keys);
    }
}
