//! Node configuration.
//!
//! Values come from an optional TOML file and are then overridden by command
//! line flags (see `main.rs`). Every field has a default so an empty file, or
//! no file at all, yields a runnable single-node setup.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// UDP address used for gossip, e.g. "127.0.0.1:5000".
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// HTTP address for the gateway and internal RPC. Defaults to the gossip
    /// port + 1000 on the same interface.
    #[serde(default)]
    pub http: Option<SocketAddr>,

    /// Gossip addresses of existing members used to bootstrap.
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,

    /// Directory for blobs and index records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub placement: PlacementConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Number of random peers each heartbeat is sent to.
    #[serde(default = "default_fanout")]
    pub fanout: usize,
    /// Consecutive missed heartbeats before a node becomes SUSPECT.
    #[serde(default = "default_missed")]
    pub suspect_after_missed: u32,
    /// Silence after which a SUSPECT node is declared DEAD.
    #[serde(default = "default_dead_ms")]
    pub dead_timeout_ms: u64,
    /// How long a DEAD record is kept before it is purged.
    #[serde(default = "default_purge_ms")]
    pub purge_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlacementConfig {
    #[serde(default = "default_buckets")]
    pub num_buckets: u32,
    #[serde(default = "default_replication")]
    pub replication_factor: usize,
    #[serde(default = "default_vnodes")]
    pub virtual_nodes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_attempts")]
    pub rpc_attempts: usize,
    /// Upper bound on concurrently outstanding sub-queries per query.
    #[serde(default = "default_max_fanout")]
    pub max_fanout: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http: None,
            seeds: Vec::new(),
            data_dir: default_data_dir(),
            membership: MembershipConfig::default(),
            placement: PlacementConfig::default(),
            router: RouterConfig::default(),
            log_format: None,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_ms(),
            fanout: default_fanout(),
            suspect_after_missed: default_missed(),
            dead_timeout_ms: default_dead_ms(),
            purge_grace_ms: default_purge_ms(),
        }
    }
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            num_buckets: default_buckets(),
            replication_factor: default_replication(),
            virtual_nodes: default_vnodes(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: default_query_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_attempts: default_attempts(),
            max_fanout: default_max_fanout(),
        }
    }
}

impl NodeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: NodeConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http
            .unwrap_or_else(|| SocketAddr::new(self.bind.ip(), self.bind.port().wrapping_add(1000)))
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.membership;
        if m.heartbeat_interval_ms == 0 {
            bail!("membership.heartbeat_interval_ms must be > 0");
        }
        if m.suspect_after_missed == 0 {
            bail!("membership.suspect_after_missed must be > 0");
        }
        if m.dead_timeout_ms <= m.suspect_timeout().as_millis() as u64 {
            bail!(
                "membership.dead_timeout_ms ({}) must exceed the suspect timeout ({:?})",
                m.dead_timeout_ms,
                m.suspect_timeout()
            );
        }
        if self.placement.num_buckets == 0 {
            bail!("placement.num_buckets must be > 0");
        }
        if self.placement.replication_factor == 0 {
            bail!("placement.replication_factor must be > 0");
        }
        if self.placement.virtual_nodes == 0 {
            bail!("placement.virtual_nodes must be > 0");
        }
        if self.router.rpc_attempts == 0 {
            bail!("router.rpc_attempts must be > 0");
        }
        Ok(())
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `T`: k missed heartbeats.
    pub fn suspect_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.suspect_after_missed
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn purge_grace(&self) -> Duration {
        Duration::from_millis(self.purge_grace_ms)
    }
}

impl RouterConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_heartbeat_ms() -> u64 {
    500
}

fn default_fanout() -> usize {
    3
}

fn default_missed() -> u32 {
    4
}

fn default_dead_ms() -> u64 {
    6_000
}

fn default_purge_ms() -> u64 {
    30_000
}

fn default_buckets() -> u32 {
    256
}

fn default_replication() -> usize {
    2
}

fn default_vnodes() -> usize {
    64
}

fn default_query_timeout_ms() -> u64 {
    2_000
}

fn default_rpc_timeout_ms() -> u64 {
    500
}

fn default_attempts() -> usize {
    3
}

fn default_max_fanout() -> usize {
    16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = NodeConfig::default();
        cfg.validate().expect("defaults should validate");
        assert_eq!(cfg.membership.suspect_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.http_addr().port(), 6000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let raw = r#"
            bind = "127.0.0.1:7000"
            seeds = ["127.0.0.1:5000"]

            [placement]
            replication_factor = 3
        "#;
        let cfg: NodeConfig = toml::from_str(raw).unwrap();

        assert_eq!(cfg.bind.port(), 7000);
        assert_eq!(cfg.seeds.len(), 1);
        assert_eq!(cfg.placement.replication_factor, 3);
        assert_eq!(cfg.placement.num_buckets, 256);
        assert_eq!(cfg.membership.heartbeat_interval_ms, 500);
    }

    #[test]
    fn test_dead_timeout_must_exceed_suspect_timeout() {
        let mut cfg = NodeConfig::default();
        cfg.membership.dead_timeout_ms = 1_000;
        assert!(cfg.validate().is_err());
    }
}
