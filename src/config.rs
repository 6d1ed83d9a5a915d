//! Configuration loading: YAML file merged over built-in defaults.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, TargetdError};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/target/targetd.yaml";
const DEFAULT_PORT: u16 = 18700;

/// A single configured ZFS filesystem pool: the pool name exposed to
/// clients and the underlying dataset it is rooted at. These need not
/// be equal (`backends/zfs.py`'s `pools_fs` mapping).
#[derive(Debug, Clone, Deserialize)]
pub struct ZfsFsPool {
    pub name: String,
    pub dataset: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub block_pools: Vec<String>,
    pub fs_pools: Vec<String>,
    pub zfs_block_pools: Vec<String>,
    pub zfs_fs_pools: Vec<ZfsFsPool>,
    pub zfs_enable_copy: bool,
    pub allow_chown: bool,
    pub user: String,
    pub password: Option<String>,
    pub log_level: String,
    pub target_name: String,
    pub ssl: bool,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub portal_addresses: Vec<String>,
    pub port: u16,
    /// Legacy single-pool key; rewritten into `block_pools` on load.
    pub pool_name: Option<String>,
    /// Optional localhost address to bind the Prometheus exporter on.
    pub metrics_listen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Config {
            block_pools: vec!["vg-targetd".to_string()],
            fs_pools: Vec::new(),
            zfs_block_pools: Vec::new(),
            zfs_fs_pools: Vec::new(),
            zfs_enable_copy: false,
            allow_chown: false,
            user: "admin".to_string(),
            password: None,
            log_level: "info".to_string(),
            target_name: format!("iqn.2003-01.org.linux-iscsi.{hostname}:targetd"),
            ssl: false,
            ssl_cert: None,
            ssl_key: None,
            portal_addresses: vec!["0.0.0.0".to_string()],
            port: DEFAULT_PORT,
            pool_name: None,
            metrics_listen: None,
        }
    }
}

impl Config {
    /// Load `path`, merging over defaults. Applies the legacy
    /// `pool_name` rewrite and de-duplicates pool lists. Fails fast
    /// (as the original does) if no password was configured.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&raw)
                .map_err(|e| TargetdError::Invalid(format!("invalid config {}: {e}", path.display())))?
        } else {
            Config::default()
        };

        if let Some(legacy) = config.pool_name.take() {
            warn!("config key 'pool_name' is deprecated, use 'block_pools'");
            config.block_pools = vec![legacy];
        }

        dedup(&mut config.block_pools);
        dedup(&mut config.fs_pools);

        if config.password.is_none() {
            return Err(TargetdError::Invalid(
                "no password configured, refusing to start".to_string(),
            ));
        }

        Ok(config)
    }
}

fn dedup(pools: &mut Vec<String>) {
    let mut seen = HashSet::new();
    pools.retain(|p| seen.insert(p.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.block_pools, vec!["vg-targetd".to_string()]);
        assert!(c.fs_pools.is_empty());
        assert_eq!(c.user, "admin");
        assert!(!c.ssl);
        assert_eq!(c.portal_addresses, vec!["0.0.0.0".to_string()]);
    }

    #[test]
    fn missing_password_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targetd.yaml");
        fs::write(&path, "block_pools: [vg0]\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn legacy_pool_name_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targetd.yaml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "pool_name: legacy-vg\npassword: secret\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.block_pools, vec!["legacy-vg".to_string()]);
        assert!(config.pool_name.is_none());
    }

    #[test]
    fn block_pools_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targetd.yaml");
        fs::write(&path, "block_pools: [vg0, vg0, vg1]\npassword: secret\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.block_pools, vec!["vg0".to_string(), "vg1".to_string()]);
    }
}
