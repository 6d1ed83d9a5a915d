//! Capability-interface traits that unify the storage backends behind
//! one shape, and the data-model types they all hand back to the
//! orchestration layer (spec.md §3, §9's "backend polymorphism →
//! capability interface" design note).
//!
//! Each backend answers `has_pool`/`has_fs_pool`/`has_so_name`/
//! `has_udev_path` without raising, so the orchestration layer
//! (`crate::block`, `crate::fs`) can build registries keyed by pool
//! name, storage-object name and udev path at `initialize` time and
//! route an inbound request to the right backend without needing a
//! global index of every volume/filesystem.

pub mod btrfs;
pub mod lvm;
pub mod zfs;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// A pool as reported by `pool_list`/`block_pools`/`fs_pools`.
#[derive(Debug, Clone, Serialize)]
pub struct Pool {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub size: u64,
    pub free_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// A volume living in a block pool.
#[derive(Debug, Clone, Serialize)]
pub struct Volume {
    pub name: String,
    pub size: u64,
    pub uuid: String,
}

/// A filesystem living in an fs pool, as returned by `fs_list`.
#[derive(Debug, Clone, Serialize)]
pub struct Filesystem {
    pub name: String,
    pub uuid: String,
    pub total_space: u64,
    pub free_space: u64,
    #[serde(skip)]
    pub pool: String,
    pub full_path: String,
}

/// A read-only snapshot of a filesystem, as returned by `ss_list`.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub name: String,
    pub uuid: String,
    pub timestamp: i64,
}

/// Unifies the LVM and ZFS block backends behind one interface so the
/// block orchestration layer (`crate::block`) never needs to know
/// which concrete backend owns a pool.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Human-readable name for log lines and error messages.
    fn kind(&self) -> &'static str;

    fn has_pool(&self, pool: &str) -> bool;

    /// The LIO storage-object name this backend would use for
    /// `pool`/`name` (`vg:volname` for LVM, `pool%name` for ZFS).
    fn get_so_name(&self, pool: &str, name: &str) -> String;

    fn has_so_name(&self, so_name: &str) -> bool;

    /// The block device path the LIO storage object would wrap.
    fn get_dev_path(&self, pool: &str, name: &str) -> String;

    fn has_udev_path(&self, udev_path: &str) -> bool;

    /// Recover `(pool, volume)` from a udev device path, used by
    /// `export_list` to attach pool/volume identity to a mapped LUN
    /// whose LIO storage object only carries the device path.
    fn pool_volume_from_udev_path(&self, udev_path: &str) -> Option<(String, String)>;

    async fn volumes(&self, pool: &str) -> Result<Vec<Volume>>;

    async fn create(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    async fn destroy(&self, pool: &str, name: &str) -> Result<()>;

    async fn copy(&self, pool: &str, src: &str, dst: &str, size: Option<u64>) -> Result<()>;

    async fn resize(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    async fn vol_info(&self, pool: &str, name: &str) -> Result<Option<Volume>>;

    async fn block_pools(&self) -> Result<Vec<Pool>>;
}

/// Unifies the btrfs and ZFS filesystem backends behind one interface
/// for the filesystem orchestration layer (`crate::fs`).
#[async_trait]
pub trait FsBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    fn has_fs_pool(&self, pool: &str) -> bool;

    async fn fs_list(&self) -> Result<Vec<Filesystem>>;

    async fn fs_create(&self, pool: &str, name: &str, size: u64) -> Result<()>;

    async fn fs_destroy(&self, pool: &str, name: &str) -> Result<()>;

    async fn fs_clone(
        &self,
        pool: &str,
        src: &str,
        dst: &str,
        snapshot_name: Option<&str>,
    ) -> Result<()>;

    async fn fs_snapshot(&self, pool: &str, name: &str, dest_ss_name: &str) -> Result<()>;

    async fn fs_snapshot_delete(&self, pool: &str, name: &str, ss_name: &str) -> Result<()>;

    async fn ss(&self, pool: &str, name: &str) -> Result<Vec<Snapshot>>;

    async fn fs_pools(&self) -> Result<Vec<Pool>>;
}
