//! Filesystem orchestration layer: resolves uuid-addressed public API
//! calls (`fs_destroy`, `fs_snapshot`, `fs_clone`, `ss_list`, ...) to
//! the right `FsBackend`, and delegates NFS verbs to `crate::nfs`.
//!
//! Grounded on `examples/original_source/targetd/fs.py` for verb
//! sequencing (snapshot-then-destroy ordering, and the rule that a
//! uuid is resolved by scanning `fs_list` only, never snapshot output
//! — see DESIGN.md's Open Question decision on `fs_destroy`).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::btrfs::BtrfsBackend;
use crate::backend::zfs::{FsPoolMapping, ZfsBackend};
use crate::backend::{Filesystem, FsBackend, Pool, Snapshot};
use crate::config::Config;
use crate::error::{Result, TargetdError};
use crate::nfs::{Export, NfsManager};
use crate::util::name_check;

pub struct NfsExportInfo {
    pub host: String,
    pub path: String,
    pub options: Vec<String>,
}

/// Serialization of mutating calls is not this struct's job: spec.md
/// §3/§5 mandate one process-wide mutex around the whole dispatched
/// method body, held by `Dispatcher` in `src/rpc.rs` (see the note on
/// `BlockManager` in `src/block.rs`) — a lock here would let a block
/// verb and an fs verb run concurrently even though both ZFS halves
/// shell out to the same `zfs` binary.
pub struct FsManager {
    backends: Vec<Arc<dyn FsBackend>>,
    nfs: NfsManager,
    allow_chown: bool,
}

impl FsManager {
    pub async fn new(config: &Config) -> Result<Self> {
        let mut backends: Vec<Arc<dyn FsBackend>> = Vec::new();
        if !config.fs_pools.is_empty() {
            let mounts = config.fs_pools.iter().map(std::path::PathBuf::from).collect();
            if let Some(btrfs) = BtrfsBackend::new(mounts).await? {
                backends.push(Arc::new(btrfs));
            }
        }
        if !config.zfs_fs_pools.is_empty() {
            let mappings = config
                .zfs_fs_pools
                .iter()
                .map(|p| FsPoolMapping {
                    name: p.name.clone(),
                    dataset: p.dataset.clone(),
                })
                .collect();
            if let Some(zfs) = ZfsBackend::new_fs(mappings, config.zfs_enable_copy).await? {
                backends.push(Arc::new(zfs));
            }
        }
        Ok(FsManager {
            backends,
            nfs: NfsManager::default(),
            allow_chown: config.allow_chown,
        })
    }

    fn backend_for_pool(&self, pool: &str) -> Result<&Arc<dyn FsBackend>> {
        self.backends
            .iter()
            .find(|b| b.has_fs_pool(pool))
            .ok_or_else(|| TargetdError::InvalidPool(pool.to_string()))
    }

    pub async fn fs_list(&self) -> Result<Vec<Filesystem>> {
        let mut out = Vec::new();
        for backend in &self.backends {
            out.extend(backend.fs_list().await?);
        }
        Ok(out)
    }

    async fn get_fs_by_uuid(&self, uuid: &str) -> Result<Filesystem> {
        self.fs_list()
            .await?
            .into_iter()
            .find(|f| f.uuid == uuid)
            .ok_or_else(|| TargetdError::NotFoundFs(uuid.to_string()))
    }

    pub async fn fs_create(&self, pool: &str, name: &str, size: u64) -> Result<()> {
        name_check(name)?;
        self.backend_for_pool(pool)?.fs_create(pool, name, size).await
    }

    pub async fn fs_destroy(&self, uuid: &str) -> Result<()> {
        let fs = self.get_fs_by_uuid(uuid).await?;
        self.backend_for_pool(&fs.pool)?.fs_destroy(&fs.pool, &fs.name).await
    }

    pub async fn ss(&self, fs_uuid: &str) -> Result<Vec<Snapshot>> {
        let fs = self.get_fs_by_uuid(fs_uuid).await?;
        self.backend_for_pool(&fs.pool)?.ss(&fs.pool, &fs.name).await
    }

    async fn get_ss_by_uuid(&self, fs_uuid: &str, ss_uuid: &str) -> Result<Snapshot> {
        self.ss(fs_uuid)
            .await?
            .into_iter()
            .find(|s| s.uuid == ss_uuid)
            .ok_or_else(|| TargetdError::NotFoundSs(ss_uuid.to_string()))
    }

    pub async fn fs_snapshot(&self, fs_uuid: &str, dest_ss_name: &str) -> Result<()> {
        name_check(dest_ss_name)?;
        let fs = self.get_fs_by_uuid(fs_uuid).await?;
        self.backend_for_pool(&fs.pool)?
            .fs_snapshot(&fs.pool, &fs.name, dest_ss_name)
            .await
    }

    pub async fn fs_snapshot_delete(&self, fs_uuid: &str, ss_uuid: &str) -> Result<()> {
        let fs = self.get_fs_by_uuid(fs_uuid).await?;
        let snapshot = self.get_ss_by_uuid(fs_uuid, ss_uuid).await?;
        self.backend_for_pool(&fs.pool)?
            .fs_snapshot_delete(&fs.pool, &fs.name, &snapshot.name)
            .await
    }

    pub async fn fs_clone(&self, fs_uuid: &str, dest_fs_name: &str, snapshot_id: Option<&str>) -> Result<()> {
        name_check(dest_fs_name)?;
        let fs = self.get_fs_by_uuid(fs_uuid).await?;
        let snapshot_name = match snapshot_id {
            Some(id) => Some(self.get_ss_by_uuid(fs_uuid, id).await?.name),
            None => None,
        };
        self.backend_for_pool(&fs.pool)?
            .fs_clone(&fs.pool, &fs.name, dest_fs_name, snapshot_name.as_deref())
            .await
    }

    pub async fn fs_pools(&self) -> Result<Vec<Pool>> {
        let mut out = Vec::new();
        for backend in &self.backends {
            out.extend(backend.fs_pools().await?);
        }
        Ok(out)
    }

    pub fn nfs_export_auth_list(&self) -> &'static [&'static str] {
        NfsManager::security_options()
    }

    pub async fn nfs_export_list(&self) -> Result<Vec<NfsExportInfo>> {
        Ok(self
            .nfs
            .exports()
            .await?
            .into_iter()
            .map(|e: Export| NfsExportInfo {
                host: e.host,
                path: e.path,
                options: e.options_list(),
            })
            .collect())
    }

    pub async fn nfs_export_add(
        &self,
        host: &str,
        path: &str,
        export_path: Option<&str>,
        options: &[String],
        chown: Option<&str>,
    ) -> Result<()> {
        if export_path.is_some() {
            return Err(TargetdError::NfsNoSupport(
                "separate export path not supported at this time".to_string(),
            ));
        }
        if let Some(spec) = chown {
            if !self.allow_chown {
                return Err(TargetdError::NoSupport(
                    "chown extension disabled (allow_chown=false)".to_string(),
                ));
            }
            validate_chown_spec(spec)?;
        }
        let mut bits = 0u32;
        let mut pairs = BTreeMap::new();
        for opt in options {
            if let Some((k, v)) = opt.split_once('=') {
                pairs.insert(k.to_string(), v.to_string());
            } else {
                let Some(bit) = crate::nfs::bool_option(opt) else {
                    return Err(TargetdError::InvalidArgument(format!("unknown export option '{opt}'")));
                };
                bits |= bit;
            }
        }
        self.nfs.export_add(host, path, bits, pairs).await?;
        if let Some(spec) = chown {
            crate::util::invoke(&["chown", spec, path]).await?;
        }
        Ok(())
    }

    pub async fn nfs_export_remove(&self, host: &str, path: &str) -> Result<()> {
        self.nfs.export_remove(host, path).await
    }
}

/// Validates the `"uid[:gid]"` form of the `chown` extension argument.
fn validate_chown_spec(spec: &str) -> Result<()> {
    let mut parts = spec.splitn(2, ':');
    let uid = parts.next().unwrap_or("");
    let gid = parts.next();
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !numeric(uid) || gid.is_some_and(|g| !numeric(g)) {
        return Err(TargetdError::InvalidArgument(format!(
            "invalid chown spec '{spec}', expected uid[:gid]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod chown_tests {
    use super::*;

    #[test]
    fn accepts_uid_and_uid_gid() {
        assert!(validate_chown_spec("1000").is_ok());
        assert!(validate_chown_spec("1000:1000").is_ok());
    }

    #[test]
    fn rejects_non_numeric_or_malformed() {
        assert!(validate_chown_spec("root").is_err());
        assert!(validate_chown_spec("1000:").is_err());
        assert!(validate_chown_spec("").is_err());
    }
}
