//! btrfs filesystem backend.
//!
//! Grounded on `examples/original_source/targetd/backends/btrfs.py`.
//! Each configured pool is a btrfs mount point; this backend manages
//! two subvolume trees under it, `targetd_fs/` for live filesystems
//! and `targetd_ss/<fs>/` for their read-only snapshots, and never
//! touches anything else under the mount point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::error::{Result, TargetdError};
use crate::util::{invoke, invoke_retrying, name_check};

use super::{Filesystem, FsBackend, Pool, Snapshot};

const FS_DIR: &str = "targetd_fs";
const SS_DIR: &str = "targetd_ss";
const FS_TREE_PREFIX: &str = "<FS_TREE>/";
const BTRFS_TRANSIENT_EXIT: i32 = 19;

pub struct BtrfsBackend {
    mounts: Vec<PathBuf>,
}

async fn create_sub_volume(path: &Path) -> Result<()> {
    if !path.exists() {
        invoke(&["btrfs", "subvolume", "create", &path.to_string_lossy()]).await?;
    }
    Ok(())
}

async fn subvolume_delete(path: &Path) -> Result<()> {
    invoke(&["btrfs", "subvolume", "delete", &path.to_string_lossy()]).await?;
    Ok(())
}

fn fs_space_values(mount_point: &Path) -> Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(mount_point).map_err(|e| {
        TargetdError::Invalid(format!("statvfs failed for {}: {e}", mount_point.display()))
    })?;
    let total = stat.blocks() * stat.fragment_size();
    let free = stat.blocks_available() * stat.fragment_size();
    Ok((total, free))
}

/// Splits `btrfs subvolume list` output into whitespace-delimited
/// fields per line, stripping the `<FS_TREE>/` prefix the newer
/// kernel/progs pair tacks onto paths.
fn split_stdout(out: &str) -> Vec<Vec<String>> {
    out.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() > 1 {
                Some(
                    fields
                        .into_iter()
                        .map(|f| f.strip_prefix(FS_TREE_PREFIX).unwrap_or(f).to_string())
                        .collect(),
                )
            } else {
                None
            }
        })
        .collect()
}

async fn list_subvolumes(args: &[&str]) -> Result<Vec<Vec<String>>> {
    let inv = invoke_retrying(args, BTRFS_TRANSIENT_EXIT, 5, Duration::from_secs(1)).await?;
    Ok(split_stdout(&inv.stdout))
}

/// `btrfs subvolume list -s` prints snapshot timestamps in the
/// system's local zone with no offset field, so `parse_btrfs_timestamp`
/// can only read them back correctly if the daemon's own zone is UTC.
/// Accepts the POSIX `TZ=UTC`/`TZ=UTC0` spellings; anything else
/// (including an unset `TZ` on a host whose `/etc/localtime` isn't
/// UTC) is refused rather than silently drifting by the zone offset.
fn require_utc_timezone() -> Result<()> {
    match std::env::var("TZ").ok().as_deref() {
        Some("UTC") | Some("UTC0") => Ok(()),
        _ => Err(TargetdError::Invalid(
            "btrfs pools are configured but TZ is not set to UTC; snapshot timestamps \
             are reported in the local zone and would be misread as UTC, so the daemon \
             must be started with TZ=UTC"
                .to_string(),
        )),
    }
}

impl BtrfsBackend {
    pub async fn new(mounts: Vec<PathBuf>) -> Result<Option<Self>> {
        if mounts.is_empty() {
            return Ok(None);
        }
        require_utc_timezone()?;
        for mount in &mounts {
            if let Err(e) = create_sub_volume(&mount.join(FS_DIR)).await {
                error!(mount = %mount.display(), error = %e, "unable to create required btrfs subvolumes");
                return Err(e);
            }
            create_sub_volume(&mount.join(SS_DIR)).await?;
        }
        Ok(Some(BtrfsBackend { mounts }))
    }

    fn pool_check(&self, pool: &str) -> Result<&Path> {
        self.mounts
            .iter()
            .find(|m| m.as_os_str() == pool)
            .map(PathBuf::as_path)
            .ok_or_else(|| TargetdError::InvalidPool(pool.to_string()))
    }
}

#[async_trait]
impl FsBackend for BtrfsBackend {
    fn kind(&self) -> &'static str {
        "btrfs"
    }

    fn has_fs_pool(&self, pool: &str) -> bool {
        self.mounts.iter().any(|m| m.as_os_str() == pool)
    }

    async fn fs_list(&self) -> Result<Vec<Filesystem>> {
        let prefix = format!("{FS_DIR}/");
        let mut out = Vec::new();
        for pool in &self.mounts {
            let pool_str = pool.to_string_lossy().into_owned();
            let fs_tree = pool.join(FS_DIR);
            let rows = list_subvolumes(&["btrfs", "subvolume", "list", "-ua", &pool_str]).await?;
            if rows.is_empty() {
                continue;
            }
            let (total, free) = fs_space_values(&fs_tree)?;
            for row in rows {
                let Some(sub_vol) = row.get(10) else { continue };
                let Some(name) = sub_vol.strip_prefix(&prefix) else {
                    continue;
                };
                let uuid = row.get(8).cloned().unwrap_or_default();
                out.push(Filesystem {
                    name: name.to_string(),
                    uuid,
                    total_space: total,
                    free_space: free,
                    pool: pool_str.clone(),
                    full_path: format!("{pool_str}/{sub_vol}"),
                });
            }
        }
        Ok(out)
    }

    async fn fs_create(&self, pool: &str, name: &str, _size: u64) -> Result<()> {
        name_check(name)?;
        let mount = self.pool_check(pool)?;
        let full_path = mount.join(FS_DIR).join(name);
        if full_path.exists() {
            return Err(TargetdError::ExistsFsName(name.to_string()));
        }
        create_sub_volume(&full_path).await
    }

    async fn fs_destroy(&self, pool: &str, name: &str) -> Result<()> {
        let mount = self.pool_check(pool)?;
        let base_snapshot_dir = mount.join(SS_DIR).join(name);

        for snap in self.ss(pool, name).await? {
            subvolume_delete(&base_snapshot_dir.join(&snap.name)).await?;
        }
        if base_snapshot_dir.exists() {
            subvolume_delete(&base_snapshot_dir).await?;
        }
        subvolume_delete(&mount.join(FS_DIR).join(name)).await
    }

    async fn fs_clone(&self, pool: &str, src: &str, dst: &str, snapshot_name: Option<&str>) -> Result<()> {
        let mount = self.pool_check(pool)?;
        let (source, dest) = match snapshot_name {
            Some(ss) => (mount.join(SS_DIR).join(src).join(ss), mount.join(FS_DIR).join(dst)),
            None => (mount.join(FS_DIR).join(src), mount.join(FS_DIR).join(dst)),
        };
        if dest.exists() {
            return Err(TargetdError::ExistsCloneName(dst.to_string()));
        }
        invoke(&[
            "btrfs",
            "subvolume",
            "snapshot",
            &source.to_string_lossy(),
            &dest.to_string_lossy(),
        ])
        .await?;
        Ok(())
    }

    async fn fs_snapshot(&self, pool: &str, name: &str, dest_ss_name: &str) -> Result<()> {
        let mount = self.pool_check(pool)?;
        let source_path = mount.join(FS_DIR).join(name);
        let dest_base = mount.join(SS_DIR).join(name);
        let dest_path = dest_base.join(dest_ss_name);

        create_sub_volume(&dest_base).await?;

        if dest_path.exists() {
            return Err(TargetdError::ExistsFsName(dest_ss_name.to_string()));
        }
        invoke(&[
            "btrfs",
            "subvolume",
            "snapshot",
            "-r",
            &source_path.to_string_lossy(),
            &dest_path.to_string_lossy(),
        ])
        .await?;
        Ok(())
    }

    async fn fs_snapshot_delete(&self, pool: &str, name: &str, ss_name: &str) -> Result<()> {
        let mount = self.pool_check(pool)?;
        subvolume_delete(&mount.join(SS_DIR).join(name).join(ss_name)).await
    }

    async fn ss(&self, pool: &str, name: &str) -> Result<Vec<Snapshot>> {
        let mount = self.pool_check(pool)?;
        let full_path = mount.join(SS_DIR).join(name);
        if !full_path.exists() {
            return Ok(Vec::new());
        }
        let rows = list_subvolumes(&["btrfs", "subvolume", "list", "-s", &full_path.to_string_lossy()]).await?;
        let mut out = Vec::new();
        for row in rows {
            let Some(date) = row.get(10) else { continue };
            let Some(time) = row.get(11) else { continue };
            let timestamp = parse_btrfs_timestamp(date, time).unwrap_or(0);
            let uuid = row.get(row.len().saturating_sub(3)).cloned().unwrap_or_default();
            let name = row.last().cloned().unwrap_or_default();
            out.push(Snapshot { name, uuid, timestamp });
        }
        Ok(out)
    }

    async fn fs_pools(&self) -> Result<Vec<Pool>> {
        let mut out = Vec::new();
        for pool in &self.mounts {
            let (total, free) = fs_space_values(pool)?;
            out.push(Pool {
                name: pool.to_string_lossy().into_owned(),
                kind: "fs",
                size: total,
                free_size: free,
                uuid: None,
            });
        }
        Ok(out)
    }
}

/// Parses a `YYYY-MM-DD HH:MM:SS` pair from `btrfs subvolume list -s`
/// as seconds since the epoch, treating the fields as UTC. `btrfs`
/// prints these fields in the system's local zone (the original
/// resolved them the same way via `time.mktime`), so this is only
/// correct when the daemon itself runs with its local zone pinned to
/// UTC — `BtrfsBackend::new` refuses to start otherwise.
fn parse_btrfs_timestamp(date: &str, time: &str) -> Option<i64> {
    let (y, m, d) = {
        let mut it = date.split('-');
        (it.next()?.parse::<i64>().ok()?, it.next()?.parse::<i64>().ok()?, it.next()?.parse::<i64>().ok()?)
    };
    let (hh, mm, ss) = {
        let mut it = time.split(':');
        (it.next()?.parse::<i64>().ok()?, it.next()?.parse::<i64>().ok()?, it.next()?.parse::<i64>().ok()?)
    };
    // Days since epoch via a civil-to-days algorithm (Howard Hinnant's).
    let y_adj = if m <= 2 { y - 1 } else { y };
    let era = if y_adj >= 0 { y_adj } else { y_adj - 399 } / 400;
    let yoe = (y_adj - era * 400) as i64;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146097 + doe - 719468;
    Some(days * 86400 + hh * 3600 + mm * 60 + ss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_stdout_strips_fs_tree_prefix() {
        let out = "ID 256 gen 10 top level 5 parent_uuid - uuid abcd path <FS_TREE>/targetd_fs/vol1\n";
        let rows = split_stdout(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][8], "abcd");
        assert_eq!(rows[0][10], "targetd_fs/vol1");
    }

    #[test]
    fn split_stdout_ignores_blank_lines() {
        assert!(split_stdout("\n\n").is_empty());
    }

    #[test]
    fn parse_btrfs_timestamp_handles_epoch_boundary() {
        assert_eq!(parse_btrfs_timestamp("1970-01-01", "00:00:00"), Some(0));
        assert_eq!(parse_btrfs_timestamp("2021-01-01", "00:00:00"), Some(1609459200));
    }

    #[test]
    fn require_utc_timezone_accepts_utc_spellings_only() {
        std::env::set_var("TZ", "UTC");
        assert!(require_utc_timezone().is_ok());
        std::env::set_var("TZ", "UTC0");
        assert!(require_utc_timezone().is_ok());
        std::env::set_var("TZ", "America/New_York");
        assert!(require_utc_timezone().is_err());
        std::env::remove_var("TZ");
        assert!(require_utc_timezone().is_err());
    }
}
