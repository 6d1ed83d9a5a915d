//! Façade over the kernel LIO (`rtslib`-equivalent) configuration
//! store: targets, TPGs, portals, storage objects, TPG LUNs, node
//! ACLs, access groups and mapped LUNs, plus a persist-to-file hook.
//!
//! The real configfs tree lives under `/sys/kernel/config/target`;
//! this module treats it as the opaque façade spec.md §9 calls for; a
//! production build would shell out to `targetcli`/write configfs
//! attribute files directly where `LioStore`'s methods are called.
//! What's specified here — and therefore what actually has to be
//! correct — is the in-memory object graph and its garbage-collection
//! rules (spec.md §3 invariant (a), (b)), independent of which
//! mechanism ultimately persists it.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TargetdError};

pub const MAX_LUN: u32 = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chap {
    pub in_user: Option<String>,
    pub in_pass: Option<String>,
    pub out_user: Option<String>,
    pub out_pass: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappedLun {
    pub host_lun_id: u32,
    pub tpg_lun_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    pub name: String,
    pub udev_path: String,
    pub wwn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpgLun {
    pub id: u32,
    pub so_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeAcl {
    pub wwn: String,
    pub mapped_luns: Vec<MappedLun>,
    pub chap: Option<Chap>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessGroup {
    pub name: String,
    pub wwns: Vec<String>,
    pub mapped_luns: Vec<MappedLun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tpg {
    pub tag: u16,
    pub portals: Vec<String>,
    pub authentication: bool,
    pub storage_objects: HashMap<String, StorageObject>,
    pub tpg_luns: Vec<TpgLun>,
    pub node_acls: HashMap<String, NodeAcl>,
}

impl Tpg {
    fn new(tag: u16) -> Self {
        Tpg {
            tag,
            portals: Vec::new(),
            authentication: false,
            storage_objects: HashMap::new(),
            tpg_luns: Vec::new(),
            node_acls: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.node_acls.is_empty() && self.tpg_luns.is_empty()
    }

    fn next_tpg_lun_id(&self) -> u32 {
        self.tpg_luns.iter().map(|l| l.id + 1).max().unwrap_or(0)
    }

    fn tpg_lun_for_so(&self, so_name: &str) -> Option<u32> {
        self.tpg_luns
            .iter()
            .find(|l| l.so_name == so_name)
            .map(|l| l.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Target {
    pub tpgs: HashMap<u16, Tpg>,
    pub access_groups: HashMap<String, AccessGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LioConfig {
    targets: HashMap<String, Target>,
}

/// The façade: every orchestration-layer mutation of the LIO store
/// goes through one of these methods, and a mutating call must be
/// followed by `save_to_file` before the orchestration layer returns.
pub struct LioStore {
    config: Mutex<LioConfig>,
    save_path: Option<std::path::PathBuf>,
}

impl LioStore {
    pub fn new(save_path: Option<std::path::PathBuf>) -> Self {
        LioStore {
            config: Mutex::new(LioConfig::default()),
            save_path,
        }
    }

    fn with_target<F, T>(&self, target_name: &str, f: F) -> T
    where
        F: FnOnce(&mut Target) -> T,
    {
        let mut guard = self.config.lock().expect("lio store mutex poisoned");
        let target = guard.targets.entry(target_name.to_string()).or_default();
        f(target)
    }

    pub fn ensure_target(&self, target_name: &str) {
        self.with_target(target_name, |_| ());
    }

    pub fn ensure_tpg(&self, target_name: &str, tag: u16) {
        self.with_target(target_name, |t| {
            t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
        });
    }

    pub fn ensure_portal(&self, target_name: &str, tag: u16, addr: &str) {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            if !tpg.portals.iter().any(|p| p == addr) {
                tpg.portals.push(addr.to_string());
            }
        });
    }

    pub fn disable_authentication(&self, target_name: &str, tag: u16) {
        self.with_target(target_name, |t| {
            if let Some(tpg) = t.tpgs.get_mut(&tag) {
                tpg.authentication = false;
            }
        });
    }

    pub fn ensure_storage_object(&self, target_name: &str, tag: u16, so_name: &str, udev_path: &str, wwn: &str) {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            tpg.storage_objects
                .entry(so_name.to_string())
                .or_insert_with(|| StorageObject {
                    name: so_name.to_string(),
                    udev_path: udev_path.to_string(),
                    wwn: wwn.to_string(),
                });
        });
    }

    /// Returns the TPG LUN id bound to `so_name`, creating one if absent.
    pub fn ensure_tpg_lun(&self, target_name: &str, tag: u16, so_name: &str) -> u32 {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            if let Some(id) = tpg.tpg_lun_for_so(so_name) {
                return id;
            }
            let id = tpg.next_tpg_lun_id();
            tpg.tpg_luns.push(TpgLun {
                id,
                so_name: so_name.to_string(),
            });
            id
        })
    }

    pub fn ensure_node_acl(&self, target_name: &str, tag: u16, wwn: &str) {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            tpg.node_acls.entry(wwn.to_string()).or_insert_with(|| NodeAcl {
                wwn: wwn.to_string(),
                ..Default::default()
            });
        });
    }

    pub fn ensure_mapped_lun(&self, target_name: &str, tag: u16, wwn: &str, host_lun_id: u32, tpg_lun_id: u32) {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            let acl = tpg.node_acls.entry(wwn.to_string()).or_insert_with(|| NodeAcl {
                wwn: wwn.to_string(),
                ..Default::default()
            });
            let entry = MappedLun {
                host_lun_id,
                tpg_lun_id,
            };
            if !acl.mapped_luns.contains(&entry) {
                acl.mapped_luns.push(entry);
            }
        });
    }

    /// Returns the TPG LUN id currently bound to `so_name`, if any,
    /// without creating one. Used by the orchestration layer to find
    /// the LUN to unmap without guessing its id.
    pub fn tpg_lun_id_for_so(&self, target_name: &str, tag: u16, so_name: &str) -> Option<u32> {
        self.with_target(target_name, |t| {
            t.tpgs.get(&tag).and_then(|tpg| tpg.tpg_lun_for_so(so_name))
        })
    }

    pub fn is_mapped(&self, target_name: &str, so_name: &str) -> bool {
        self.with_target(target_name, |t| {
            t.tpgs.values().any(|tpg| {
                tpg.tpg_luns
                    .iter()
                    .any(|l| l.so_name == so_name && !l.id_is_orphan(tpg))
            })
        })
    }

    /// Remove the mapped LUN for `wwn`/`host_lun_id`, cascading removal
    /// of the TPG LUN + storage object (if now unreferenced) and the
    /// node ACL (if now empty), then the TPG and target if also empty.
    pub fn remove_mapped_lun(&self, target_name: &str, tag: u16, wwn: &str, host_lun_id: u32) -> Result<()> {
        self.with_target(target_name, |t| {
            let Some(tpg) = t.tpgs.get_mut(&tag) else {
                return Err(TargetdError::NotFoundVolumeExport(wwn.to_string(), wwn.to_string()));
            };
            let Some(acl) = tpg.node_acls.get_mut(wwn) else {
                return Err(TargetdError::NotFoundVolumeExport(wwn.to_string(), wwn.to_string()));
            };
            let before = acl.mapped_luns.len();
            acl.mapped_luns.retain(|m| m.host_lun_id != host_lun_id);
            if acl.mapped_luns.len() == before {
                return Err(TargetdError::NotFoundVolumeExport(wwn.to_string(), wwn.to_string()));
            }
            if acl.mapped_luns.is_empty() {
                tpg.node_acls.remove(wwn);
            }
            gc_unused_tpg_luns(tpg);
            Ok(())
        })?;
        self.with_target(target_name, |t| {
            if let Some(tpg) = t.tpgs.get(&tag) {
                if tpg.is_empty() {
                    t.tpgs.remove(&tag);
                }
            }
        });
        Ok(())
    }

    pub fn set_chap(
        &self,
        target_name: &str,
        tag: u16,
        wwn: &str,
        in_user: Option<String>,
        in_pass: Option<String>,
        out_user: Option<String>,
        out_pass: Option<String>,
    ) -> Result<()> {
        self.with_target(target_name, |t| {
            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            let acl = tpg
                .node_acls
                .get_mut(wwn)
                .ok_or_else(|| TargetdError::NotFoundAccessGroup(wwn.to_string()))?;
            acl.chap = Some(Chap {
                in_user,
                in_pass,
                out_user,
                out_pass,
            });
            Ok(())
        })
    }

    pub fn access_group_create(&self, target_name: &str, ag_name: &str, wwn: &str) -> Result<()> {
        self.with_target(target_name, |t| {
            if t.access_groups.contains_key(ag_name) {
                return Err(TargetdError::NameConflict(ag_name.to_string()));
            }
            let already_present = t
                .tpgs
                .values()
                .any(|tpg| tpg.node_acls.contains_key(wwn))
                || t.access_groups.values().any(|ag| ag.wwns.iter().any(|w| w == wwn));
            if already_present {
                return Err(TargetdError::ExistsInitiator(wwn.to_string()));
            }
            t.access_groups.insert(
                ag_name.to_string(),
                AccessGroup {
                    name: ag_name.to_string(),
                    wwns: vec![wwn.to_string()],
                    mapped_luns: Vec::new(),
                },
            );
            Ok(())
        })
    }

    pub fn access_group_destroy(&self, target_name: &str, ag_name: &str) -> Result<()> {
        self.with_target(target_name, |t| {
            t.access_groups
                .remove(ag_name)
                .map(|_| ())
                .ok_or_else(|| TargetdError::NotFoundAccessGroup(ag_name.to_string()))
        })
    }

    pub fn access_group_init_add(&self, target_name: &str, ag_name: &str, wwn: &str) -> Result<()> {
        self.with_target(target_name, |t| {
            let already_present = t
                .tpgs
                .values()
                .any(|tpg| tpg.node_acls.contains_key(wwn))
                || t.access_groups.values().any(|ag| ag.wwns.iter().any(|w| w == wwn));
            if already_present {
                return Err(TargetdError::ExistsInitiator(wwn.to_string()));
            }
            let ag = t
                .access_groups
                .get_mut(ag_name)
                .ok_or_else(|| TargetdError::NotFoundAccessGroup(ag_name.to_string()))?;
            ag.wwns.push(wwn.to_string());
            Ok(())
        })
    }

    pub fn access_group_init_del(&self, target_name: &str, ag_name: &str, wwn: &str) -> Result<()> {
        self.with_target(target_name, |t| {
            let ag = t
                .access_groups
                .get_mut(ag_name)
                .ok_or_else(|| TargetdError::NotFoundAccessGroup(ag_name.to_string()))?;
            ag.wwns.retain(|w| w != wwn);
            Ok(())
        })
    }

    pub fn access_group_names(&self, target_name: &str) -> Vec<AccessGroup> {
        self.with_target(target_name, |t| t.access_groups.values().cloned().collect())
    }

    pub fn access_group(&self, target_name: &str, ag_name: &str) -> Option<AccessGroup> {
        self.with_target(target_name, |t| t.access_groups.get(ag_name).cloned())
    }

    /// Map `tpg_lun_id` at `host_lun_id` to every member of `ag_name`.
    /// Returns the host LUN id actually used.
    pub fn access_group_map_create(
        &self,
        target_name: &str,
        tag: u16,
        ag_name: &str,
        tpg_lun_id: u32,
        host_lun_id: Option<u32>,
    ) -> Result<u32> {
        self.with_target(target_name, |t| {
            let wwns = {
                let ag = t
                    .access_groups
                    .get(ag_name)
                    .ok_or_else(|| TargetdError::NotFoundAccessGroup(ag_name.to_string()))?;
                if ag.wwns.is_empty() {
                    return Err(TargetdError::NotFoundAccessGroup(ag_name.to_string()));
                }
                ag.wwns.clone()
            };

            let ag_mapped = t.access_groups.get(ag_name).unwrap().mapped_luns.clone();
            if ag_mapped.iter().any(|m| m.tpg_lun_id == tpg_lun_id) {
                // Already masked; signal by returning the existing id.
                return Ok(ag_mapped
                    .iter()
                    .find(|m| m.tpg_lun_id == tpg_lun_id)
                    .unwrap()
                    .host_lun_id);
            }

            let used: std::collections::HashSet<u32> =
                ag_mapped.iter().map(|m| m.host_lun_id).collect();
            let chosen = match host_lun_id {
                Some(id) => id,
                None => (0..=MAX_LUN)
                    .find(|id| !used.contains(id))
                    .ok_or(TargetdError::NoFreeHostLunId)?,
            };

            let tpg = t.tpgs.entry(tag).or_insert_with(|| Tpg::new(tag));
            for wwn in &wwns {
                let acl = tpg.node_acls.entry(wwn.clone()).or_insert_with(|| NodeAcl {
                    wwn: wwn.clone(),
                    ..Default::default()
                });
                let entry = MappedLun {
                    host_lun_id: chosen,
                    tpg_lun_id,
                };
                if !acl.mapped_luns.contains(&entry) {
                    acl.mapped_luns.push(entry);
                }
            }

            t.access_groups
                .get_mut(ag_name)
                .unwrap()
                .mapped_luns
                .push(MappedLun {
                    host_lun_id: chosen,
                    tpg_lun_id,
                });

            Ok(chosen)
        })
    }

    pub fn access_group_map_destroy(&self, target_name: &str, tag: u16, ag_name: &str, tpg_lun_id: u32) -> Result<()> {
        self.with_target(target_name, |t| {
            let wwns = t
                .access_groups
                .get(ag_name)
                .map(|ag| ag.wwns.clone())
                .ok_or_else(|| TargetdError::NotFoundAccessGroup(ag_name.to_string()))?;

            if let Some(tpg) = t.tpgs.get_mut(&tag) {
                for wwn in &wwns {
                    if let Some(acl) = tpg.node_acls.get_mut(wwn) {
                        acl.mapped_luns.retain(|m| m.tpg_lun_id != tpg_lun_id);
                        if acl.mapped_luns.is_empty() {
                            tpg.node_acls.remove(wwn);
                        }
                    }
                }
                gc_unused_tpg_luns(tpg);
            }

            if let Some(ag) = t.access_groups.get_mut(ag_name) {
                ag.mapped_luns.retain(|m| m.tpg_lun_id != tpg_lun_id);
            }
            Ok(())
        })
    }

    pub fn node_acls(&self, target_name: &str, tag: u16) -> Vec<NodeAcl> {
        self.with_target(target_name, |t| {
            t.tpgs
                .get(&tag)
                .map(|tpg| tpg.node_acls.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// All TPG LUNs currently registered under `tag`, for callers that
    /// need to resolve a mapped lun's `tpg_lun_id` back to the storage
    /// object it points at (e.g. `export_list`).
    pub fn tpg_luns(&self, target_name: &str, tag: u16) -> Vec<TpgLun> {
        self.with_target(target_name, |t| {
            t.tpgs.get(&tag).map(|tpg| tpg.tpg_luns.clone()).unwrap_or_default()
        })
    }

    pub fn storage_object(&self, target_name: &str, tag: u16, so_name: &str) -> Option<StorageObject> {
        self.with_target(target_name, |t| {
            t.tpgs
                .get(&tag)
                .and_then(|tpg| tpg.storage_objects.get(so_name).cloned())
        })
    }

    /// Persist the whole configuration to disk as JSON, standing in
    /// for `RTSRoot().save_to_file()` in the original. Every mutating
    /// orchestration-layer verb calls this before returning.
    pub fn save_to_file(&self) -> Result<()> {
        let Some(path) = &self.save_path else {
            return Ok(());
        };
        let guard = self.config.lock().expect("lio store mutex poisoned");
        let json = serde_json::to_string_pretty(&*guard)
            .map_err(|e| TargetdError::Invalid(format!("failed to serialize LIO config: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), "persisted LIO configuration");
        Ok(())
    }
}

impl Serialize for LioConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.targets.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LioConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(LioConfig {
            targets: HashMap::deserialize(deserializer)?,
        })
    }
}

fn gc_unused_tpg_luns(tpg: &mut Tpg) {
    let referenced: std::collections::HashSet<u32> = tpg
        .node_acls
        .values()
        .flat_map(|acl| acl.mapped_luns.iter().map(|m| m.tpg_lun_id))
        .collect();
    tpg.tpg_luns.retain(|lun| {
        let keep = referenced.contains(&lun.id);
        if !keep {
            tpg.storage_objects.remove(&lun.so_name);
        }
        keep
    });
}

trait TpgLunOrphanCheck {
    fn id_is_orphan(&self, tpg: &Tpg) -> bool;
}

impl TpgLunOrphanCheck for TpgLun {
    fn id_is_orphan(&self, tpg: &Tpg) -> bool {
        !tpg.node_acls
            .values()
            .any(|acl| acl.mapped_luns.iter().any(|m| m.tpg_lun_id == self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_tpg_lun_reuses_existing_for_same_storage_object() {
        let store = LioStore::new(None);
        store.ensure_target("iqn.t");
        store.ensure_storage_object("iqn.t", 1, "vg0:v1", "/dev/vg0/v1", "wwn1");
        let id1 = store.ensure_tpg_lun("iqn.t", 1, "vg0:v1");
        let id2 = store.ensure_tpg_lun("iqn.t", 1, "vg0:v1");
        assert_eq!(id1, id2);
    }

    #[test]
    fn removing_last_mapped_lun_cascades_tpg_lun_and_so() {
        let store = LioStore::new(None);
        store.ensure_target("iqn.t");
        store.ensure_storage_object("iqn.t", 1, "vg0:v1", "/dev/vg0/v1", "wwn1");
        let lun_id = store.ensure_tpg_lun("iqn.t", 1, "vg0:v1");
        store.ensure_node_acl("iqn.t", 1, "iqn.initiator");
        store.ensure_mapped_lun("iqn.t", 1, "iqn.initiator", 0, lun_id);

        store.remove_mapped_lun("iqn.t", 1, "iqn.initiator", 0).unwrap();

        assert!(store.node_acls("iqn.t", 1).is_empty());
        assert!(store.storage_object("iqn.t", 1, "vg0:v1").is_none());
    }

    #[test]
    fn access_group_map_create_picks_smallest_free_id() {
        let store = LioStore::new(None);
        store.ensure_target("iqn.t");
        store.access_group_create("iqn.t", "ag0", "iqn.init1").unwrap();
        let id0 = store
            .access_group_map_create("iqn.t", 1, "ag0", 100, None)
            .unwrap();
        assert_eq!(id0, 0);
        let id1 = store
            .access_group_map_create("iqn.t", 1, "ag0", 101, None)
            .unwrap();
        assert_eq!(id1, 1);
    }

    #[test]
    fn access_group_create_rejects_duplicate_initiator() {
        let store = LioStore::new(None);
        store.ensure_target("iqn.t");
        store.access_group_create("iqn.t", "ag0", "iqn.init1").unwrap();
        let err = store
            .access_group_create("iqn.t", "ag1", "iqn.init1")
            .unwrap_err();
        assert_eq!(err.code(), -52);
    }
}
