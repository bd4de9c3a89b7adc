//! Backups written to a remote. Each backup is a metadata document next to a
//! data directory filled by the data mover:
//!
//! ```text
//! xo-vm-backups/<vm uuid>/<date>-<nonce>.json
//! xo-vm-backups/<vm uuid>/data/<date>-<nonce>/...
//! xo-vm-backups/<vm uuid>/locks/...
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    format_filename_date, health_check_vm, BaseCandidates, TransferRequest, Writer,
    WriterContext,
};
use crate::cleanup::best_effort;
use crate::config::JobMode;
use crate::error::{Result, VmrepError};
use crate::export::{ExportedVdi, ExportedVm};
use crate::hypervisor::VmRecord;
use crate::metadata::schema::{BASE_DELTA, SCHEMA_VERSION};
use crate::retention::select_expired_before_write;
use crate::storage::lock::{acquire_lock, release_lock, LockGuard};
use crate::storage::{delete_prefix, StorageBackend};
use crate::task;

pub const BACKUP_DIR: &str = "xo-vm-backups";

/// Metadata document describing one backup on a remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: u32,
    pub job_id: String,
    pub schedule_id: String,
    pub vm_uuid: String,
    pub timestamp: DateTime<Utc>,
    pub mode: JobMode,
    pub is_full: bool,
    /// The exported VM, usually a snapshot.
    pub vm: ExportedVm,
    /// Keyed by disk uuid.
    pub vdis: BTreeMap<String, ExportedVdi>,
    /// Key prefix holding the disk data.
    pub data_dir: String,
    pub size: u64,
}

fn backup_nonce() -> String {
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn vm_backup_dir(vm_uuid: &str) -> String {
    format!("{BACKUP_DIR}/{vm_uuid}")
}

/// Every backup of `vm_uuid` found on `storage`, oldest first, with its key.
/// Unreadable documents are skipped.
pub fn list_vm_backups(
    storage: &dyn StorageBackend,
    vm_uuid: &str,
) -> Result<Vec<(String, BackupMetadata)>> {
    let dir = format!("{}/", vm_backup_dir(vm_uuid));
    let mut backups = Vec::new();
    for key in storage.list(&dir)? {
        let Some(name) = key.strip_prefix(&dir) else {
            continue;
        };
        if name.contains('/') || !name.ends_with(".json") {
            continue;
        }
        let Some(data) = storage.get(&key)? else {
            continue;
        };
        match serde_json::from_slice::<BackupMetadata>(&data) {
            Ok(metadata) => backups.push((key, metadata)),
            Err(e) => warn!(key = %key, error = %e, "skipping unreadable backup metadata"),
        }
    }
    backups.sort_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));
    Ok(backups)
}

/// Backups of `vm_uuid` with at least one disk that is a delta of `parent`.
fn children_of(
    storage: &dyn StorageBackend,
    vm_uuid: &str,
    parent: &BackupMetadata,
) -> Result<Vec<(String, BackupMetadata)>> {
    Ok(list_vm_backups(storage, vm_uuid)?
        .into_iter()
        .filter(|(_, child)| {
            child.vdis.values().any(|vdi| {
                vdi.base_uuid
                    .as_deref()
                    .is_some_and(|base| parent.vdis.contains_key(base))
            })
        })
        .collect())
}

/// Rebase `child` onto the bases of `parent`, once the data mover has folded
/// the parent's data into it.
fn rebase_on_parent(child: &mut BackupMetadata, parent: &BackupMetadata, size: u64) {
    for vdi in child.vdis.values_mut() {
        let Some(folded) = vdi.base_uuid.as_deref().and_then(|base| parent.vdis.get(base)) else {
            continue;
        };
        vdi.base_uuid = folded.base_uuid.clone();
        match &vdi.base_uuid {
            Some(base) => vdi.other_config.insert(BASE_DELTA.to_string(), base.clone()),
            None => vdi.other_config.remove(BASE_DELTA),
        };
    }
    if child.vm.other_config.get(BASE_DELTA) == Some(&parent.vm.uuid) {
        match parent.vm.other_config.get(BASE_DELTA) {
            Some(base) => child.vm.other_config.insert(BASE_DELTA.to_string(), base.clone()),
            None => child.vm.other_config.remove(BASE_DELTA),
        };
    }
    child.is_full = child.vdis.values().all(|vdi| vdi.base_uuid.is_none());
    child.size = size;
}

/// Delete a backup: the metadata first so it is never listed without data.
pub fn delete_backup(storage: &dyn StorageBackend, key: &str, metadata: &BackupMetadata) -> Result<()> {
    storage.delete(key)?;
    let removed = delete_prefix(storage, &format!("{}/", metadata.data_dir))?;
    debug!(key, removed, "deleted backup");
    Ok(())
}

pub struct RemoteWriter {
    ctx: WriterContext,
    remote_id: String,
    storage: Arc<dyn StorageBackend>,
    lock: Option<LockGuard>,
    old_entries: Vec<(String, BackupMetadata)>,
    /// Disk uuids present in the backups kept on this remote.
    known_disks: HashSet<String>,
    written: Option<BackupMetadata>,
}

impl RemoteWriter {
    pub fn new(ctx: WriterContext, remote_id: impl Into<String>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            ctx,
            remote_id: remote_id.into(),
            storage,
            lock: None,
            old_entries: Vec::new(),
            known_disks: HashSet::new(),
            written: None,
        }
    }

    /// Metadata of the backup written by the last transfer.
    pub fn written(&self) -> Option<&BackupMetadata> {
        self.written.as_ref()
    }

    fn job_backups(&self) -> Result<Vec<(String, BackupMetadata)>> {
        Ok(list_vm_backups(self.storage.as_ref(), &self.ctx.vm_uuid)?
            .into_iter()
            .filter(|(_, b)| b.job_id == self.ctx.job.id && b.schedule_id == self.ctx.schedule_id)
            .collect())
    }

    /// Data directories whose metadata was never written.
    fn delete_orphan_data(&self) -> Result<()> {
        let dir = vm_backup_dir(&self.ctx.vm_uuid);
        let data_prefix = format!("{dir}/data/");
        let stamps: BTreeSet<String> = self
            .storage
            .list(&data_prefix)?
            .iter()
            .filter_map(|key| key.strip_prefix(&data_prefix)?.split('/').next().map(str::to_string))
            .collect();
        for stamp in stamps {
            if self.storage.exists(&format!("{dir}/{stamp}.json"))? {
                continue;
            }
            let removed = best_effort(
                format!("delete orphan data {stamp} on remote {}", self.remote_id),
                delete_prefix(self.storage.as_ref(), &format!("{data_prefix}{stamp}/")),
            );
            if let Some(removed) = removed {
                info!(remote = %self.remote_id, stamp = %stamp, removed, "deleted orphan backup data");
            }
        }
        Ok(())
    }

    /// Fold `parent` into every backup that is a delta of it, then delete
    /// it. Nothing is deleted when a merge fails.
    fn expire_backup(&self, key: &str, parent: &BackupMetadata) -> Result<()> {
        let storage = self.storage.as_ref();
        for (child_key, mut child) in children_of(storage, &self.ctx.vm_uuid, parent)? {
            let size = self.ctx.mover.merge_backups(storage, parent, &child)?;
            rebase_on_parent(&mut child, parent, size);
            storage.put(&child_key, &serde_json::to_vec_pretty(&child)?)?;
            info!(
                remote = %self.remote_id,
                parent = key,
                child = %child_key,
                full = child.is_full,
                "merged expired backup into its child"
            );
        }
        delete_backup(storage, key, parent)
    }

    /// Oldest first, so a chain collapses into its oldest kept backup.
    fn delete_old_entries(&mut self) {
        for (key, metadata) in std::mem::take(&mut self.old_entries) {
            best_effort(
                format!("delete old backup {key} on remote {}", self.remote_id),
                self.expire_backup(&key, &metadata),
            );
        }
    }
}

impl Writer for RemoteWriter {
    fn target(&self) -> String {
        format!("remote:{}", self.remote_id)
    }

    fn before_backup(&mut self) -> Result<()> {
        let guard = acquire_lock(self.storage.as_ref(), &vm_backup_dir(&self.ctx.vm_uuid))?;
        debug!(remote = %self.remote_id, lock = guard.key(), "acquired remote lock");
        self.lock = Some(guard);
        Ok(())
    }

    fn after_backup(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(guard) => release_lock(self.storage.as_ref(), guard),
            None => Ok(()),
        }
    }

    fn check_base_vdis(&mut self, candidates: &mut BaseCandidates, base_vm: &VmRecord) -> Result<()> {
        let last = self.job_backups()?.pop();
        match last {
            Some((_, backup)) if backup.vm.uuid == base_vm.uuid => {
                candidates.retain(|base_uuid, _| backup.vdis.contains_key(base_uuid));
            }
            _ => {
                debug!(remote = %self.remote_id, base = %base_vm.uuid, "latest backup is not of the base VM");
                candidates.clear();
            }
        }
        Ok(())
    }

    fn prepare(&mut self, is_full: bool) -> Result<()> {
        debug!(remote = %self.remote_id, is_full, "preparing remote backup");
        self.delete_orphan_data()?;

        let backups = self.job_backups()?;
        self.old_entries =
            select_expired_before_write(&backups, self.ctx.settings.export_retention()).to_vec();

        let delete_first = self.ctx.settings.delete_first();
        let doomed: HashSet<&str> = self.old_entries.iter().map(|(k, _)| k.as_str()).collect();
        self.known_disks = list_vm_backups(self.storage.as_ref(), &self.ctx.vm_uuid)?
            .into_iter()
            .filter(|(key, _)| !delete_first || !doomed.contains(key.as_str()))
            .flat_map(|(_, b)| b.vdis.into_keys())
            .collect();

        if delete_first {
            self.delete_old_entries();
        }
        Ok(())
    }

    fn transfer(&mut self, request: &TransferRequest<'_>) -> Result<()> {
        let export = request.export;
        for vdi in export.vdis.values() {
            if let Some(base_uuid) = vdi.base_uuid.as_deref() {
                if !self.known_disks.contains(base_uuid) {
                    return Err(VmrepError::MetadataInconsistency(format!(
                        "missing base VDI {base_uuid} on remote {}",
                        self.remote_id
                    )));
                }
            }
        }

        let dir = vm_backup_dir(&self.ctx.vm_uuid);
        let stamp = format!("{}-{}", format_filename_date(request.timestamp), backup_nonce());
        let data_dir = format!("{dir}/data/{stamp}");

        let size = task::run("transfer", || {
            self.ctx
                .mover
                .write_backup(export, self.storage.as_ref(), &data_dir)
        })?;

        let metadata = BackupMetadata {
            version: SCHEMA_VERSION,
            job_id: self.ctx.job.id.clone(),
            schedule_id: self.ctx.schedule_id.clone(),
            vm_uuid: self.ctx.vm_uuid.clone(),
            timestamp: request.timestamp,
            mode: self.ctx.job.mode,
            is_full: export.is_full(),
            vm: export.vm.clone(),
            vdis: export.vdis.clone(),
            data_dir,
            size,
        };
        let key = format!("{dir}/{stamp}.json");
        self.storage.put(&key, &serde_json::to_vec_pretty(&metadata)?)?;
        info!(remote = %self.remote_id, key = %key, size, full = metadata.is_full, "backup written");
        self.written = Some(metadata);
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.ctx.settings.delete_first() {
            self.delete_old_entries();
        }
        Ok(())
    }

    fn health_check(&mut self) -> Result<()> {
        let sr = self
            .ctx
            .health_check_sr
            .as_ref()
            .ok_or_else(|| VmrepError::Config("no health check SR configured".into()))?;
        let metadata = self
            .written
            .as_ref()
            .ok_or_else(|| VmrepError::Other("no backup to health check".into()))?;

        let hv = self.ctx.hypervisor.as_ref();
        let restored = self
            .ctx
            .mover
            .import_backup(metadata, self.storage.as_ref(), sr)?;
        health_check_vm(hv, &restored, self.ctx.settings.health_check_timeout())
    }
}
