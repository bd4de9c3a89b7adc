//! Continuous replication: every run imports the export as a new VM on a
//! target SR, applying deltas on top of the previous replica.

use std::collections::HashSet;

use tracing::{debug, info};

use super::replica_index::ReplicaIndex;
use super::{
    format_filename_date, health_check_vm, BaseCandidates, TransferRequest, Writer,
    WriterContext,
};
use crate::cleanup::best_effort;
use crate::error::{Result, VmrepError};
use crate::export::IncrementalExport;
use crate::hypervisor::{vm_disk_records, Hypervisor, SrRecord, VmRecord, OP_START, OP_START_ON};
use crate::metadata::schema::{
    BASE_DELTA, COPY_OF, DATETIME, JOB_ID, REPLICATED_TO_SR_UUID, SCHEDULE_ID, VM_UUID,
};
use crate::metadata::{parse_datetime, set_backup_identity, BackupIdentity};
use crate::retention::select_expired_before_write;
use crate::task;
use vmrep_types::ObjRef;

pub const START_BLOCKED_REASON: &str =
    "Start operation for this vm is blocked, clone it if you want to use it.";
pub const IMPORTING_REASON: &str = "VM is being imported by a backup job";
pub const REPLICATION_TAG: &str = "Continuous Replication";
pub const HA_DISABLED_TAG: &str = "HA disabled";

/// Selects replicas of one VM produced by one job.
pub(crate) struct ReplicaFilter<'a> {
    pub job_id: &'a str,
    pub vm_uuid: &'a str,
    /// `None` matches every schedule.
    pub schedule_id: Option<&'a str>,
    /// `None` only matches replicas without an SR tag.
    pub sr_uuid: Option<&'a str>,
    /// Only VMs whose start is still blocked. Imports in progress are always
    /// blocked; finished warm-migration replicas are not.
    pub start_blocked: bool,
}

/// Replicas matching `filter`, oldest first.
pub(crate) fn list_replicated_vms(
    hv: &dyn Hypervisor,
    filter: &ReplicaFilter<'_>,
) -> Result<Vec<VmRecord>> {
    let mut replicas: Vec<VmRecord> = hv
        .all_vms()?
        .into_iter()
        .filter(|vm| {
            !vm.is_a_snapshot
                && !vm.is_a_template
                && (!filter.start_blocked || vm.is_blocked(OP_START))
                && vm.tag(JOB_ID) == Some(filter.job_id)
                && vm.tag(REPLICATED_TO_SR_UUID) == filter.sr_uuid
                && filter
                    .schedule_id
                    .map_or(true, |schedule| vm.tag(SCHEDULE_ID) == Some(schedule))
                // Replicas created before the VM tag existed have none.
                && vm.tag(VM_UUID).map_or(true, |uuid| uuid == filter.vm_uuid)
        })
        .collect();
    replicas.sort_by_key(|vm| vm.tag(DATETIME).and_then(parse_datetime));
    Ok(replicas)
}

pub struct ReplicationWriter {
    ctx: WriterContext,
    sr: SrRecord,
    old_entries: Vec<VmRecord>,
    index: Option<ReplicaIndex>,
    target_vm: Option<ObjRef>,
}

impl ReplicationWriter {
    pub fn new(ctx: WriterContext, sr: SrRecord) -> Self {
        Self {
            ctx,
            sr,
            old_entries: Vec::new(),
            index: None,
            target_vm: None,
        }
    }

    /// Reference of the replica created by the last transfer.
    pub fn target_vm(&self) -> Option<&ObjRef> {
        self.target_vm.as_ref()
    }

    fn filter(&self, with_schedule: bool, with_sr: bool) -> ReplicaFilter<'_> {
        ReplicaFilter {
            job_id: &self.ctx.job.id,
            vm_uuid: &self.ctx.vm_uuid,
            schedule_id: with_schedule.then_some(self.ctx.schedule_id.as_str()),
            sr_uuid: with_sr.then_some(self.sr.uuid.as_str()),
            start_blocked: false,
        }
    }

    /// Replicas left by an interrupted transfer: imported but never tagged
    /// with the SR they were replicated to.
    fn delete_orphans(&self) -> Result<()> {
        let hv = self.ctx.hypervisor.as_ref();
        let filter = ReplicaFilter {
            start_blocked: true,
            ..self.filter(false, false)
        };
        for orphan in list_replicated_vms(hv, &filter)? {
            let action = format!("delete orphan replica {}", orphan.uuid);
            if best_effort(action, hv.destroy_vm(&orphan.obj_ref)).is_some() {
                info!(vm = %orphan.uuid, sr = %self.sr.uuid, "deleted orphan replica");
            }
        }
        Ok(())
    }

    fn delete_old_entries(&mut self) {
        let hv = self.ctx.hypervisor.as_ref();
        for replica in self.old_entries.drain(..) {
            let action = format!("delete old replica {}", replica.uuid);
            if best_effort(action, hv.destroy_vm(&replica.obj_ref)).is_some() {
                debug!(vm = %replica.uuid, "deleted old replica");
            }
        }
    }

    /// Copy `export` for this SR, resolving every base on the target. Fails
    /// before anything is imported when a base cannot be found.
    fn decorate(&self, export: &IncrementalExport, index: &ReplicaIndex) -> Result<IncrementalExport> {
        let mut export = export.clone();
        let warm_migration = self.ctx.settings.warm_migration();

        let vm = &mut export.vm;
        vm.other_config.insert(COPY_OF.to_string(), vm.uuid.clone());
        // Only written once the replica is complete.
        vm.other_config.remove(REPLICATED_TO_SR_UUID);
        for op in [OP_START, OP_START_ON] {
            vm.blocked_operations
                .insert(op.to_string(), IMPORTING_REASON.to_string());
        }
        if !warm_migration && !vm.tags.iter().any(|t| t == REPLICATION_TAG) {
            vm.tags.push(REPLICATION_TAG.to_string());
        }

        let base_replica = match export.vm.other_config.get(BASE_DELTA) {
            Some(base_uuid) => Some(index.resolve(base_uuid)?.ok_or_else(|| {
                VmrepError::MetadataInconsistency(format!(
                    "no replica of base VM {base_uuid} on SR {}",
                    self.sr.uuid
                ))
            })?),
            None => None,
        };
        if let Some(replica) = base_replica {
            debug!(sr = %self.sr.uuid, base = %replica.vm.uuid, "importing as a delta");
        }

        for vdi in export.vdis.values_mut() {
            vdi.other_config.insert(COPY_OF.to_string(), vdi.uuid.clone());
            vdi.other_config.remove(REPLICATED_TO_SR_UUID);
            vdi.sr = Some(self.sr.obj_ref.clone());

            let Some(base_uuid) = vdi.base_uuid.as_deref() else {
                continue;
            };
            let base = match base_replica {
                Some(replica) => replica.disks.get(base_uuid),
                None => index.resolve_disk(base_uuid)?,
            };
            let base = base.ok_or_else(|| {
                VmrepError::MetadataInconsistency(format!(
                    "missing base VDI (copy of {base_uuid}) on SR {}",
                    self.sr.uuid
                ))
            })?;
            vdi.base_vdi = Some(base.obj_ref.clone());
        }
        Ok(export)
    }

    fn finalize_replica(&self, target: &ObjRef, request: &TransferRequest<'_>) -> Result<()> {
        let hv = self.ctx.hypervisor.as_ref();
        let record = hv.vm_record(target)?;

        if self.ctx.settings.warm_migration() {
            hv.update_blocked_operations(target, &[(OP_START, None), (OP_START_ON, None)])?;
        } else {
            if !record.ha_restart_priority.is_empty() {
                hv.set_ha_restart_priority(target, "")?;
                hv.add_tag(target, HA_DISABLED_TAG)?;
            }
            hv.update_blocked_operations(
                target,
                &[
                    (OP_START, Some(START_BLOCKED_REASON)),
                    (OP_START_ON, Some(START_BLOCKED_REASON)),
                ],
            )?;
        }

        hv.set_name_label(
            target,
            &format!(
                "{} - {} - ({})",
                request.vm.name_label,
                self.ctx.job.name,
                format_filename_date(request.timestamp)
            ),
        )?;

        // Last: the SR tag is what makes the replica visible to later runs.
        set_backup_identity(
            hv,
            target,
            &BackupIdentity {
                timestamp: request.timestamp,
                job_id: self.ctx.job.id.clone(),
                schedule_id: self.ctx.schedule_id.clone(),
                vm_uuid: self.ctx.vm_uuid.clone(),
                sr_uuid: Some(self.sr.uuid.clone()),
            },
        )
    }
}

impl Writer for ReplicationWriter {
    fn target(&self) -> String {
        format!("sr:{}", self.sr.uuid)
    }

    fn check_base_vdis(&mut self, candidates: &mut BaseCandidates, base_vm: &VmRecord) -> Result<()> {
        let hv = self.ctx.hypervisor.as_ref();
        let replica = list_replicated_vms(hv, &self.filter(false, true))?
            .into_iter()
            .find(|vm| vm.tag(COPY_OF) == Some(base_vm.uuid.as_str()));

        let Some(replica) = replica else {
            debug!(sr = %self.sr.uuid, base = %base_vm.uuid, "no replica of the base VM");
            candidates.clear();
            return Ok(());
        };

        let replicated: HashSet<String> = vm_disk_records(hv, &replica.obj_ref)?
            .iter()
            .filter_map(|vdi| vdi.tag(COPY_OF).map(str::to_string))
            .collect();
        candidates.retain(|base_uuid, _| replicated.contains(base_uuid));
        Ok(())
    }

    fn prepare(&mut self, is_full: bool) -> Result<()> {
        debug!(sr = %self.sr.uuid, is_full, "preparing replication");
        self.delete_orphans()?;

        let hv = self.ctx.hypervisor.clone();
        let replicas = list_replicated_vms(hv.as_ref(), &self.filter(true, true))?;
        self.old_entries =
            select_expired_before_write(&replicas, self.ctx.settings.copy_retention()).to_vec();

        if self.ctx.settings.delete_first() {
            self.delete_old_entries();
        }

        self.index = Some(ReplicaIndex::build(hv.as_ref(), &self.sr.uuid)?);
        Ok(())
    }

    fn transfer(&mut self, request: &TransferRequest<'_>) -> Result<()> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| VmrepError::Other("transfer called before prepare".into()))?;
        let export = self.decorate(request.export, index)?;

        let target = task::run("transfer", || {
            self.ctx.mover.import_incremental(&export, &self.sr)
        })?;
        self.target_vm = Some(target.clone());
        self.finalize_replica(&target, request)?;
        info!(sr = %self.sr.uuid, replica = %target, full = export.is_full(), "replica created");
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
        let replica = self
            .target_vm
            .as_ref()
            .ok_or_else(|| VmrepError::Other("no replica to health check".into()))?;

        let hv = self.ctx.hypervisor.as_ref();
        let record = hv.vm_record(replica)?;
        let clone = hv.copy_vm(
            replica,
            &sr.obj_ref,
            &format!("Health check - {}", record.name_label),
        )?;
        health_check_vm(hv, &clone, self.ctx.settings.health_check_timeout())
    }
}
