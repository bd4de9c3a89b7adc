use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use super::writers::{call_writers, call_writers_sequentially};
use super::VmBackupRunner;
use crate::config::JobMode;
use crate::error::{Result, VmrepError};
use crate::export::IncrementalExport;
use crate::hypervisor::{vm_disk_records, VmRecord};
use crate::metadata::{chain_length, is_export_successful, mark_export_successful, set_chain_length};
use crate::writer::{BaseCandidates, TransferRequest};
use vmrep_types::ObjRef;

impl VmBackupRunner {
    /// Pick the snapshot the next export is a delta of, and the disks that
    /// still need a full export. Leaves `base_vm` unset for a full export.
    pub(super) fn select_base_vm(&mut self) -> Result<()> {
        if self.job.mode != JobMode::Delta {
            return Ok(());
        }
        let hv = self.hv.as_ref();

        let Some(base) = self
            .job_snapshots
            .iter()
            .rev()
            .find(|s| is_export_successful(&s.other_config))
            .cloned()
        else {
            debug!(vm = %self.vm.uuid, "no exported snapshot to use as base");
            return Ok(());
        };

        let full_interval = self.settings.full_interval();
        let next_length = chain_length(hv, &base.obj_ref)? + 1;
        if full_interval != 0 && full_interval <= next_length {
            debug!(vm = %self.vm.uuid, next_length, full_interval, "full interval reached");
            return Ok(());
        }

        let live_disks: HashMap<ObjRef, _> = vm_disk_records(hv, &self.vm.obj_ref)?
            .into_iter()
            .map(|vdi| (vdi.obj_ref.clone(), vdi))
            .collect();
        let job_vdis: HashSet<&str> = self
            .job_snapshot_vdis
            .iter()
            .map(|vdi| vdi.uuid.as_str())
            .collect();

        let mut candidates = BaseCandidates::new();
        for base_vdi in vm_disk_records(hv, &base.obj_ref)? {
            let Some(source) = base_vdi.snapshot_of.as_ref().and_then(|r| live_disks.get(r)) else {
                debug!(vdi = %base_vdi.uuid, "base disk no longer belongs to the VM");
                continue;
            };
            if !job_vdis.contains(base_vdi.uuid.as_str()) {
                debug!(vdi = %base_vdi.uuid, "base disk was not made by this job");
                continue;
            }
            candidates.insert(base_vdi.uuid.clone(), source.clone());
        }

        let mut present = candidates.clone();
        call_writers_sequentially(
            &mut self.writers,
            &mut self.report.writer_failures,
            "check_base_vdis",
            |w| {
                if present.is_empty() {
                    Ok(())
                } else {
                    w.check_base_vdis(&mut present, &base)
                }
            },
        )?;

        if present.is_empty() {
            debug!(vm = %self.vm.uuid, "no base disk available on every target");
            return Ok(());
        }

        let full_required: HashSet<ObjRef> = candidates
            .iter()
            .filter(|(uuid, _)| !present.contains_key(*uuid))
            .map(|(_, source)| source.obj_ref.clone())
            .collect();
        info!(
            vm = %self.vm.uuid,
            base = %base.uuid,
            delta_disks = present.len(),
            full_disks = full_required.len(),
            "selected base snapshot"
        );
        self.base_vm = Some(base);
        self.full_vdis_required = Some(full_required);
        Ok(())
    }

    /// Export the snapshot to every writer, then record the chain it extends.
    pub(super) fn copy(&mut self) -> Result<()> {
        let exported = self
            .exported_vm
            .clone()
            .ok_or_else(|| VmrepError::Other("nothing to export".into()))?;
        let timestamp = self
            .timestamp
            .ok_or_else(|| VmrepError::Other("export has no timestamp".into()))?;
        let hv = self.hv.clone();

        let is_full = self
            .full_vdis_required
            .as_ref()
            .map_or(true, |required| !required.is_empty());
        call_writers(
            &mut self.writers,
            &mut self.report.writer_failures,
            "prepare",
            true,
            |w| w.prepare(is_full),
        )?;

        let no_full_disks = HashSet::new();
        let export = IncrementalExport::build(
            hv.as_ref(),
            &exported,
            self.base_vm.as_ref(),
            self.full_vdis_required.as_ref().unwrap_or(&no_full_disks),
        )?;

        let request = TransferRequest {
            timestamp,
            export: &export,
            vm: &self.vm,
        };
        call_writers(
            &mut self.writers,
            &mut self.report.writer_failures,
            "transfer",
            true,
            |w| w.transfer(&request),
        )?;
        self.report.is_full = Some(export.is_full());
        self.report.transferred_size = export.total_size();

        let tagged = self.tag_exported(&exported, export.is_full());

        // Transferred copies are in place: retention runs even if tagging failed.
        call_writers(
            &mut self.writers,
            &mut self.report.writer_failures,
            "cleanup",
            true,
            |w| w.cleanup(),
        )?;
        tagged
    }

    fn tag_exported(&self, exported: &VmRecord, is_full: bool) -> Result<()> {
        let hv = self.hv.as_ref();
        if let Some(base) = &self.base_vm {
            if !is_full {
                let length = chain_length(hv, &base.obj_ref)? + 1;
                set_chain_length(hv, &exported.obj_ref, length)?;
            }
        }
        if exported.is_a_snapshot {
            mark_export_successful(hv, &exported.obj_ref)?;
        }
        Ok(())
    }
}
