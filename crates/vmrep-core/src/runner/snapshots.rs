use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info};

use super::VmBackupRunner;
use crate::cleanup::best_effort;
use crate::config::JobMode;
use crate::error::Result;
use crate::hypervisor::{vm_disk_records, PowerState};
use crate::metadata::schema::{DATETIME, JOB_ID, SCHEDULE_ID};
use crate::metadata::{parse_datetime, set_backup_identity, BackupIdentity};
use crate::retention::select_expired;
use crate::task;

impl VmBackupRunner {
    /// Name given to the snapshots made by this job.
    pub(super) fn snapshot_name_label(&self) -> String {
        format!("[XO Backup {}] {}", self.job.name, self.vm.name_label)
    }

    /// Reload the snapshots of the VM and of its disks tagged with this job.
    pub(super) fn fetch_job_snapshots(&mut self) -> Result<()> {
        let hv = self.hv.as_ref();
        let job_id = self.job.id.as_str();

        let mut snapshots = Vec::new();
        for snapshot in hv.vm_snapshots(&self.vm.obj_ref)? {
            let record = hv.vm_record(&snapshot)?;
            if record.tag(JOB_ID) == Some(job_id) {
                snapshots.push(record);
            }
        }
        snapshots.sort_by_key(|s| s.tag(DATETIME).and_then(parse_datetime));

        let mut vdis = Vec::new();
        for disk in vm_disk_records(hv, &self.vm.obj_ref)? {
            for snapshot in &disk.snapshots {
                let record = hv.vdi_record(snapshot)?;
                if record.tag(JOB_ID) == Some(job_id) {
                    vdis.push(record);
                }
            }
        }

        debug!(
            vm = %self.vm.uuid,
            snapshots = snapshots.len(),
            vdis = vdis.len(),
            "fetched job snapshots"
        );
        self.job_snapshots = snapshots;
        self.job_snapshot_vdis = vdis;
        Ok(())
    }

    /// Destroy the job snapshots each schedule's retention no longer keeps.
    /// Failures are logged and skipped.
    pub(super) fn remove_unused_snapshots(&mut self) {
        let mut by_schedule: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, snapshot) in self.job_snapshots.iter().enumerate() {
            let schedule = snapshot.tag(SCHEDULE_ID).unwrap_or_default().to_string();
            by_schedule.entry(schedule).or_default().push(i);
        }

        let mut destroyed = Vec::new();
        for (schedule_id, indexes) in &by_schedule {
            let settings = self
                .config
                .settings_for(&[schedule_id.as_str(), self.vm.uuid.as_str()]);
            for &i in select_expired(indexes, settings.snapshot_retention()) {
                let snapshot = &self.job_snapshots[i];
                let deleted = best_effort(
                    format!("delete old snapshot {}", snapshot.uuid),
                    self.hv.destroy_vm(&snapshot.obj_ref),
                );
                if deleted.is_some() {
                    debug!(snapshot = %snapshot.uuid, schedule = %schedule_id, "deleted old snapshot");
                    destroyed.push(i);
                }
            }
        }

        let mut i = 0;
        self.job_snapshots.retain(|_| {
            let keep = !destroyed.contains(&i);
            i += 1;
            keep
        });
    }

    fn must_do_snapshot(&self) -> bool {
        self.job.mode == JobMode::Delta
            || self.settings.unconditional_snapshot()
            || (!self.settings.offline_backup() && self.vm.power_state == PowerState::Running)
            || self.settings.snapshot_retention() != 0
    }

    /// Snapshot the VM, or export it directly when a full backup does not
    /// need a snapshot.
    pub(super) fn snapshot(&mut self) -> Result<()> {
        if !self.must_do_snapshot() {
            debug!(vm = %self.vm.uuid, "exporting the VM itself");
            self.timestamp = Some(Utc::now());
            self.exported_vm = Some(self.hv.vm_record(&self.vm.obj_ref)?);
            return Ok(());
        }

        let (timestamp, snapshot) = task::run("snapshot", || {
            let hv = self.hv.as_ref();
            if !self.settings.bypass_vdi_chains_check() {
                hv.assert_healthy_vdi_chains(&self.vm.obj_ref)?;
            }
            let snapshot = hv.snapshot_vm(
                &self.vm.obj_ref,
                &self.snapshot_name_label(),
                self.settings.checkpoint_snapshot(),
            )?;
            let timestamp = Utc::now();
            set_backup_identity(
                hv,
                &snapshot,
                &BackupIdentity {
                    timestamp,
                    job_id: self.job.id.clone(),
                    schedule_id: self.schedule_id.clone(),
                    vm_uuid: self.vm.uuid.clone(),
                    sr_uuid: None,
                },
            )?;
            Ok((timestamp, hv.vm_record(&snapshot)?))
        })?;

        info!(vm = %self.vm.uuid, snapshot = %snapshot.uuid, "snapshot created");
        self.report.snapshot = Some(snapshot.obj_ref.clone());
        self.timestamp = Some(timestamp);
        self.exported_vm = Some(snapshot);
        Ok(())
    }
}
