//! Backup of a single VM for one job run.
//!
//! [`VmBackupRunner::run`] snapshots the VM, selects the base of an
//! incremental export, fans the export out to every writer and prunes what
//! retention no longer needs. Whatever happens, migration is unblocked again,
//! writers are released and a VM shut down for the backup is restarted.

mod incremental;
mod snapshots;
mod writers;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupFailure, CleanupStack};
use crate::config::{JobConfig, JobDefinition, Settings};
use crate::error::{Result, VmrepError};
use crate::hypervisor::{
    Hypervisor, PowerState, SrRecord, VdiRecord, VmRecord, OP_MIGRATE_SEND, OP_POOL_MIGRATE,
    OP_START,
};
use crate::metadata::reset_backup_identity;
use crate::metadata::schema::JOB_ID;
use crate::mover::DataMover;
use crate::storage::StorageBackend;
use crate::writer::{RemoteWriter, ReplicationWriter, WriterContext};
use vmrep_types::ObjRef;

pub use self::writers::WriterFailure;
use self::writers::{call_writers, release_writers, Writers};

pub const MIGRATION_BLOCKED_REASON: &str = "VM migration is blocked during backup";
/// VM tag forcing a checkpoint (memory) snapshot.
pub const MEMORY_BACKUP_TAG: &str = "xo-memory-backup";
/// VM tag forcing the VM to be shut down while it is snapshotted.
pub const OFFLINE_BACKUP_TAG: &str = "xo-offline-backup";

/// A remote a job writes to.
#[derive(Clone)]
pub struct RemoteTarget {
    pub id: String,
    pub storage: Arc<dyn StorageBackend>,
}

pub struct RunnerInput<'a> {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub mover: Arc<dyn DataMover>,
    pub config: &'a JobConfig,
    pub schedule_id: &'a str,
    pub vm: VmRecord,
    pub remotes: Vec<RemoteTarget>,
    pub srs: Vec<SrRecord>,
    pub health_check_sr: Option<SrRecord>,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub vm_uuid: String,
    /// Snapshot created by the run, if any.
    pub snapshot: Option<ObjRef>,
    /// `None` when nothing was transferred.
    pub is_full: Option<bool>,
    pub transferred_size: u64,
    pub writer_failures: Vec<WriterFailure>,
    pub cleanup_failures: Vec<CleanupFailure>,
    pub health_checked: bool,
}

impl RunReport {
    /// True when every writer went through the whole run.
    pub fn is_success(&self) -> bool {
        self.writer_failures.is_empty()
    }
}

/// When to restart a VM shut down for the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAfter {
    Snapshot,
    Backup,
}

pub struct VmBackupRunner {
    hv: Arc<dyn Hypervisor>,
    config: JobConfig,
    job: JobDefinition,
    schedule_id: String,
    vm: VmRecord,
    settings: Settings,
    writers: Writers,
    health_check_sr: Option<SrRecord>,

    timestamp: Option<DateTime<Utc>>,
    exported_vm: Option<VmRecord>,
    /// Snapshots of the VM made by this job, oldest first.
    job_snapshots: Vec<VmRecord>,
    /// Snapshots of the VM disks made by this job.
    job_snapshot_vdis: Vec<VdiRecord>,
    base_vm: Option<VmRecord>,
    /// Live disks that must be exported in full. `None` when there is no base.
    full_vdis_required: Option<HashSet<ObjRef>>,
    report: RunReport,
}

impl VmBackupRunner {
    pub fn new(input: RunnerInput<'_>) -> Result<Self> {
        let RunnerInput {
            hypervisor,
            mover,
            config,
            schedule_id,
            vm,
            remotes,
            srs,
            health_check_sr,
        } = input;

        if vm.tag(JOB_ID) == Some(config.job.id.as_str()) && vm.is_blocked(OP_START) {
            return Err(VmrepError::PreconditionViolation(format!(
                "cannot backup VM {}: it is a replica created by this job",
                vm.uuid
            )));
        }
        if vm
            .current_operations
            .values()
            .any(|op| op == OP_MIGRATE_SEND || op == OP_POOL_MIGRATE)
        {
            return Err(VmrepError::PreconditionViolation(format!(
                "cannot backup VM {}: it is being migrated",
                vm.uuid
            )));
        }
        config.schedule(schedule_id)?;

        let mut settings = config.settings_for(&[schedule_id, vm.uuid.as_str()]);
        if vm.has_tag(MEMORY_BACKUP_TAG) {
            settings.checkpoint_snapshot = Some(true);
        }
        if vm.has_tag(OFFLINE_BACKUP_TAG) {
            settings.offline_snapshot = Some(true);
        }

        let context = |settings: Settings| WriterContext {
            hypervisor: hypervisor.clone(),
            mover: mover.clone(),
            job: config.job.clone(),
            schedule_id: schedule_id.to_string(),
            vm_uuid: vm.uuid.clone(),
            settings,
            health_check_sr: health_check_sr.clone(),
        };

        let mut writers = Writers::default();
        for remote in remotes {
            let remote_settings = config.with_override(&settings, &remote.id);
            if remote_settings.export_retention() != 0 {
                writers.push(Box::new(RemoteWriter::new(
                    context(remote_settings),
                    remote.id,
                    remote.storage,
                )));
            }
        }
        for sr in srs {
            let sr_settings = config.with_override(&settings, &sr.uuid);
            if sr_settings.copy_retention() != 0 {
                writers.push(Box::new(ReplicationWriter::new(context(sr_settings), sr)));
            }
        }

        Ok(Self {
            report: RunReport {
                vm_uuid: vm.uuid.clone(),
                ..RunReport::default()
            },
            hv: hypervisor,
            config: config.clone(),
            job: config.job.clone(),
            schedule_id: schedule_id.to_string(),
            vm,
            settings,
            writers,
            health_check_sr,
            timestamp: None,
            exported_vm: None,
            job_snapshots: Vec::new(),
            job_snapshot_vdis: Vec::new(),
            base_vm: None,
            full_vdis_required: None,
        })
    }

    /// Targets still part of the run.
    pub fn writer_targets(&self) -> Vec<String> {
        self.writers.targets()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn run(mut self) -> Result<RunReport> {
        if self.settings.offline_backup() && self.settings.snapshot_retention() != 0 {
            return Err(VmrepError::Config(
                "offline backup is not compatible with snapshot retention".into(),
            ));
        }
        info!(
            vm = %self.vm.uuid,
            job = %self.job.id,
            schedule = %self.schedule_id,
            writers = self.writers.len(),
            "starting VM backup"
        );

        call_writers(
            &mut self.writers,
            &mut self.report.writer_failures,
            "before_backup",
            true,
            |w| w.before_backup(),
        )?;

        let mut cleanup = CleanupStack::<Self>::new();
        cleanup.push("release writers", |runner| runner.after_backup());
        let result = self
            .block_migration(&mut cleanup)
            .and_then(|()| self.run_steps());
        let failures = cleanup.unwind(&mut self);
        self.report.cleanup_failures.extend(failures);

        match &result {
            Ok(()) => info!(vm = %self.vm.uuid, success = self.report.is_success(), "VM backup done"),
            Err(e) => warn!(vm = %self.vm.uuid, error = %e, "VM backup failed"),
        }
        result.map(|()| self.report)
    }

    fn after_backup(&mut self) -> Result<()> {
        release_writers(&mut self.writers, &mut self.report.writer_failures)
    }

    fn block_migration(&mut self, cleanup: &mut CleanupStack<Self>) -> Result<()> {
        let previous_send = self.vm.blocked_operations.get(OP_MIGRATE_SEND).cloned();
        let previous_pool = self.vm.blocked_operations.get(OP_POOL_MIGRATE).cloned();

        self.hv.update_blocked_operations(
            &self.vm.obj_ref,
            &[
                (OP_MIGRATE_SEND, Some(MIGRATION_BLOCKED_REASON)),
                (OP_POOL_MIGRATE, Some(MIGRATION_BLOCKED_REASON)),
            ],
        )?;
        cleanup.push("restore migration", move |runner| {
            runner.hv.update_blocked_operations(
                &runner.vm.obj_ref,
                &[
                    (OP_MIGRATE_SEND, restored_reason(previous_send.as_deref())),
                    (OP_POOL_MIGRATE, restored_reason(previous_pool.as_deref())),
                ],
            )
        });
        Ok(())
    }

    fn run_steps(&mut self) -> Result<()> {
        self.fetch_job_snapshots()?;
        self.select_base_vm()?;

        if self.vm.tag(JOB_ID).is_some() {
            debug!(vm = %self.vm.uuid, "removing stale backup tags from the VM");
            reset_backup_identity(self.hv.as_ref(), &self.vm.obj_ref)?;
        }
        self.remove_unused_snapshots();

        let start_after = self.start_after();
        if let Some(when) = start_after {
            info!(vm = %self.vm.uuid, ?when, "shutting down VM for the backup");
            self.hv
                .clean_shutdown(&self.vm.obj_ref)
                .map_err(|e| VmrepError::fatal("shutdown", e))?;
        }

        let mut transfer_cleanup = CleanupStack::<Self>::new();
        transfer_cleanup.push("prune job snapshots", |runner| {
            runner.fetch_job_snapshots()?;
            runner.remove_unused_snapshots();
            Ok(())
        });
        if start_after.is_some() {
            transfer_cleanup.push("restart VM", |runner| {
                runner.restart_vm();
                Ok(())
            });
        }

        let result = self.snapshot_and_copy(start_after);
        let failures = transfer_cleanup.unwind(self);
        self.report.cleanup_failures.extend(failures);
        result?;

        self.health_check();
        Ok(())
    }

    fn start_after(&self) -> Option<StartAfter> {
        if self.vm.power_state != PowerState::Running {
            None
        } else if self.settings.offline_backup() {
            Some(StartAfter::Backup)
        } else if self.settings.offline_snapshot() {
            Some(StartAfter::Snapshot)
        } else {
            None
        }
    }

    fn snapshot_and_copy(&mut self, start_after: Option<StartAfter>) -> Result<()> {
        self.snapshot().map_err(|e| VmrepError::fatal("snapshot", e))?;
        if start_after == Some(StartAfter::Snapshot) {
            self.restart_vm();
        }
        if self.writers.is_empty() {
            debug!(vm = %self.vm.uuid, "no writer left, skipping transfer");
            return Ok(());
        }
        self.copy().map_err(|e| VmrepError::fatal("transfer", e))
    }

    /// Best effort: the VM may already be running.
    fn restart_vm(&self) {
        match self.hv.start(&self.vm.obj_ref) {
            Ok(()) => info!(vm = %self.vm.uuid, "VM restarted"),
            Err(e) => debug!(vm = %self.vm.uuid, error = %e, "ignoring VM restart failure"),
        }
    }

    fn health_check(&mut self) {
        if self.health_check_sr.is_none() || self.writers.is_empty() {
            return;
        }
        let tags = self.settings.health_check_vms_with_tags();
        if !tags.is_empty() && !tags.iter().any(|tag| self.vm.has_tag(tag)) {
            debug!(vm = %self.vm.uuid, "VM not selected for health check");
            return;
        }
        match call_writers(
            &mut self.writers,
            &mut self.report.writer_failures,
            "health_check",
            true,
            |w| w.health_check(),
        ) {
            Ok(()) => self.report.health_checked = true,
            Err(e) => warn!(vm = %self.vm.uuid, error = %e, "health check failed"),
        }
    }
}

/// Block reason to put back once the run is over. A reason set by an earlier,
/// interrupted run is not restored.
fn restored_reason(previous: Option<&str>) -> Option<&str> {
    previous.filter(|reason| *reason != MIGRATION_BLOCKED_REASON)
}
