use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{JobConfig, JobDefinition, JobMode, ScheduleConfig, Settings};
use crate::error::Result;
use crate::hypervisor::{SrRecord, VmRecord};
use crate::metadata::schema::{JOB_ID, REPLICATED_TO_SR_UUID};
use crate::runner::{RemoteTarget, RunReport, RunnerInput, VmBackupRunner};
use crate::testutil::{MemoryDataMover, MemoryHypervisor};
use crate::writer::WriterContext;

pub const JOB: &str = "job-1";
pub const SCHEDULE: &str = "schedule-1";

pub fn job_config(mode: JobMode, settings: Settings) -> JobConfig {
    JobConfig {
        job: JobDefinition {
            id: JOB.into(),
            name: "Nightly".into(),
            mode,
        },
        settings,
        overrides: BTreeMap::new(),
        schedules: vec![ScheduleConfig {
            id: SCHEDULE.into(),
            name: None,
        }],
        remotes: Vec::new(),
        srs: Vec::new(),
        health_check_sr: None,
    }
}

/// Settings of a delta job replicating to one SR.
pub fn replication_settings(copy_retention: usize) -> Settings {
    Settings {
        copy_retention: Some(copy_retention),
        ..Settings::default()
    }
}

/// A pool with one running VM and a replication target SR.
pub struct Fixture {
    pub hv: Arc<MemoryHypervisor>,
    pub mover: Arc<MemoryDataMover>,
    pub pool_sr: SrRecord,
    pub target_sr: SrRecord,
    pub vm: VmRecord,
    pub config: JobConfig,
    pub srs: Vec<SrRecord>,
    pub remotes: Vec<RemoteTarget>,
    pub health_check_sr: Option<SrRecord>,
}

impl Fixture {
    pub fn new(disks: usize, settings: Settings) -> Self {
        let hv = Arc::new(MemoryHypervisor::new());
        let mover = Arc::new(MemoryDataMover::new(hv.clone()));
        let pool_sr = hv.add_sr("local storage");
        let target_sr = hv.add_sr("replication target");
        let vm = hv.add_vm("web-01", disks, &pool_sr);
        Self {
            srs: vec![target_sr.clone()],
            hv,
            mover,
            pool_sr,
            target_sr,
            vm,
            config: job_config(JobMode::Delta, settings),
            remotes: Vec::new(),
            health_check_sr: None,
        }
    }

    pub fn runner(&self) -> Result<VmBackupRunner> {
        VmBackupRunner::new(RunnerInput {
            hypervisor: self.hv.clone(),
            mover: self.mover.clone(),
            config: &self.config,
            schedule_id: SCHEDULE,
            vm: self.hv.vm(&self.vm.obj_ref),
            remotes: self.remotes.clone(),
            srs: self.srs.clone(),
            health_check_sr: self.health_check_sr.clone(),
        })
    }

    pub fn run(&self) -> Result<RunReport> {
        self.runner()?.run()
    }

    pub fn writer_context(&self) -> WriterContext {
        WriterContext {
            hypervisor: self.hv.clone(),
            mover: self.mover.clone(),
            job: self.config.job.clone(),
            schedule_id: SCHEDULE.into(),
            vm_uuid: self.vm.uuid.clone(),
            settings: self.config.settings.clone(),
            health_check_sr: self.health_check_sr.clone(),
        }
    }

    /// Completed replicas on the target SR, oldest first.
    pub fn replicas(&self) -> Vec<VmRecord> {
        let sr = self.target_sr.uuid.clone();
        self.hv.vms_where(|vm| {
            !vm.is_a_snapshot && vm.tag(REPLICATED_TO_SR_UUID) == Some(sr.as_str())
        })
    }

    /// Snapshots of the VM made by the job.
    pub fn job_snapshots(&self) -> Vec<VmRecord> {
        let vm = self.vm.obj_ref.clone();
        self.hv.vms_where(|s| {
            s.is_a_snapshot && s.snapshot_of.as_ref() == Some(&vm) && s.tag(JOB_ID) == Some(JOB)
        })
    }
}
