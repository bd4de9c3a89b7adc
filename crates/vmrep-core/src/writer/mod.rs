//! Targets a run writes to. One [`Writer`] is created per configured remote
//! or replication SR; the runner drives them all through the same steps.

pub mod remote;
pub mod replication;
mod replica_index;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::cleanup::best_effort;
use crate::config::{JobDefinition, Settings};
use crate::error::{Result, VmrepError};
use crate::export::IncrementalExport;
use crate::hypervisor::{Hypervisor, PowerState, SrRecord, VdiRecord, VmRecord, OP_START, OP_START_ON};
use crate::mover::DataMover;
use crate::task;
use vmrep_types::ObjRef;

pub use self::remote::RemoteWriter;
pub use self::replication::ReplicationWriter;

const HEALTH_CHECK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Base disk uuid → live disk it is a snapshot of.
pub type BaseCandidates = BTreeMap<String, VdiRecord>;

/// Everything a writer needs to know about the run it belongs to.
#[derive(Clone)]
pub struct WriterContext {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub mover: Arc<dyn DataMover>,
    pub job: JobDefinition,
    pub schedule_id: String,
    /// Uuid of the backed up VM.
    pub vm_uuid: String,
    /// Run settings merged with the overrides of this target.
    pub settings: Settings,
    pub health_check_sr: Option<SrRecord>,
}

pub struct TransferRequest<'a> {
    /// When the exported snapshot was taken.
    pub timestamp: DateTime<Utc>,
    pub export: &'a IncrementalExport,
    /// The backed up VM, not its snapshot.
    pub vm: &'a VmRecord,
}

pub trait Writer: Send {
    /// Human readable target, used in logs and reports.
    fn target(&self) -> String;

    fn before_backup(&mut self) -> Result<()> {
        Ok(())
    }

    fn after_backup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop from `candidates` every base disk this target has no copy of.
    fn check_base_vdis(&mut self, candidates: &mut BaseCandidates, base_vm: &VmRecord) -> Result<()>;

    fn prepare(&mut self, is_full: bool) -> Result<()>;

    fn transfer(&mut self, request: &TransferRequest<'_>) -> Result<()>;

    fn cleanup(&mut self) -> Result<()>;

    fn health_check(&mut self) -> Result<()>;
}

/// Date format used in names and remote keys.
pub fn format_filename_date(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Boot a throwaway VM and wait for it to run. The VM is destroyed afterwards,
/// whatever the outcome.
pub fn health_check_vm(hv: &dyn Hypervisor, vm: &ObjRef, timeout: Duration) -> Result<()> {
    let result = task::run("health check", || {
        hv.update_blocked_operations(vm, &[(OP_START, None), (OP_START_ON, None)])?;
        hv.start(vm)?;
        wait_running(hv, vm, timeout)
    });
    best_effort(format!("destroy health check VM {vm}"), hv.destroy_vm(vm));
    result
}

fn wait_running(hv: &dyn Hypervisor, vm: &ObjRef, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let record = hv.vm_record(vm)?;
        if record.power_state == PowerState::Running {
            debug!(vm = %record.uuid, "health check VM is running");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(VmrepError::Other(format!(
                "health check VM {} did not start within {}s (power state {:?})",
                record.uuid,
                timeout.as_secs(),
                record.power_state
            )));
        }
        thread::sleep(HEALTH_CHECK_POLL_INTERVAL.min(timeout));
    }
}
