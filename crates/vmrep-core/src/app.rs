//! Entry point of a job run: resolve the targets of a job and back up every
//! VM it selects, one after the other.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::JobConfig;
use crate::error::Result;
use crate::hypervisor::{Hypervisor, VmRecord};
use crate::mover::DataMover;
use crate::runner::{RemoteTarget, RunReport, RunnerInput, VmBackupRunner};
use crate::storage::backend_from_config;
use crate::task;
use vmrep_types::ObjRef;

/// Result of the run of one VM. A failing VM never stops the others.
#[derive(Debug)]
pub struct VmRunOutcome {
    pub vm: ObjRef,
    pub result: Result<RunReport>,
}

/// Run `schedule_id` of the job for every VM of `vms`.
///
/// Fails only when the job itself cannot run: unknown schedule, unreachable
/// remote or SR.
pub fn run_job(
    hypervisor: Arc<dyn Hypervisor>,
    mover: Arc<dyn DataMover>,
    config: &JobConfig,
    schedule_id: &str,
    vms: &[ObjRef],
) -> Result<Vec<VmRunOutcome>> {
    config.schedule(schedule_id)?;

    let remotes = config
        .remotes
        .iter()
        .map(|remote| {
            Ok(RemoteTarget {
                id: remote.id.clone(),
                storage: Arc::from(backend_from_config(remote)?),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let srs = config
        .srs
        .iter()
        .map(|uuid| hypervisor.sr_by_uuid(uuid))
        .collect::<Result<Vec<_>>>()?;
    let health_check_sr = config
        .health_check_sr
        .as_deref()
        .map(|uuid| hypervisor.sr_by_uuid(uuid))
        .transpose()?;

    info!(
        job = %config.job.id,
        schedule = schedule_id,
        vms = vms.len(),
        remotes = remotes.len(),
        srs = srs.len(),
        "starting job"
    );

    let backup_vm = task::wrap("vm backup", |vm: VmRecord| {
        VmBackupRunner::new(RunnerInput {
            hypervisor: hypervisor.clone(),
            mover: mover.clone(),
            config,
            schedule_id,
            vm,
            remotes: remotes.clone(),
            srs: srs.clone(),
            health_check_sr: health_check_sr.clone(),
        })?
        .run()
    });

    let mut outcomes = Vec::with_capacity(vms.len());
    for vm in vms {
        let result = hypervisor.vm_record(vm).and_then(&backup_vm);
        if let Err(e) = &result {
            error!(vm = %vm, error = %e, "VM backup failed");
        }
        outcomes.push(VmRunOutcome {
            vm: vm.clone(),
            result,
        });
    }
    Ok(outcomes)
}
