//! Reading and writing backup tags on VMs and their disks.
//!
//! Every write is per object: a crash between tagging the VM and tagging one
//! of its disks leaves the disk untagged. Readers treat a missing tag as
//! "not part of any chain", which at worst forces a full transfer.

pub mod schema;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::debug;

use crate::error::{Result, VmrepError};
use crate::hypervisor::{ConfigChange, Hypervisor, OtherConfig};
use vmrep_types::ObjRef;

use self::schema::*;

/// The tag tuple identifying which job run produced a snapshot or replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupIdentity {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub schedule_id: String,
    pub vm_uuid: String,
    /// Only set on replicas.
    pub sr_uuid: Option<String>,
}

impl BackupIdentity {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("job id", &self.job_id),
            ("schedule id", &self.schedule_id),
            ("vm uuid", &self.vm_uuid),
        ] {
            if value.is_empty() {
                return Err(VmrepError::InvalidArgument(format!(
                    "backup identity is missing the {name}"
                )));
            }
        }
        Ok(())
    }
}

pub fn format_datetime(timestamp: DateTime<Utc>) -> String {
    timestamp.format(DATETIME_FORMAT).to_string()
}

pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The VM followed by each of its disks.
fn vm_and_disks(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<Vec<ObjRef>> {
    let mut objects = vec![vm.clone()];
    objects.extend(hv.vm_disks(vm)?);
    Ok(objects)
}

fn update_vm_and_disks(hv: &dyn Hypervisor, vm: &ObjRef, changes: &[ConfigChange<'_>]) -> Result<()> {
    for obj in vm_and_disks(hv, vm)? {
        hv.update_other_config(&obj, changes)?;
    }
    Ok(())
}

/// Tag a VM and all of its disks with the identity of the current run.
pub fn set_backup_identity(hv: &dyn Hypervisor, vm: &ObjRef, identity: &BackupIdentity) -> Result<()> {
    identity.validate()?;
    let datetime = format_datetime(identity.timestamp);
    let changes: [ConfigChange<'_>; 5] = [
        (DATETIME, Some(datetime.as_str())),
        (JOB_ID, Some(identity.job_id.as_str())),
        (SCHEDULE_ID, Some(identity.schedule_id.as_str())),
        (VM_UUID, Some(identity.vm_uuid.as_str())),
        (REPLICATED_TO_SR_UUID, identity.sr_uuid.as_deref()),
    ];
    // Without an SR this is a plain backup: leave any replication tag alone.
    let changes = if identity.sr_uuid.is_some() {
        &changes[..]
    } else {
        &changes[..4]
    };
    update_vm_and_disks(hv, vm, changes)
}

/// Remove the job identity from a VM and its disks.
///
/// [`REPLICATED_TO_SR_UUID`] is kept: a replica can itself be the source of
/// another replication job.
pub fn reset_backup_identity(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<()> {
    let changes: Vec<ConfigChange<'_>> = IDENTITY_KEYS.iter().map(|&key| (key, None)).collect();
    update_vm_and_disks(hv, vm, &changes)
}

/// Flag a snapshot as usable as an incremental base.
pub fn mark_export_successful(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<()> {
    update_vm_and_disks(hv, vm, &[(EXPORTED_SUCCESSFULLY, Some("true"))])
}

pub fn is_export_successful(other_config: &OtherConfig) -> bool {
    other_config.get(EXPORTED_SUCCESSFULLY).map(String::as_str) == Some("true")
}

/// Longest chain recorded on the VM or any of its disks. Untagged objects count as 0.
pub fn chain_length(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<u32> {
    let mut longest = 0;
    for obj in vm_and_disks(hv, vm)? {
        let other_config = hv.other_config(&obj)?;
        let length = other_config
            .get(DELTA_CHAIN_LENGTH)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        longest = longest.max(length);
    }
    Ok(longest)
}

pub fn set_chain_length(hv: &dyn Hypervisor, vm: &ObjRef, length: u32) -> Result<()> {
    debug!(vm = %vm, length, "updating delta chain length");
    let value = length.to_string();
    update_vm_and_disks(hv, vm, &[(DELTA_CHAIN_LENGTH, Some(value.as_str()))])
}

/// Bump the chain length of a VM and its disks to one past the longest one.
pub fn increment_chain_length(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<u32> {
    let length = chain_length(hv, vm)? + 1;
    set_chain_length(hv, vm, length)?;
    Ok(length)
}
