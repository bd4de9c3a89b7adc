//! Interface to the hypervisor management API.
//!
//! The RPC client itself lives outside this crate; everything the runner and
//! writers need from it goes through [`Hypervisor`]. Implementations must be
//! usable from several writer threads at once.

mod records;

pub use self::records::{OtherConfig, PowerState, SrRecord, VdiRecord, VmRecord};

use crate::error::Result;
use vmrep_types::ObjRef;

pub const OP_START: &str = "start";
pub const OP_START_ON: &str = "start_on";
pub const OP_MIGRATE_SEND: &str = "migrate_send";
pub const OP_POOL_MIGRATE: &str = "pool_migrate";

/// A single metadata change: `None` removes the key.
pub type ConfigChange<'a> = (&'a str, Option<&'a str>);

pub trait Hypervisor: Send + Sync {
    fn vm_record(&self, vm: &ObjRef) -> Result<VmRecord>;

    fn vdi_record(&self, vdi: &ObjRef) -> Result<VdiRecord>;

    fn sr_record(&self, sr: &ObjRef) -> Result<SrRecord>;

    /// Resolve an SR from its uuid.
    fn sr_by_uuid(&self, uuid: &str) -> Result<SrRecord>;

    /// Every VM known to the connection, templates and snapshots included.
    fn all_vms(&self) -> Result<Vec<VmRecord>>;

    /// Read the `other_config` map of a VM or VDI.
    fn other_config(&self, obj: &ObjRef) -> Result<OtherConfig>;

    /// Apply several `other_config` changes to one object.
    fn update_other_config(&self, obj: &ObjRef, changes: &[ConfigChange<'_>]) -> Result<()>;

    fn set_other_config_entry(&self, obj: &ObjRef, key: &str, value: Option<&str>) -> Result<()> {
        self.update_other_config(obj, &[(key, value)])
    }

    /// Disks (VDIs) attached to a VM, CD drives excluded.
    fn vm_disks(&self, vm: &ObjRef) -> Result<Vec<ObjRef>>;

    fn vm_snapshots(&self, vm: &ObjRef) -> Result<Vec<ObjRef>>;

    /// Destroy a VM together with its disks.
    fn destroy_vm(&self, vm: &ObjRef) -> Result<()>;

    fn destroy_vdi(&self, vdi: &ObjRef) -> Result<()>;

    /// Take a snapshot, with memory when `checkpoint` is set. Disks flagged as
    /// not to be backed up are skipped.
    fn snapshot_vm(&self, vm: &ObjRef, name_label: &str, checkpoint: bool) -> Result<ObjRef>;

    /// Fail when a disk chain of the VM is too long or needs coalescing.
    fn assert_healthy_vdi_chains(&self, vm: &ObjRef) -> Result<()>;

    fn clean_shutdown(&self, vm: &ObjRef) -> Result<()>;

    fn start(&self, vm: &ObjRef) -> Result<()>;

    /// Apply blocked-operation changes: `Some(reason)` blocks, `None` unblocks.
    fn update_blocked_operations(&self, vm: &ObjRef, changes: &[ConfigChange<'_>]) -> Result<()>;

    fn set_ha_restart_priority(&self, vm: &ObjRef, priority: &str) -> Result<()>;

    fn set_name_label(&self, vm: &ObjRef, name_label: &str) -> Result<()>;

    fn add_tag(&self, vm: &ObjRef, tag: &str) -> Result<()>;

    /// Full copy of a VM onto an SR.
    fn copy_vm(&self, vm: &ObjRef, sr: &ObjRef, name_label: &str) -> Result<ObjRef>;
}

/// Fetch the records of every disk attached to `vm`.
pub fn vm_disk_records(hv: &dyn Hypervisor, vm: &ObjRef) -> Result<Vec<VdiRecord>> {
    hv.vm_disks(vm)?
        .iter()
        .map(|vdi| hv.vdi_record(vdi))
        .collect()
}
