use std::collections::HashMap;

use crate::error::{Result, VmrepError};
use crate::hypervisor::{vm_disk_records, Hypervisor, VdiRecord, VmRecord};
use crate::metadata::schema::{COPY_OF, REPLICATED_TO_SR_UUID};

pub(crate) struct IndexedReplica {
    pub vm: VmRecord,
    /// Disks of the replica keyed by their COPY_OF tag.
    pub disks: HashMap<String, VdiRecord>,
}

/// Replicas living on one SR, keyed by the uuid they are a copy of.
///
/// Built once per `prepare` so that resolving the base of every disk is a
/// lookup instead of a scan of every object of the pool.
pub(crate) struct ReplicaIndex {
    sr_uuid: String,
    replicas: HashMap<String, Vec<IndexedReplica>>,
}

impl ReplicaIndex {
    pub fn build(hv: &dyn Hypervisor, sr_uuid: &str) -> Result<Self> {
        let mut replicas: HashMap<String, Vec<IndexedReplica>> = HashMap::new();
        for vm in hv.all_vms()? {
            if vm.is_a_snapshot || vm.is_a_template {
                continue;
            }
            if vm.tag(REPLICATED_TO_SR_UUID) != Some(sr_uuid) {
                continue;
            }
            let Some(copy_of) = vm.tag(COPY_OF).map(str::to_string) else {
                continue;
            };
            let disks = vm_disk_records(hv, &vm.obj_ref)?
                .into_iter()
                .filter_map(|vdi| vdi.tag(COPY_OF).map(|c| (c.to_string(), vdi.clone())))
                .collect();
            replicas
                .entry(copy_of)
                .or_default()
                .push(IndexedReplica { vm, disks });
        }
        Ok(Self {
            sr_uuid: sr_uuid.to_string(),
            replicas,
        })
    }

    /// The single replica of `copy_of` on this SR, if any.
    pub fn resolve(&self, copy_of: &str) -> Result<Option<&IndexedReplica>> {
        match self.replicas.get(copy_of).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([replica]) => Ok(Some(replica)),
            Some(many) => Err(VmrepError::MetadataInconsistency(format!(
                "{} replicas of {copy_of} on SR {}",
                many.len(),
                self.sr_uuid
            ))),
        }
    }

    /// The single replica disk of `copy_of` on this SR, searching every replica.
    pub fn resolve_disk(&self, copy_of: &str) -> Result<Option<&VdiRecord>> {
        let mut found = self
            .replicas
            .values()
            .flatten()
            .filter_map(|replica| replica.disks.get(copy_of));
        match (found.next(), found.next()) {
            (None, _) => Ok(None),
            (Some(disk), None) => Ok(Some(disk)),
            (Some(_), Some(_)) => Err(VmrepError::MetadataInconsistency(format!(
                "several replica disks of {copy_of} on SR {}",
                self.sr_uuid
            ))),
        }
    }
}
