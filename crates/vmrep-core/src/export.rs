//! Description of what a run exports: the VM (usually a snapshot), its disks
//! and, for incremental exports, which base each disk is a delta of.
//!
//! The bytes themselves are moved by the [`DataMover`](crate::mover::DataMover);
//! writers only decorate the metadata below before handing it over.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::hypervisor::{vm_disk_records, Hypervisor, OtherConfig, VmRecord};
use crate::metadata::schema::BASE_DELTA;
use vmrep_types::ObjRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedVm {
    #[serde(rename = "$ref")]
    pub obj_ref: ObjRef,
    pub uuid: String,
    pub name_label: String,
    pub is_a_snapshot: bool,
    pub other_config: OtherConfig,
    pub blocked_operations: BTreeMap<String, String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedVdi {
    /// Disk being read.
    #[serde(rename = "$ref")]
    pub obj_ref: ObjRef,
    pub uuid: String,
    pub name_label: String,
    pub virtual_size: u64,
    pub other_config: OtherConfig,
    /// Uuid of the disk this export is a delta of, `None` for a full export.
    pub base_uuid: Option<String>,
    /// SR the disk is imported to. Set by replication writers.
    #[serde(skip)]
    pub sr: Option<ObjRef>,
    /// Disk on the target the delta applies to. Set by replication writers.
    #[serde(skip)]
    pub base_vdi: Option<ObjRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalExport {
    pub vm: ExportedVm,
    /// Keyed by disk uuid.
    pub vdis: BTreeMap<String, ExportedVdi>,
}

impl IncrementalExport {
    /// Describe the export of `exported_vm`, as a delta of `base_vm` when given.
    ///
    /// Disks whose source disk is in `full_vdis_required`, or which have no
    /// counterpart in the base, are exported in full.
    pub fn build(
        hv: &dyn Hypervisor,
        exported_vm: &VmRecord,
        base_vm: Option<&VmRecord>,
        full_vdis_required: &HashSet<ObjRef>,
    ) -> Result<Self> {
        let base_disks = match base_vm {
            Some(base) => vm_disk_records(hv, &base.obj_ref)?,
            None => Vec::new(),
        };

        let mut vdis = BTreeMap::new();
        for vdi in vm_disk_records(hv, &exported_vm.obj_ref)? {
            // Disks of a snapshot point to the live disk; the live VM is its own source.
            let source = vdi.snapshot_of.clone().unwrap_or_else(|| vdi.obj_ref.clone());
            let base = if full_vdis_required.contains(&source) {
                None
            } else {
                base_disks
                    .iter()
                    .find(|b| b.snapshot_of.as_ref() == Some(&source))
            };

            let mut other_config = vdi.other_config.clone();
            match base {
                Some(base) => {
                    other_config.insert(BASE_DELTA.to_string(), base.uuid.clone());
                }
                None => {
                    other_config.remove(BASE_DELTA);
                }
            }
            debug!(vdi = %vdi.uuid, base = ?base.map(|b| &b.uuid), "exporting disk");

            vdis.insert(
                vdi.uuid.clone(),
                ExportedVdi {
                    obj_ref: vdi.obj_ref.clone(),
                    uuid: vdi.uuid.clone(),
                    name_label: vdi.name_label.clone(),
                    virtual_size: vdi.virtual_size,
                    other_config,
                    base_uuid: base.map(|b| b.uuid.clone()),
                    sr: None,
                    base_vdi: None,
                },
            );
        }

        let mut other_config = exported_vm.other_config.clone();
        let has_delta = vdis.values().any(|v| v.base_uuid.is_some());
        match base_vm {
            Some(base) if has_delta => {
                other_config.insert(BASE_DELTA.to_string(), base.uuid.clone());
            }
            _ => {
                other_config.remove(BASE_DELTA);
            }
        }

        Ok(Self {
            vm: ExportedVm {
                obj_ref: exported_vm.obj_ref.clone(),
                uuid: exported_vm.uuid.clone(),
                name_label: exported_vm.name_label.clone(),
                is_a_snapshot: exported_vm.is_a_snapshot,
                other_config,
                blocked_operations: exported_vm.blocked_operations.clone(),
                tags: exported_vm.tags.clone(),
            },
            vdis,
        })
    }

    /// True when no disk is exported as a delta.
    pub fn is_full(&self) -> bool {
        self.vdis.values().all(|vdi| vdi.base_uuid.is_none())
    }

    pub fn total_size(&self) -> u64 {
        self.vdis.values().map(|vdi| vdi.virtual_size).sum()
    }
}
