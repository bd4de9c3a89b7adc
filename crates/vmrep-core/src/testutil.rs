use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::{Result, VmrepError};
use crate::export::{ExportedVdi, ExportedVm, IncrementalExport};
use crate::hypervisor::{
    ConfigChange, Hypervisor, OtherConfig, PowerState, SrRecord, VdiRecord, VmRecord, OP_START,
};
use crate::mover::DataMover;
use crate::storage::StorageBackend;
use crate::writer::remote::{list_vm_backups, BackupMetadata};
use vmrep_types::ObjRef;

pub const GIB: u64 = 1 << 30;

#[derive(Default)]
struct PoolState {
    next_id: u64,
    vms: BTreeMap<ObjRef, VmRecord>,
    vdis: BTreeMap<ObjRef, VdiRecord>,
    vm_disks: BTreeMap<ObjRef, Vec<ObjRef>>,
    srs: BTreeMap<ObjRef, SrRecord>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

impl PoolState {
    fn next_ref(&mut self) -> (ObjRef, String) {
        self.next_id += 1;
        let n = self.next_id;
        (
            ObjRef::new(format!("OpaqueRef:{n:08}")),
            format!("{n:08x}-0000-4000-8000-000000000000"),
        )
    }

    fn check(&mut self, op: &str, obj: &ObjRef) -> Result<()> {
        self.calls.push(format!("{op} {obj}"));
        if self.failing.contains(op) {
            return Err(VmrepError::Hypervisor(format!("{op} failed on {obj}")));
        }
        Ok(())
    }

    fn vm_mut(&mut self, vm: &ObjRef) -> Result<&mut VmRecord> {
        self.vms
            .get_mut(vm)
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))
    }

    fn new_vdi(&mut self, template: &VdiRecord) -> VdiRecord {
        let (obj_ref, uuid) = self.next_ref();
        let vdi = VdiRecord {
            obj_ref: obj_ref.clone(),
            uuid,
            snapshots: Vec::new(),
            ..template.clone()
        };
        self.vdis.insert(obj_ref, vdi.clone());
        vdi
    }

    fn new_vm(&mut self, template: &VmRecord, disks: Vec<ObjRef>) -> VmRecord {
        let (obj_ref, uuid) = self.next_ref();
        let vm = VmRecord {
            obj_ref: obj_ref.clone(),
            uuid,
            snapshots: Vec::new(),
            current_operations: BTreeMap::new(),
            ..template.clone()
        };
        self.vms.insert(obj_ref.clone(), vm.clone());
        self.vm_disks.insert(obj_ref, disks);
        vm
    }

    fn destroy_vm(&mut self, vm: &ObjRef) -> Result<()> {
        self.vms
            .remove(vm)
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))?;
        for disk in self.vm_disks.remove(vm).unwrap_or_default() {
            self.vdis.remove(&disk);
            for other in self.vdis.values_mut() {
                other.snapshots.retain(|s| s != &disk);
            }
        }
        for other in self.vms.values_mut() {
            other.snapshots.retain(|s| s != vm);
        }
        Ok(())
    }

    fn import(&mut self, vm: &ExportedVm, vdis: &[&ExportedVdi], sr: &SrRecord) -> Result<ObjRef> {
        let ha_restart_priority = self
            .vms
            .get(&vm.obj_ref)
            .map(|source| source.ha_restart_priority.clone())
            .unwrap_or_default();

        let mut disks = Vec::new();
        for exported in vdis {
            if let Some(base) = &exported.base_vdi {
                if !self.vdis.contains_key(base) {
                    return Err(VmrepError::Other(format!("base VDI {base} does not exist")));
                }
            }
            let template = VdiRecord {
                obj_ref: ObjRef::default(),
                uuid: String::new(),
                name_label: exported.name_label.clone(),
                sr: exported.sr.clone().unwrap_or_else(|| sr.obj_ref.clone()),
                virtual_size: exported.virtual_size,
                is_a_snapshot: false,
                snapshot_of: None,
                snapshots: Vec::new(),
                other_config: exported.other_config.clone(),
            };
            disks.push(self.new_vdi(&template).obj_ref);
        }

        let template = VmRecord {
            obj_ref: ObjRef::default(),
            uuid: String::new(),
            name_label: vm.name_label.clone(),
            power_state: PowerState::Halted,
            is_a_snapshot: false,
            is_a_template: false,
            snapshot_of: None,
            other_config: vm.other_config.clone(),
            blocked_operations: vm.blocked_operations.clone(),
            current_operations: BTreeMap::new(),
            tags: vm.tags.clone(),
            ha_restart_priority,
            snapshots: Vec::new(),
        };
        Ok(self.new_vm(&template, disks).obj_ref)
    }
}

fn apply(map: &mut BTreeMap<String, String>, changes: &[ConfigChange<'_>]) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                map.insert(key.to_string(), value.to_string());
            }
            None => {
                map.remove(*key);
            }
        }
    }
}

/// In-memory pool for testing. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryHypervisor {
    state: Mutex<PoolState>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sr(&self, name_label: &str) -> SrRecord {
        let mut state = self.state.lock().unwrap();
        let (obj_ref, uuid) = state.next_ref();
        let sr = SrRecord {
            obj_ref: obj_ref.clone(),
            uuid,
            name_label: name_label.to_string(),
        };
        state.srs.insert(obj_ref, sr.clone());
        sr
    }

    /// A running VM with `disks` disks of 1 GiB on `sr`.
    pub fn add_vm(&self, name_label: &str, disks: usize, sr: &SrRecord) -> VmRecord {
        let mut state = self.state.lock().unwrap();
        let disk_refs = (0..disks)
            .map(|i| {
                let template = VdiRecord {
                    obj_ref: ObjRef::default(),
                    uuid: String::new(),
                    name_label: format!("{name_label} disk {i}"),
                    sr: sr.obj_ref.clone(),
                    virtual_size: GIB,
                    is_a_snapshot: false,
                    snapshot_of: None,
                    snapshots: Vec::new(),
                    other_config: OtherConfig::new(),
                };
                state.new_vdi(&template).obj_ref
            })
            .collect();
        let template = VmRecord {
            obj_ref: ObjRef::default(),
            uuid: String::new(),
            name_label: name_label.to_string(),
            power_state: PowerState::Running,
            is_a_snapshot: false,
            is_a_template: false,
            snapshot_of: None,
            other_config: OtherConfig::new(),
            blocked_operations: BTreeMap::new(),
            current_operations: BTreeMap::new(),
            tags: Vec::new(),
            ha_restart_priority: String::new(),
            snapshots: Vec::new(),
        };
        state.new_vm(&template, disk_refs)
    }

    /// Add a disk to an existing VM.
    pub fn attach_disk(&self, vm: &ObjRef, sr: &SrRecord) -> VdiRecord {
        let mut state = self.state.lock().unwrap();
        let template = VdiRecord {
            obj_ref: ObjRef::default(),
            uuid: String::new(),
            name_label: "attached disk".into(),
            sr: sr.obj_ref.clone(),
            virtual_size: GIB,
            is_a_snapshot: false,
            snapshot_of: None,
            snapshots: Vec::new(),
            other_config: OtherConfig::new(),
        };
        let vdi = state.new_vdi(&template);
        state
            .vm_disks
            .get_mut(vm)
            .unwrap()
            .push(vdi.obj_ref.clone());
        vdi
    }

    pub fn vm(&self, vm: &ObjRef) -> VmRecord {
        self.state.lock().unwrap().vms[vm].clone()
    }

    pub fn try_vm(&self, vm: &ObjRef) -> Option<VmRecord> {
        self.state.lock().unwrap().vms.get(vm).cloned()
    }

    pub fn vdi(&self, vdi: &ObjRef) -> VdiRecord {
        self.state.lock().unwrap().vdis[vdi].clone()
    }

    pub fn disks(&self, vm: &ObjRef) -> Vec<VdiRecord> {
        let state = self.state.lock().unwrap();
        state.vm_disks[vm]
            .iter()
            .map(|r| state.vdis[r].clone())
            .collect()
    }

    /// Every VM matching `pred`, in creation order.
    pub fn vms_where(&self, pred: impl Fn(&VmRecord) -> bool) -> Vec<VmRecord> {
        let state = self.state.lock().unwrap();
        state.vms.values().filter(|vm| pred(vm)).cloned().collect()
    }

    pub fn update_vm(&self, vm: &ObjRef, f: impl FnOnce(&mut VmRecord)) {
        let mut state = self.state.lock().unwrap();
        f(state.vms.get_mut(vm).unwrap());
    }

    pub fn update_vdi(&self, vdi: &ObjRef, f: impl FnOnce(&mut VdiRecord)) {
        let mut state = self.state.lock().unwrap();
        f(state.vdis.get_mut(vdi).unwrap());
    }

    /// Make every call to `op` fail until [`MemoryHypervisor::heal`].
    pub fn fail(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().unwrap().failing.remove(op);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: &str) -> usize {
        let prefix = format!("{op} ");
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Every recorded call, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl Hypervisor for MemoryHypervisor {
    fn vm_record(&self, vm: &ObjRef) -> Result<VmRecord> {
        let state = self.state.lock().unwrap();
        state
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))
    }

    fn vdi_record(&self, vdi: &ObjRef) -> Result<VdiRecord> {
        let state = self.state.lock().unwrap();
        state
            .vdis
            .get(vdi)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(vdi.to_string()))
    }

    fn sr_record(&self, sr: &ObjRef) -> Result<SrRecord> {
        let state = self.state.lock().unwrap();
        state
            .srs
            .get(sr)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(sr.to_string()))
    }

    fn sr_by_uuid(&self, uuid: &str) -> Result<SrRecord> {
        let state = self.state.lock().unwrap();
        state
            .srs
            .values()
            .find(|sr| sr.uuid == uuid)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(format!("SR {uuid}")))
    }

    fn all_vms(&self) -> Result<Vec<VmRecord>> {
        Ok(self.state.lock().unwrap().vms.values().cloned().collect())
    }

    fn other_config(&self, obj: &ObjRef) -> Result<OtherConfig> {
        let state = self.state.lock().unwrap();
        if let Some(vm) = state.vms.get(obj) {
            return Ok(vm.other_config.clone());
        }
        state
            .vdis
            .get(obj)
            .map(|vdi| vdi.other_config.clone())
            .ok_or_else(|| VmrepError::ObjectNotFound(obj.to_string()))
    }

    fn update_other_config(&self, obj: &ObjRef, changes: &[ConfigChange<'_>]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("update_other_config", obj)?;
        if let Some(vm) = state.vms.get_mut(obj) {
            apply(&mut vm.other_config, changes);
            return Ok(());
        }
        let vdi = state
            .vdis
            .get_mut(obj)
            .ok_or_else(|| VmrepError::ObjectNotFound(obj.to_string()))?;
        apply(&mut vdi.other_config, changes);
        Ok(())
    }

    fn vm_disks(&self, vm: &ObjRef) -> Result<Vec<ObjRef>> {
        let state = self.state.lock().unwrap();
        state
            .vm_disks
            .get(vm)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))
    }

    fn vm_snapshots(&self, vm: &ObjRef) -> Result<Vec<ObjRef>> {
        let state = self.state.lock().unwrap();
        if !state.vms.contains_key(vm) {
            return Err(VmrepError::ObjectNotFound(vm.to_string()));
        }
        Ok(state
            .vms
            .values()
            .filter(|s| s.snapshot_of.as_ref() == Some(vm))
            .map(|s| s.obj_ref.clone())
            .collect())
    }

    fn destroy_vm(&self, vm: &ObjRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("destroy_vm", vm)?;
        state.destroy_vm(vm)
    }

    fn destroy_vdi(&self, vdi: &ObjRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("destroy_vdi", vdi)?;
        state
            .vdis
            .remove(vdi)
            .map(|_| ())
            .ok_or_else(|| VmrepError::ObjectNotFound(vdi.to_string()))
    }

    fn snapshot_vm(&self, vm: &ObjRef, name_label: &str, checkpoint: bool) -> Result<ObjRef> {
        let mut state = self.state.lock().unwrap();
        state.check(if checkpoint { "checkpoint" } else { "snapshot" }, vm)?;
        state.check("snapshot_vm", vm)?;
        let source = state
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))?;

        let mut disks = Vec::new();
        for disk_ref in state.vm_disks[vm].clone() {
            let disk = state.vdis[&disk_ref].clone();
            let snapshot = state.new_vdi(&VdiRecord {
                is_a_snapshot: true,
                snapshot_of: Some(disk_ref.clone()),
                ..disk
            });
            if let Some(disk) = state.vdis.get_mut(&disk_ref) {
                disk.snapshots.push(snapshot.obj_ref.clone());
            }
            disks.push(snapshot.obj_ref);
        }

        let snapshot = state.new_vm(
            &VmRecord {
                name_label: name_label.to_string(),
                power_state: if checkpoint {
                    PowerState::Suspended
                } else {
                    PowerState::Halted
                },
                is_a_snapshot: true,
                snapshot_of: Some(vm.clone()),
                ..source
            },
            disks,
        );
        state.vm_mut(vm)?.snapshots.push(snapshot.obj_ref.clone());
        Ok(snapshot.obj_ref)
    }

    fn assert_healthy_vdi_chains(&self, vm: &ObjRef) -> Result<()> {
        self.state.lock().unwrap().check("assert_healthy_vdi_chains", vm)
    }

    fn clean_shutdown(&self, vm: &ObjRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("clean_shutdown", vm)?;
        let record = state.vm_mut(vm)?;
        if record.power_state != PowerState::Running {
            return Err(VmrepError::Hypervisor("VM_BAD_POWER_STATE".into()));
        }
        record.power_state = PowerState::Halted;
        Ok(())
    }

    fn start(&self, vm: &ObjRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("start", vm)?;
        let record = state.vm_mut(vm)?;
        if record.is_blocked(OP_START) {
            return Err(VmrepError::Hypervisor("OPERATION_BLOCKED".into()));
        }
        if record.power_state != PowerState::Halted {
            return Err(VmrepError::Hypervisor("VM_BAD_POWER_STATE".into()));
        }
        record.power_state = PowerState::Running;
        Ok(())
    }

    fn update_blocked_operations(&self, vm: &ObjRef, changes: &[ConfigChange<'_>]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("update_blocked_operations", vm)?;
        apply(&mut state.vm_mut(vm)?.blocked_operations, changes);
        Ok(())
    }

    fn set_ha_restart_priority(&self, vm: &ObjRef, priority: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("set_ha_restart_priority", vm)?;
        state.vm_mut(vm)?.ha_restart_priority = priority.to_string();
        Ok(())
    }

    fn set_name_label(&self, vm: &ObjRef, name_label: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("set_name_label", vm)?;
        state.vm_mut(vm)?.name_label = name_label.to_string();
        Ok(())
    }

    fn add_tag(&self, vm: &ObjRef, tag: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.check("add_tag", vm)?;
        let record = state.vm_mut(vm)?;
        if !record.has_tag(tag) {
            record.tags.push(tag.to_string());
        }
        Ok(())
    }

    fn copy_vm(&self, vm: &ObjRef, sr: &ObjRef, name_label: &str) -> Result<ObjRef> {
        let mut state = self.state.lock().unwrap();
        state.check("copy_vm", vm)?;
        let source = state
            .vms
            .get(vm)
            .cloned()
            .ok_or_else(|| VmrepError::ObjectNotFound(vm.to_string()))?;
        let mut disks = Vec::new();
        for disk_ref in state.vm_disks[vm].clone() {
            let disk = state.vdis[&disk_ref].clone();
            let copy = state.new_vdi(&VdiRecord {
                sr: sr.clone(),
                is_a_snapshot: false,
                snapshot_of: None,
                ..disk
            });
            disks.push(copy.obj_ref);
        }
        let copy = state.new_vm(
            &VmRecord {
                name_label: name_label.to_string(),
                power_state: PowerState::Halted,
                is_a_snapshot: false,
                snapshot_of: None,
                ..source
            },
            disks,
        );
        Ok(copy.obj_ref)
    }
}

#[derive(Default)]
struct MoverState {
    failing: bool,
    imports: Vec<IncrementalExport>,
    writes: Vec<(String, IncrementalExport)>,
    restores: usize,
    merges: Vec<(String, String)>,
}

/// Data mover materialising imports in a [`MemoryHypervisor`] and writing
/// one small object per disk to remotes.
pub struct MemoryDataMover {
    hv: Arc<MemoryHypervisor>,
    state: Mutex<MoverState>,
}

impl MemoryDataMover {
    pub fn new(hv: Arc<MemoryHypervisor>) -> Self {
        Self {
            hv,
            state: Mutex::new(MoverState::default()),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Every export handed to `import_incremental`, in order.
    pub fn imports(&self) -> Vec<IncrementalExport> {
        self.state.lock().unwrap().imports.clone()
    }

    /// Every export handed to `write_backup`, with its data directory.
    pub fn writes(&self) -> Vec<(String, IncrementalExport)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn restores(&self) -> usize {
        self.state.lock().unwrap().restores
    }

    /// Data directories of every `(parent, child)` pair handed to `merge_backups`.
    pub fn merges(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().merges.clone()
    }

    fn check(&self) -> Result<()> {
        if self.state.lock().unwrap().failing {
            return Err(VmrepError::TransientInfra("transfer interrupted".into()));
        }
        Ok(())
    }
}

pub fn disk_data_key(dir: &str, vdi_uuid: &str) -> String {
    format!("{dir}/{vdi_uuid}.vhd")
}

impl DataMover for MemoryDataMover {
    fn import_incremental(&self, export: &IncrementalExport, sr: &SrRecord) -> Result<ObjRef> {
        self.state.lock().unwrap().imports.push(export.clone());
        self.check()?;
        let vdis: Vec<&ExportedVdi> = export.vdis.values().collect();
        self.hv.state.lock().unwrap().import(&export.vm, &vdis, sr)
    }

    fn write_backup(
        &self,
        export: &IncrementalExport,
        storage: &dyn StorageBackend,
        dir: &str,
    ) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .writes
            .push((dir.to_string(), export.clone()));
        self.check()?;
        for vdi in export.vdis.values() {
            storage.put(&disk_data_key(dir, &vdi.uuid), vdi.uuid.as_bytes())?;
        }
        Ok(export.total_size())
    }

    fn merge_backups(
        &self,
        storage: &dyn StorageBackend,
        parent: &BackupMetadata,
        child: &BackupMetadata,
    ) -> Result<u64> {
        self.state
            .lock()
            .unwrap()
            .merges
            .push((parent.data_dir.clone(), child.data_dir.clone()));
        self.check()?;
        let mut size = child.size;
        for vdi in child.vdis.values() {
            let Some(folded) = vdi.base_uuid.as_deref().and_then(|b| parent.vdis.get(b)) else {
                continue;
            };
            let key = disk_data_key(&child.data_dir, &vdi.uuid);
            let mut data = storage
                .get(&disk_data_key(&parent.data_dir, &folded.uuid))?
                .unwrap_or_default();
            data.extend(storage.get(&key)?.unwrap_or_default());
            storage.put(&key, &data)?;
            size += folded.virtual_size;
        }
        Ok(size)
    }

    fn import_backup(
        &self,
        metadata: &BackupMetadata,
        storage: &dyn StorageBackend,
        sr: &SrRecord,
    ) -> Result<ObjRef> {
        self.state.lock().unwrap().restores += 1;
        self.check()?;
        // Every disk must resolve down to a full export.
        let backups = list_vm_backups(storage, &metadata.vm_uuid)?;
        for vdi in metadata.vdis.values() {
            let mut disk: &ExportedVdi = vdi;
            let mut dir = metadata.data_dir.as_str();
            loop {
                if !storage.exists(&disk_data_key(dir, &disk.uuid))? {
                    return Err(VmrepError::ObjectNotFound(format!("data of disk {}", disk.uuid)));
                }
                let Some(base) = disk.base_uuid.as_deref() else {
                    break;
                };
                let (_, parent) = backups
                    .iter()
                    .find(|(_, b)| b.vdis.contains_key(base))
                    .ok_or_else(|| {
                        VmrepError::ObjectNotFound(format!("base {base} of disk {}", disk.uuid))
                    })?;
                disk = &parent.vdis[base];
                dir = &parent.data_dir;
            }
        }
        let vdis: Vec<&ExportedVdi> = metadata.vdis.values().collect();
        self.hv.state.lock().unwrap().import(&metadata.vm, &vdis, sr)
    }
}

/// In-memory storage backend for testing. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
    failing_prefix: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` under `prefix` fail, or none with `None`.
    pub fn fail_puts_under(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if let Some(prefix) = self.failing_prefix.lock().unwrap().as_deref() {
            if key.starts_with(prefix) {
                return Err(VmrepError::TransientInfra(format!("remote unavailable: {key}")));
            }
        }
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
