use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vmrep_types::ObjRef;

/// Key/value metadata map attached to every VM and VDI.
pub type OtherConfig = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Paused,
    Running,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    #[serde(rename = "$ref")]
    pub obj_ref: ObjRef,
    pub uuid: String,
    pub name_label: String,
    pub power_state: PowerState,
    pub is_a_snapshot: bool,
    pub is_a_template: bool,
    /// Source VM when this record is a snapshot.
    pub snapshot_of: Option<ObjRef>,
    pub other_config: OtherConfig,
    /// Operation name → reason. Presence of a key means the operation is blocked.
    pub blocked_operations: BTreeMap<String, String>,
    /// Task reference → operation name.
    pub current_operations: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub ha_restart_priority: String,
    pub snapshots: Vec<ObjRef>,
}

impl VmRecord {
    pub fn is_blocked(&self, operation: &str) -> bool {
        self.blocked_operations.contains_key(operation)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdiRecord {
    #[serde(rename = "$ref")]
    pub obj_ref: ObjRef,
    pub uuid: String,
    pub name_label: String,
    pub sr: ObjRef,
    pub virtual_size: u64,
    pub is_a_snapshot: bool,
    /// Source VDI when this record is a snapshot.
    pub snapshot_of: Option<ObjRef>,
    pub snapshots: Vec<ObjRef>,
    pub other_config: OtherConfig,
}

impl VdiRecord {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrRecord {
    #[serde(rename = "$ref")]
    pub obj_ref: ObjRef,
    pub uuid: String,
    pub name_label: String,
}
