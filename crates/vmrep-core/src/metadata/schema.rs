//! Tag keys persisted in the `other_config` map of VMs and VDIs.
//!
//! These strings are read back by every later run, possibly by other
//! versions of this crate: never change an existing value.

/// Bumped when the meaning of an existing key changes.
pub const SCHEMA_VERSION: u32 = 1;

/// On an incrementally replicated VM or VDI: uuid of the object used as the
/// base of the incremental export.
pub const BASE_DELTA: &str = "xo:base_delta";

/// On a replicated VM: uuid of the SR it was replicated to. Written only once
/// the replication completed.
pub const REPLICATED_TO_SR_UUID: &str = "xo:backup:sr";

/// On VMs and VDIs of a replica: uuid of the exported source object
/// (snapshot or VM).
pub const COPY_OF: &str = "xo:copy_of";

pub const DATETIME: &str = "xo:backup:datetime";

pub const JOB_ID: &str = "xo:backup:job";

pub const SCHEDULE_ID: &str = "xo:backup:schedule";

pub const DELTA_CHAIN_LENGTH: &str = "xo:backup:deltaChainLength";

pub const EXPORTED_SUCCESSFULLY: &str = "xo:backup:exported";

/// Uuid of the backed up VM itself, not of its snapshot.
pub const VM_UUID: &str = "xo:backup:vm";

/// Keys identifying the job run that produced an object.
pub(crate) const IDENTITY_KEYS: [&str; 6] = [
    DATETIME,
    DELTA_CHAIN_LENGTH,
    EXPORTED_SUCCESSFULLY,
    JOB_ID,
    SCHEDULE_ID,
    VM_UUID,
];

/// `strftime` format of [`DATETIME`] values. Sorts lexicographically.
pub const DATETIME_FORMAT: &str = "%Y%m%dT%H:%M:%SZ";
