//! Bulk data transfer. The codec that streams disk contents is external; this
//! trait is the seam writers call into.

use crate::error::Result;
use crate::export::IncrementalExport;
use crate::hypervisor::SrRecord;
use crate::storage::StorageBackend;
use crate::writer::remote::BackupMetadata;
use vmrep_types::ObjRef;

pub trait DataMover: Send + Sync {
    /// Materialise `export` as a new VM on `sr`. Disks carrying a `base_vdi`
    /// are applied as deltas on top of it. The new VM receives the
    /// `other_config`, `blocked_operations` and tags of the export.
    fn import_incremental(&self, export: &IncrementalExport, sr: &SrRecord) -> Result<ObjRef>;

    /// Write the disk contents of `export` under `dir` on a remote.
    /// Returns the number of bytes written.
    fn write_backup(
        &self,
        export: &IncrementalExport,
        storage: &dyn StorageBackend,
        dir: &str,
    ) -> Result<u64>;

    /// Fold the disk data of `parent` into `child`, whose disks are deltas
    /// of it, so `child` no longer needs `parent`. Returns the size of the
    /// merged backup. Called again with the same pair after an interrupted
    /// merge, so it must tolerate data that is already merged.
    fn merge_backups(
        &self,
        storage: &dyn StorageBackend,
        parent: &BackupMetadata,
        child: &BackupMetadata,
    ) -> Result<u64>;

    /// Restore a backup previously written with [`DataMover::write_backup`],
    /// following its delta chain, as a new VM on `sr`.
    fn import_backup(
        &self,
        metadata: &BackupMetadata,
        storage: &dyn StorageBackend,
        sr: &SrRecord,
    ) -> Result<ObjRef>;
}
