pub(super) fn default_snapshot_retention() -> usize {
    0
}

pub(super) fn default_export_retention() -> usize {
    0
}

pub(super) fn default_copy_retention() -> usize {
    0
}

/// 0 disables forced full transfers.
pub(super) fn default_full_interval() -> u32 {
    0
}

pub(super) fn default_health_check_timeout_secs() -> u64 {
    600
}

pub(super) fn default_job_mode() -> super::JobMode {
    super::JobMode::Delta
}
