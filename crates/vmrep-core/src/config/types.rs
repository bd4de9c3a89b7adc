use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{Result, VmrepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Every transfer is a full export.
    Full,
    /// Transfers are incremental against the last exported snapshot.
    Delta,
}

/// Tunables of a job. Every field is optional so that a partial `Settings`
/// can override another one field by field, see [`Settings::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Number of job snapshots kept on the VM.
    pub snapshot_retention: Option<usize>,
    /// Number of backups kept on a remote. 0 disables the remote.
    pub export_retention: Option<usize>,
    /// Number of replicas kept on an SR. 0 disables the SR.
    pub copy_retention: Option<usize>,
    /// Force a full transfer once the delta chain reaches this length.
    pub full_interval: Option<u32>,
    /// Delete expired copies before transferring instead of after.
    pub delete_first: Option<bool>,
    /// Shut the VM down for the whole run.
    pub offline_backup: Option<bool>,
    /// Shut the VM down while the snapshot is taken.
    pub offline_snapshot: Option<bool>,
    /// Snapshot with memory.
    pub checkpoint_snapshot: Option<bool>,
    pub unconditional_snapshot: Option<bool>,
    pub bypass_vdi_chains_check: Option<bool>,
    /// The replica is meant to become the live VM: leave it startable.
    pub warm_migration: Option<bool>,
    /// Only health check VMs carrying one of these tags (all VMs when empty).
    pub health_check_vms_with_tags: Option<Vec<String>>,
    pub health_check_timeout_secs: Option<u64>,
}

macro_rules! merge_fields {
    ($base:expr, $over:expr, $($field:ident),+ $(,)?) => {
        Settings {
            $($field: $over.$field.clone().or_else(|| $base.$field.clone()),)+
        }
    };
}

impl Settings {
    /// Return a copy of `self` where every field set in `overrides` wins.
    pub fn merge(&self, overrides: &Settings) -> Settings {
        merge_fields!(
            self,
            overrides,
            snapshot_retention,
            export_retention,
            copy_retention,
            full_interval,
            delete_first,
            offline_backup,
            offline_snapshot,
            checkpoint_snapshot,
            unconditional_snapshot,
            bypass_vdi_chains_check,
            warm_migration,
            health_check_vms_with_tags,
            health_check_timeout_secs,
        )
    }

    pub fn snapshot_retention(&self) -> usize {
        self.snapshot_retention
            .unwrap_or_else(default_snapshot_retention)
    }

    pub fn export_retention(&self) -> usize {
        self.export_retention.unwrap_or_else(default_export_retention)
    }

    pub fn copy_retention(&self) -> usize {
        self.copy_retention.unwrap_or_else(default_copy_retention)
    }

    pub fn full_interval(&self) -> u32 {
        self.full_interval.unwrap_or_else(default_full_interval)
    }

    pub fn delete_first(&self) -> bool {
        self.delete_first.unwrap_or(false)
    }

    pub fn offline_backup(&self) -> bool {
        self.offline_backup.unwrap_or(false)
    }

    pub fn offline_snapshot(&self) -> bool {
        self.offline_snapshot.unwrap_or(false)
    }

    pub fn checkpoint_snapshot(&self) -> bool {
        self.checkpoint_snapshot.unwrap_or(false)
    }

    pub fn unconditional_snapshot(&self) -> bool {
        self.unconditional_snapshot.unwrap_or(false)
    }

    pub fn bypass_vdi_chains_check(&self) -> bool {
        self.bypass_vdi_chains_check.unwrap_or(false)
    }

    pub fn warm_migration(&self) -> bool {
        self.warm_migration.unwrap_or(false)
    }

    pub fn health_check_vms_with_tags(&self) -> &[String] {
        self.health_check_vms_with_tags.as_deref().unwrap_or(&[])
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(
            self.health_check_timeout_secs
                .unwrap_or_else(default_health_check_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_job_mode")]
    pub mode: JobMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub id: String,
    /// Bare path or `file://` URL.
    pub url: String,
}

/// A backup job as stored by the job configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job: JobDefinition,
    /// Job-level defaults.
    #[serde(default)]
    pub settings: Settings,
    /// Per schedule id, remote id, SR uuid or VM uuid overrides.
    #[serde(default)]
    pub overrides: BTreeMap<String, Settings>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    /// Uuids of the SRs to replicate to.
    #[serde(default)]
    pub srs: Vec<String>,
    #[serde(default)]
    pub health_check_sr: Option<String>,
}

impl JobConfig {
    pub fn schedule(&self, id: &str) -> Result<&ScheduleConfig> {
        self.schedules
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| VmrepError::Config(format!("unknown schedule '{id}'")))
    }

    /// Job defaults overridden, in order, by the entries for each of `ids`.
    pub fn settings_for(&self, ids: &[&str]) -> Settings {
        ids.iter().fold(self.settings.clone(), |acc, id| {
            match self.overrides.get(*id) {
                Some(overrides) => acc.merge(overrides),
                None => acc,
            }
        })
    }

    /// `base` overridden by the entry for a single id.
    pub fn with_override(&self, base: &Settings, id: &str) -> Settings {
        match self.overrides.get(id) {
            Some(overrides) => base.merge(overrides),
            None => base.clone(),
        }
    }
}
