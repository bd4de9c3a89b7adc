use std::collections::HashSet;
use std::path::Path;

use super::types::JobConfig;
use crate::error::{Result, VmrepError};

/// Load and validate a job configuration file.
pub fn load_job_config(path: &Path) -> Result<JobConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| VmrepError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_job_config(&contents)
        .map_err(|e| VmrepError::Config(format!("invalid config '{}': {e}", path.display())))
}

/// Parse and validate a job configuration from YAML text.
pub fn parse_job_config(contents: &str) -> Result<JobConfig> {
    let config: JobConfig =
        serde_yaml::from_str(contents).map_err(|e| VmrepError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &JobConfig) -> Result<()> {
    if config.job.id.trim().is_empty() {
        return Err(VmrepError::Config("job.id must not be empty".into()));
    }

    let mut seen = HashSet::new();
    for schedule in &config.schedules {
        if schedule.id.trim().is_empty() {
            return Err(VmrepError::Config("schedule id must not be empty".into()));
        }
        if !seen.insert(schedule.id.as_str()) {
            return Err(VmrepError::Config(format!(
                "duplicate schedule id '{}'",
                schedule.id
            )));
        }
    }

    for remote in &config.remotes {
        if remote.id.trim().is_empty() || remote.url.trim().is_empty() {
            return Err(VmrepError::Config(
                "remotes need both an id and a url".into(),
            ));
        }
    }

    // Every place where a schedule's settings can end up.
    let mut scopes = vec![config.settings.clone()];
    for schedule in &config.schedules {
        scopes.push(config.settings_for(&[schedule.id.as_str()]));
    }
    for settings in scopes {
        if settings.offline_backup() && settings.snapshot_retention() != 0 {
            return Err(VmrepError::Config(
                "offline_backup is not compatible with snapshot_retention".into(),
            ));
        }
    }

    Ok(())
}
