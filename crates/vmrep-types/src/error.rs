use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmrepError>;

#[derive(Debug, Error)]
pub enum VmrepError {
    /// The run must not start: nothing has been mutated yet.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// An incremental export declares a base that cannot be found on the target.
    #[error("metadata inconsistency: {0}")]
    MetadataInconsistency(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure of a best-effort cleanup step. Logged by callers, never escalated.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("{step} failed: {source}")]
    FatalRun {
        step: String,
        #[source]
        source: Box<VmrepError>,
    },

    #[error("all targets have failed, step: {step} ({})", .errors.join("; "))]
    AllTargetsFailed { step: String, errors: Vec<String> },

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote is locked by another process (lock: {0})")]
    Locked(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl VmrepError {
    /// Demote the failure of a best-effort step, which is logged and never
    /// escalated.
    pub fn transient(action: impl std::fmt::Display, source: VmrepError) -> Self {
        VmrepError::TransientInfra(format!("{action}: {source}"))
    }

    /// Wrap an error raised by a step whose failure aborts the whole run.
    pub fn fatal(step: impl Into<String>, source: VmrepError) -> Self {
        VmrepError::FatalRun {
            step: step.into(),
            source: Box::new(source),
        }
    }
}
