/// Errors from launching or signalling the managed encoder process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all
    #[error("failed to spawn encoder: {0}")]
    SpawnFailed(String),
    /// The launcher did not confirm a start within the spawn timeout
    #[error("encoder did not confirm start within {0}s")]
    SpawnTimeout(u64),
    /// Signal delivery failed
    #[error("failed to signal encoder: {0}")]
    SignalFailed(String),
    /// The process has already exited
    #[error("encoder process has exited")]
    ProcessExited,
}

/// Rejections returned to control-plane callers.
///
/// Run-time failures of the encoder (spawn errors, crashes) are never
/// reported here; they are recovered by the supervisor and only show up in
/// the status record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("encoder is already running")]
    AlreadyRunning,

    #[error("another control command is in progress")]
    Busy,

    #[error("upstream relay is not available; waiting for it to come up")]
    DependencyUnavailable,

    #[error(transparent)]
    ConfigInvalid(#[from] ConfigError),

    #[error("supervisor is gone")]
    SupervisorGone,
}

/// A rejected configuration update. The previous configuration is kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("failed to persist configuration: {0}")]
    Persist(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure to write the status record. Always logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("status encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
