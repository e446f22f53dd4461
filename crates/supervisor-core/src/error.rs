/// Error kinds from spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] supervisor_config::ConfigError),

    #[error("no such program {0:?}")]
    NotFound(String),

    #[error("no such replica {index} in program {program:?}")]
    ReplicaNotFound { program: String, index: u32 },

    #[error("failed to spawn {program:?}: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program:?} replica {index} did not stop within its stop_timeout, force-killed")]
    StopTimeout { program: String, index: u32 },

    #[error("tick failed for program {program:?}: {reason}")]
    TickError { program: String, reason: String },
}
