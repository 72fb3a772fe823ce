//! Structured error kinds surfaced by the supervision engine.

use thiserror::Error;

/// Error kinds the core raises. Individual operation failures never unwind
/// past the Supervisor's serialization point; they are returned here and
/// logged by the caller.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("program `{name}` is invalid: {message}")]
    ConfigInvalid { name: String, message: String },

    #[error("unknown program `{name}`")]
    UnknownProgram { name: String },

    #[error("failed to spawn program `{program}` instance {index}: {source}")]
    SpawnFailed {
        program: String,
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid} for program `{program}` instance {index}")]
    SignalFailed {
        program: String,
        index: usize,
        pid: u32,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
