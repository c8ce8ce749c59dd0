//! Error taxonomy for the map-reduce engine.
//!
//! Distinguishes kernel failure, worker crash, spill I/O failure, and
//! protocol violation. All four are fatal to the job they occur in; none
//! are retried. Caller abandonment is deliberately *not* a variant here —
//! it is not an error, just a teardown path (see
//! [`crate::pool::WorkerPool::teardown`]).

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can terminate a map-reduce job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A kernel invocation panicked inside a worker thread.
    #[error("kernel panicked in worker {worker}: {message}")]
    KernelFailure { worker: usize, message: String },

    /// A worker thread terminated without completing its mapping pass
    /// (fewer than N `Done` markers were observed for a stage).
    #[error("worker {worker} crashed before acknowledging end-of-input")]
    WorkerCrash { worker: usize },

    /// A read or write against a [`crate::spill::SpillStore`] failed.
    #[error("spill store I/O failed on {path}: {source}")]
    SpillIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized or deserialized through the spill codec.
    #[error("spill codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The channel protocol received a payload it should never see. This
    /// indicates an implementation bug, not a runtime condition callers can
    /// trigger.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Convenience alias for engine-internal results.
pub type EngineResult<T> = Result<T, EngineError>;
