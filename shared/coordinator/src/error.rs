use thiserror::Error;

use tessella_core::SetupError;
use tessella_network::FabricError;
use tessella_worker::WorkerError;

#[derive(Debug, Error)]
pub enum SolveError {
    /// Invalid problem or configuration, caught before any worker runs.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Transport failure; the worker pool is torn down.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// A worker aborted its solve and forwarded the reason.
    #[error("worker {rank} failed: {message}")]
    Worker { rank: u32, message: String },

    /// Spawning a worker thread or process failed.
    #[error("spawning workers: {0}")]
    Spawn(#[source] std::io::Error),

    /// A scattered payload came back corrupted.
    #[error("transport integrity: {0}")]
    Integrity(String),

    #[error("runtime: {0}")]
    Runtime(String),
}

impl From<WorkerError> for SolveError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Setup(e) => SolveError::Setup(e),
            WorkerError::Fabric(e) => SolveError::Fabric(e),
            other => SolveError::Worker {
                rank: 0,
                message: other.to_string(),
            },
        }
    }
}
