use thiserror::Error;

use tessella_core::SetupError;
use tessella_network::FabricError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error("consistency check failed: {0}")]
    DebugCheck(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
