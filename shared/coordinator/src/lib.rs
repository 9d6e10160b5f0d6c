mod error;
mod grid;
mod params;
mod pool;
mod solve;
mod timing;

pub use error::SolveError;
pub use grid::auto_grid;
pub use params::{GridSpec, SolveParams};
pub use pool::{PoolBackend, WorkerPool};
pub use solve::{solve_z, Coordinator, Solution, SolveStats};
pub use timing::CostPoint;

pub use tessella_core::{DebugChecks, SetupError, Strategy};
pub use tessella_network::TerminationReason;
