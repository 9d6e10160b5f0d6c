mod error;
mod runtime;
mod sequential;
mod strategy;
mod tile;

pub use error::WorkerError;
pub use runtime::run_worker;
pub use sequential::{solve_sequential, SequentialOutcome};
pub use strategy::{Candidate, Picker};
pub use tile::Tile;
