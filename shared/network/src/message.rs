use serde::{Deserialize, Serialize};

use tessella_core::{SolveConfig, WireTensor};

/// Everything a worker needs to start one solve: its place in the worker
/// grid, the shared dictionary constants and its slice of the signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInit {
    pub rank: u32,
    pub world: u32,
    /// Workers per axis of the activation grid.
    pub worker_grid: Vec<u32>,
    /// Global activation shape (without the atom axis).
    pub valid_shape: Vec<u32>,
    pub reg: f64,
    pub config: SolveConfig,
    /// Dictionary, shape (K, C, a₁, …).
    pub dictionary: WireTensor,
    /// Dictionary cross-correlation, shape (K, K, 2a₁−1, …).
    pub dtd: WireTensor,
    /// Squared atom norms.
    pub norms: Vec<f64>,
    /// Signal slice covering the worker's extended tile plus atom support.
    pub x_tile: WireTensor,
    /// Warm-start activations over the extended tile, if any.
    pub z0_tile: Option<WireTensor>,
}

/// One accepted coordinate update crossing a tile boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorderUpdate {
    pub atom: u32,
    /// Global coordinates of the updated activation.
    pub pos: Vec<i32>,
    pub dz: f64,
}

/// A rectangular block of per-atom values, addressed in global coordinates.
/// Used for the warm gradient exchange at startup and the final activation
/// border exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strip {
    /// Global (start, end) per axis.
    pub bounds: Vec<(u32, u32)>,
    /// Values, shape (K, extent₁, …).
    pub values: WireTensor,
}

/// Progress report a worker sends whenever it pauses, resumes, or applies
/// border traffic while paused. Quiescence is declared from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub paused: bool,
    /// Border updates sent so far.
    pub sent: u64,
    /// Border updates received and applied so far.
    pub received: u64,
    pub iterations: u64,
}

/// Why a worker stopped updating coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    Converged,
    MaxIter,
    Timeout,
}

/// One accepted update, recorded when timing is on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Seconds since the worker started solving.
    pub t: f64,
    pub iteration: u64,
    pub rank: u32,
    pub atom: u32,
    pub pos: Vec<u32>,
    pub dz: f64,
}

/// End-of-solve statistics for one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub rank: u32,
    pub n_updates: u64,
    pub iterations: u64,
    /// Seconds spent in the solve loop.
    pub runtime: f64,
    /// Seconds spent initializing the tile.
    pub t_init: f64,
    pub n_reactivations: u32,
    pub reason: TerminationReason,
    /// Non-zero count per atom over the worker's inner tile.
    pub z_nnz: Vec<u64>,
    /// Per-update log, empty unless timing was requested.
    pub updates: Vec<UpdateRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub rank: u32,
    pub message: String,
}

/// The full tag space of the solver protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Root → worker: start a solve.
    TaskInit(Box<TaskInit>),
    /// Worker → neighbor: incremental gradient correction.
    BorderUpdate(BorderUpdate),
    /// Worker → neighbor: warm gradient values at startup.
    BetaStrip(Strip),
    /// Worker → neighbor: final activation borders (sufficient statistics).
    ZStrip(Strip),
    /// Worker → root: pause/resume + message accounting.
    Status(WorkerStatus),
    /// Root → worker: stop updating and report results.
    Terminate,
    /// Worker → root: reached a named barrier.
    BarrierReady(u32),
    /// Root → worker: barrier released.
    BarrierRelease(u32),
    /// Worker → root: first and last element of the received signal tile.
    EdgeEcho { first: f64, last: f64 },
    /// Worker → root: warm gradient value at the shared probe point.
    BetaProbe(f64),
    /// Worker → root: the inner activation tile.
    ResultZ(WireTensor),
    /// Worker → root: summand of the activation autocorrelation.
    ReduceZtz(WireTensor),
    /// Worker → root: summand of the activation/signal correlation.
    ReduceZtx(WireTensor),
    /// Worker → root: end-of-solve statistics.
    ResultStats(Box<WorkerReport>),
    /// Worker → root: unrecoverable worker error.
    Failure(WorkerFailure),
    /// Root → worker: leave the pool.
    Shutdown,
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TaskInit(_) => "task_init",
            Message::BorderUpdate(_) => "border_update",
            Message::BetaStrip(_) => "beta_strip",
            Message::ZStrip(_) => "z_strip",
            Message::Status(_) => "status",
            Message::Terminate => "terminate",
            Message::BarrierReady(_) => "barrier_ready",
            Message::BarrierRelease(_) => "barrier_release",
            Message::EdgeEcho { .. } => "edge_echo",
            Message::BetaProbe(_) => "beta_probe",
            Message::ResultZ(_) => "result_z",
            Message::ReduceZtz(_) => "reduce_ztz",
            Message::ReduceZtx(_) => "reduce_ztx",
            Message::ResultStats(_) => "result_stats",
            Message::Failure(_) => "failure",
            Message::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Wire;

    #[test]
    fn test_border_update_round_trip() {
        let msg = Message::BorderUpdate(BorderUpdate {
            atom: 3,
            pos: vec![17, 2],
            dz: -0.25,
        });
        let bytes = msg.to_bytes();
        let back = Message::from_bytes(&bytes).unwrap();
        match back {
            Message::BorderUpdate(u) => {
                assert_eq!(u.atom, 3);
                assert_eq!(u.pos, vec![17, 2]);
                assert_eq!(u.dz, -0.25);
            }
            other => panic!("decoded {other:?}"),
        }
    }
}
