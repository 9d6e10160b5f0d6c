use std::ops::Range;
use std::time::{Duration, Instant};

use ndarray::{ArrayD, IxDyn};
use tracing::{debug, info, warn};

use tessella_core::{
    atom_norms, cross_correlate, flat_index, for_each_point, valid_shape, Segmentation,
    SetupError, WireTensor,
};
use tessella_network::{
    Fabric, Mailbox, Message, TaskInit, TerminationReason, WorkerReport, WorkerStatus,
};
use tessella_worker::solve_sequential;

use crate::error::SolveError;
use crate::params::SolveParams;
use crate::pool::{PoolBackend, WorkerPool};
use crate::timing::{reconstruct_cost, CostPoint};

const BARRIER_INIT: u32 = 0;
const BARRIER_DONE: u32 = 1;

/// How long the gather phase waits for any single result after
/// termination was broadcast.
const GATHER_GRACE: Duration = Duration::from_secs(120);

/// Result of one activation solve.
#[derive(Debug)]
pub struct Solution {
    pub z: ArrayD<f64>,
    /// Activation autocorrelation, when requested.
    pub ztz: Option<ArrayD<f64>>,
    /// Activation/signal correlation, when requested.
    pub ztx: Option<ArrayD<f64>>,
    /// Reconstructed objective trajectory, when timing was requested.
    pub cost_log: Option<Vec<CostPoint>>,
    pub stats: SolveStats,
}

/// Aggregated and per-worker solve statistics.
#[derive(Debug, Clone)]
pub struct SolveStats {
    pub n_updates: u64,
    pub iterations: u64,
    /// Slowest worker's solve-loop time, seconds.
    pub runtime: f64,
    /// Slowest worker's initialization time, seconds.
    pub t_init: f64,
    /// Non-zero count per atom in the returned activations.
    pub z_nnz: Vec<u64>,
    pub reason: TerminationReason,
    pub workers: Vec<WorkerReport>,
}

/// Root of a distributed solve: owns the reusable worker pool, scatters
/// problems, detects quiescence and stitches results back together.
pub struct Coordinator {
    params: SolveParams,
    backend: PoolBackend,
    runtime: tokio::runtime::Runtime,
    pool: Option<WorkerPool>,
}

/// One-shot convenience around [`Coordinator`]; the pool it spawns lives
/// for this call only.
pub fn solve_z(
    x: &ArrayD<f64>,
    d: &ArrayD<f64>,
    reg: f64,
    z0: Option<&ArrayD<f64>>,
    params: &SolveParams,
) -> Result<Solution, SolveError> {
    Coordinator::new(params.clone())?.solve_z(x, d, reg, z0)
}

impl Coordinator {
    pub fn new(params: SolveParams) -> Result<Self, SolveError> {
        let backend = match &params.hostfile {
            Some(hostfile) => PoolBackend::Processes {
                worker_bin: std::env::var_os("TESSELLA_WORKER_BIN")
                    .map(Into::into)
                    .unwrap_or_else(|| "tessella-workerd".into()),
                hostfile: Some(hostfile.clone()),
            },
            None => PoolBackend::Threads,
        };
        Self::with_backend(params, backend)
    }

    pub fn with_backend(params: SolveParams, backend: PoolBackend) -> Result<Self, SolveError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| SolveError::Runtime(err.to_string()))?;
        Ok(Self {
            params,
            backend,
            runtime,
            pool: None,
        })
    }

    pub fn params(&self) -> &SolveParams {
        &self.params
    }

    /// Sparse-codes one signal against a dictionary: returns the
    /// activations minimizing ½‖X − Σ D_k ∗ Z_k‖² + reg·‖Z‖₁, plus the
    /// optional sufficient statistics and objective trajectory.
    pub fn solve_z(
        &mut self,
        x: &ArrayD<f64>,
        d: &ArrayD<f64>,
        reg: f64,
        z0: Option<&ArrayD<f64>>,
    ) -> Result<Solution, SolveError> {
        let atom_shape = d.shape()[2..].to_vec();
        let valid = valid_shape(&x.shape()[1..], &atom_shape)?;
        if x.shape()[0] != d.shape()[1] {
            return Err(SetupError::ChannelMismatch {
                dict: d.shape()[1],
                signal: x.shape()[0],
            }
            .into());
        }
        if let Some(z0) = z0 {
            let mut expect = vec![d.shape()[0]];
            expect.extend(&valid);
            if z0.shape() != expect.as_slice() {
                return Err(SetupError::BadShape(format!(
                    "warm start shape {:?} does not match the activation grid {expect:?}",
                    z0.shape()
                ))
                .into());
            }
        }

        if self.params.n_jobs <= 1 {
            return self.solve_single(x, d, reg, z0);
        }
        let grid = self.params.resolve_grid(&valid, &atom_shape)?;

        // (re)build the pool when the world changed
        let world = self.params.n_jobs;
        let needs_pool = match &self.pool {
            Some(pool) => pool.world() != world,
            None => true,
        };
        if needs_pool {
            if let Some(old) = self.pool.take() {
                let _ = self.runtime.block_on(old.shutdown());
            }
            let pool = self
                .runtime
                .block_on(WorkerPool::spawn(world, &self.backend))?;
            self.pool = Some(pool);
        }

        let pool = self.pool.as_mut().expect("pool was just ensured");
        let outcome = self.runtime.block_on(run_distributed(
            pool.mailbox(),
            &self.params,
            &grid,
            x,
            d,
            reg,
            z0,
        ));
        match outcome {
            Ok(raw) => {
                let cost_log = if self.params.timing {
                    Some(reconstruct_cost(x, d, reg, z0, &valid, &raw.reports)?)
                } else {
                    None
                };
                Ok(assemble(raw, cost_log))
            }
            Err(err) => {
                // a failed solve leaves unknown traffic in flight; tear the
                // pool down rather than reuse it
                if let Some(pool) = self.pool.take() {
                    let _ = self.runtime.block_on(pool.shutdown());
                }
                Err(err)
            }
        }
    }

    fn solve_single(
        &self,
        x: &ArrayD<f64>,
        d: &ArrayD<f64>,
        reg: f64,
        z0: Option<&ArrayD<f64>>,
    ) -> Result<Solution, SolveError> {
        let outcome = solve_sequential(x, d, reg, z0, &self.params.worker_config())?;
        let valid = valid_shape(&x.shape()[1..], &d.shape()[2..])?;
        let cost_log = if self.params.timing {
            Some(reconstruct_cost(
                x,
                d,
                reg,
                z0,
                &valid,
                std::slice::from_ref(&outcome.report),
            )?)
        } else {
            None
        };
        let report = outcome.report;
        Ok(Solution {
            z: outcome.z,
            ztz: outcome.ztz,
            ztx: outcome.ztx,
            cost_log,
            stats: SolveStats {
                n_updates: report.n_updates,
                iterations: report.iterations,
                runtime: report.runtime,
                t_init: report.t_init,
                z_nnz: report.z_nnz.clone(),
                reason: report.reason,
                workers: vec![report],
            },
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = self.runtime.block_on(pool.shutdown());
        }
    }
}

struct RawOutcome {
    z: ArrayD<f64>,
    ztz: Option<ArrayD<f64>>,
    ztx: Option<ArrayD<f64>>,
    reports: Vec<WorkerReport>,
    timed_out: bool,
}

fn assemble(raw: RawOutcome, cost_log: Option<Vec<CostPoint>>) -> Solution {
    let reason = if raw.timed_out {
        TerminationReason::Timeout
    } else if raw
        .reports
        .iter()
        .any(|r| r.reason == TerminationReason::Timeout)
    {
        TerminationReason::Timeout
    } else if raw
        .reports
        .iter()
        .any(|r| r.reason == TerminationReason::MaxIter)
    {
        TerminationReason::MaxIter
    } else {
        TerminationReason::Converged
    };
    let mut z_nnz = vec![0u64; raw.reports.first().map_or(0, |r| r.z_nnz.len())];
    for report in &raw.reports {
        for (total, &n) in z_nnz.iter_mut().zip(&report.z_nnz) {
            *total += n;
        }
    }
    let stats = SolveStats {
        n_updates: raw.reports.iter().map(|r| r.n_updates).sum(),
        iterations: raw.reports.iter().map(|r| r.iterations).sum(),
        runtime: raw.reports.iter().map(|r| r.runtime).fold(0.0, f64::max),
        t_init: raw.reports.iter().map(|r| r.t_init).fold(0.0, f64::max),
        z_nnz,
        reason,
        workers: raw.reports,
    };
    Solution {
        z: raw.z,
        ztz: raw.ztz,
        ztx: raw.ztx,
        cost_log,
        stats,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_distributed<F: Fabric>(
    mb: &mut Mailbox<F>,
    params: &SolveParams,
    grid: &[usize],
    x: &ArrayD<f64>,
    d: &ArrayD<f64>,
    reg: f64,
    z0: Option<&ArrayD<f64>>,
) -> Result<RawOutcome, SolveError> {
    let world = params.n_jobs;
    let n_atoms = d.shape()[0];
    let atom_shape = d.shape()[2..].to_vec();
    let valid = valid_shape(&x.shape()[1..], &atom_shape)?;
    let overlap: Vec<usize> = atom_shape.iter().map(|&a| a - 1).collect();
    let tiles = Segmentation::new(grid.to_vec(), valid.clone(), overlap)?;

    let config = params.worker_config();
    let dtd = WireTensor::from_array(&cross_correlate(d));
    let norms = atom_norms(d);
    let dictionary = WireTensor::from_array(d);

    // workers are idle between solves, so anything already queued is
    // leftover traffic from a previous solve
    while let Some((src, stale)) = mb.try_recv()? {
        debug!(src, kind = stale.kind(), "discarding stale message");
    }

    // scatter
    let t_dispatch = Instant::now();
    let mut expected_edges = Vec::with_capacity(world);
    for rank in 0..world {
        let ext = tiles.extended_bounds(rank);
        let signal_bounds: Vec<Range<usize>> = ext
            .iter()
            .zip(&atom_shape)
            .map(|(r, &a)| r.start..r.end + a - 1)
            .collect();
        let x_tile = slice_tensor(x, &signal_bounds);
        {
            let flat = x_tile.as_slice().expect("freshly sliced");
            expected_edges.push((flat[0], flat[flat.len() - 1]));
        }
        let init = TaskInit {
            rank: rank as u32,
            world: world as u32,
            worker_grid: grid.iter().map(|&g| g as u32).collect(),
            valid_shape: valid.iter().map(|&v| v as u32).collect(),
            reg,
            config: config.clone(),
            dictionary: dictionary.clone(),
            dtd: dtd.clone(),
            norms: norms.clone(),
            x_tile: WireTensor::from_array(&x_tile),
            z0_tile: z0.map(|z0| WireTensor::from_array(&slice_tensor(z0, &ext))),
        };
        mb.send(rank, Message::TaskInit(Box::new(init))).await?;
    }

    // scatter confirmation
    for rank in 0..world {
        let msg = expect_from(mb, rank, |m| matches!(m, Message::EdgeEcho { .. })).await?;
        if let Message::EdgeEcho { first, last } = msg {
            let (expect_first, expect_last) = expected_edges[rank];
            if first != expect_first || last != expect_last {
                return Err(SolveError::Integrity(format!(
                    "worker {rank} echoed tile edges ({first}, {last}), \
                     expected ({expect_first}, {expect_last})"
                )));
            }
        }
    }

    if params.debug.warm_beta {
        let probe = tiles.inner_shape(0);
        let holders: Vec<usize> = (0..world)
            .filter(|&rank| tiles.local_of(rank, &probe).is_some())
            .collect();
        let mut values = Vec::with_capacity(holders.len());
        for &rank in &holders {
            let msg = expect_from(mb, rank, |m| matches!(m, Message::BetaProbe(_))).await?;
            if let Message::BetaProbe(value) = msg {
                values.push((rank, value));
            }
        }
        if let Some(&(_, reference)) = values.first() {
            for &(src, value) in &values[1..] {
                if (value - reference).abs() > 1e-9 * (1.0 + reference.abs()) {
                    return Err(SolveError::Integrity(format!(
                        "warm gradient disagrees at the probe point: worker {src} \
                         reports {value}, expected {reference}"
                    )));
                }
            }
        }
        debug!(holders = holders.len(), "warm gradient probe consistent");
    }

    root_barrier(mb, BARRIER_INIT, world).await?;
    info!(
        world,
        elapsed = ?t_dispatch.elapsed(),
        "dispatch complete, workers searching"
    );

    // drive until global quiescence or the overall deadline
    let deadline = params
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let mut statuses: Vec<Option<WorkerStatus>> = vec![None; world];
    let mut timed_out = false;
    loop {
        let item = match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                match tokio::time::timeout(left, mb.recv()).await {
                    Ok(item) => Some(item?),
                    Err(_) => None,
                }
            }
            None => Some(mb.recv().await?),
        };
        match item {
            None => {
                warn!("solve deadline reached, terminating workers");
                timed_out = true;
                mb.bcast(Message::Terminate).await?;
                break;
            }
            Some((src, Message::Status(status))) => {
                statuses[src] = Some(status);
                if quiescent(&statuses) {
                    debug!("all workers paused with no traffic in flight");
                    mb.bcast(Message::Terminate).await?;
                    break;
                }
            }
            Some((_, Message::Failure(failure))) => {
                mb.bcast(Message::Terminate).await?;
                return Err(SolveError::Worker {
                    rank: failure.rank,
                    message: failure.message,
                });
            }
            Some((src, other)) => {
                debug!(src, kind = other.kind(), "ignoring message while driving");
            }
        }
    }

    // gather
    let mut z_shape = vec![n_atoms];
    z_shape.extend(&valid);
    let mut z = ArrayD::zeros(IxDyn(&z_shape));
    for rank in 0..world {
        let msg = expect_from(mb, rank, |m| matches!(m, Message::ResultZ(_))).await?;
        if let Message::ResultZ(tensor) = msg {
            let tile = tensor.into_array().map_err(SetupError::from)?;
            let inner = tiles.inner_bounds(rank);
            let expect: Vec<usize> = std::iter::once(n_atoms)
                .chain(inner.iter().map(Range::len))
                .collect();
            if tile.shape() != expect.as_slice() {
                return Err(SolveError::Integrity(format!(
                    "worker {rank} returned a tile of shape {:?}, expected {expect:?}",
                    tile.shape()
                )));
            }
            paste_tile(&mut z, &tile, &inner);
        }
    }

    let (ztz, ztx) = if params.return_ztz {
        let mut ztz_sum: Option<ArrayD<f64>> = None;
        let mut ztx_sum: Option<ArrayD<f64>> = None;
        for rank in 0..world {
            let msg = expect_from(mb, rank, |m| matches!(m, Message::ReduceZtz(_))).await?;
            if let Message::ReduceZtz(tensor) = msg {
                accumulate(&mut ztz_sum, tensor.into_array().map_err(SetupError::from)?);
            }
            let msg = expect_from(mb, rank, |m| matches!(m, Message::ReduceZtx(_))).await?;
            if let Message::ReduceZtx(tensor) = msg {
                accumulate(&mut ztx_sum, tensor.into_array().map_err(SetupError::from)?);
            }
        }
        (ztz_sum, ztx_sum)
    } else {
        (None, None)
    };

    let mut reports = Vec::with_capacity(world);
    for rank in 0..world {
        let msg = expect_from(mb, rank, |m| matches!(m, Message::ResultStats(_))).await?;
        if let Message::ResultStats(report) = msg {
            reports.push(*report);
        }
    }

    root_barrier(mb, BARRIER_DONE, world).await?;
    info!(
        updates = reports.iter().map(|r| r.n_updates).sum::<u64>(),
        timed_out, "solve gathered"
    );

    Ok(RawOutcome {
        z,
        ztz,
        ztx,
        reports,
        timed_out,
    })
}

/// All workers paused and every border update accounted for on both ends.
fn quiescent(statuses: &[Option<WorkerStatus>]) -> bool {
    let mut sent = 0u64;
    let mut received = 0u64;
    for status in statuses {
        match status {
            Some(status) if status.paused => {
                sent += status.sent;
                received += status.received;
            }
            _ => return false,
        }
    }
    sent == received
}

/// Root half of a named barrier: collect every worker's report, surface
/// failures instead of hanging on a worker that will never arrive, then
/// release.
async fn root_barrier<F: Fabric>(
    mb: &mut Mailbox<F>,
    id: u32,
    world: usize,
) -> Result<(), SolveError> {
    for _ in 0..world {
        let fut = mb.wait_for(|_, m| {
            matches!(m, Message::BarrierReady(got) if *got == id)
                || matches!(m, Message::Failure(_))
        });
        match tokio::time::timeout(GATHER_GRACE, fut).await {
            Err(_) => {
                return Err(SolveError::Integrity(format!(
                    "barrier {id} timed out waiting for workers"
                )))
            }
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok((_, Message::Failure(failure)))) => {
                mb.bcast(Message::Terminate).await?;
                return Err(SolveError::Worker {
                    rank: failure.rank,
                    message: failure.message,
                });
            }
            Ok(Ok(_)) => {}
        }
    }
    mb.bcast(Message::BarrierRelease(id)).await?;
    Ok(())
}

/// Waits for a specific result from a specific worker, surfacing any
/// worker failure and bounding the wait.
async fn expect_from<F: Fabric>(
    mb: &mut Mailbox<F>,
    rank: usize,
    pred: impl Fn(&Message) -> bool,
) -> Result<Message, SolveError> {
    let fut = mb.wait_for(|src, m| {
        (src == rank && pred(m)) || matches!(m, Message::Failure(_))
    });
    match tokio::time::timeout(GATHER_GRACE, fut).await {
        Err(_) => Err(SolveError::Integrity(format!(
            "worker {rank} did not report its result in time"
        ))),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok((_, Message::Failure(failure)))) => Err(SolveError::Worker {
            rank: failure.rank,
            message: failure.message,
        }),
        Ok(Ok((_, msg))) => Ok(msg),
    }
}

/// Copies a rectangular region (leading axis kept whole) out of a tensor.
fn slice_tensor(source: &ArrayD<f64>, bounds: &[Range<usize>]) -> ArrayD<f64> {
    let source = source.as_standard_layout();
    let lead = source.shape()[0];
    let extent: Vec<usize> = bounds.iter().map(Range::len).collect();
    let mut shape = vec![lead];
    shape.extend(&extent);
    let mut data = Vec::with_capacity(shape.iter().product());
    let source_shape = source.shape().to_vec();
    let flat = source.as_slice().expect("standard layout");
    for c in 0..lead {
        for_each_point(bounds, |p| {
            let mut idx = Vec::with_capacity(p.len() + 1);
            idx.push(c);
            idx.extend_from_slice(p);
            data.push(flat[flat_index(&source_shape, &idx)]);
        });
    }
    ArrayD::from_shape_vec(IxDyn(&shape), data).expect("shape matches data")
}

/// Writes one worker's inner activations into the global map.
fn paste_tile(z: &mut ArrayD<f64>, tile: &ArrayD<f64>, inner: &[Range<usize>]) {
    let n_atoms = z.shape()[0];
    let local: Vec<Range<usize>> = inner.iter().map(|r| 0..r.len()).collect();
    for k in 0..n_atoms {
        for_each_point(&local, |p| {
            let mut src = Vec::with_capacity(p.len() + 1);
            src.push(k);
            src.extend_from_slice(p);
            let mut dst = Vec::with_capacity(p.len() + 1);
            dst.push(k);
            dst.extend(p.iter().zip(inner).map(|(&p, r)| r.start + p));
            z[&dst[..]] = tile[&src[..]];
        });
    }
}

fn accumulate(total: &mut Option<ArrayD<f64>>, part: ArrayD<f64>) {
    match total {
        Some(total) => *total += &part,
        None => *total = Some(part),
    }
}
