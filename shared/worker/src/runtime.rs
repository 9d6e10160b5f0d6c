use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use tessella_core::{SolveConfig, Strategy, WireTensor};
use tessella_network::{
    BorderUpdate, Fabric, Mailbox, Message, TaskInit, TerminationReason, UpdateRecord,
    WorkerFailure, WorkerReport, WorkerStatus,
};

use crate::error::WorkerError;
use crate::strategy::Picker;
use crate::tile::Tile;

pub(crate) const BARRIER_INIT: u32 = 0;
pub(crate) const BARRIER_DONE: u32 = 1;

/// How often a paused worker wakes up to look at its deadline.
const PAUSE_POLL: Duration = Duration::from_millis(10);

enum SolveEnd {
    Done,
    ShutdownRequested,
}

/// Command loop of one pooled worker: solve every task the root sends,
/// leave on shutdown. Worker-local solve errors are reported to the root;
/// fabric errors tear the worker down.
pub async fn run_worker<F: Fabric>(fabric: F) -> Result<(), WorkerError> {
    let rank = fabric.rank();
    let mut mb = Mailbox::new(fabric);
    info!(rank, "worker ready");
    // strips from a neighbor that started the next solve before our own
    // task arrived; fed back once it does
    let mut early = Vec::new();
    loop {
        let (src, msg) = mb.recv().await?;
        match msg {
            Message::TaskInit(init) => {
                for (src, strip) in early.drain(..) {
                    mb.stash_front(src, strip);
                }
                match solve(&mut mb, *init).await {
                    Ok(SolveEnd::Done) => {}
                    Ok(SolveEnd::ShutdownRequested) => return Ok(()),
                    Err(WorkerError::Fabric(err)) => return Err(err.into()),
                    Err(err) => {
                        warn!(rank, "solve failed: {err}");
                        let root = mb.root();
                        mb.send(
                            root,
                            Message::Failure(WorkerFailure {
                                rank: rank as u32,
                                message: err.to_string(),
                            }),
                        )
                        .await?;
                    }
                }
            }
            Message::BetaStrip(_) => early.push((src, msg)),
            Message::Shutdown => {
                debug!(rank, "worker shutting down");
                return Ok(());
            }
            other => {
                // stale traffic from an aborted solve
                trace!(rank, kind = other.kind(), "dropping stray message");
            }
        }
    }
}

struct Counters {
    iterations: u64,
    n_updates: u64,
    sent: u64,
    received: u64,
    /// Pause/resume cycles since the last accepted update, against patience.
    reactivations: u32,
    total_reactivations: u32,
}

async fn solve<F: Fabric>(mb: &mut Mailbox<F>, init: TaskInit) -> Result<SolveEnd, WorkerError> {
    let t_start = Instant::now();
    let rank = init.rank as usize;
    let config = init.config.clone();
    let root = mb.root();
    let mut tile = Tile::new(init)?;
    let mut picker = Picker::new(&config, rank);
    let neighbor_ids: Vec<usize> = tile.neighbors().iter().map(|(_, id)| *id).collect();
    debug!(rank, neighbors = neighbor_ids.len(), "tile ready");

    // confirm the scatter
    let (first, last) = tile.x_edges();
    mb.send(root, Message::EdgeEcho { first, last }).await?;

    // one round of border β so halos start consistent
    for &n in &neighbor_ids {
        let strip = tile.beta_strip_for(n);
        mb.send(n, Message::BetaStrip(strip)).await?;
    }
    let mut terminated_early = false;
    for _ in 0..neighbor_ids.len() {
        let (_, msg) = mb
            .wait_for(|_, m| {
                matches!(
                    m,
                    Message::BetaStrip(_) | Message::Terminate | Message::Shutdown
                )
            })
            .await?;
        match msg {
            Message::BetaStrip(strip) => tile.apply_beta_strip(&strip)?,
            Message::Terminate => {
                terminated_early = true;
                break;
            }
            Message::Shutdown => return Ok(SolveEnd::ShutdownRequested),
            _ => unreachable!("filtered by wait_for"),
        }
    }

    if !terminated_early {
        if config.debug.warm_beta {
            let probe = tile.warm_probe_point();
            if let Some(value) = tile.probe_beta(&probe) {
                mb.send(root, Message::BetaProbe(value)).await?;
            }
        }
        match worker_barrier(mb, BARRIER_INIT).await? {
            SolveEnd::ShutdownRequested => return Ok(SolveEnd::ShutdownRequested),
            SolveEnd::Done => {}
        }
    }
    let t_init = t_start.elapsed().as_secs_f64();

    let solve_start = Instant::now();
    let deadline = config
        .timeout
        .map(|secs| solve_start + Duration::from_secs_f64(secs));
    let mut counters = Counters {
        iterations: 0,
        n_updates: 0,
        sent: 0,
        received: 0,
        reactivations: 0,
        total_reactivations: 0,
    };
    let mut updates_log = Vec::new();
    let mut cursor = 0usize;
    let mut paused = false;
    let mut terminating = false;
    let mut reason = TerminationReason::Converged;

    'main: while !terminated_early {
        // apply everything the neighbors sent before looking at β again
        let mut applied = 0u64;
        loop {
            match mb.try_recv()? {
                Some((_, Message::BorderUpdate(update))) => {
                    tile.apply_remote(&update)?;
                    if config.debug.beta {
                        tile.check_beta(counters.n_updates + counters.received)?;
                    }
                    counters.received += 1;
                    applied += 1;
                }
                Some((_, Message::Terminate)) => break 'main,
                Some((src, other)) => {
                    trace!(rank, src, kind = other.kind(), "ignoring message mid-solve");
                }
                None => break,
            }
        }

        if paused {
            if applied > 0 {
                if !terminating && tile.any_active() {
                    counters.reactivations += 1;
                    counters.total_reactivations += 1;
                    if counters.reactivations > config.patience {
                        info!(rank, "out of patience, staying paused");
                        terminating = true;
                        send_status(mb, root, true, &counters).await?;
                    } else {
                        paused = false;
                        trace!(rank, "reactivated by border traffic");
                        send_status(mb, root, false, &counters).await?;
                    }
                } else {
                    // keep the root's message accounting current
                    send_status(mb, root, true, &counters).await?;
                }
            }
            if paused {
                match tokio::time::timeout(PAUSE_POLL, mb.recv()).await {
                    Ok(item) => {
                        let (src, msg) = item?;
                        // feed it through the drain on the next pass
                        mb.stash_front(src, msg);
                    }
                    Err(_) => {}
                }
                continue 'main;
            }
            continue 'main;
        }

        if counters.iterations >= config.max_iter {
            reason = TerminationReason::MaxIter;
            terminating = true;
            paused = true;
            debug!(rank, "iteration cap reached");
            send_status(mb, root, true, &counters).await?;
            continue 'main;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            reason = TerminationReason::Timeout;
            terminating = true;
            paused = true;
            debug!(rank, "deadline reached");
            send_status(mb, root, true, &counters).await?;
            continue 'main;
        }

        let Some(segment) = tile.next_active_segment(cursor) else {
            paused = true;
            debug!(rank, iterations = counters.iterations, "nothing left to do");
            send_status(mb, root, true, &counters).await?;
            continue 'main;
        };
        cursor = (segment + 1) % tile.n_segments();
        counters.iterations += 1;

        let candidate = picker.select(&tile, segment);
        match candidate {
            Some(c) if c.dz.abs() > tile.tol() => {
                if config.debug.update_contained {
                    tile.check_update_contained(&c.pos)?;
                }
                tile.apply_local(c.atom, &c.pos, c.dz);
                if config.debug.beta {
                    tile.check_beta(counters.n_updates + counters.received + 1)?;
                }
                counters.n_updates += 1;
                counters.reactivations = 0;
                if config.timing {
                    updates_log.push(UpdateRecord {
                        t: solve_start.elapsed().as_secs_f64(),
                        iteration: counters.iterations,
                        rank: rank as u32,
                        atom: c.atom as u32,
                        pos: tile
                            .global_of_inner(&c.pos)
                            .iter()
                            .map(|&p| p as u32)
                            .collect(),
                        dz: c.dz,
                    });
                }
                let global: Vec<i32> = tile
                    .global_of_inner(&c.pos)
                    .iter()
                    .map(|&p| p as i32)
                    .collect();
                for n in tile.neighbors_of_update(&c.pos) {
                    mb.send(
                        n,
                        Message::BorderUpdate(BorderUpdate {
                            atom: c.atom as u32,
                            pos: global.clone(),
                            dz: c.dz,
                        }),
                    )
                    .await?;
                    counters.sent += 1;
                }
            }
            _ => {
                let deactivate = match config.strategy {
                    Strategy::Greedy | Strategy::Lgcd => true,
                    // an unlucky draw is not proof the segment is done
                    Strategy::Random => tile.segment_max(segment) <= tile.tol(),
                };
                if deactivate {
                    tile.deactivate(segment);
                    if config.debug.active_segments {
                        tile.check_active_segments()?;
                    }
                }
            }
        }
    }

    let runtime = solve_start.elapsed().as_secs_f64();
    info!(
        rank,
        updates = counters.n_updates,
        iterations = counters.iterations,
        runtime,
        "solve finished"
    );
    finalize(
        mb,
        &mut tile,
        &config,
        &neighbor_ids,
        WorkerReport {
            rank: rank as u32,
            n_updates: counters.n_updates,
            iterations: counters.iterations,
            runtime,
            t_init,
            n_reactivations: counters.total_reactivations,
            reason,
            z_nnz: Vec::new(),
            updates: updates_log,
        },
    )
    .await
}

async fn finalize<F: Fabric>(
    mb: &mut Mailbox<F>,
    tile: &mut Tile,
    config: &SolveConfig,
    neighbor_ids: &[usize],
    mut report: WorkerReport,
) -> Result<SolveEnd, WorkerError> {
    let root = mb.root();
    mb.send(root, Message::ResultZ(WireTensor::from_array(tile.z())))
        .await?;

    if config.return_ztz {
        // the autocorrelation needs the final activations of the halo
        for &n in neighbor_ids {
            let strip = tile.z_strip_for(n);
            mb.send(n, Message::ZStrip(strip)).await?;
        }
        let mut strips = Vec::with_capacity(neighbor_ids.len());
        for _ in 0..neighbor_ids.len() {
            let (_, msg) = mb
                .wait_for(|_, m| matches!(m, Message::ZStrip(_) | Message::Shutdown))
                .await?;
            match msg {
                Message::ZStrip(strip) => strips.push(strip),
                Message::Shutdown => return Ok(SolveEnd::ShutdownRequested),
                _ => unreachable!("filtered by wait_for"),
            }
        }
        let z_ext = tile.z_with_halo(&strips)?;
        let ztz = tile.ztz_contribution(&z_ext);
        mb.send(root, Message::ReduceZtz(WireTensor::from_array(&ztz)))
            .await?;
        let ztx = tile.ztx_contribution();
        mb.send(root, Message::ReduceZtx(WireTensor::from_array(&ztx)))
            .await?;
    }

    report.z_nnz = tile.z_nnz();
    mb.send(root, Message::ResultStats(Box::new(report))).await?;
    worker_barrier(mb, BARRIER_DONE).await
}

/// Worker half of a named barrier that also honors a shutdown request, so
/// an aborted solve cannot wedge the pool.
async fn worker_barrier<F: Fabric>(
    mb: &mut Mailbox<F>,
    id: u32,
) -> Result<SolveEnd, WorkerError> {
    let root = mb.root();
    mb.send(root, Message::BarrierReady(id)).await?;
    let (_, msg) = mb
        .wait_for(|_, m| {
            matches!(m, Message::BarrierRelease(got) if *got == id)
                || matches!(m, Message::Shutdown)
        })
        .await?;
    match msg {
        Message::Shutdown => Ok(SolveEnd::ShutdownRequested),
        _ => Ok(SolveEnd::Done),
    }
}

async fn send_status<F: Fabric>(
    mb: &mut Mailbox<F>,
    root: usize,
    paused: bool,
    counters: &Counters,
) -> Result<(), WorkerError> {
    mb.send(
        root,
        Message::Status(WorkerStatus {
            paused,
            sent: counters.sent,
            received: counters.received,
            iterations: counters.iterations,
        }),
    )
    .await?;
    Ok(())
}
