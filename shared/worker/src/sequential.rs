use std::time::{Duration, Instant};

use ndarray::ArrayD;
use tracing::debug;

use tessella_core::{
    atom_norms, cross_correlate, valid_shape, SolveConfig, Strategy, WireTensor,
};
use tessella_network::{TaskInit, TerminationReason, UpdateRecord, WorkerReport};

use crate::error::WorkerError;
use crate::strategy::Picker;
use crate::tile::Tile;

/// Result of the in-process single-worker path.
pub struct SequentialOutcome {
    pub z: ArrayD<f64>,
    pub ztz: Option<ArrayD<f64>>,
    pub ztx: Option<ArrayD<f64>>,
    pub report: WorkerReport,
}

/// Coordinate descent on the whole problem in the calling thread, used
/// when only one worker is requested. Shares the tile and selection code
/// with the distributed path; there are simply no borders to talk over.
pub fn solve_sequential(
    x: &ArrayD<f64>,
    d: &ArrayD<f64>,
    reg: f64,
    z0: Option<&ArrayD<f64>>,
    config: &SolveConfig,
) -> Result<SequentialOutcome, WorkerError> {
    let t_start = Instant::now();
    let valid = valid_shape(&x.shape()[1..], &d.shape()[2..])?;
    let init = TaskInit {
        rank: 0,
        world: 1,
        worker_grid: vec![1; valid.len()],
        valid_shape: valid.iter().map(|&v| v as u32).collect(),
        reg,
        config: config.clone(),
        dictionary: WireTensor::from_array(d),
        dtd: WireTensor::from_array(&cross_correlate(d)),
        norms: atom_norms(d),
        x_tile: WireTensor::from_array(x),
        z0_tile: z0.map(WireTensor::from_array),
    };
    let mut tile = Tile::new(init)?;
    let mut picker = Picker::new(config, 0);
    let t_init = t_start.elapsed().as_secs_f64();

    let solve_start = Instant::now();
    let deadline = config
        .timeout
        .map(|secs| solve_start + Duration::from_secs_f64(secs));
    let mut iterations = 0u64;
    let mut n_updates = 0u64;
    let mut updates_log = Vec::new();
    let mut cursor = 0usize;
    let mut reason = TerminationReason::Converged;

    loop {
        if iterations >= config.max_iter {
            reason = TerminationReason::MaxIter;
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            reason = TerminationReason::Timeout;
            break;
        }
        let Some(segment) = tile.next_active_segment(cursor) else {
            break;
        };
        cursor = (segment + 1) % tile.n_segments();
        iterations += 1;

        match picker.select(&tile, segment) {
            Some(c) if c.dz.abs() > tile.tol() => {
                if config.debug.update_contained {
                    tile.check_update_contained(&c.pos)?;
                }
                tile.apply_local(c.atom, &c.pos, c.dz);
                if config.debug.beta {
                    tile.check_beta(n_updates + 1)?;
                }
                n_updates += 1;
                if config.timing {
                    updates_log.push(UpdateRecord {
                        t: solve_start.elapsed().as_secs_f64(),
                        iteration: iterations,
                        rank: 0,
                        atom: c.atom as u32,
                        pos: c.pos.iter().map(|&p| p as u32).collect(),
                        dz: c.dz,
                    });
                }
            }
            _ => {
                let deactivate = match config.strategy {
                    Strategy::Greedy | Strategy::Lgcd => true,
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
    debug!(updates = n_updates, iterations, runtime, "sequential solve done");

    let (ztz, ztx) = if config.return_ztz {
        let z_ext = tile.z_with_halo(&[])?;
        (
            Some(tile.ztz_contribution(&z_ext)),
            Some(tile.ztx_contribution()),
        )
    } else {
        (None, None)
    };
    let report = WorkerReport {
        rank: 0,
        n_updates,
        iterations,
        runtime,
        t_init,
        n_reactivations: 0,
        reason,
        z_nnz: tile.z_nnz(),
        updates: updates_log,
    };
    Ok(SequentialOutcome {
        z: tile.z().clone(),
        ztz,
        ztx,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tessella_core::{compute_ztx, compute_ztz, cost, lambda_max, reconstruct, DebugChecks};

    fn tensor(shape: &[usize], data: Vec<f64>) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    /// Three atoms of length 5, a signal planted from 10 spikes.
    fn planted_1d() -> (ArrayD<f64>, ArrayD<f64>, Vec<(usize, usize)>) {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut d = ArrayD::zeros(IxDyn(&[3, 1, 5]));
        for k in 0..3 {
            let mut norm = 0.0;
            for t in 0..5 {
                let v: f64 = rng.random_range(-1.0..1.0);
                d[[k, 0, t]] = v;
                norm += v * v;
            }
            for t in 0..5 {
                d[[k, 0, t]] /= norm.sqrt();
            }
        }
        let mut z_true = ArrayD::zeros(IxDyn(&[3, 96]));
        let mut spikes = Vec::new();
        // spikes far enough apart that their atom supports never overlap
        let shift = rng.random_range(0..6);
        for i in 0..10 {
            let k = rng.random_range(0..3);
            let p = shift + 9 * i;
            z_true[[k, p]] = 1.0 + rng.random_range(0.0..1.0);
            spikes.push((k, p));
        }
        let x = reconstruct(&d, &z_true).unwrap();
        (x, d, spikes)
    }

    fn base_config() -> SolveConfig {
        SolveConfig {
            tol: 1e-8,
            max_iter: 1_000_000,
            debug: DebugChecks::all(),
            ..SolveConfig::default()
        }
    }

    #[test]
    fn test_planted_support_recovered() {
        let (x, d, spikes) = planted_1d();
        let out = solve_sequential(&x, &d, 0.002, None, &base_config()).unwrap();
        assert_eq!(out.report.reason, TerminationReason::Converged);
        let mut recovered: Vec<(usize, usize)> = Vec::new();
        for k in 0..3 {
            for p in 0..96 {
                if out.z[[k, p]].abs() > 1e-3 {
                    recovered.push((k, p));
                }
            }
        }
        let mut expect = spikes.clone();
        expect.sort_unstable();
        recovered.sort_unstable();
        assert_eq!(recovered, expect);
    }

    #[test]
    fn test_lambda_max_gives_zero() {
        let (x, d, _) = planted_1d();
        let reg = lambda_max(&x, &d).unwrap();
        let out = solve_sequential(&x, &d, reg, None, &base_config()).unwrap();
        assert_eq!(out.report.n_updates, 0);
        assert!(out.z.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_warm_restart_is_a_fixed_point() {
        let (x, d, _) = planted_1d();
        let config = base_config();
        let first = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        let again = solve_sequential(&x, &d, 0.002, Some(&first.z), &config).unwrap();
        assert_eq!(again.report.n_updates, 0);
        assert_eq!(again.z, first.z);
    }

    #[test]
    fn test_cost_monotone_under_timing_log() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            timing: true,
            ..base_config()
        };
        let out = solve_sequential(&x, &d, 0.01, None, &config).unwrap();
        assert!(out.report.n_updates > 0);
        // replay the log and watch the objective fall
        let mut z = ArrayD::zeros(IxDyn(&[3, 96]));
        let mut last = cost(&x, &d, &z, 0.01).unwrap();
        for update in &out.report.updates {
            z[[update.atom as usize, update.pos[0] as usize]] += update.dz;
            let now = cost(&x, &d, &z, 0.01).unwrap();
            assert!(
                now <= last + 1e-9,
                "objective rose from {last} to {now} at iteration {}",
                update.iteration
            );
            last = now;
        }
    }

    #[test]
    fn test_z_positive_never_negative() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            z_positive: true,
            ..base_config()
        };
        let out = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        assert!(out.z.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_freeze_support_keeps_support() {
        let (x, d, _) = planted_1d();
        let mut z0 = ArrayD::zeros(IxDyn(&[3, 96]));
        z0[[0, 10]] = 0.5;
        z0[[2, 40]] = -0.25;
        let config = SolveConfig {
            freeze_support: true,
            ..base_config()
        };
        let out = solve_sequential(&x, &d, 0.002, Some(&z0), &config).unwrap();
        for k in 0..3 {
            for p in 0..96 {
                if z0[[k, p]] == 0.0 {
                    assert_eq!(out.z[[k, p]], 0.0, "support grew at ({k}, {p})");
                }
            }
        }
    }

    #[test]
    fn test_random_strategy_converges() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            strategy: Strategy::Random,
            random_state: Some(42),
            max_iter: 5_000_000,
            tol: 1e-8,
            ..SolveConfig::default()
        };
        let out = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        let greedy = solve_sequential(&x, &d, 0.002, None, &base_config()).unwrap();
        let norm: f64 = greedy.z.iter().map(|v| v * v).sum::<f64>().sqrt();
        let diff: f64 = out
            .z
            .iter()
            .zip(greedy.z.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        assert!(diff <= 1e-5 * norm.max(1.0), "random drifted by {diff}");
    }

    #[test]
    fn test_lgcd_matches_greedy() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            strategy: Strategy::Lgcd,
            ..base_config()
        };
        let lgcd = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        let greedy = solve_sequential(&x, &d, 0.002, None, &base_config()).unwrap();
        let norm: f64 = greedy.z.iter().map(|v| v * v).sum::<f64>().sqrt();
        let diff: f64 = lgcd
            .z
            .iter()
            .zip(greedy.z.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        assert!(diff <= 1e-6 * norm.max(1.0));
    }

    #[test]
    fn test_ztz_matches_offline() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            return_ztz: true,
            ..base_config()
        };
        let out = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        let ztz = out.ztz.unwrap();
        let ztx = out.ztx.unwrap();
        let expect_ztz = compute_ztz(&out.z, &[5]);
        let expect_ztx = compute_ztx(&out.z, &x, &[5]).unwrap();
        for (got, want) in ztz.iter().zip(expect_ztz.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-10);
        }
        for (got, want) in ztx.iter().zip(expect_ztx.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_timeout_reported() {
        let (x, d, _) = planted_1d();
        let config = SolveConfig {
            timeout: Some(0.0),
            ..base_config()
        };
        let out = solve_sequential(&x, &d, 0.002, None, &config).unwrap();
        assert_eq!(out.report.reason, TerminationReason::Timeout);
        assert_eq!(out.report.n_updates, 0);
    }
}
