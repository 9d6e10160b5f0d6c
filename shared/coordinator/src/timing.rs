use ndarray::{ArrayD, IxDyn};

use tessella_core::{cost, SetupError};
use tessella_network::WorkerReport;

/// One point of the reconstructed objective trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct CostPoint {
    pub n_updates: u64,
    /// Seconds since the solve started.
    pub t: f64,
    pub cost: f64,
}

/// Merges the per-worker update logs by timestamp, replays the activation
/// trajectory, and evaluates the objective at geometrically spaced
/// checkpoints (every power of two updates) plus the final state.
pub fn reconstruct_cost(
    x: &ArrayD<f64>,
    d: &ArrayD<f64>,
    reg: f64,
    z0: Option<&ArrayD<f64>>,
    valid_shape: &[usize],
    reports: &[WorkerReport],
) -> Result<Vec<CostPoint>, SetupError> {
    let n_atoms = d.shape()[0];
    let mut z = match z0 {
        Some(z0) => z0.clone(),
        None => {
            let mut shape = vec![n_atoms];
            shape.extend(valid_shape);
            ArrayD::zeros(IxDyn(&shape))
        }
    };

    let mut log: Vec<_> = reports.iter().flat_map(|r| r.updates.iter()).collect();
    log.sort_by(|a, b| a.t.total_cmp(&b.t));

    let mut points = vec![CostPoint {
        n_updates: 0,
        t: 0.0,
        cost: cost(x, d, &z, reg)?,
    }];
    let mut next_checkpoint = 1u64;
    let mut applied = 0u64;
    let mut last_t = 0.0;
    for update in &log {
        let mut idx = vec![update.atom as usize];
        idx.extend(update.pos.iter().map(|&p| p as usize));
        z[&idx[..]] += update.dz;
        applied += 1;
        last_t = update.t;
        if applied >= next_checkpoint {
            points.push(CostPoint {
                n_updates: applied,
                t: update.t,
                cost: cost(x, d, &z, reg)?,
            });
            next_checkpoint *= 2;
        }
    }
    if points.last().map(|p| p.n_updates) != Some(applied) {
        points.push(CostPoint {
            n_updates: applied,
            t: last_t,
            cost: cost(x, d, &z, reg)?,
        });
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessella_network::{TerminationReason, UpdateRecord};

    fn report(updates: Vec<UpdateRecord>) -> WorkerReport {
        WorkerReport {
            rank: 0,
            n_updates: updates.len() as u64,
            iterations: updates.len() as u64,
            runtime: 1.0,
            t_init: 0.0,
            n_reactivations: 0,
            reason: TerminationReason::Converged,
            z_nnz: vec![],
            updates,
        }
    }

    #[test]
    fn test_replay_orders_by_timestamp() {
        let d = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2]), vec![1.0, 0.0]).unwrap();
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        // two updates on the same coordinate, out of order across workers
        let r0 = report(vec![UpdateRecord {
            t: 0.2,
            iteration: 1,
            rank: 0,
            atom: 0,
            pos: vec![0],
            dz: -0.5,
        }]);
        let r1 = report(vec![UpdateRecord {
            t: 0.1,
            iteration: 1,
            rank: 1,
            atom: 0,
            pos: vec![0],
            dz: 1.0,
        }]);
        let points = reconstruct_cost(&x, &d, 0.0, None, &[3], &[r0, r1]).unwrap();
        // start at ½‖x‖² = 0.5, reach 0.5·0.25 = 0.125 after both updates
        assert_eq!(points.first().unwrap().n_updates, 0);
        assert!((points.first().unwrap().cost - 0.5).abs() < 1e-12);
        let last = points.last().unwrap();
        assert_eq!(last.n_updates, 2);
        assert!((last.cost - 0.125).abs() < 1e-12);
        assert!((last.t - 0.2).abs() < 1e-12);
    }
}
