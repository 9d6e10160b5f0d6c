use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tessella_core::{DebugChecks, SetupError, SolveConfig, Strategy};

/// How workers are laid out over the activation grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridSpec {
    /// Pick the factorization of `n_jobs` with the squarest tiles.
    Auto,
    /// Workers per axis; the product must equal `n_jobs`.
    Explicit(Vec<usize>),
}

/// User-facing solve parameters. The per-worker subset travels to the
/// workers as a [`SolveConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveParams {
    pub n_jobs: usize,
    pub w_world: GridSpec,
    pub strategy: Strategy,
    pub n_seg: Option<usize>,
    pub tol: f64,
    /// Total iteration budget, split evenly across workers.
    pub max_iter: u64,
    /// Wall-clock cap in seconds, per worker and for the whole solve.
    pub timeout: Option<f64>,
    pub z_positive: bool,
    pub use_soft_lock: bool,
    pub freeze_support: bool,
    pub return_ztz: bool,
    pub timing: bool,
    pub random_state: Option<u64>,
    pub patience: u32,
    /// One host per line for multi-host pools; workers cycle through it.
    pub hostfile: Option<PathBuf>,
    pub debug: DebugChecks,
}

impl Default for SolveParams {
    fn default() -> Self {
        Self {
            n_jobs: 1,
            w_world: GridSpec::Auto,
            strategy: Strategy::Greedy,
            n_seg: None,
            tol: 1e-5,
            max_iter: 100_000,
            timeout: None,
            z_positive: false,
            use_soft_lock: true,
            freeze_support: false,
            return_ztz: false,
            timing: false,
            random_state: None,
            patience: 1_000,
            hostfile: None,
            debug: DebugChecks::default(),
        }
    }
}

impl SolveParams {
    /// The subset one worker needs, with the iteration budget divided.
    pub fn worker_config(&self) -> SolveConfig {
        SolveConfig {
            strategy: self.strategy,
            n_seg: self.n_seg,
            tol: self.tol,
            max_iter: (self.max_iter / self.n_jobs.max(1) as u64).max(1),
            timeout: self.timeout,
            z_positive: self.z_positive,
            use_soft_lock: self.use_soft_lock,
            freeze_support: self.freeze_support,
            return_ztz: self.return_ztz,
            timing: self.timing,
            random_state: self.random_state,
            patience: self.patience,
            debug: self.debug,
        }
    }

    /// Resolves the worker grid against a problem and rejects layouts whose
    /// tiles are too thin for the atom support.
    pub fn resolve_grid(
        &self,
        valid_shape: &[usize],
        atom_shape: &[usize],
    ) -> Result<Vec<usize>, SetupError> {
        let grid = match &self.w_world {
            GridSpec::Auto => crate::grid::auto_grid(self.n_jobs, valid_shape)?,
            GridSpec::Explicit(grid) => {
                if grid.len() != valid_shape.len()
                    || grid.iter().product::<usize>() != self.n_jobs
                {
                    return Err(SetupError::GridMismatch {
                        grid: grid.clone(),
                        world: self.n_jobs,
                    });
                }
                grid.clone()
            }
        };
        for (axis, ((&g, &v), &a)) in grid.iter().zip(valid_shape).zip(atom_shape).enumerate() {
            if g == 0 {
                return Err(SetupError::GridMismatch {
                    grid: grid.clone(),
                    world: self.n_jobs,
                });
            }
            let extent = v / g;
            if g > 1 && extent <= 2 * a - 1 {
                return Err(SetupError::TileTooSmall {
                    axis,
                    extent,
                    min: 2 * a - 1,
                });
            }
        }
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_splits_iterations() {
        let params = SolveParams {
            n_jobs: 4,
            max_iter: 1000,
            ..SolveParams::default()
        };
        assert_eq!(params.worker_config().max_iter, 250);
    }

    #[test]
    fn test_explicit_grid_must_match_jobs() {
        let params = SolveParams {
            n_jobs: 4,
            w_world: GridSpec::Explicit(vec![3, 1]),
            ..SolveParams::default()
        };
        assert!(params.resolve_grid(&[64, 64], &[8, 8]).is_err());
    }

    #[test]
    fn test_thin_tiles_rejected() {
        let params = SolveParams {
            n_jobs: 8,
            w_world: GridSpec::Explicit(vec![8]),
            ..SolveParams::default()
        };
        // tiles of 12 cannot host atoms of support 8 (needs > 15)
        let err = params.resolve_grid(&[96], &[8]).unwrap_err();
        assert!(matches!(err, SetupError::TileTooSmall { .. }));
    }

    #[test]
    fn test_auto_grid_resolution() {
        let params = SolveParams {
            n_jobs: 4,
            ..SolveParams::default()
        };
        assert_eq!(params.resolve_grid(&[57, 57], &[8, 8]).unwrap(), vec![2, 2]);
    }
}
