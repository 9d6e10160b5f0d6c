use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SetupError;

/// Coordinate selection scheme inside a segment.
///
/// `Greedy` picks the coordinate with the largest optimal update over the
/// whole tile (one segment), `Lgcd` does the same over small round-robin
/// segments, `Random` draws a coordinate uniformly from the current segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Greedy,
    Random,
    Lgcd,
}

impl FromStr for Strategy {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greedy" => Ok(Strategy::Greedy),
            "random" => Ok(Strategy::Random),
            "lgcd" => Ok(Strategy::Lgcd),
            other => Err(SetupError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Greedy => "greedy",
            Strategy::Random => "random",
            Strategy::Lgcd => "lgcd",
        })
    }
}

/// Consistency assertions that abort a solve with a diagnostic when they
/// fail. All default to off; tests turn them on. Fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugChecks {
    /// Cross-check the warm gradient field against neighbors at startup.
    pub warm_beta: bool,
    /// Recompute the gradient field from scratch after each applied update.
    pub beta: bool,
    /// Verify that inactive segments hold no coordinate above tolerance.
    pub active_segments: bool,
    /// Verify that selected updates fall inside the worker's own tile.
    pub update_contained: bool,
}

impl DebugChecks {
    pub fn all() -> Self {
        Self {
            warm_beta: true,
            beta: true,
            active_segments: true,
            update_contained: true,
        }
    }
}

/// Per-worker solve configuration, broadcast verbatim to every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveConfig {
    pub strategy: Strategy,
    /// Candidate segments per axis; `None` resolves per strategy, see
    /// [`resolve_n_seg`].
    pub n_seg: Option<usize>,
    /// Smallest update magnitude worth applying.
    pub tol: f64,
    /// Iteration cap for one worker.
    pub max_iter: u64,
    /// Wall-clock cap for one worker, in seconds.
    pub timeout: Option<f64>,
    /// Constrain activations to be non-negative.
    pub z_positive: bool,
    /// Prefer interior candidates over tile-border candidates that do not
    /// strictly dominate them.
    pub use_soft_lock: bool,
    /// Only update coordinates that are non-zero in the warm start.
    pub freeze_support: bool,
    /// Compute the activation sufficient statistics at the end.
    pub return_ztz: bool,
    /// Record one timestamped entry per accepted update.
    pub timing: bool,
    /// Seed for the `random` strategy.
    pub random_state: Option<u64>,
    /// Consecutive pause/resume cycles before a worker gives up.
    pub patience: u32,
    pub debug: DebugChecks,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
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
            debug: DebugChecks::default(),
        }
    }
}

/// Number of candidate segments per axis for a tile.
///
/// An explicit `n_seg` wins on every axis. Otherwise `greedy` and `random`
/// scan the tile as a single segment; only `lgcd` splits it into segments
/// of roughly twice the atom support.
pub fn resolve_n_seg(
    strategy: Strategy,
    n_seg: Option<usize>,
    inner_shape: &[usize],
    atom_shape: &[usize],
) -> Vec<usize> {
    match (n_seg, strategy) {
        (Some(n), _) => vec![n.max(1); inner_shape.len()],
        (None, Strategy::Greedy) | (None, Strategy::Random) => vec![1; inner_shape.len()],
        (None, Strategy::Lgcd) => inner_shape
            .iter()
            .zip(atom_shape)
            .map(|(&extent, &atom)| (extent / (2 * atom)).max(1))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("greedy".parse::<Strategy>().unwrap(), Strategy::Greedy);
        assert_eq!("lgcd".parse::<Strategy>().unwrap(), Strategy::Lgcd);
        assert!("fancy".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_resolve_n_seg_defaults() {
        assert_eq!(resolve_n_seg(Strategy::Greedy, None, &[96], &[5]), vec![1]);
        assert_eq!(resolve_n_seg(Strategy::Random, None, &[96], &[5]), vec![1]);
        assert_eq!(resolve_n_seg(Strategy::Lgcd, None, &[96], &[5]), vec![9]);
        assert_eq!(
            resolve_n_seg(Strategy::Lgcd, None, &[57, 12], &[8, 8]),
            vec![3, 1]
        );
        assert_eq!(resolve_n_seg(Strategy::Lgcd, Some(4), &[96], &[5]), vec![4]);
        assert_eq!(
            resolve_n_seg(Strategy::Random, Some(4), &[96], &[5]),
            vec![4]
        );
    }
}
