use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use tessella_core::{SolveConfig, Strategy};

pub use crate::tile::Candidate;
use crate::tile::Tile;

/// Coordinate selection, resolved once at solver construction.
///
/// Both variants honor the soft-lock rule when enabled: a candidate inside
/// a cross-tile overlap strip is committed only if it strictly dominates
/// the best candidate in the segment's interior, so concurrent mirror
/// updates on both sides of a border stay rare.
pub enum Picker {
    Greedy { soft_lock: bool },
    Random { rng: ChaCha8Rng, soft_lock: bool },
}

impl Picker {
    pub fn new(config: &SolveConfig, rank: usize) -> Self {
        match config.strategy {
            Strategy::Greedy | Strategy::Lgcd => Picker::Greedy {
                soft_lock: config.use_soft_lock,
            },
            Strategy::Random => {
                let rng = match config.random_state {
                    // distinct streams per worker from one user seed
                    Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(rank as u64)),
                    None => ChaCha8Rng::seed_from_u64(rand::random()),
                };
                Picker::Random {
                    rng,
                    soft_lock: config.use_soft_lock,
                }
            }
        }
    }

    /// Picks the candidate to try in one segment. Returns `None` only for
    /// an empty segment.
    pub fn select(&mut self, tile: &Tile, segment: usize) -> Option<Candidate> {
        match self {
            Picker::Greedy { soft_lock } => {
                let (best, interior) = tile.best_in_segment(segment);
                let best = best?;
                if *soft_lock {
                    Some(prefer_interior(tile, best, interior))
                } else {
                    Some(best)
                }
            }
            Picker::Random { rng, soft_lock } => {
                let bounds = tile.segment_bounds(segment);
                let atom = rng.random_range(0..tile.n_atoms());
                let pos: Vec<usize> = bounds
                    .iter()
                    .map(|r| rng.random_range(r.start..r.end))
                    .collect();
                let draw = Candidate {
                    atom,
                    dz: tile.dz_opt_at(atom, &pos),
                    pos,
                };
                if *soft_lock {
                    let (_, interior) = tile.best_in_segment(segment);
                    Some(prefer_interior(tile, draw, interior))
                } else {
                    Some(draw)
                }
            }
        }
    }
}

/// The soft-lock arbitration: an overlap-strip candidate yields to any
/// interior candidate of at least the same magnitude.
fn prefer_interior(tile: &Tile, candidate: Candidate, interior: Option<Candidate>) -> Candidate {
    if !tile.in_overlap(&candidate.pos) {
        return candidate;
    }
    match interior {
        Some(interior) if interior.dz.abs() >= candidate.dz.abs() => interior,
        _ => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use tessella_core::{atom_norms, cross_correlate, WireTensor};
    use tessella_network::TaskInit;

    /// Right-hand tile of a split 1-d problem whose best update sits in
    /// the low overlap strip, tied with an interior coordinate.
    fn border_heavy_tile() -> Tile {
        let d = ArrayD::from_shape_vec(IxDyn(&[1, 1, 3]), vec![1.0, 0.0, 0.0]).unwrap();
        let mut x = ArrayD::zeros(IxDyn(&[1, 24]));
        // global positions 20 (overlap strip) and 30 (interior)
        x[[0, 2]] = 2.0;
        x[[0, 12]] = 2.0;
        Tile::new(TaskInit {
            rank: 1,
            world: 2,
            worker_grid: vec![2],
            valid_shape: vec![40],
            reg: 0.1,
            config: SolveConfig::default(),
            dictionary: WireTensor::from_array(&d),
            dtd: WireTensor::from_array(&cross_correlate(&d)),
            norms: atom_norms(&d),
            x_tile: WireTensor::from_array(&x),
            z0_tile: None,
        })
        .unwrap()
    }

    #[test]
    fn test_soft_lock_defers_to_equal_interior() {
        let tile = border_heavy_tile();
        let config = SolveConfig::default();
        let mut picker = Picker::new(&config, 1);
        let picked = picker.select(&tile, 0).unwrap();
        assert_eq!(picked.pos, vec![10]);
    }

    #[test]
    fn test_without_soft_lock_border_wins_scan_order() {
        let tile = border_heavy_tile();
        let config = SolveConfig {
            use_soft_lock: false,
            ..SolveConfig::default()
        };
        let mut picker = Picker::new(&config, 1);
        let picked = picker.select(&tile, 0).unwrap();
        assert_eq!(picked.pos, vec![0]);
    }

    #[test]
    fn test_dominant_border_update_still_commits() {
        let mut tile = border_heavy_tile();
        // make the strip candidate strictly dominant
        tile.apply_local(0, &[10], 1.0);
        let config = SolveConfig::default();
        let mut picker = Picker::new(&config, 1);
        let picked = picker.select(&tile, 0).unwrap();
        assert_eq!(picked.pos, vec![0]);
    }
}
