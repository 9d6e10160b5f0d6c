use tessella_core::SetupError;

/// Worker grid for `n_jobs` workers over a valid activation shape: the
/// factorization whose tile aspect ratio is closest to square. 1-d signals
/// get a flat split; higher dimensions need an explicit grid.
pub fn auto_grid(n_jobs: usize, valid_shape: &[usize]) -> Result<Vec<usize>, SetupError> {
    match valid_shape.len() {
        1 => Ok(vec![n_jobs]),
        2 => {
            let (v0, v1) = (valid_shape[0] as f64, valid_shape[1] as f64);
            let mut best = (vec![n_jobs, 1], aspect_gap(v0, v1, n_jobs, 1));
            for g0 in 1..=n_jobs {
                if n_jobs % g0 != 0 {
                    continue;
                }
                let g1 = n_jobs / g0;
                let gap = aspect_gap(v0, v1, g0, g1);
                if gap < best.1 {
                    best = (vec![g0, g1], gap);
                }
            }
            Ok(best.0)
        }
        d => Err(SetupError::AutoGridUnsupported(d)),
    }
}

fn aspect_gap(v0: f64, v1: f64, g0: usize, g1: usize) -> f64 {
    let aspect = (v0 / g0 as f64) / (v1 / g1 as f64);
    (aspect - 1.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_dimensional() {
        assert_eq!(auto_grid(6, &[100]).unwrap(), vec![6]);
    }

    #[test]
    fn test_square_signal_gets_square_grid() {
        assert_eq!(auto_grid(4, &[64, 64]).unwrap(), vec![2, 2]);
        assert_eq!(auto_grid(9, &[64, 64]).unwrap(), vec![3, 3]);
        assert_eq!(auto_grid(16, &[64, 64]).unwrap(), vec![4, 4]);
    }

    #[test]
    fn test_wide_signal_splits_along_width() {
        // tiles of 32×32 beat 8×128
        assert_eq!(auto_grid(4, &[32, 128]).unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_prime_worker_count() {
        let grid = auto_grid(7, &[64, 64]).unwrap();
        assert_eq!(grid.iter().product::<usize>(), 7);
    }

    #[test]
    fn test_three_dimensional_rejected() {
        assert!(auto_grid(4, &[16, 16, 16]).is_err());
    }
}
