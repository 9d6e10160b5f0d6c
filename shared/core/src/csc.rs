use ndarray::{ArrayD, IxDyn};

use crate::error::SetupError;
use crate::shape::{flat_index, for_each_point, valid_shape};

/// Exact single-coordinate minimizer of the penalized quadratic:
/// `softθ(b, λ) / α`, one-sided when `positive`.
pub fn soft_threshold(b: f64, reg: f64, alpha: f64, positive: bool) -> f64 {
    if positive {
        ((b - reg) / alpha).max(0.0)
    } else if b > reg {
        (b - reg) / alpha
    } else if b < -reg {
        (b + reg) / alpha
    } else {
        0.0
    }
}

/// Squared norm of each atom: per-channel power averaged over the channel
/// axis, summed over the support. All-zero atoms are clamped to 1 so they
/// can never be selected.
pub fn atom_norms(d: &ArrayD<f64>) -> Vec<f64> {
    let n_atoms = d.shape()[0];
    let n_channels = d.shape()[1];
    let atom_len: usize = d.shape()[1..].iter().product();
    let d = d.as_standard_layout();
    let data = d.as_slice().expect("standard layout");
    (0..n_atoms)
        .map(|k| {
            let power: f64 = data[k * atom_len..(k + 1) * atom_len]
                .iter()
                .map(|v| v * v)
                .sum();
            let norm = power / n_channels as f64;
            if norm == 0.0 {
                1.0
            } else {
                norm
            }
        })
        .collect()
}

/// Cross-correlation of the dictionary with itself, shape
/// `(K, K, 2a₁−1, …)`: `out[k, j, τ] = Σ_{c,t} D_k[c, t] · D_j[c, t − τ]`
/// with τ centered at `a − 1`.
pub fn cross_correlate(d: &ArrayD<f64>) -> ArrayD<f64> {
    let n_atoms = d.shape()[0];
    let n_channels = d.shape()[1];
    let atom_shape = d.shape()[2..].to_vec();
    let lag_shape: Vec<usize> = atom_shape.iter().map(|&a| 2 * a - 1).collect();

    let mut out_shape = vec![n_atoms, n_atoms];
    out_shape.extend(&lag_shape);
    let mut out = ArrayD::zeros(IxDyn(&out_shape));

    let d = d.as_standard_layout();
    let d_flat = d.as_slice().expect("standard layout");
    let d_shape = d.shape().to_vec();
    let out_flat = out.as_slice_mut().expect("freshly allocated");

    let lag_bounds: Vec<_> = lag_shape.iter().map(|&e| 0..e).collect();
    let atom_bounds: Vec<_> = atom_shape.iter().map(|&e| 0..e).collect();
    for_each_point(&lag_bounds, |m| {
        // τ = m − (a − 1), per axis
        let tau: Vec<isize> = m
            .iter()
            .zip(&atom_shape)
            .map(|(&m, &a)| m as isize - (a as isize - 1))
            .collect();
        for k in 0..n_atoms {
            for j in 0..n_atoms {
                let mut acc = 0.0;
                for c in 0..n_channels {
                    for_each_point(&atom_bounds, |t| {
                        let mut shifted = Vec::with_capacity(t.len() + 2);
                        shifted.push(j);
                        shifted.push(c);
                        for ((&t, &tau), &a) in t.iter().zip(&tau).zip(&atom_shape) {
                            let t2 = t as isize - tau;
                            if t2 < 0 || t2 >= a as isize {
                                return;
                            }
                            shifted.push(t2 as usize);
                        }
                        let mut lhs = Vec::with_capacity(t.len() + 2);
                        lhs.push(k);
                        lhs.push(c);
                        lhs.extend_from_slice(t);
                        acc += d_flat[flat_index(&d_shape, &lhs)]
                            * d_flat[flat_index(&d_shape, &shifted)];
                    });
                }
                let mut at = vec![k, j];
                at.extend_from_slice(m);
                out_flat[flat_index(&out_shape, &at)] = acc;
            }
        }
    });
    out
}

/// Correlation of every atom with the signal over the valid grid:
/// `out[k, p] = Σ_{c,t} D_k[c, t] · X[c, p + t]`, shape `(K, V₁, …)`.
pub fn correlate(d: &ArrayD<f64>, x: &ArrayD<f64>) -> Result<ArrayD<f64>, SetupError> {
    let n_atoms = d.shape()[0];
    let n_channels = d.shape()[1];
    if x.shape()[0] != n_channels {
        return Err(SetupError::ChannelMismatch {
            dict: n_channels,
            signal: x.shape()[0],
        });
    }
    let atom_shape = d.shape()[2..].to_vec();
    let valid = valid_shape(&x.shape()[1..], &atom_shape)?;

    let mut out_shape = vec![n_atoms];
    out_shape.extend(&valid);
    let mut out = ArrayD::zeros(IxDyn(&out_shape));

    let d = d.as_standard_layout();
    let x = x.as_standard_layout();
    let d_flat = d.as_slice().expect("standard layout");
    let x_flat = x.as_slice().expect("standard layout");
    let d_shape = d.shape().to_vec();
    let x_shape = x.shape().to_vec();
    let out_flat = out.as_slice_mut().expect("freshly allocated");

    let valid_bounds: Vec<_> = valid.iter().map(|&e| 0..e).collect();
    let atom_bounds: Vec<_> = atom_shape.iter().map(|&e| 0..e).collect();
    for_each_point(&valid_bounds, |p| {
        for k in 0..n_atoms {
            let mut acc = 0.0;
            for c in 0..n_channels {
                for_each_point(&atom_bounds, |t| {
                    let mut d_at = Vec::with_capacity(t.len() + 2);
                    d_at.push(k);
                    d_at.push(c);
                    d_at.extend_from_slice(t);
                    let mut x_at = Vec::with_capacity(t.len() + 1);
                    x_at.push(c);
                    x_at.extend(p.iter().zip(t).map(|(&p, &t)| p + t));
                    acc += d_flat[flat_index(&d_shape, &d_at)]
                        * x_flat[flat_index(&x_shape, &x_at)];
                });
            }
            let mut at = vec![k];
            at.extend_from_slice(p);
            out_flat[flat_index(&out_shape, &at)] = acc;
        }
    });
    Ok(out)
}

/// Dense reconstruction `Σ_k D_k ∗ Z_k`, shape `(C, S₁, …)`.
pub fn reconstruct(d: &ArrayD<f64>, z: &ArrayD<f64>) -> Result<ArrayD<f64>, SetupError> {
    let n_atoms = d.shape()[0];
    let n_channels = d.shape()[1];
    if z.shape()[0] != n_atoms {
        return Err(SetupError::BadShape(format!(
            "activation map has {} atoms but the dictionary has {}",
            z.shape()[0],
            n_atoms
        )));
    }
    let atom_shape = d.shape()[2..].to_vec();
    let valid = z.shape()[1..].to_vec();
    let sig_shape: Vec<usize> = valid
        .iter()
        .zip(&atom_shape)
        .map(|(&v, &a)| v + a - 1)
        .collect();

    let mut out_shape = vec![n_channels];
    out_shape.extend(&sig_shape);
    let mut out = ArrayD::zeros(IxDyn(&out_shape));

    let d = d.as_standard_layout();
    let z = z.as_standard_layout();
    let d_flat = d.as_slice().expect("standard layout");
    let z_flat = z.as_slice().expect("standard layout");
    let d_shape = d.shape().to_vec();
    let z_shape = z.shape().to_vec();
    let out_flat = out.as_slice_mut().expect("freshly allocated");

    let valid_bounds: Vec<_> = valid.iter().map(|&e| 0..e).collect();
    let atom_bounds: Vec<_> = atom_shape.iter().map(|&e| 0..e).collect();
    for k in 0..n_atoms {
        for_each_point(&valid_bounds, |p| {
            let mut z_at = Vec::with_capacity(p.len() + 1);
            z_at.push(k);
            z_at.extend_from_slice(p);
            let weight = z_flat[flat_index(&z_shape, &z_at)];
            if weight == 0.0 {
                return;
            }
            for c in 0..n_channels {
                for_each_point(&atom_bounds, |t| {
                    let mut d_at = Vec::with_capacity(t.len() + 2);
                    d_at.push(k);
                    d_at.push(c);
                    d_at.extend_from_slice(t);
                    let mut o_at = Vec::with_capacity(t.len() + 1);
                    o_at.push(c);
                    o_at.extend(p.iter().zip(t).map(|(&p, &t)| p + t));
                    out_flat[flat_index(&out_shape, &o_at)] +=
                        weight * d_flat[flat_index(&d_shape, &d_at)];
                });
            }
        });
    }
    Ok(out)
}

/// ½‖X − Σ_k D_k ∗ Z_k‖² + reg·‖Z‖₁
pub fn cost(x: &ArrayD<f64>, d: &ArrayD<f64>, z: &ArrayD<f64>, reg: f64) -> Result<f64, SetupError> {
    let rec = reconstruct(d, z)?;
    if rec.shape() != x.shape() {
        return Err(SetupError::BadShape(format!(
            "reconstruction shape {:?} does not match the signal {:?}",
            rec.shape(),
            x.shape()
        )));
    }
    let residual: f64 = x
        .iter()
        .zip(rec.iter())
        .map(|(&xv, &rv)| (xv - rv) * (xv - rv))
        .sum();
    let l1: f64 = z.iter().map(|v| v.abs()).sum();
    Ok(0.5 * residual + reg * l1)
}

/// Smallest regularization for which Z = 0 is optimal: `‖Dᵀ ⋆ X‖∞`.
pub fn lambda_max(x: &ArrayD<f64>, d: &ArrayD<f64>) -> Result<f64, SetupError> {
    Ok(correlate(d, x)?.iter().fold(0.0f64, |m, v| m.max(v.abs())))
}

/// Activation autocorrelation, shape `(K, K, 2a₁−1, …)`:
/// `out[k, j, τ] = Σ_p Z[k, p] · Z[j, p + τ]` over in-range pairs.
pub fn compute_ztz(z: &ArrayD<f64>, atom_shape: &[usize]) -> ArrayD<f64> {
    let n_atoms = z.shape()[0];
    let valid = z.shape()[1..].to_vec();
    let lag_shape: Vec<usize> = atom_shape.iter().map(|&a| 2 * a - 1).collect();

    let mut out_shape = vec![n_atoms, n_atoms];
    out_shape.extend(&lag_shape);
    let mut out = ArrayD::zeros(IxDyn(&out_shape));

    let z = z.as_standard_layout();
    let z_flat = z.as_slice().expect("standard layout");
    let z_shape = z.shape().to_vec();
    let out_flat = out.as_slice_mut().expect("freshly allocated");

    let lag_bounds: Vec<_> = lag_shape.iter().map(|&e| 0..e).collect();
    for_each_point(&lag_bounds, |m| {
        let tau: Vec<isize> = m
            .iter()
            .zip(atom_shape)
            .map(|(&m, &a)| m as isize - (a as isize - 1))
            .collect();
        // anchors p with both p and p + τ inside the valid grid
        let anchor_bounds: Vec<_> = valid
            .iter()
            .zip(&tau)
            .map(|(&v, &t)| {
                let lo = (-t).max(0) as usize;
                let hi = (v as isize).min(v as isize - t).max(0) as usize;
                lo..hi
            })
            .collect();
        for k in 0..n_atoms {
            for j in 0..n_atoms {
                let mut acc = 0.0;
                for_each_point(&anchor_bounds, |p| {
                    let mut a_at = Vec::with_capacity(p.len() + 1);
                    a_at.push(k);
                    a_at.extend_from_slice(p);
                    let mut b_at = Vec::with_capacity(p.len() + 1);
                    b_at.push(j);
                    b_at.extend(p.iter().zip(&tau).map(|(&p, &t)| (p as isize + t) as usize));
                    acc += z_flat[flat_index(&z_shape, &a_at)]
                        * z_flat[flat_index(&z_shape, &b_at)];
                });
                let mut at = vec![k, j];
                at.extend_from_slice(m);
                out_flat[flat_index(&out_shape, &at)] = acc;
            }
        }
    });
    out
}

/// Correlation of the activations with the signal, shape `(K, C, a₁, …)`:
/// `out[k, c, t] = Σ_p Z[k, p] · X[c, p + t]`.
pub fn compute_ztx(
    z: &ArrayD<f64>,
    x: &ArrayD<f64>,
    atom_shape: &[usize],
) -> Result<ArrayD<f64>, SetupError> {
    let n_atoms = z.shape()[0];
    let n_channels = x.shape()[0];
    let valid = z.shape()[1..].to_vec();
    let expect_valid = valid_shape(&x.shape()[1..], atom_shape)?;
    if expect_valid != valid {
        return Err(SetupError::BadShape(format!(
            "activation shape {valid:?} does not match the valid grid {expect_valid:?}"
        )));
    }

    let mut out_shape = vec![n_atoms, n_channels];
    out_shape.extend(atom_shape);
    let mut out = ArrayD::zeros(IxDyn(&out_shape));

    let z = z.as_standard_layout();
    let x = x.as_standard_layout();
    let z_flat = z.as_slice().expect("standard layout");
    let x_flat = x.as_slice().expect("standard layout");
    let z_shape = z.shape().to_vec();
    let x_shape = x.shape().to_vec();
    let out_flat = out.as_slice_mut().expect("freshly allocated");

    let valid_bounds: Vec<_> = valid.iter().map(|&e| 0..e).collect();
    let atom_bounds: Vec<_> = atom_shape.iter().map(|&e| 0..e).collect();
    for k in 0..n_atoms {
        for_each_point(&valid_bounds, |p| {
            let mut z_at = Vec::with_capacity(p.len() + 1);
            z_at.push(k);
            z_at.extend_from_slice(p);
            let weight = z_flat[flat_index(&z_shape, &z_at)];
            if weight == 0.0 {
                return;
            }
            for c in 0..n_channels {
                for_each_point(&atom_bounds, |t| {
                    let mut x_at = Vec::with_capacity(t.len() + 1);
                    x_at.push(c);
                    x_at.extend(p.iter().zip(t).map(|(&p, &t)| p + t));
                    let mut o_at = vec![k, c];
                    o_at.extend_from_slice(t);
                    out_flat[flat_index(&out_shape, &o_at)] +=
                        weight * x_flat[flat_index(&x_shape, &x_at)];
                });
            }
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    fn tensor(shape: &[usize], data: Vec<f64>) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn test_soft_threshold() {
        assert_abs_diff_eq!(soft_threshold(3.0, 1.0, 2.0, false), 1.0);
        assert_abs_diff_eq!(soft_threshold(-3.0, 1.0, 2.0, false), -1.0);
        assert_abs_diff_eq!(soft_threshold(0.5, 1.0, 2.0, false), 0.0);
        assert_abs_diff_eq!(soft_threshold(-3.0, 1.0, 2.0, true), 0.0);
        assert_abs_diff_eq!(soft_threshold(3.0, 1.0, 2.0, true), 1.0);
    }

    #[test]
    fn test_atom_norms_clamps_zero() {
        let d = tensor(&[2, 1, 2], vec![1.0, 2.0, 0.0, 0.0]);
        assert_eq!(atom_norms(&d), vec![5.0, 1.0]);
    }

    #[test]
    fn test_atom_norms_average_over_channels() {
        let d = tensor(&[1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        // (1 + 4 + 9 + 16) / 2 channels
        assert_eq!(atom_norms(&d), vec![15.0]);
    }

    #[test]
    fn test_correlate_1d() {
        // single atom [1, 2] against an impulse at index 2
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let x = tensor(&[1, 5], vec![0.0, 0.0, 1.0, 0.0, 0.0]);
        let dtx = correlate(&d, &x).unwrap();
        assert_eq!(dtx.shape(), &[1, 4]);
        assert_eq!(dtx.as_slice().unwrap(), &[0.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_reconstruct_matches_convolution() {
        let d = tensor(&[1, 1, 3], vec![1.0, -1.0, 0.5]);
        let mut z = ArrayD::zeros(IxDyn(&[1, 6]));
        z[[0, 1]] = 2.0;
        z[[0, 4]] = -1.0;
        let rec = reconstruct(&d, &z).unwrap();
        assert_eq!(rec.shape(), &[1, 8]);
        let expect = [0.0, 2.0, -2.0, 1.0, -1.0, 1.0, -0.5, 0.0];
        for (got, want) in rec.iter().zip(expect) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cross_correlate_center_and_symmetry() {
        let d = tensor(&[2, 1, 3], vec![1.0, 2.0, 3.0, 0.0, 1.0, -1.0]);
        let dtd = cross_correlate(&d);
        assert_eq!(dtd.shape(), &[2, 2, 5]);
        // with one channel the center lag equals α
        let norms = atom_norms(&d);
        assert_abs_diff_eq!(dtd[[0, 0, 2]], norms[0]);
        assert_abs_diff_eq!(dtd[[1, 1, 2]], norms[1]);
        // out[k, j, τ] == out[j, k, −τ]
        for m in 0..5 {
            assert_abs_diff_eq!(dtd[[0, 1, m]], dtd[[1, 0, 4 - m]]);
        }
    }

    #[test]
    fn test_cross_correlate_keeps_channel_sum() {
        // DᵀD sums over channels while α is the channel mean
        let d = tensor(&[1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let dtd = cross_correlate(&d);
        assert_abs_diff_eq!(dtd[[0, 0, 1]], 30.0);
        assert_abs_diff_eq!(2.0 * atom_norms(&d)[0], dtd[[0, 0, 1]]);
    }

    #[test]
    fn test_cross_correlate_matches_definition() {
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let dtd = cross_correlate(&d);
        // τ ∈ {−1, 0, 1}: Σ_t d(t)·d(t−τ)
        assert_eq!(dtd.as_slice().unwrap(), &[2.0, 5.0, 2.0]);
    }

    #[test]
    fn test_cost_of_zero_activation() {
        let d = tensor(&[1, 1, 2], vec![1.0, 1.0]);
        let x = tensor(&[1, 4], vec![1.0, 2.0, 0.0, -1.0]);
        let z = ArrayD::zeros(IxDyn(&[1, 3]));
        assert_abs_diff_eq!(cost(&x, &d, &z, 0.7).unwrap(), 3.0);
    }

    #[test]
    fn test_lambda_max() {
        let d = tensor(&[1, 1, 2], vec![1.0, 1.0]);
        let x = tensor(&[1, 4], vec![1.0, 2.0, 0.0, -1.0]);
        // correlations: [3, 2, -1]
        assert_abs_diff_eq!(lambda_max(&x, &d).unwrap(), 3.0);
    }

    #[test]
    fn test_ztz_matches_brute_force() {
        let z = tensor(&[2, 4], vec![1.0, 0.0, 2.0, -1.0, 0.5, 1.0, 0.0, 3.0]);
        let ztz = compute_ztz(&z, &[2]);
        assert_eq!(ztz.shape(), &[2, 2, 3]);
        for k in 0..2 {
            for j in 0..2 {
                for (m, tau) in [(0usize, -1isize), (1, 0), (2, 1)] {
                    let mut acc = 0.0;
                    for p in 0..4isize {
                        let q = p + tau;
                        if (0..4).contains(&q) {
                            acc += z[[k, p as usize]] * z[[j, q as usize]];
                        }
                    }
                    assert_abs_diff_eq!(ztz[[k, j, m]], acc, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_ztx_matches_brute_force() {
        let d_shape = [2usize];
        let z = tensor(&[1, 3], vec![1.0, -2.0, 0.0]);
        let x = tensor(&[1, 4], vec![0.5, 1.0, -1.0, 2.0]);
        let ztx = compute_ztx(&z, &x, &d_shape).unwrap();
        assert_eq!(ztx.shape(), &[1, 1, 2]);
        assert_abs_diff_eq!(ztx[[0, 0, 0]], 1.0 * 0.5 - 2.0 * 1.0);
        assert_abs_diff_eq!(ztx[[0, 0, 1]], 1.0 * 1.0 - 2.0 * -1.0);
    }
}
