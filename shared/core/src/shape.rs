use std::ops::Range;

use crate::error::SetupError;

/// Shape of the activation grid for a signal/atom pair: `sig - atom + 1`
/// per axis. Fails when an atom does not fit inside the signal.
pub fn valid_shape(sig: &[usize], atom: &[usize]) -> Result<Vec<usize>, SetupError> {
    if sig.len() != atom.len() {
        return Err(SetupError::BadShape(format!(
            "signal has {} axes but atoms have {}",
            sig.len(),
            atom.len()
        )));
    }
    sig.iter()
        .zip(atom)
        .enumerate()
        .map(|(axis, (&s, &a))| {
            if a == 0 || s < a {
                Err(SetupError::SignalTooSmall {
                    axis,
                    signal: s,
                    atom: a,
                })
            } else {
                Ok(s - a + 1)
            }
        })
        .collect()
}

/// Number of points in a dense rectangular shape.
pub fn shape_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major flat offset of `idx` inside `shape`.
pub fn flat_index(shape: &[usize], idx: &[usize]) -> usize {
    debug_assert_eq!(shape.len(), idx.len());
    let mut flat = 0;
    for (&extent, &i) in shape.iter().zip(idx) {
        debug_assert!(i < extent);
        flat = flat * extent + i;
    }
    flat
}

/// Visits every point of a rectangular region in row-major order. The point
/// buffer is reused between calls, so the callback must not retain it.
pub fn for_each_point(bounds: &[Range<usize>], mut f: impl FnMut(&[usize])) {
    if bounds.iter().any(|r| r.is_empty()) {
        return;
    }
    let mut point: Vec<usize> = bounds.iter().map(|r| r.start).collect();
    loop {
        f(&point);
        // odometer increment, last axis fastest
        let mut axis = bounds.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            point[axis] += 1;
            if point[axis] < bounds[axis].end {
                break;
            }
            point[axis] = bounds[axis].start;
        }
    }
}

/// Axis-wise intersection of two rectangular regions, `None` when empty.
pub fn intersect(a: &[Range<usize>], b: &[Range<usize>]) -> Option<Vec<Range<usize>>> {
    debug_assert_eq!(a.len(), b.len());
    let mut out = Vec::with_capacity(a.len());
    for (ra, rb) in a.iter().zip(b) {
        let start = ra.start.max(rb.start);
        let end = ra.end.min(rb.end);
        if start >= end {
            return None;
        }
        out.push(start..end);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_shape() {
        assert_eq!(valid_shape(&[100], &[5]).unwrap(), vec![96]);
        assert_eq!(valid_shape(&[64, 32], &[8, 8]).unwrap(), vec![57, 25]);
        assert!(valid_shape(&[4], &[5]).is_err());
        assert!(valid_shape(&[4, 4], &[2]).is_err());
    }

    #[test]
    fn test_flat_index_row_major() {
        let shape = [3, 4, 5];
        let mut expect = 0;
        for_each_point(&[0..3, 0..4, 0..5], |p| {
            assert_eq!(flat_index(&shape, p), expect);
            expect += 1;
        });
        assert_eq!(expect, 60);
    }

    #[test]
    fn test_for_each_point_empty() {
        let mut n = 0;
        for_each_point(&[0..3, 2..2], |_| n += 1);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(&[0..5, 2..8], &[3..9, 0..4]), Some(vec![3..5, 2..4]));
        assert_eq!(intersect(&[0..5], &[5..9]), None);
    }
}
