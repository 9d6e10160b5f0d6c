use std::ops::Range;

use ndarray::{ArrayD, IxDyn};
use tracing::trace;

use tessella_core::{
    correlate, flat_index, for_each_point, intersect, resolve_n_seg, soft_threshold, Segmentation,
    SetupError, WireTensor,
};
use tessella_network::{BorderUpdate, Strip, TaskInit};

use crate::error::WorkerError;

/// One worker's view of the problem: its own activations over the inner
/// region, the gradient field β over the halo-extended region, and the
/// candidate segments scanned by the solver.
///
/// β satisfies, for every coordinate of the extended region not currently
/// in flight from a neighbor:
///   `β[k, p] = [D_kᵀ ⋆ (X − Σ_j D_j ∗ Z_j)](p) + α_k · Z[k, p]`
/// so the optimal update of any coordinate is one soft-threshold away.
pub struct Tile {
    pub rank: usize,
    n_atoms: usize,
    n_channels: usize,
    atom_shape: Vec<usize>,
    workers: Segmentation,
    /// Global bounds of the owned region.
    inner: Vec<Range<usize>>,
    /// Global bounds of the halo-extended region.
    ext: Vec<Range<usize>>,
    /// `inner.start − ext.start` per axis.
    off: Vec<usize>,
    inner_shape: Vec<usize>,
    ext_shape: Vec<usize>,
    /// Signal slice covering the extended region plus atom support.
    x: ArrayD<f64>,
    /// Owned activations, shape (K, inner…).
    z: ArrayD<f64>,
    /// Gradient field, shape (K, ext…).
    beta: ArrayD<f64>,
    /// Optimal update per owned coordinate, shape (K, inner…).
    dz_opt: ArrayD<f64>,
    /// Coordinates allowed to move when the support is frozen.
    support: Option<Vec<bool>>,
    dictionary: ArrayD<f64>,
    dtd: ArrayD<f64>,
    norms: Vec<f64>,
    reg: f64,
    tol: f64,
    z_positive: bool,
    freeze_support: bool,
    /// Candidate segments over the inner region (local coordinates).
    segments: Segmentation,
    active: Vec<bool>,
    neighbors: Vec<(Vec<isize>, usize)>,
}

/// A candidate coordinate update inside one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub atom: usize,
    /// Inner-local coordinates.
    pub pos: Vec<usize>,
    pub dz: f64,
}

impl Tile {
    pub fn new(init: TaskInit) -> Result<Self, WorkerError> {
        let TaskInit {
            rank,
            worker_grid,
            valid_shape,
            reg,
            config,
            dictionary,
            dtd,
            norms,
            x_tile,
            z0_tile,
            ..
        } = init;
        let rank = rank as usize;
        let dictionary = dictionary.into_array()?;
        let n_atoms = dictionary.shape()[0];
        let n_channels = dictionary.shape()[1];
        let atom_shape = dictionary.shape()[2..].to_vec();
        let valid_shape: Vec<usize> = valid_shape.iter().map(|&v| v as usize).collect();
        let overlap: Vec<usize> = atom_shape.iter().map(|&a| a - 1).collect();
        let grid: Vec<usize> = worker_grid.iter().map(|&g| g as usize).collect();

        let workers = Segmentation::new(grid, valid_shape, overlap)?;
        let inner = workers.inner_bounds(rank);
        let ext = workers.extended_bounds(rank);
        let off: Vec<usize> = inner
            .iter()
            .zip(&ext)
            .map(|(i, e)| i.start - e.start)
            .collect();
        let inner_shape: Vec<usize> = inner.iter().map(Range::len).collect();
        let ext_shape: Vec<usize> = ext.iter().map(Range::len).collect();
        let neighbors = workers.neighbors(rank);

        let x = x_tile.into_array()?;
        let expect_x: Vec<usize> = std::iter::once(n_channels)
            .chain(ext_shape.iter().zip(&atom_shape).map(|(&e, &a)| e + a - 1))
            .collect();
        if x.shape() != expect_x.as_slice() {
            return Err(SetupError::BadShape(format!(
                "signal tile shape {:?} does not match the expected {:?}",
                x.shape(),
                expect_x
            ))
            .into());
        }

        let dtd = dtd.into_array()?;

        let n_seg = resolve_n_seg(config.strategy, config.n_seg, &inner_shape, &atom_shape);
        for (axis, (&count, (&extent, &atom))) in n_seg
            .iter()
            .zip(inner_shape.iter().zip(&atom_shape))
            .enumerate()
        {
            let seg_extent = extent / count;
            if count > 1 && seg_extent < 2 * atom - 1 {
                return Err(SetupError::SegmentTooSmall {
                    axis,
                    extent: seg_extent,
                    min: 2 * atom - 1,
                }
                .into());
            }
        }
        let segments = Segmentation::new(n_seg, inner_shape.clone(), vec![0; inner_shape.len()])?;
        let active = vec![true; segments.n_segments()];

        let mut z_shape = vec![n_atoms];
        z_shape.extend(&inner_shape);

        // local part of the warm gradient: atoms against the signal tile
        let beta = correlate(&dictionary, &x)?;
        debug_assert_eq!(&beta.shape()[1..], ext_shape.as_slice());

        let mut tile = Self {
            rank,
            n_atoms,
            n_channels,
            atom_shape,
            workers,
            inner,
            ext,
            off,
            inner_shape,
            ext_shape,
            x,
            z: ArrayD::zeros(IxDyn(&z_shape)),
            beta,
            dz_opt: ArrayD::zeros(IxDyn(&z_shape)),
            support: None,
            dictionary,
            dtd,
            norms,
            reg,
            tol: config.tol,
            z_positive: config.z_positive,
            freeze_support: config.freeze_support,
            segments,
            active,
            neighbors,
        };

        if let Some(z0) = z0_tile {
            tile.apply_warm_start(z0.into_array()?)?;
        }
        let full: Vec<Range<usize>> = tile.ext_shape.iter().map(|&e| 0..e).collect();
        tile.refresh_window(&full);
        Ok(tile)
    }

    fn apply_warm_start(&mut self, z0: ArrayD<f64>) -> Result<(), WorkerError> {
        let mut expect = vec![self.n_atoms];
        expect.extend(&self.ext_shape);
        if z0.shape() != expect.as_slice() {
            return Err(SetupError::BadShape(format!(
                "warm start tile shape {:?} does not match the extended region {:?}",
                z0.shape(),
                expect
            ))
            .into());
        }
        // copy the owned part
        let inner_len: usize = self.inner_shape.iter().product();
        let mut support = vec![false; self.n_atoms * inner_len];
        let inner_local: Vec<Range<usize>> = self.inner_shape.iter().map(|&e| 0..e).collect();
        {
            let off = &self.off;
            let inner_shape = &self.inner_shape;
            let z = &mut self.z;
            for k in 0..self.n_atoms {
                let mut cursor = k * inner_len;
                for_each_point(&inner_local, |p| {
                    let value = z0[&at(k, &add(p, off))[..]];
                    z[&at(k, p)[..]] = value;
                    debug_assert_eq!(cursor % inner_len, flat_index(inner_shape, p));
                    support[cursor] = value != 0.0;
                    cursor += 1;
                });
            }
        }
        if self.freeze_support {
            self.support = Some(support);
        }
        // fold every non-zero of the extended region into β
        let ext_local: Vec<Range<usize>> = self.ext_shape.iter().map(|&e| 0..e).collect();
        let mut nonzeros = Vec::new();
        for k in 0..self.n_atoms {
            for_each_point(&ext_local, |p| {
                let value = z0[&at(k, p)[..]];
                if value != 0.0 {
                    nonzeros.push((k, p.to_vec(), value));
                }
            });
        }
        for (k, p, value) in nonzeros {
            self.apply_beta_delta(k, &p, value);
        }
        Ok(())
    }

    pub fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    pub fn n_segments(&self) -> usize {
        self.segments.n_segments()
    }

    pub fn tol(&self) -> f64 {
        self.tol
    }

    pub fn neighbors(&self) -> &[(Vec<isize>, usize)] {
        &self.neighbors
    }

    pub fn inner_bounds(&self) -> &[Range<usize>] {
        &self.inner
    }

    pub fn z(&self) -> &ArrayD<f64> {
        &self.z
    }

    pub fn is_active(&self, segment: usize) -> bool {
        self.active[segment]
    }

    pub fn any_active(&self) -> bool {
        self.active.iter().any(|&a| a)
    }

    pub fn deactivate(&mut self, segment: usize) {
        self.active[segment] = false;
    }

    /// First active segment at or after `cursor`, scanning cyclically.
    pub fn next_active_segment(&self, cursor: usize) -> Option<usize> {
        let n = self.segments.n_segments();
        (0..n).map(|i| (cursor + i) % n).find(|&s| self.active[s])
    }

    /// Optimal update of one owned coordinate, given the current β.
    pub fn dz_opt_at(&self, atom: usize, pos: &[usize]) -> f64 {
        self.dz_opt[&at(atom, pos)[..]]
    }

    fn compute_dz_opt(&self, atom: usize, pos: &[usize]) -> f64 {
        if let Some(support) = &self.support {
            let mut shape = vec![self.n_atoms];
            shape.extend(&self.inner_shape);
            let mut idx = vec![atom];
            idx.extend_from_slice(pos);
            if !support[flat_index(&shape, &idx)] {
                return 0.0;
            }
        }
        let b = self.beta[&at(atom, &add(pos, &self.off))[..]];
        let target = soft_threshold(b, self.reg, self.norms[atom], self.z_positive);
        target - self.z[&at(atom, pos)[..]]
    }

    /// Greedy scan of one segment. Returns the best candidate overall and
    /// the best candidate outside the cross-tile overlap strips; strict
    /// comparison keeps ties on the lexicographically first (k, p).
    pub fn best_in_segment(&self, segment: usize) -> (Option<Candidate>, Option<Candidate>) {
        let bounds = self.segments.inner_bounds(segment);
        let mut best: Option<Candidate> = None;
        let mut interior: Option<Candidate> = None;
        for atom in 0..self.n_atoms {
            for_each_point(&bounds, |p| {
                let dz = self.dz_opt[&at(atom, p)[..]];
                let magnitude = dz.abs();
                if best.as_ref().map_or(true, |c| magnitude > c.dz.abs()) {
                    best = Some(Candidate {
                        atom,
                        pos: p.to_vec(),
                        dz,
                    });
                }
                if !self.in_overlap(p)
                    && interior.as_ref().map_or(true, |c| magnitude > c.dz.abs())
                {
                    interior = Some(Candidate {
                        atom,
                        pos: p.to_vec(),
                        dz,
                    });
                }
            });
        }
        (best, interior)
    }

    /// Largest optimal update over one segment.
    pub fn segment_max(&self, segment: usize) -> f64 {
        let bounds = self.segments.inner_bounds(segment);
        let mut max = 0.0f64;
        for atom in 0..self.n_atoms {
            for_each_point(&bounds, |p| {
                max = max.max(self.dz_opt[&at(atom, p)[..]].abs());
            });
        }
        max
    }

    pub fn segment_bounds(&self, segment: usize) -> Vec<Range<usize>> {
        self.segments.inner_bounds(segment)
    }

    /// Whether an inner-local coordinate lies within the strip of width
    /// a − 1 shared with some neighbor's halo.
    pub fn in_overlap(&self, pos: &[usize]) -> bool {
        pos.iter().enumerate().any(|(axis, &p)| {
            let margin = self.atom_shape[axis] - 1;
            let has_low = self.inner[axis].start > 0;
            let has_high = self.inner[axis].end < self.workers.signal_shape()[axis];
            (has_low && p < margin) || (has_high && p + margin >= self.inner_shape[axis])
        })
    }

    /// Applies an accepted update to the owned activations and β.
    pub fn apply_local(&mut self, atom: usize, pos: &[usize], dz: f64) {
        self.z[&at(atom, pos)[..]] += dz;
        let ext_pos = add(pos, &self.off);
        self.apply_beta_delta(atom, &ext_pos, dz);
        trace!(atom, ?pos, dz, "applied local update");
    }

    /// Applies a neighbor's update to β over our halo.
    pub fn apply_remote(&mut self, update: &BorderUpdate) -> Result<(), WorkerError> {
        let global: Vec<usize> = update.pos.iter().map(|&p| p as usize).collect();
        let local = self
            .workers
            .local_of(self.rank, &global)
            .ok_or_else(|| {
                WorkerError::Protocol(format!(
                    "border update at {global:?} outside the extended region of worker {}",
                    self.rank
                ))
            })?;
        self.apply_beta_delta(update.atom as usize, &local, update.dz);
        Ok(())
    }

    /// Incremental β maintenance: when Z[k₀, p₀] changes by dz, every β
    /// coordinate within the atom cross-correlation support moves by
    /// `−DᵀD[k, k₀](p₀ − p) · dz`, and the updated coordinate re-adds its
    /// diagonal α·dz. Refreshes dz_opt and segment activity around p₀.
    fn apply_beta_delta(&mut self, atom0: usize, pos0: &[usize], dz: f64) {
        let window: Vec<Range<usize>> = pos0
            .iter()
            .zip(&self.atom_shape)
            .zip(&self.ext_shape)
            .map(|((&p, &a), &len)| p.saturating_sub(a - 1)..(p + a).min(len))
            .collect();
        {
            let beta = &mut self.beta;
            let dtd = &self.dtd;
            let atom_shape = &self.atom_shape;
            for atom in 0..self.n_atoms {
                for_each_point(&window, |p| {
                    // lag index: (p₀ − p) + (a − 1) per axis
                    let mut dtd_at = vec![atom, atom0];
                    dtd_at.extend(
                        p.iter()
                            .zip(pos0)
                            .zip(atom_shape)
                            .map(|((&p, &p0), &a)| p0 + a - 1 - p),
                    );
                    beta[&at(atom, p)[..]] -= dtd[&dtd_at[..]] * dz;
                });
            }
        }
        self.beta[&at(atom0, pos0)[..]] += self.norms[atom0] * dz;
        self.refresh_window(&window);
    }

    /// Recomputes dz_opt over the inner part of an extended-frame window
    /// and re-activates any segment that now holds a workable coordinate.
    fn refresh_window(&mut self, window_ext: &[Range<usize>]) {
        let mut inner_window = Vec::with_capacity(window_ext.len());
        for ((w, &off), &len) in window_ext.iter().zip(&self.off).zip(&self.inner_shape) {
            let lo = w.start.max(off) - off;
            let hi = w.end.min(off + len).saturating_sub(off);
            if lo >= hi {
                return;
            }
            inner_window.push(lo..hi);
        }
        let mut fresh = Vec::new();
        for atom in 0..self.n_atoms {
            for_each_point(&inner_window, |p| {
                fresh.push((at(atom, p), self.compute_dz_opt(atom, p)));
            });
        }
        for (idx, value) in fresh {
            self.dz_opt[&idx[..]] = value;
        }
        for segment in 0..self.segments.n_segments() {
            if self.active[segment] {
                continue;
            }
            let bounds = self.segments.inner_bounds(segment);
            if let Some(shared) = intersect(&bounds, &inner_window) {
                let mut workable = false;
                for atom in 0..self.n_atoms {
                    for_each_point(&shared, |p| {
                        if self.dz_opt[&at(atom, p)[..]].abs() > self.tol {
                            workable = true;
                        }
                    });
                }
                if workable {
                    self.active[segment] = true;
                }
            }
        }
    }

    /// Neighbors whose halo contains the given inner-local coordinate.
    pub fn neighbors_of_update(&self, pos: &[usize]) -> Vec<usize> {
        self.neighbors
            .iter()
            .filter(|(dir, _)| {
                dir.iter().enumerate().all(|(axis, &d)| {
                    let margin = self.atom_shape[axis] - 1;
                    match d {
                        -1 => pos[axis] < margin,
                        1 => pos[axis] + margin >= self.inner_shape[axis],
                        _ => true,
                    }
                })
            })
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn global_of_inner(&self, pos: &[usize]) -> Vec<usize> {
        self.inner
            .iter()
            .zip(pos)
            .map(|(r, &p)| r.start + p)
            .collect()
    }

    /// Our inner values overlapping a neighbor's halo, as a wire strip.
    fn pack_strip(&self, neighbor: usize, values: &ArrayD<f64>, frame_off: &[usize]) -> Strip {
        let region = intersect(&self.inner, &self.workers.extended_bounds(neighbor))
            .expect("neighbors always share a border region");
        let extent: Vec<usize> = region.iter().map(Range::len).collect();
        let mut shape = vec![self.n_atoms];
        shape.extend(&extent);
        let mut data = Vec::with_capacity(shape.iter().product());
        let local: Vec<Range<usize>> = region
            .iter()
            .zip(&self.inner)
            .zip(frame_off)
            .map(|((r, i), &off)| r.start - i.start + off..r.end - i.start + off)
            .collect();
        for atom in 0..self.n_atoms {
            for_each_point(&local, |p| {
                data.push(values[&at(atom, p)[..]]);
            });
        }
        Strip {
            bounds: region
                .iter()
                .map(|r| (r.start as u32, r.end as u32))
                .collect(),
            values: WireTensor {
                shape: shape.iter().map(|&s| s as u32).collect(),
                data,
            },
        }
    }

    /// β values for one neighbor's warm-up exchange.
    pub fn beta_strip_for(&self, neighbor: usize) -> Strip {
        let off = self.off.clone();
        self.pack_strip(neighbor, &self.beta, &off)
    }

    /// Final activations for one neighbor's sufficient statistics.
    pub fn z_strip_for(&self, neighbor: usize) -> Strip {
        let zero_off = vec![0; self.off.len()];
        self.pack_strip(neighbor, &self.z, &zero_off)
    }

    /// Overwrites halo β values with a neighbor's authoritative ones.
    pub fn apply_beta_strip(&mut self, strip: &Strip) -> Result<(), WorkerError> {
        self.unpack_strip(strip, |tile, atom, ext_pos, value| {
            tile.beta[&at(atom, ext_pos)[..]] = value;
        })
    }

    fn unpack_strip(
        &mut self,
        strip: &Strip,
        mut write: impl FnMut(&mut Self, usize, &[usize], f64),
    ) -> Result<(), WorkerError> {
        let region: Vec<Range<usize>> = strip
            .bounds
            .iter()
            .map(|&(s, e)| s as usize..e as usize)
            .collect();
        let mut cursor = 0;
        let data = &strip.values.data;
        let expected: usize = self.n_atoms * region.iter().map(Range::len).product::<usize>();
        if data.len() != expected {
            return Err(WorkerError::Protocol(format!(
                "strip payload of {} values does not match region {region:?}",
                data.len()
            )));
        }
        let mut out_of_range = false;
        for atom in 0..self.n_atoms {
            for_each_point(&region, |global| {
                let value = data[cursor];
                cursor += 1;
                let mut local = Vec::with_capacity(global.len());
                for (&g, r) in global.iter().zip(&self.ext) {
                    if !r.contains(&g) {
                        out_of_range = true;
                        return;
                    }
                    local.push(g - r.start);
                }
                write(&mut *self, atom, &local, value);
            });
        }
        if out_of_range {
            return Err(WorkerError::Protocol(
                "strip region extends outside the extended tile".into(),
            ));
        }
        Ok(())
    }

    /// Shared probe point for the warm-up consistency check: the corner
    /// where tile 0 meets its diagonal neighbor, visible to every tile
    /// around it.
    pub fn warm_probe_point(&self) -> Vec<usize> {
        self.workers.inner_shape(0)
    }

    /// β value of atom 0 at a global probe point, when we can see it.
    pub fn probe_beta(&self, global: &[usize]) -> Option<f64> {
        self.workers
            .local_of(self.rank, global)
            .map(|local| self.beta[&at(0, &local)[..]])
    }

    /// Non-zero count per atom over the owned region.
    pub fn z_nnz(&self) -> Vec<u64> {
        let inner_len: usize = self.inner_shape.iter().product();
        let flat = self.z.as_slice().expect("activations are contiguous");
        (0..self.n_atoms)
            .map(|k| {
                flat[k * inner_len..(k + 1) * inner_len]
                    .iter()
                    .filter(|&&v| v != 0.0)
                    .count() as u64
            })
            .collect()
    }

    /// Extended-frame activations: our own inner values plus the neighbor
    /// strips received at result time.
    pub fn z_with_halo(&mut self, strips: &[Strip]) -> Result<ArrayD<f64>, WorkerError> {
        let mut shape = vec![self.n_atoms];
        shape.extend(&self.ext_shape);
        let mut z_ext = ArrayD::zeros(IxDyn(&shape));
        let inner_local: Vec<Range<usize>> = self.inner_shape.iter().map(|&e| 0..e).collect();
        for atom in 0..self.n_atoms {
            for_each_point(&inner_local, |p| {
                z_ext[&at(atom, &add(p, &self.off))[..]] = self.z[&at(atom, p)[..]];
            });
        }
        for strip in strips {
            self.unpack_strip(strip, |_tile, atom, ext_pos, value| {
                z_ext[&at(atom, ext_pos)[..]] = value;
            })?;
        }
        Ok(z_ext)
    }

    /// This tile's summand of the activation autocorrelation: anchors run
    /// over the owned region, partners may reach into the halo.
    pub fn ztz_contribution(&self, z_ext: &ArrayD<f64>) -> ArrayD<f64> {
        let lag_shape: Vec<usize> = self.atom_shape.iter().map(|&a| 2 * a - 1).collect();
        let mut out_shape = vec![self.n_atoms, self.n_atoms];
        out_shape.extend(&lag_shape);
        let mut out = ArrayD::zeros(IxDyn(&out_shape));

        let lag_bounds: Vec<Range<usize>> = lag_shape.iter().map(|&e| 0..e).collect();
        for_each_point(&lag_bounds, |m| {
            let tau: Vec<isize> = m
                .iter()
                .zip(&self.atom_shape)
                .map(|(&m, &a)| m as isize - (a as isize - 1))
                .collect();
            // anchors in the extended frame whose partner stays inside it
            let anchor_bounds: Vec<Range<usize>> = self
                .off
                .iter()
                .zip(&self.inner_shape)
                .zip(&self.ext_shape)
                .zip(&tau)
                .map(|(((&off, &ilen), &elen), &t)| {
                    let lo = off as isize;
                    let hi = (off + ilen) as isize;
                    let lo = lo.max(-t);
                    let hi = hi.min(elen as isize - t);
                    lo.max(0) as usize..hi.max(0) as usize
                })
                .collect();
            for k in 0..self.n_atoms {
                for j in 0..self.n_atoms {
                    let mut acc = 0.0;
                    for_each_point(&anchor_bounds, |p| {
                        let q: Vec<usize> = p
                            .iter()
                            .zip(&tau)
                            .map(|(&p, &t)| (p as isize + t) as usize)
                            .collect();
                        acc += z_ext[&at(k, p)[..]] * z_ext[&at(j, &q)[..]];
                    });
                    let mut at_out = vec![k, j];
                    at_out.extend_from_slice(m);
                    out[&at_out[..]] = acc;
                }
            }
        });
        out
    }

    /// This tile's summand of the activation/signal correlation.
    pub fn ztx_contribution(&self) -> ArrayD<f64> {
        let mut out_shape = vec![self.n_atoms, self.n_channels];
        out_shape.extend(&self.atom_shape);
        let mut out = ArrayD::zeros(IxDyn(&out_shape));
        let inner_local: Vec<Range<usize>> = self.inner_shape.iter().map(|&e| 0..e).collect();
        let atom_bounds: Vec<Range<usize>> = self.atom_shape.iter().map(|&a| 0..a).collect();
        for k in 0..self.n_atoms {
            for_each_point(&inner_local, |p| {
                let weight = self.z[&at(k, p)[..]];
                if weight == 0.0 {
                    return;
                }
                let base = add(p, &self.off);
                for c in 0..self.n_channels {
                    for_each_point(&atom_bounds, |t| {
                        let mut x_at = Vec::with_capacity(t.len() + 1);
                        x_at.push(c);
                        x_at.extend(base.iter().zip(t).map(|(&b, &t)| b + t));
                        let mut o_at = vec![k, c];
                        o_at.extend_from_slice(t);
                        out[&o_at[..]] += weight * self.x[&x_at[..]];
                    });
                }
            });
        }
        out
    }

    /// First and last raw values of the signal tile, echoed back to the
    /// root to confirm the scatter.
    pub fn x_edges(&self) -> (f64, f64) {
        let flat = self.x.as_slice().expect("signal tile is contiguous");
        (flat[0], flat[flat.len() - 1])
    }

    /// Debug check: recompute β from the signal and our own activations
    /// over coordinates no other tile can influence, and compare.
    pub fn check_beta(&self, n_updates: u64) -> Result<(), WorkerError> {
        let margins: Vec<Range<usize>> = self
            .inner
            .iter()
            .zip(&self.inner_shape)
            .zip(&self.atom_shape)
            .zip(self.workers.signal_shape())
            .map(|(((global, &len), &a), &valid)| {
                let lo = if global.start > 0 { a - 1 } else { 0 };
                let hi = if global.end < valid { len - (a - 1) } else { len };
                lo..hi
            })
            .collect();
        if margins.iter().any(|r| r.is_empty()) {
            return Ok(());
        }
        let tolerance = 1e-10 * (n_updates.max(1) as f64);
        let inner_local: Vec<Range<usize>> = self.inner_shape.iter().map(|&e| 0..e).collect();
        let mut failed = None;
        for atom in 0..self.n_atoms {
            for_each_point(&margins, |p| {
                if failed.is_some() {
                    return;
                }
                let ext_pos = add(p, &self.off);
                // DᵀX part
                let mut expect = 0.0;
                let atom_bounds: Vec<Range<usize>> =
                    self.atom_shape.iter().map(|&a| 0..a).collect();
                for c in 0..self.n_channels {
                    for_each_point(&atom_bounds, |t| {
                        let mut d_at = vec![atom, c];
                        d_at.extend_from_slice(t);
                        let mut x_at = Vec::with_capacity(t.len() + 1);
                        x_at.push(c);
                        x_at.extend(ext_pos.iter().zip(t).map(|(&e, &t)| e + t));
                        expect += self.dictionary[&d_at[..]] * self.x[&x_at[..]];
                    });
                }
                // minus the activation cross-talk, plus the diagonal
                for j in 0..self.n_atoms {
                    for_each_point(&inner_local, |q| {
                        let weight = self.z[&at(j, q)[..]];
                        if weight == 0.0 {
                            return;
                        }
                        let in_range = q
                            .iter()
                            .zip(p)
                            .zip(&self.atom_shape)
                            .all(|((&q, &p), &a)| q.abs_diff(p) <= a - 1);
                        if !in_range {
                            return;
                        }
                        let mut dtd_at = vec![atom, j];
                        dtd_at.extend(
                            p.iter()
                                .zip(q)
                                .zip(&self.atom_shape)
                                .map(|((&p, &q), &a)| q + a - 1 - p),
                        );
                        expect -= self.dtd[&dtd_at[..]] * weight;
                    });
                }
                expect += self.norms[atom] * self.z[&at(atom, p)[..]];
                let got = self.beta[&at(atom, &ext_pos)[..]];
                let diff = (got - expect).abs();
                if diff > tolerance {
                    failed = Some(format!(
                        "beta drift {diff:.3e} at atom {atom}, {p:?} (allowed {tolerance:.3e})"
                    ));
                }
            });
        }
        match failed {
            Some(message) => Err(WorkerError::DebugCheck(message)),
            None => Ok(()),
        }
    }

    /// Debug check: every inactive segment really has nothing to do.
    pub fn check_active_segments(&self) -> Result<(), WorkerError> {
        for segment in 0..self.segments.n_segments() {
            if !self.active[segment] {
                let max = self.segment_max(segment);
                if max > self.tol {
                    return Err(WorkerError::DebugCheck(format!(
                        "inactive segment {segment} holds an update of {max:.3e}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Debug check: a selected update must lie in the owned region.
    pub fn check_update_contained(&self, pos: &[usize]) -> Result<(), WorkerError> {
        let global = self.global_of_inner(pos);
        if !self.workers.is_inner(self.rank, &global) {
            return Err(WorkerError::DebugCheck(format!(
                "selected update at {global:?} outside the tile of worker {}",
                self.rank
            )));
        }
        Ok(())
    }
}

/// (k, p…) index vector.
fn at(atom: usize, pos: &[usize]) -> Vec<usize> {
    let mut idx = Vec::with_capacity(pos.len() + 1);
    idx.push(atom);
    idx.extend_from_slice(pos);
    idx
}

fn add(a: &[usize], b: &[usize]) -> Vec<usize> {
    a.iter().zip(b).map(|(&a, &b)| a + b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};
    use tessella_core::{atom_norms, cross_correlate, SolveConfig};

    fn tensor(shape: &[usize], data: Vec<f64>) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    fn single_tile_init(x: ArrayD<f64>, d: ArrayD<f64>, reg: f64) -> TaskInit {
        let valid: Vec<u32> = x.shape()[1..]
            .iter()
            .zip(&d.shape()[2..])
            .map(|(&s, &a)| (s - a + 1) as u32)
            .collect();
        TaskInit {
            rank: 0,
            world: 1,
            worker_grid: vec![1; valid.len()],
            valid_shape: valid,
            reg,
            config: SolveConfig::default(),
            dtd: WireTensor::from_array(&cross_correlate(&d)),
            norms: atom_norms(&d),
            dictionary: WireTensor::from_array(&d),
            x_tile: WireTensor::from_array(&x),
            z0_tile: None,
        }
    }

    fn impulse_problem() -> Tile {
        // one atom [1, 2], one channel, impulse signal
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let x = tensor(&[1, 8], vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        Tile::new(single_tile_init(x, d, 0.1)).unwrap()
    }

    #[test]
    fn test_beta_init_matches_correlation() {
        let tile = impulse_problem();
        // β = Dᵀ⋆X for z = 0
        assert_abs_diff_eq!(tile.beta[[0, 1]], 2.0);
        assert_abs_diff_eq!(tile.beta[[0, 2]], 1.0);
        assert_abs_diff_eq!(tile.beta[[0, 5]], 4.0);
        assert_abs_diff_eq!(tile.beta[[0, 6]], 2.0);
    }

    #[test]
    fn test_local_update_keeps_beta_consistent() {
        let mut tile = impulse_problem();
        let before = tile.beta.clone();
        let dz = tile.dz_opt_at(0, &[5]);
        assert!(dz > 0.0);
        tile.apply_local(0, &[5], dz);
        // single channel: the diagonal re-add cancels the center lag, so
        // the updated coordinate's β is unchanged and its optimal update
        // collapses to zero
        assert_abs_diff_eq!(tile.beta[[0, 5]], before[[0, 5]], epsilon = 1e-12);
        assert_abs_diff_eq!(tile.dz_opt_at(0, &[5]), 0.0, epsilon = 1e-12);
        // one lag away, β moved by −DᵀD(1)·dz
        assert_abs_diff_eq!(tile.beta[[0, 4]], before[[0, 4]] - 2.0 * dz, epsilon = 1e-12);
        tile.check_beta(1).unwrap();
    }

    #[test]
    fn test_greedy_selection_prefers_largest() {
        let tile = impulse_problem();
        let (best, _) = tile.best_in_segment(0);
        let best = best.unwrap();
        // β/α is largest at position 5 (value 4/5)
        assert_eq!(best.pos, vec![5]);
        assert_eq!(best.atom, 0);
    }

    #[test]
    fn test_zero_when_under_regularization() {
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let x = tensor(&[1, 8], vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let reg = 5.0; // above ‖Dᵀ⋆X‖∞ = 4
        let tile = Tile::new(single_tile_init(x, d, reg)).unwrap();
        let (best, _) = tile.best_in_segment(0);
        assert_abs_diff_eq!(best.unwrap().dz, 0.0);
    }

    #[test]
    fn test_warm_start_round_trip() {
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let x = tensor(&[1, 8], vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let mut cold = Tile::new(single_tile_init(x.clone(), d.clone(), 0.1)).unwrap();
        let dz = cold.dz_opt_at(0, &[5]);
        cold.apply_local(0, &[5], dz);

        let mut init = single_tile_init(x, d, 0.1);
        init.z0_tile = Some(WireTensor::from_array(&cold.z.clone()));
        let warm = Tile::new(init).unwrap();
        for i in 0..7 {
            assert_abs_diff_eq!(warm.beta[[0, i]], cold.beta[[0, i]], epsilon = 1e-12);
            assert_abs_diff_eq!(
                warm.dz_opt_at(0, &[i]),
                cold.dz_opt_at(0, &[i]),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_freeze_support_masks_new_coordinates() {
        let d = tensor(&[1, 1, 2], vec![1.0, 2.0]);
        let x = tensor(&[1, 8], vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let mut z0 = ArrayD::zeros(IxDyn(&[1, 7]));
        z0[[0, 2]] = 0.3;
        let mut init = single_tile_init(x, d, 0.1);
        init.config.freeze_support = true;
        init.z0_tile = Some(WireTensor::from_array(&z0));
        let tile = Tile::new(init).unwrap();
        // position 5 has the largest gain but is outside the support
        assert_abs_diff_eq!(tile.dz_opt_at(0, &[5]), 0.0);
        assert!(tile.dz_opt_at(0, &[2]).abs() > 0.0);
    }

    #[test]
    fn test_z_nnz() {
        let mut tile = impulse_problem();
        assert_eq!(tile.z_nnz(), vec![0]);
        tile.apply_local(0, &[5], 0.5);
        assert_eq!(tile.z_nnz(), vec![1]);
    }

    /// Two adjacent tiles over one 1-d signal, for border tests.
    fn two_tiles() -> (Tile, Tile) {
        let d = tensor(&[1, 1, 3], vec![0.5, 1.0, -0.5]);
        let x_data: Vec<f64> = (0..42).map(|i| ((i * 7 + 3) % 11) as f64 / 11.0).collect();
        let x = tensor(&[1, 42], x_data);
        let valid = vec![40u32];
        let make = |rank: u32, x_slice: ArrayD<f64>| {
            Tile::new(TaskInit {
                rank,
                world: 2,
                worker_grid: vec![2],
                valid_shape: valid.clone(),
                reg: 0.05,
                config: SolveConfig::default(),
                dictionary: WireTensor::from_array(&d),
                dtd: WireTensor::from_array(&cross_correlate(&d)),
                norms: atom_norms(&d),
                x_tile: WireTensor::from_array(&x_slice),
                z0_tile: None,
            })
            .unwrap()
        };
        // tile 0: ext [0, 22), signal [0, 24); tile 1: ext [18, 40), signal [18, 42)
        let x0 = tensor(&[1, 24], x.as_slice().unwrap()[..24].to_vec());
        let x1 = tensor(&[1, 24], x.as_slice().unwrap()[18..42].to_vec());
        (make(0, x0), make(1, x1))
    }

    #[test]
    fn test_warm_strip_matches_neighbor_beta() {
        let (t0, t1) = two_tiles();
        // tile 1's inner values over tile 0's halo
        let strip = t1.beta_strip_for(0);
        assert_eq!(strip.bounds, vec![(20, 22)]);
        // both tiles computed β from the same signal, so the strip is a
        // no-op overwrite of identical values
        let mut t0 = t0;
        let before = t0.beta.clone();
        t0.apply_beta_strip(&strip).unwrap();
        for i in 0..22 {
            assert_abs_diff_eq!(t0.beta[[0, i]], before[[0, i]], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_border_update_keeps_halo_consistent() {
        let (mut t0, mut t1) = two_tiles();
        // an update in tile 0's border strip toward tile 1
        let pos = vec![19usize];
        let dz = 0.75;
        assert_eq!(t0.neighbors_of_update(&pos), vec![1]);
        t0.apply_local(0, &pos, dz);
        let update = BorderUpdate {
            atom: 0,
            pos: vec![19],
            dz,
        };
        t1.apply_remote(&update).unwrap();
        // both tiles agree on β wherever their extended regions overlap
        for global in 18..22usize {
            let local0 = global; // tile 0 ext starts at 0
            let local1 = global - 18;
            assert_abs_diff_eq!(
                t0.beta[[0, local0]],
                t1.beta[[0, local1]],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_remote_update_outside_halo_rejected() {
        let (_, mut t1) = two_tiles();
        let update = BorderUpdate {
            atom: 0,
            pos: vec![2],
            dz: 0.1,
        };
        assert!(t1.apply_remote(&update).is_err());
    }

    #[test]
    fn test_overlap_strip_detection() {
        let (t0, t1) = two_tiles();
        // tile 0 has only a high neighbor: strip is the last a−1 positions
        assert!(!t0.in_overlap(&[0]));
        assert!(!t0.in_overlap(&[17]));
        assert!(t0.in_overlap(&[18]));
        assert!(t0.in_overlap(&[19]));
        // tile 1 has only a low neighbor
        assert!(t1.in_overlap(&[0]));
        assert!(t1.in_overlap(&[1]));
        assert!(!t1.in_overlap(&[2]));
    }
}
