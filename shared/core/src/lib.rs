mod config;
mod csc;
mod error;
mod segmentation;
mod shape;
mod tensor;

pub use config::{resolve_n_seg, DebugChecks, SolveConfig, Strategy};
pub use csc::{
    atom_norms, compute_ztx, compute_ztz, correlate, cost, cross_correlate, lambda_max,
    reconstruct, soft_threshold,
};
pub use error::SetupError;
pub use segmentation::Segmentation;
pub use shape::{flat_index, for_each_point, intersect, shape_len, valid_shape};
pub use tensor::WireTensor;
