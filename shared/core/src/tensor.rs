use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::SetupError;

/// Dense tensor in transit: a shape header followed by row-major values.
/// This is the only array representation that crosses the fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTensor {
    pub shape: Vec<u32>,
    pub data: Vec<f64>,
}

impl WireTensor {
    pub fn from_array(array: &ArrayD<f64>) -> Self {
        Self {
            shape: array.shape().iter().map(|&s| s as u32).collect(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn into_array(self) -> Result<ArrayD<f64>, SetupError> {
        let shape: Vec<usize> = self.shape.iter().map(|&s| s as usize).collect();
        let len = self.data.len();
        ArrayD::from_shape_vec(IxDyn(&shape), self.data)
            .map_err(|_| SetupError::BadTensorShape { shape, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    #[test]
    fn test_round_trip() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 3]), (0..6).map(|v| v as f64).collect()).unwrap();
        let b = WireTensor::from_array(&a).into_array().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bad_shape_rejected() {
        let t = WireTensor {
            shape: vec![2, 4],
            data: vec![0.0; 6],
        };
        assert!(t.into_array().is_err());
    }
}
