//! Vector normalization applied identically on the ingestion and query paths.

use crate::error::{Result, RetrievalError};
use crate::vector::Vector;
use serde::{Deserialize, Serialize};

/// Which norm a vector is scaled to unit length under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    /// Sum of absolute values equals 1.
    L1,
    /// Euclidean length equals 1.
    L2,
    /// Leave vectors untouched; the caller normalizes upstream.
    None,
}

impl Norm {
    /// Norm of `v` under this choice. `None` reports the L2 norm.
    pub fn measure(&self, v: &Vector) -> f32 {
        match self {
            Norm::L1 => v.l1_norm(),
            Norm::L2 | Norm::None => v.l2_norm(),
        }
    }
}

/// Scale `v` to unit length under `norm`.
///
/// A zero vector (or one whose norm is not finite) yields `DegenerateVector`.
pub fn normalize(v: &Vector, norm: Norm) -> Result<Vector> {
    if norm == Norm::None {
        return Ok(v.clone());
    }
    let length = norm.measure(v);
    if length == 0.0 || !length.is_finite() {
        return Err(RetrievalError::DegenerateVector);
    }
    Ok(Vector::new(v.as_slice().iter().map(|x| x / length).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_l2_normalize() {
        let v = normalize(&Vector::new(vec![3.0, 4.0]), Norm::L2).unwrap();
        assert_relative_eq!(v.l2_norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(v.as_slice()[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(v.as_slice()[1], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_l1_normalize() {
        let v = normalize(&Vector::new(vec![1.0, -3.0]), Norm::L1).unwrap();
        assert_relative_eq!(v.l1_norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(v.as_slice()[1], -0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_vector_is_degenerate() {
        let zero = Vector::new(vec![0.0; 4]);
        assert!(matches!(
            normalize(&zero, Norm::L1),
            Err(RetrievalError::DegenerateVector)
        ));
        assert!(matches!(
            normalize(&zero, Norm::L2),
            Err(RetrievalError::DegenerateVector)
        ));
    }

    #[test]
    fn test_none_is_identity() {
        let v = Vector::new(vec![2.0, 0.0]);
        assert_eq!(normalize(&v, Norm::None).unwrap(), v);
    }

    proptest! {
        #[test]
        fn prop_unit_norm(data in prop::collection::vec(-100.0f32..100.0, 1..64)) {
            let v = Vector::new(data);
            prop_assume!(v.l1_norm() > 1e-3);
            for norm in [Norm::L1, Norm::L2] {
                let n = normalize(&v, norm).unwrap();
                prop_assert!((norm.measure(&n) - 1.0).abs() < 1e-4);
            }
        }
    }
}
