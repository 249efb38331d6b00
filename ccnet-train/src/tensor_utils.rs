//! Shape helpers for batches entering sequence models.

use ccnet_core::{MlError, Result};
use ndarray::{ArrayD, Axis};

/// Bring `tensor` to rank `target_dim`.
///
/// Lower-rank tensors gain unit axes at position 1 (`[batch, feat]` becomes
/// `[batch, 1, feat]`); higher-rank tensors drop unit axes at position 1.
/// A non-unit axis in the way of a reduction is a shape error.
pub fn adjust_tensor_dim(tensor: ArrayD<f32>, target_dim: usize) -> Result<ArrayD<f32>> {
    let mut tensor = tensor;
    while tensor.ndim() < target_dim {
        let axis = if tensor.ndim() == 0 { 0 } else { 1 };
        tensor = tensor.insert_axis(Axis(axis));
    }
    while tensor.ndim() > target_dim {
        if tensor.ndim() < 2 || tensor.len_of(Axis(1)) != 1 {
            return Err(MlError::shape(format!(
                "cannot reduce tensor of shape {:?} to rank {target_dim}",
                tensor.shape()
            )));
        }
        tensor = tensor.remove_axis(Axis(1));
    }
    Ok(tensor)
}

/// [`adjust_tensor_dim`] for optional tensors such as padding masks.
pub fn adjust_optional_dim(
    tensor: Option<ArrayD<f32>>,
    target_dim: usize,
) -> Result<Option<ArrayD<f32>>> {
    tensor.map(|t| adjust_tensor_dim(t, target_dim)).transpose()
}

/// Mask of non-padding positions: `1.0` where any feature along the last axis
/// is non-zero, else `0.0`. The last axis is kept with length 1.
pub fn generate_padding_mask(batch: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if batch.ndim() < 2 {
        return Err(MlError::shape(format!(
            "padding mask needs at least [batch, feature], got {:?}",
            batch.shape()
        )));
    }
    let last = Axis(batch.ndim() - 1);
    let mask = batch.map_axis(last, |lane| {
        if lane.iter().any(|v| *v != 0.0) { 1.0 } else { 0.0 }
    });
    Ok(mask.insert_axis(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn, array};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lifts_rank_two_to_three() {
        let t = Array::zeros(IxDyn(&[4, 6]));
        let out = adjust_tensor_dim(t, 3).unwrap();
        assert_eq!(out.shape(), &[4, 1, 6]);
    }

    #[test]
    fn test_rank_three_untouched() {
        let t = Array::zeros(IxDyn(&[2, 5, 3]));
        let out = adjust_tensor_dim(t, 3).unwrap();
        assert_eq!(out.shape(), &[2, 5, 3]);
    }

    #[test]
    fn test_reduces_unit_axis() {
        let t = Array::zeros(IxDyn(&[2, 1, 5, 3]));
        let out = adjust_tensor_dim(t, 3).unwrap();
        assert_eq!(out.shape(), &[2, 5, 3]);
    }

    #[test]
    fn test_non_unit_axis_cannot_reduce() {
        let t = Array::zeros(IxDyn(&[2, 4, 5, 3]));
        assert!(adjust_tensor_dim(t, 3).is_err());
    }

    #[test]
    fn test_optional_passthrough() {
        assert!(adjust_optional_dim(None, 3).unwrap().is_none());
    }

    #[test]
    fn test_padding_mask() {
        let batch = array![[[1.0f32, 0.0], [0.0, 0.0]], [[0.0, 0.0], [0.0, 2.0]]].into_dyn();
        let mask = generate_padding_mask(&batch).unwrap();
        assert_eq!(mask.shape(), &[2, 2, 1]);
        assert_eq!(
            mask,
            array![[[1.0f32], [0.0]], [[0.0], [1.0]]].into_dyn()
        );
    }
}
