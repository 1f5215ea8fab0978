//! Micro-batch helpers.

use std::num::NonZeroUsize;

use ndarray::{Array2, ArrayD, ArrayViewD, Axis};

use crate::{MlErr, Result};

/// Splits a batch into micro-batches of `split_size` samples along the first axis.
///
/// The last micro-batch holds the remainder and may be smaller.
///
/// # Returns
/// The micro-batches in order, or an error if the batch is empty.
pub fn split_batch(
    x: ArrayViewD<'_, f32>,
    split_size: NonZeroUsize,
) -> Result<Vec<ArrayViewD<'_, f32>>> {
    if x.ndim() == 0 || x.len_of(Axis(0)) == 0 {
        return Err(MlErr::EmptyBatch);
    }

    let mut parts = Vec::with_capacity(x.len_of(Axis(0)).div_ceil(split_size.get()));
    let mut rest = x;
    while rest.len_of(Axis(0)) > split_size.get() {
        let (head, tail) = rest.split_at(Axis(0), split_size.get());
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);

    Ok(parts)
}

/// Concatenates micro-batches back into a single batch along the first axis.
pub fn concat_batches(parts: &[ArrayViewD<f32>]) -> Result<ArrayD<f32>> {
    if parts.is_empty() {
        return Err(MlErr::EmptyBatch);
    }

    Ok(ndarray::concatenate(Axis(0), parts)?)
}

/// Builds a `(labels.len(), num_classes)` one hot matrix.
pub fn one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut y = Array2::zeros((labels.len(), num_classes));

    for (mut row, &label) in y.outer_iter_mut().zip(labels) {
        if label >= num_classes {
            return Err(MlErr::SizeMismatch {
                what: "one hot label",
                got: label,
                expected: num_classes,
            });
        }

        row[label] = 1.0;
    }

    Ok(y)
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn batch(n: usize) -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[n, 2, 3]), |i| (i[0] * 6 + i[1] * 3 + i[2]) as f32)
    }

    #[test]
    fn split_keeps_order_and_remainder() {
        let x = batch(10);
        let parts = split_batch(x.view(), NonZeroUsize::new(4).unwrap()).unwrap();

        let sizes: Vec<_> = parts.iter().map(|p| p.shape()[0]).collect();
        assert_eq!(sizes, [4, 4, 2]);
        assert_eq!(parts[2][[0, 0, 0]], 48.0);

        let back = concat_batches(&parts).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn split_larger_than_batch_is_a_single_part() {
        let x = batch(3);
        let parts = split_batch(x.view(), NonZeroUsize::new(16).unwrap()).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].shape(), &[3, 2, 3]);
    }

    #[test]
    fn empty_batch_is_rejected() {
        let x = batch(0);
        let split = NonZeroUsize::new(2).unwrap();
        assert!(matches!(split_batch(x.view(), split), Err(MlErr::EmptyBatch)));
        assert!(matches!(concat_batches(&[]), Err(MlErr::EmptyBatch)));
    }

    #[test]
    fn one_hot_rows() {
        let y = one_hot(&[2, 0], 3).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[0., 0., 1., 1., 0., 0.]);
        assert!(one_hot(&[3], 3).is_err());
    }
}
