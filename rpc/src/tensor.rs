//! Conversions between owned arrays and the borrowed wire tensors.

use comms::msg::Tensor;
use ndarray::{ArrayD, CowArray, IxDyn};

use crate::Result;

/// Lays `t` out in row-major order, copying only when it isn't already.
pub(crate) fn standard(t: &ArrayD<f32>) -> CowArray<'_, f32, IxDyn> {
    t.as_standard_layout()
}

/// Borrows a standard layout array as a wire tensor.
pub(crate) fn to_wire<'a>(t: &'a CowArray<'_, f32, IxDyn>) -> Option<Tensor<'a>> {
    t.as_slice().map(|data| Tensor {
        shape: t.shape().to_vec(),
        data,
    })
}

/// Copies a received tensor out of the frame buffer.
pub(crate) fn from_wire(t: Tensor<'_>) -> Result<ArrayD<f32>> {
    Ok(ArrayD::from_shape_vec(IxDyn(&t.shape), t.data.to_vec())?)
}
