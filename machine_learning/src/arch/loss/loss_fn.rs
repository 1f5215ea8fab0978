use ndarray::{ArrayD, ArrayViewD};

use crate::Result;

pub trait LossFn {
    fn loss(&self, y_pred: ArrayViewD<f32>, y: ArrayViewD<f32>) -> Result<f32>;
    fn loss_prime(&self, y_pred: ArrayViewD<f32>, y: ArrayViewD<f32>) -> Result<ArrayD<f32>>;
}
