use ndarray::{Zip, prelude::*};

use crate::{MlErr, Result};

/// Max pooling over non padded windows, rounding the output size down.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl MaxPool2d {
    pub fn new(kernel: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel, stride }
    }

    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let invalid = || MlErr::InvalidShape {
            layer: "max_pool2d",
            got: input.to_vec(),
        };

        let &[c, h, w] = input else {
            return Err(invalid());
        };

        let (oh, ow) = self.spatial_out((h, w)).ok_or_else(invalid)?;
        Ok(vec![c, oh, ow])
    }

    fn spatial_out(&self, (h, w): (usize, usize)) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;

        if kh == 0 || kw == 0 || sh == 0 || sw == 0 || h < kh || w < kw {
            return None;
        }

        Some(((h - kh) / sh + 1, (w - kw) / sw + 1))
    }

    /// Pools every plane of `x`.
    ///
    /// # Returns
    /// The pooled batch and, for every output element, the flat index of the winning element
    /// within its input plane.
    pub fn forward(&self, x: ArrayView4<f32>) -> Result<(Array4<f32>, Array4<usize>)> {
        let (n, c, h, w) = x.dim();
        let (oh, ow) = self.spatial_out((h, w)).ok_or(MlErr::InvalidShape {
            layer: "max_pool2d",
            got: x.shape().to_vec(),
        })?;

        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;

        let mut y = Array4::zeros((n, c, oh, ow));
        let mut argmax = Array4::zeros((n, c, oh, ow));

        let x = x.as_standard_layout();
        let x = x.view().into_shape_with_order((n * c, h, w))?;
        let mut y_planes = y.view_mut().into_shape_with_order((n * c, oh, ow))?;
        let mut arg_planes = argmax.view_mut().into_shape_with_order((n * c, oh, ow))?;

        Zip::from(y_planes.outer_iter_mut())
            .and(arg_planes.outer_iter_mut())
            .and(x.outer_iter())
            .par_for_each(|mut y, mut arg, x| {
                for ((oy, ox), y) in y.indexed_iter_mut() {
                    let (y0, x0) = (oy * sh, ox * sw);
                    let mut best = (x[[y0, x0]], y0 * w + x0);

                    for iy in y0..y0 + kh {
                        for ix in x0..x0 + kw {
                            let v = x[[iy, ix]];
                            if v > best.0 {
                                best = (v, iy * w + ix);
                            }
                        }
                    }

                    *y = best.0;
                    arg[[oy, ox]] = best.1;
                }
            });

        Ok((y, argmax))
    }

    /// Routes every element of `d` back to the input element that won its window.
    pub fn backward(
        &self,
        argmax: &Array4<usize>,
        input_dim: (usize, usize, usize, usize),
        d: Array4<f32>,
    ) -> Result<Array4<f32>> {
        if argmax.dim() != d.dim() {
            return Err(MlErr::InvalidShape {
                layer: "max_pool2d",
                got: d.shape().to_vec(),
            });
        }

        let (n, c, h, w) = input_dim;
        let (_, _, oh, ow) = d.dim();

        let mut dx = Array3::<f32>::zeros((n * c, h, w));
        let d = d.into_shape_with_order((n * c, oh * ow))?;
        let argmax = argmax.view().into_shape_with_order((n * c, oh * ow))?;

        Zip::from(dx.outer_iter_mut())
            .and(d.outer_iter())
            .and(argmax.outer_iter())
            .par_for_each(|mut dx, d, argmax| {
                for (&d, &i) in d.iter().zip(argmax) {
                    dx[[i / w, i % w]] += d;
                }
            });

        Ok(dx.into_shape_with_order((n, c, h, w))?)
    }
}
