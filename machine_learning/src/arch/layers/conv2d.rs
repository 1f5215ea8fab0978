use ndarray::{Zip, linalg, prelude::*};
use rayon::prelude::*;

use crate::{MlErr, Result};

/// A 2d convolution over NCHW tensors, lowered to a matrix product per sample.
///
/// The parameters are the weights, laid out as `(out, in, kh, kw)`, followed by one bias per
/// output channel.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
}

impl Conv2d {
    /// Creates a new `Conv2d` layer.
    ///
    /// # Arguments
    /// * `in_channels` - The channels of the input.
    /// * `out_channels` - The channels of the output, one filter each.
    /// * `kernel` - The `(height, width)` of every filter.
    /// * `stride` - The `(vertical, horizontal)` step between windows.
    /// * `padding` - The zeros added on each side of the input.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
        }
    }

    /// The length of a column of the lowered input, `in * kh * kw`.
    fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.out_channels * self.patch_len() + self.out_channels
    }

    /// The sizes of the weight and bias tensors.
    pub fn param_sizes(&self) -> [usize; 2] {
        [self.out_channels * self.patch_len(), self.out_channels]
    }

    /// Returns `(fan_in, fan_out)` of the weight tensor.
    pub fn fans(&self) -> (usize, usize) {
        let area = self.kernel.0 * self.kernel.1;
        (self.in_channels * area, self.out_channels * area)
    }

    /// Infers the per sample output shape for a per sample input shape `[c, h, w]`.
    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>> {
        let invalid = || MlErr::InvalidShape {
            layer: "conv2d",
            got: input.to_vec(),
        };

        let &[c, h, w] = input else {
            return Err(invalid());
        };

        if c != self.in_channels {
            return Err(invalid());
        }

        let (oh, ow) = self.spatial_out((h, w)).ok_or_else(invalid)?;
        Ok(vec![self.out_channels, oh, ow])
    }

    fn spatial_out(&self, (h, w): (usize, usize)) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;

        if sh == 0 || sw == 0 || h + 2 * ph < kh || w + 2 * pw < kw {
            return None;
        }

        Some(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Convolves every sample of `x` in parallel.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `x` - The input batch, `(n, in, h, w)`.
    ///
    /// # Returns
    /// The output batch `(n, out, oh, ow)`.
    pub fn forward(&self, params: &[f32], x: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (n, _, h, w) = x.dim();
        self.output_shape(&x.shape()[1..])?;
        let (oh, ow) = self.spatial_out((h, w)).ok_or(MlErr::InvalidShape {
            layer: "conv2d",
            got: x.shape().to_vec(),
        })?;

        let (weights, biases) = self.view_params(params)?;
        let biases = biases.insert_axis(Axis(1));

        let mut y = Array3::zeros((n, self.out_channels, oh * ow));
        Zip::from(y.axis_iter_mut(Axis(0)))
            .and(x.axis_iter(Axis(0)))
            .par_for_each(|mut y, x| {
                let cols = self.im2col(x, (oh, ow));
                linalg::general_mat_mul(1.0, &weights, &cols, 0.0, &mut y);
                y += &biases;
            });

        Ok(y.into_shape_with_order((n, self.out_channels, oh, ow))?)
    }

    /// Propagates `d` backwards through the convolution.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `grad` - This layer's slice of the gradient, overwritten with the new gradient.
    /// * `x` - The input this layer saw during the forward pass.
    /// * `d` - The gradient of the loss with respect to the output.
    /// * `need_dx` - Whether the gradient with respect to the input is needed.
    ///
    /// # Returns
    /// The gradient with respect to the input, when asked for.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        x: ArrayView4<f32>,
        d: Array4<f32>,
        need_dx: bool,
    ) -> Result<Option<Array4<f32>>> {
        let (n, _, h, w) = x.dim();
        let (_, out, oh, ow) = d.dim();
        if out != self.out_channels || d.dim().0 != n {
            return Err(MlErr::InvalidShape {
                layer: "conv2d",
                got: d.shape().to_vec(),
            });
        }

        let d = d.into_shape_with_order((n, out, oh * ow))?;
        let patch_len = self.patch_len();

        let zeros = move || {
            (
                Array2::<f32>::zeros((out, patch_len)),
                Array1::<f32>::zeros(out),
            )
        };

        let (dw_sum, db_sum) = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .zip(d.axis_iter(Axis(0)))
            .map(|(x, d)| {
                let cols = self.im2col(x, (oh, ow));
                let (mut dw, _) = zeros();
                linalg::general_mat_mul(1.0, &d, &cols.t(), 0.0, &mut dw);
                (dw, d.sum_axis(Axis(1)))
            })
            .reduce(zeros, |(mut dw, mut db), (dw_i, db_i)| {
                dw += &dw_i;
                db += &db_i;
                (dw, db)
            });

        let (mut dw, mut db) = self.view_grad(grad)?;
        dw.assign(&dw_sum);
        db.assign(&db_sum);

        if !need_dx {
            return Ok(None);
        }

        let (weights, _) = self.view_params(params)?;
        let mut dx = Array4::zeros((n, self.in_channels, h, w));
        Zip::from(dx.axis_iter_mut(Axis(0)))
            .and(d.axis_iter(Axis(0)))
            .par_for_each(|dx, d| {
                let mut dcols = Array2::zeros((patch_len, oh * ow));
                linalg::general_mat_mul(1.0, &weights.t(), &d, 0.0, &mut dcols);
                self.col2im(dcols.view(), dx, (oh, ow));
            });

        Ok(Some(dx))
    }

    /// Lowers a single `(c, h, w)` sample into a `(c * kh * kw, oh * ow)` matrix whose columns
    /// are the receptive fields of every output position.
    fn im2col(&self, x: ArrayView3<f32>, (oh, ow): (usize, usize)) -> Array2<f32> {
        let mut cols = Array2::zeros((self.patch_len(), oh * ow));

        self.for_each_tap(x.dim(), (oh, ow), |row, col, (c, iy, ix)| {
            cols[[row, col]] = x[[c, iy, ix]];
        });

        cols
    }

    /// The adjoint of `im2col`, overlapping windows add up.
    fn col2im(&self, cols: ArrayView2<f32>, mut dx: ArrayViewMut3<f32>, out: (usize, usize)) {
        let dim = dx.dim();
        self.for_each_tap(dim, out, |row, col, (c, iy, ix)| {
            dx[[c, iy, ix]] += cols[[row, col]];
        });
    }

    /// Visits every `(row, col)` of the lowered matrix that maps to a real, unpadded, input
    /// position.
    fn for_each_tap<F>(
        &self,
        (_, h, w): (usize, usize, usize),
        (oh, ow): (usize, usize),
        mut f: F,
    ) where
        F: FnMut(usize, usize, (usize, usize, usize)),
    {
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;

        for row in 0..self.patch_len() {
            let c = row / (kh * kw);
            let ky = (row / kw) % kh;
            let kx = row % kw;

            for oy in 0..oh {
                let Some(iy) = (oy * sh + ky).checked_sub(ph).filter(|&iy| iy < h) else {
                    continue;
                };

                for ox in 0..ow {
                    let Some(ix) = (ox * sw + kx).checked_sub(pw).filter(|&ix| ix < w) else {
                        continue;
                    };

                    f(row, oy * ow + ox, (c, iy, ix));
                }
            }
        }
    }

    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        self.check_len("conv2d parameters", params.len())?;
        let (w, b) = params.split_at(self.out_channels * self.patch_len());
        let weights = ArrayView2::from_shape((self.out_channels, self.patch_len()), w)?;
        let biases = ArrayView1::from_shape(self.out_channels, b)?;
        Ok((weights, biases))
    }

    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        self.check_len("conv2d gradient", grad.len())?;
        let (w, b) = grad.split_at_mut(self.out_channels * self.patch_len());
        let dw = ArrayViewMut2::from_shape((self.out_channels, self.patch_len()), w)?;
        let db = ArrayViewMut1::from_shape(self.out_channels, b)?;
        Ok((dw, db))
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size() {
            return Err(MlErr::SizeMismatch {
                what,
                got,
                expected: self.size(),
            });
        }

        Ok(())
    }
}
