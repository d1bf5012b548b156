//! 2-D convolution, batch normalization and pooling kernels.
//!
//! Convolutions lower to im2col + a single GEMM:
//! - weights `[out, in, k, k]` are viewed as a `[out, in*k*k]` matrix
//! - the input is unfolded into `[in*k*k, out_h*out_w]` columns
//! - the product is written straight into the output feature map

use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::tensor::FeatureMap;

/// Whether layers use frozen statistics (`Eval`) or per-input statistics and dropout (`Train`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

#[inline]
pub fn relu_inplace(x: &mut [f32]) {
    for v in x {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Output spatial extent of a padded, strided window.
#[inline]
#[must_use]
pub fn pooled_len(len: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    let padded = len + 2 * padding;
    if padded < kernel {
        0
    } else {
        (padded - kernel) / stride + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dShape {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dShape {
    #[must_use]
    pub fn weight_shape(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel, self.kernel]
    }

    #[must_use]
    pub fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel * self.kernel
    }

    #[must_use]
    pub fn output_hw(&self, height: usize, width: usize) -> (usize, usize) {
        (
            pooled_len(height, self.kernel, self.stride, self.padding),
            pooled_len(width, self.kernel, self.stride, self.padding),
        )
    }
}

/// Bias-free square convolution.
#[derive(Debug, Clone)]
pub struct Conv2d {
    shape: Conv2dShape,
    weight: Vec<f32>, // [out, in, k, k]
}

impl Conv2d {
    #[must_use]
    pub fn new(shape: Conv2dShape, weight: Vec<f32>) -> Self {
        assert_eq!(
            weight.len(),
            shape.weight_len(),
            "conv weight length does not match {:?}",
            shape.weight_shape()
        );
        Self { shape, weight }
    }

    #[must_use]
    pub fn shape(&self) -> Conv2dShape {
        self.shape
    }

    #[must_use]
    pub fn forward(&self, input: &FeatureMap) -> FeatureMap {
        let s = self.shape;
        debug_assert_eq!(input.channels, s.in_channels);

        let (out_h, out_w) = s.output_hw(input.height, input.width);
        let n_pos = out_h * out_w;
        let mut out = FeatureMap::zeros(s.out_channels, out_h, out_w);
        if n_pos == 0 {
            return out;
        }

        let k_dim = s.in_channels * s.kernel * s.kernel;
        let unfolded;
        let cols: &[f32] = if s.kernel == 1 && s.stride == 1 && s.padding == 0 {
            &input.data
        } else {
            unfolded = im2col(input, s, out_h, out_w);
            &unfolded
        };

        let (Ok(w), Ok(x), Ok(mut y)) = (
            ArrayView2::from_shape((s.out_channels, k_dim), &self.weight),
            ArrayView2::from_shape((k_dim, n_pos), cols),
            ArrayViewMut2::from_shape((s.out_channels, n_pos), &mut out.data),
        ) else {
            unreachable!("conv buffers are sized from the same shape");
        };
        general_mat_mul(1.0, &w, &x, 0.0, &mut y);
        out
    }
}

/// Unfold `input` into a row-major `[in*k*k, out_h*out_w]` matrix with zero padding.
fn im2col(input: &FeatureMap, s: Conv2dShape, out_h: usize, out_w: usize) -> Vec<f32> {
    let n_pos = out_h * out_w;
    let mut cols = vec![0.0f32; s.in_channels * s.kernel * s.kernel * n_pos];
    let pad = s.padding as isize;
    let (h, w) = (input.height as isize, input.width as isize);

    for c in 0..s.in_channels {
        let plane = input.channel(c);
        for ky in 0..s.kernel {
            for kx in 0..s.kernel {
                let row = (c * s.kernel + ky) * s.kernel + kx;
                let dst = &mut cols[row * n_pos..(row + 1) * n_pos];
                for oy in 0..out_h {
                    let iy = (oy * s.stride + ky) as isize - pad;
                    if iy < 0 || iy >= h {
                        continue;
                    }
                    let src_row = &plane[(iy as usize) * input.width..(iy as usize + 1) * input.width];
                    let dst_row = &mut dst[oy * out_w..(oy + 1) * out_w];
                    for (ox, d) in dst_row.iter_mut().enumerate() {
                        let ix = (ox * s.stride + kx) as isize - pad;
                        if ix >= 0 && ix < w {
                            *d = src_row[ix as usize];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Per-channel batch normalization.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    #[must_use]
    pub fn channels(&self) -> usize {
        self.weight.len()
    }

    /// Normalize `x` in place.
    ///
    /// `Eval` uses the running statistics; `Train` uses the biased mean/variance of `x` itself.
    /// Running statistics are never updated here.
    pub fn forward_inplace(&self, x: &mut FeatureMap, mode: Mode) {
        debug_assert_eq!(x.channels, self.channels());
        let n = x.plane_len();
        if n == 0 {
            return;
        }

        for c in 0..x.channels {
            let plane = x.channel_mut(c);
            let (mean, var) = match mode {
                Mode::Eval => (self.running_mean[c], self.running_var[c]),
                Mode::Train => {
                    let mean = plane.iter().sum::<f32>() / n as f32;
                    let var = plane.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                    (mean, var)
                }
            };
            let scale = self.weight[c] / (var + self.eps).sqrt();
            let shift = self.bias[c] - mean * scale;
            for v in plane {
                *v = *v * scale + shift;
            }
        }
    }
}

/// Max pooling with implicit `-inf` padding.
#[must_use]
pub fn max_pool2d(input: &FeatureMap, kernel: usize, stride: usize, padding: usize) -> FeatureMap {
    let out_h = pooled_len(input.height, kernel, stride, padding);
    let out_w = pooled_len(input.width, kernel, stride, padding);
    let mut out = FeatureMap::zeros(input.channels, out_h, out_w);
    let pad = padding as isize;

    for c in 0..input.channels {
        let plane = input.channel(c);
        let dst = out.channel_mut(c);
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut best = f32::NEG_INFINITY;
                for ky in 0..kernel {
                    let iy = (oy * stride + ky) as isize - pad;
                    if iy < 0 || iy >= input.height as isize {
                        continue;
                    }
                    for kx in 0..kernel {
                        let ix = (ox * stride + kx) as isize - pad;
                        if ix < 0 || ix >= input.width as isize {
                            continue;
                        }
                        let v = plane[iy as usize * input.width + ix as usize];
                        if v > best || v.is_nan() {
                            best = v;
                        }
                    }
                }
                dst[oy * out_w + ox] = best;
            }
        }
    }
    out
}

/// Adaptive average pooling to `1x1`: one mean per channel.
#[must_use]
pub fn global_avg_pool(input: &FeatureMap) -> Vec<f32> {
    let n = input.plane_len();
    (0..input.channels)
        .map(|c| {
            if n == 0 {
                0.0
            } else {
                input.channel(c).iter().sum::<f32>() / n as f32
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg_vec(n: usize, seed: u32) -> Vec<f32> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(1664525).wrapping_add(1013904223);
                ((s >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn conv_reference(input: &FeatureMap, s: Conv2dShape, weight: &[f32]) -> FeatureMap {
        let (oh, ow) = s.output_hw(input.height, input.width);
        let mut out = FeatureMap::zeros(s.out_channels, oh, ow);
        for oc in 0..s.out_channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut sum = 0.0f32;
                    for ic in 0..s.in_channels {
                        for ky in 0..s.kernel {
                            for kx in 0..s.kernel {
                                let iy = (oy * s.stride + ky) as isize - s.padding as isize;
                                let ix = (ox * s.stride + kx) as isize - s.padding as isize;
                                if iy < 0
                                    || ix < 0
                                    || iy >= input.height as isize
                                    || ix >= input.width as isize
                                {
                                    continue;
                                }
                                let wi = ((oc * s.in_channels + ic) * s.kernel + ky) * s.kernel + kx;
                                sum += weight[wi] * input.at(ic, iy as usize, ix as usize);
                            }
                        }
                    }
                    out.data[(oc * oh + oy) * ow + ox] = sum;
                }
            }
        }
        out
    }

    fn assert_close(a: &FeatureMap, b: &FeatureMap) {
        assert_eq!(a.shape(), b.shape());
        let max_diff = a
            .data
            .iter()
            .zip(&b.data)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-4, "max diff {max_diff}");
    }

    #[test]
    fn conv_matches_direct_reference() {
        let cases = [
            Conv2dShape { in_channels: 3, out_channels: 4, kernel: 3, stride: 1, padding: 1 },
            Conv2dShape { in_channels: 2, out_channels: 5, kernel: 3, stride: 2, padding: 1 },
            Conv2dShape { in_channels: 1, out_channels: 6, kernel: 7, stride: 2, padding: 3 },
            Conv2dShape { in_channels: 4, out_channels: 2, kernel: 1, stride: 2, padding: 0 },
            Conv2dShape { in_channels: 4, out_channels: 3, kernel: 1, stride: 1, padding: 0 },
        ];
        for (i, s) in cases.into_iter().enumerate() {
            let input = FeatureMap::from_vec(s.in_channels, 9, 11, lcg_vec(s.in_channels * 99, 7 + i as u32));
            let weight = lcg_vec(s.weight_len(), 100 + i as u32);
            let conv = Conv2d::new(s, weight.clone());
            assert_close(&conv.forward(&input), &conv_reference(&input, s, &weight));
        }
    }

    #[test]
    fn conv_output_extent_follows_stride() {
        let s = Conv2dShape { in_channels: 1, out_channels: 64, kernel: 7, stride: 2, padding: 3 };
        assert_eq!(s.output_hw(128, 87), (64, 44));
        let s = Conv2dShape { in_channels: 64, out_channels: 128, kernel: 3, stride: 2, padding: 1 };
        assert_eq!(s.output_hw(32, 22), (16, 11));
        assert_eq!(s.output_hw(1, 1), (1, 1));
    }

    #[test]
    fn batch_norm_eval_uses_running_stats() {
        let bn = BatchNorm2d {
            weight: vec![2.0, 1.0],
            bias: vec![0.5, -1.0],
            running_mean: vec![1.0, 0.0],
            running_var: vec![4.0, 1.0],
            eps: 0.0,
        };
        let mut x = FeatureMap::from_vec(2, 1, 2, vec![1.0, 3.0, 2.0, -2.0]);
        bn.forward_inplace(&mut x, Mode::Eval);
        // c0: (v-1)/2*2+0.5 ; c1: v-1
        assert_eq!(x.data, vec![0.5, 2.5, 1.0, -3.0]);
    }

    #[test]
    fn batch_norm_train_normalizes_input() {
        let bn = BatchNorm2d {
            weight: vec![1.0],
            bias: vec![0.0],
            running_mean: vec![100.0],
            running_var: vec![100.0],
            eps: 1e-5,
        };
        let mut x = FeatureMap::from_vec(1, 2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        bn.forward_inplace(&mut x, Mode::Train);
        let mean: f32 = x.data.iter().sum::<f32>() / 4.0;
        let var: f32 = x.data.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn max_pool_pads_with_neg_inf() {
        let x = FeatureMap::from_vec(1, 2, 2, vec![-4.0, -3.0, -2.0, -1.0]);
        let y = max_pool2d(&x, 3, 2, 1);
        assert_eq!(y.shape(), [1, 1, 1]);
        assert_eq!(y.data, vec![-1.0]);

        let x = FeatureMap::from_vec(1, 4, 4, (0..16).map(|v| v as f32).collect());
        let y = max_pool2d(&x, 3, 2, 1);
        assert_eq!(y.shape(), [1, 2, 2]);
        assert_eq!(y.data, vec![5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn global_pool_and_relu() {
        let mut x = FeatureMap::from_vec(2, 1, 2, vec![1.0, 3.0, -2.0, -4.0]);
        assert_eq!(global_avg_pool(&x), vec![2.0, -3.0]);
        relu_inplace(&mut x.data);
        assert_eq!(x.data, vec![1.0, 3.0, 0.0, 0.0]);
    }
}
