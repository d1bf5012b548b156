//! Dense ops used by the classifier head and residual joins.

use rand::Rng;

/// Linear layer: `y = x * W^T + b`.
///
/// Shapes:
/// - `input`: `[n_rows, in_dim]`
/// - `weight`: `[out_dim, in_dim]`
/// - output: `[n_rows, out_dim]`
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    debug_assert_eq!(weight.len(), out_dim * in_dim);
    if let Some(b) = bias {
        debug_assert_eq!(b.len(), out_dim);
    }

    let mut out = vec![0.0f32; n_rows * out_dim];
    for r in 0..n_rows {
        let x = &input[r * in_dim..(r + 1) * in_dim];
        let y = &mut out[r * out_dim..(r + 1) * out_dim];
        for o in 0..out_dim {
            let w = &weight[o * in_dim..(o + 1) * in_dim];
            let mut sum = bias.map_or(0.0, |b| b[o]);
            for i in 0..in_dim {
                sum += x[i] * w[i];
            }
            y[o] = sum;
        }
    }
    out
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter().copied()) {
        *d += s;
    }
}

/// Replace NaN and ±Inf with zero. Returns how many values were replaced.
pub fn zero_non_finite(x: &mut [f32]) -> usize {
    let mut replaced = 0usize;
    for v in x {
        if !v.is_finite() {
            *v = 0.0;
            replaced += 1;
        }
    }
    replaced
}

/// Inverted dropout: zero each element with probability `p`, scale survivors by `1/(1-p)`.
pub fn dropout_inplace<R: Rng + ?Sized>(x: &mut [f32], p: f32, rng: &mut R) {
    if p <= 0.0 {
        return;
    }
    if p >= 1.0 {
        x.fill(0.0);
        return;
    }
    let keep_scale = 1.0 / (1.0 - p);
    for v in x {
        if rng.random::<f32>() < p {
            *v = 0.0;
        } else {
            *v *= keep_scale;
        }
    }
}
