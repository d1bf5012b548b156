//! Deterministic stand-in weights for tests and demos. Not a stable API.

use std::collections::HashMap;

use crate::network::ClassifierNetwork;
use crate::weights::TensorF32;

/// He-scaled weights with mild batch-norm statistics for every tensor of a
/// `num_classes` network. The same `seed` always yields the same tensors.
#[must_use]
pub fn synthetic_weights(num_classes: usize, seed: u32) -> HashMap<String, TensorF32> {
    let mut s = seed;
    let mut next = move || {
        s = s.wrapping_mul(1664525).wrapping_add(1013904223);
        ((s >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0
    };
    ClassifierNetwork::parameter_shapes(num_classes)
        .into_iter()
        .map(|spec| {
            let n = spec.numel();
            let data: Vec<f32> = if spec.name.ends_with("running_var") {
                (0..n).map(|_| 1.0 + 0.1 * next().abs()).collect()
            } else if spec.name.ends_with("running_mean") || spec.name.ends_with("bias") {
                (0..n).map(|_| 0.05 * next()).collect()
            } else if spec.shape.len() == 1 {
                (0..n).map(|_| 1.0 + 0.1 * next()).collect()
            } else {
                let fan_in: usize = spec.shape[1..].iter().product();
                let scale = (3.0 / fan_in as f32).sqrt();
                (0..n).map(|_| scale * next()).collect()
            };
            (spec.name, TensorF32::new(spec.shape, data))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::synthetic_weights;
    use crate::network::ClassifierNetwork;

    #[test]
    fn same_seed_same_tensors() {
        let a = synthetic_weights(2, 11);
        assert_eq!(a, synthetic_weights(2, 11));
        assert_ne!(a, synthetic_weights(2, 12));
        assert_eq!(a.len(), ClassifierNetwork::parameter_shapes(2).len());
        assert!(a["conv1.1.running_var"].data.iter().all(|v| *v >= 1.0));
    }
}
