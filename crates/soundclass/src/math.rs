//! Probability helpers for the decision step.

pub fn softmax_inplace(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let mut max_v = x[0];
    for &v in &x[1..] {
        if v > max_v {
            max_v = v;
        }
    }

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_v).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x {
            *v /= sum;
        }
    }
}

/// Indices of the `k` largest values, in descending value order.
///
/// Equal values keep ascending index order. `k` past the length returns every index.
#[must_use]
pub fn top_k_indices(x: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..x.len()).collect();
    // Stable sort: ties keep their original relative order.
    idx.sort_by(|&a, &b| x[b].total_cmp(&x[a]));
    idx.truncate(k);
    idx
}

#[cfg(test)]
mod tests {
    use super::{softmax_inplace, top_k_indices};

    #[test]
    fn softmax_smoke() {
        let mut s = [1.0f32, 2.0, 3.0];
        softmax_inplace(&mut s);
        let sum: f32 = s.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(s[2] > s[1] && s[1] > s[0]);
    }

    #[test]
    fn softmax_is_shift_stable() {
        let mut s = [1000.0f32, 1000.0, -1000.0];
        softmax_inplace(&mut s);
        assert!((s[0] - 0.5).abs() < 1e-6);
        assert!((s[1] - 0.5).abs() < 1e-6);
        assert!(s[2].abs() < 1e-6);
    }

    #[test]
    fn top_k_orders_and_breaks_ties_by_index() {
        let x = [0.1f32, 0.4, 0.1, 0.4, 0.0];
        assert_eq!(top_k_indices(&x, 3), vec![1, 3, 0]);
        assert_eq!(top_k_indices(&x, 10), vec![1, 3, 0, 2, 4]);
        assert!(top_k_indices(&x, 0).is_empty());
    }
}
