//! Dense kernels used by the CPU backends

use crate::tensor::Tensor;

/// `out = weight · x + bias` for a `[rows, cols]` weight matrix
///
/// `x` must hold `cols` values and `out` at least `rows`.
pub fn matvec(weight: &Tensor<f32>, bias: &[f32], x: &[f32], out: &mut [f32]) {
    let rows = weight.shape[0];
    for (i, value) in out.iter_mut().take(rows).enumerate() {
        let dot: f32 = weight
            .row(i)
            .iter()
            .zip(x.iter())
            .map(|(&w, &v)| w * v)
            .sum();
        *value = dot + bias.get(i).copied().unwrap_or(0.0);
    }
}

/// Numerically stable softmax over `values`
pub fn softmax_in_place(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }

    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for value in values.iter_mut() {
        *value = (*value - max).exp();
        sum += *value;
    }

    if sum > 0.0 {
        for value in values.iter_mut() {
            *value /= sum;
        }
    }
}
