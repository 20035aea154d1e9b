//! Attention with linear biases.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Slopes for `num_heads` heads.
///
/// The first `2^floor(log2(n))` heads follow the geometric sequence
/// `2^(-8/c), 2^(-16/c), ...`; remaining heads take every other slope of the
/// sequence for `2c`.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = 1usize << (usize::BITS - 1 - num_heads.leading_zeros());
    let base = 2f64.powf(-8.0 / closest as f64);
    let mut slopes: Vec<f32> = (1..=closest).map(|i| base.powi(i as i32) as f32).collect();
    if closest < num_heads {
        let extra_base = 2f64.powf(-4.0 / closest as f64);
        slopes.extend(
            (0..num_heads - closest).map(|i| extra_base.powi((2 * i + 1) as i32) as f32),
        );
    }
    slopes
}

/// ALiBi slopes for the heads held by one tensor-parallel rank.
#[derive(Debug, Clone)]
pub struct AlibiBias {
    slopes: Vec<f32>,
}

impl AlibiBias {
    pub fn new(total_heads: usize, tp_size: usize, tp_rank: usize) -> Self {
        let local = total_heads / tp_size;
        let slopes = alibi_slopes(total_heads)
            .into_iter()
            .skip(tp_rank * local)
            .take(local)
            .collect();
        Self { slopes }
    }

    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    /// Bias `[heads, q_len, k_len]` equal to `slope * (j - i)` where `i` is
    /// the absolute query position (`past_len + row`) and `j` the key position.
    pub fn bias(
        &self,
        past_len: usize,
        q_len: usize,
        k_len: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let heads = self.slopes.len();
        let mut data = Vec::with_capacity(heads * q_len * k_len);
        for &slope in &self.slopes {
            for row in 0..q_len {
                let i = (past_len + row) as f32;
                for j in 0..k_len {
                    data.push(slope * (j as f32 - i));
                }
            }
        }
        Ok(Tensor::from_vec(data, (heads, q_len, k_len), device)?.to_dtype(dtype)?)
    }
}
