//! Rotary position embeddings in the GPT-NeoX (rotate-half) layout.

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_size: usize,
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_size: usize, base: f64) -> Self {
        let half = head_size / 2;
        let inv_freq = (0..half)
            .map(|i| {
                let power = (2.0 * i as f64) / head_size as f64;
                (1.0 / base.powf(power)) as f32
            })
            .collect();
        Self {
            head_size,
            inv_freq,
        }
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Cos/sin tables `[len, head_size / 2]` for positions `start..start + len`.
    pub fn cos_sin(
        &self,
        start: usize,
        len: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        let half = self.inv_freq.len();
        let mut angles = Vec::with_capacity(len * half);
        for pos in start..start + len {
            for &inv in &self.inv_freq {
                angles.push(pos as f32 * inv);
            }
        }
        let angles = Tensor::from_vec(angles, (len, half), device)?;
        let cos = angles.cos()?.to_dtype(dtype)?;
        let sin = angles.sin()?.to_dtype(dtype)?;
        Ok((cos, sin))
    }

    /// Rotate `x` of shape `[len, heads, head_size]` whose first token sits at
    /// absolute position `start`.
    pub fn apply(&self, x: &Tensor, start: usize) -> Result<Tensor> {
        let (len, _heads, head_size) = x.dims3()?;
        if head_size != self.head_size {
            return Err(Error::InferenceError(format!(
                "rotary head size {} does not match input head size {head_size}",
                self.head_size
            )));
        }
        let half = head_size / 2;
        let (cos, sin) = self.cos_sin(start, len, x.device(), x.dtype())?;
        let cos = cos.unsqueeze(1)?;
        let sin = sin.unsqueeze(1)?;

        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rot1 = x1.broadcast_mul(&cos)?.sub(&x2.broadcast_mul(&sin)?)?;
        let rot2 = x1.broadcast_mul(&sin)?.add(&x2.broadcast_mul(&cos)?)?;
        Tensor::cat(&[rot1, rot2], D::Minus1).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_frequencies() {
        let rope = RotaryEmbedding::new(8, 10000.0);
        assert_eq!(rope.inv_freq.len(), 4);
        assert!((rope.inv_freq[0] - 1.0).abs() < 1e-6);
        assert!((rope.inv_freq[1] - 0.1).abs() < 1e-6);
        assert!((rope.inv_freq[3] - 0.001).abs() < 1e-7);
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(8, 10000.0);
        let x = Tensor::randn(0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();
        let y = rope.apply(&x, 0).unwrap();
        let diff: f32 = x
            .sub(&y)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let rope = RotaryEmbedding::new(16, 10000.0);
        let x = Tensor::randn(0f32, 1.0, (5, 3, 16), &Device::Cpu).unwrap();
        let y = rope.apply(&x, 7).unwrap();
        let norm = |t: &Tensor| -> f32 { t.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap() };
        assert!((norm(&x) - norm(&y)).abs() < 1e-3);
    }

    #[test]
    fn test_relative_scores_depend_only_on_distance() {
        let rope = RotaryEmbedding::new(8, 10000.0);
        let q = Tensor::randn(0f32, 1.0, (1, 1, 8), &Device::Cpu).unwrap();
        let k = Tensor::randn(0f32, 1.0, (1, 1, 8), &Device::Cpu).unwrap();
        let score = |qp: usize, kp: usize| -> f32 {
            let q = rope.apply(&q, qp).unwrap();
            let k = rope.apply(&k, kp).unwrap();
            q.mul(&k).unwrap().sum_all().unwrap().to_scalar().unwrap()
        };
        assert!((score(5, 2) - score(13, 10)).abs() < 1e-4);
    }
}
