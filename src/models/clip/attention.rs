use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Sequence-first multi-head attention, `(L, N, E)` in and out.
#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiheadAttention {
    /// Packed `in_proj_weight`/`in_proj_bias` layout, with `out_proj`.
    pub fn new(vb: VarBuilder, embed_dim: usize, num_heads: usize) -> Result<Self> {
        if embed_dim % num_heads != 0 {
            candle_core::bail!("embed dim {embed_dim} is not divisible by {num_heads} heads")
        }
        let bound = (6. / (embed_dim + 3 * embed_dim) as f64).sqrt();
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.))?;
        let slice = |i: usize| -> Result<Linear> {
            let range = i * embed_dim..(i + 1) * embed_dim;
            Ok(Linear::new(
                in_proj_weight.i(range.clone())?,
                Some(in_proj_bias.i(range)?),
            ))
        };
        let (q_proj, k_proj, v_proj) = (slice(0)?, slice(1)?, slice(2)?);
        let out_proj = zero_bias_linear(vb.pp("out_proj"), embed_dim, embed_dim)?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// Separate `q_proj`/`k_proj`/`v_proj` projections and a `c_proj` output
    /// projection that may change the width.
    pub fn new_separate(
        vb: VarBuilder,
        embed_dim: usize,
        num_heads: usize,
        output_dim: usize,
        init_std: f64,
    ) -> Result<Self> {
        if embed_dim % num_heads != 0 {
            candle_core::bail!("embed dim {embed_dim} is not divisible by {num_heads} heads")
        }
        let proj = |name: &str, out_dim: usize| -> Result<Linear> {
            let vb = vb.pp(name);
            let weight = vb.get_with_hints(
                (out_dim, embed_dim),
                "weight",
                Init::Randn {
                    mean: 0.,
                    stdev: init_std,
                },
            )?;
            let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
            Ok(Linear::new(weight, Some(bias)))
        };
        Ok(Self {
            q_proj: proj("q_proj", embed_dim)?,
            k_proj: proj("k_proj", embed_dim)?,
            v_proj: proj("v_proj", embed_dim)?,
            out_proj: proj("c_proj", output_dim)?,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    // (L, N, E) -> (N * heads, L, head_dim)
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (l, n, _) = xs.dims3()?;
        xs.reshape((l, n * self.num_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()
    }

    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (tgt_len, bsz, _) = query.dims3()?;
        let (src_len, key_bsz, _) = key.dims3()?;
        if bsz != key_bsz {
            candle_core::bail!("query batch {bsz} does not match key batch {key_bsz}")
        }
        let scale = 1. / (self.head_dim as f64).sqrt();
        let q = (self.split_heads(&self.q_proj.forward(query)?)? * scale)?;
        let k = self.split_heads(&self.k_proj.forward(key)?)?;
        let v = self.split_heads(&self.v_proj.forward(value)?)?;

        let mut attn = q.matmul(&k.t()?)?;
        if let Some(mask) = attn_mask {
            let mask = mask.to_dtype(attn.dtype())?;
            attn = attn.broadcast_add(&mask.reshape((1, tgt_len, src_len))?)?;
        }
        let attn = candle_nn::ops::softmax(&attn, D::Minus1)?;
        let xs = attn
            .matmul(&v)?
            .transpose(0, 1)?
            .reshape((tgt_len, bsz, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&xs)
    }
}

// kaiming uniform with a = sqrt(5): bound 1 / sqrt(fan_in)
fn zero_bias_linear(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Linear> {
    let bound = 1. / (in_dim as f64).sqrt();
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn cross_attention_shape() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiheadAttention::new(vb, 16, 4)?;
        let q = Tensor::randn(0f32, 1., (1, 3, 16), &Device::Cpu)?;
        let kv = Tensor::randn(0f32, 1., (7, 3, 16), &Device::Cpu)?;
        assert_eq!(attn.forward(&q, &kv, &kv, None)?.dims(), &[1, 3, 16]);
        Ok(())
    }

    #[test]
    fn output_projection_starts_within_fan_in_bound() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        MultiheadAttention::new(vb, 16, 4)?;
        let data = varmap.data().lock().unwrap();
        let weight = data["out_proj.weight"].flatten_all()?.to_vec1::<f32>()?;
        assert!(weight.iter().all(|w| w.abs() <= 0.25));
        assert!(weight.iter().any(|w| *w != 0.));
        let bias = data["out_proj.bias"].to_vec1::<f32>()?;
        assert!(bias.iter().all(|b| *b == 0.));
        Ok(())
    }

    #[test]
    fn uniform_keys_average_values() -> Result<()> {
        // Identity projections with zero keys give a plain mean over values.
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let attn = MultiheadAttention::new(vb, 2, 1)?;
        {
            let data = varmap.data().lock().unwrap();
            let eye = Tensor::eye(2, DType::F32, &dev)?;
            let zeros = Tensor::zeros((2, 2), DType::F32, &dev)?;
            data["in_proj_weight"].set(&Tensor::cat(&[&eye, &zeros, &eye], 0)?)?;
            data["out_proj.weight"].set(&eye)?;
        }
        let q = Tensor::new(&[[[1f32, 0.]]], &dev)?;
        let kv = Tensor::new(&[[[1f32, 2.]], [[3., 4.]]], &dev)?;
        let out = attn.forward(&q, &kv, &kv, None)?.to_vec3::<f32>()?;
        assert!((out[0][0][0] - 2.).abs() < 1e-5);
        assert!((out[0][0][1] - 3.).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn separate_projection_changes_width() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let attn = MultiheadAttention::new_separate(vb, 8, 2, 5, 0.1)?;
        let q = Tensor::ones((1, 2, 8), DType::F32, &Device::Cpu)?;
        let kv = Tensor::ones((4, 2, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(attn.forward(&q, &kv, &kv, None)?.dims(), &[1, 2, 5]);
        Ok(())
    }
}
