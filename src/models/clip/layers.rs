use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// LayerNorm that always normalizes in f32 and casts back to the input dtype.
///
/// The parameters stay in the model dtype so that loading or updating the
/// underlying vars reaches the forward pass.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(vb: VarBuilder, size: usize) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.))?;
        Ok(Self {
            weight,
            bias,
            eps: 1e-5,
        })
    }
}

impl candle_nn::Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let orig_dtype = xs.dtype();
        let ln = candle_nn::LayerNorm::new(
            self.weight.to_dtype(DType::F32)?,
            self.bias.to_dtype(DType::F32)?,
            self.eps,
        );
        xs.to_dtype(DType::F32)?.apply(&ln)?.to_dtype(orig_dtype)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuickGelu;

impl candle_nn::Module for QuickGelu {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?)?
    }
}

/// `c_fc -> QuickGelu -> c_proj`.
#[derive(Debug, Clone)]
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    pub fn new(vb: VarBuilder, in_dim: usize, hidden_dim: usize) -> Result<Self> {
        let c_fc = candle_nn::linear(in_dim, hidden_dim, vb.pp("c_fc"))?;
        let c_proj = candle_nn::linear(hidden_dim, in_dim, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }
}

impl candle_nn::Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.c_fc)?.apply(&QuickGelu)?.apply(&self.c_proj)
    }
}
