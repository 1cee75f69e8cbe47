use super::{Adapter, LayerNorm, Mlp, MultiheadAttention};
use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

const PREFIX_LENGTH: usize = 8;

/// Pre-norm transformer block with learned key/value prefixes and two
/// parallel adapters.
#[derive(Debug, Clone)]
pub struct ResidualAttentionBlock {
    attn: MultiheadAttention,
    ln_1: LayerNorm,
    mlp: Mlp,
    ln_2: LayerNorm,
    attn_mask: Option<Tensor>,
    s_adapter: Adapter,
    mlp_adapter: Adapter,
    prefix_embedding_k: Tensor,
    prefix_embedding_v: Tensor,
}

impl ResidualAttentionBlock {
    pub fn new(
        vb: VarBuilder,
        d_model: usize,
        n_head: usize,
        attn_mask: Option<Tensor>,
    ) -> Result<Self> {
        log::debug!("building {}", vb.prefix());
        let attn = MultiheadAttention::new(vb.pp("attn"), d_model, n_head)?;
        let ln_1 = LayerNorm::new(vb.pp("ln_1"), d_model)?;
        let mlp = Mlp::new(vb.pp("mlp"), d_model, d_model * 4)?;
        let ln_2 = LayerNorm::new(vb.pp("ln_2"), d_model)?;
        let s_adapter = Adapter::new(vb.pp("S_Adapter"), d_model, false)?;
        let mlp_adapter = Adapter::new(vb.pp("MLP_Adapter"), d_model, false)?;

        let prefix_init = Init::Randn {
            mean: 0.,
            stdev: (d_model as f64).powf(-0.5),
        };
        let prefix_embedding_k =
            vb.get_with_hints((PREFIX_LENGTH, 1, d_model), "prefix_embedding_k", prefix_init)?;
        let prefix_embedding_v =
            vb.get_with_hints((PREFIX_LENGTH, 1, d_model), "prefix_embedding_v", prefix_init)?;
        Ok(Self {
            attn,
            ln_1,
            mlp,
            ln_2,
            attn_mask,
            s_adapter,
            mlp_adapter,
            prefix_embedding_k,
            prefix_embedding_v,
        })
    }

    // keys and values get the prefix tokens appended along the sequence axis
    fn attention(&self, xs: &Tensor) -> Result<Tensor> {
        let n = xs.dim(1)?;
        let prefix_k = self.prefix_embedding_k.repeat((1, n, 1))?;
        let prefix_v = self.prefix_embedding_v.repeat((1, n, 1))?;
        let key = Tensor::cat(&[xs, &prefix_k], 0)?;
        let value = Tensor::cat(&[xs, &prefix_v], 0)?;
        self.attn.forward(xs, &key, &value, self.attn_mask.as_ref())
    }
}

impl candle_nn::Module for ResidualAttentionBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attn = self.attention(&xs.apply(&self.ln_1)?)?;
        let xs = ((xs + attn)? + self.s_adapter.forward(xs)?)?;
        let mlp = xs.apply(&self.ln_2)?.apply(&self.mlp)?;
        (&xs + mlp)? + self.mlp_adapter.forward(&xs)?
    }
}

/// Lets a per-clip query token attend over the tokens of one layer.
#[derive(Debug, Clone)]
pub struct AggregationBlock {
    attn: MultiheadAttention,
    ln_1: LayerNorm,
    mlp: Mlp,
    ln_2: LayerNorm,
    attn_mask: Option<Tensor>,
}

impl AggregationBlock {
    pub fn new(
        vb: VarBuilder,
        d_model: usize,
        n_head: usize,
        attn_mask: Option<Tensor>,
    ) -> Result<Self> {
        log::debug!("building {}", vb.prefix());
        Ok(Self {
            attn: MultiheadAttention::new(vb.pp("attn"), d_model, n_head)?,
            ln_1: LayerNorm::new(vb.pp("ln_1"), d_model)?,
            mlp: Mlp::new(vb.pp("mlp"), d_model, d_model)?,
            ln_2: LayerNorm::new(vb.pp("ln_2"), d_model)?,
            attn_mask,
        })
    }

    /// `xs`: `(L, N, D)` layer tokens, `cls`: `(1, N, D)` query token.
    pub fn forward(&self, xs: &Tensor, cls: &Tensor) -> Result<Tensor> {
        let ys = Tensor::cat(&[cls, xs], 0)?.apply(&self.ln_1)?;
        let len = ys.dim(0)?;
        let query = ys.narrow(0, 0, 1)?;
        let tokens = ys.narrow(0, 1, len - 1)?;
        let cls = (cls + self.attn.forward(&query, &tokens, &tokens, self.attn_mask.as_ref())?)?;
        let mlp = cls.apply(&self.ln_2)?.apply(&self.mlp)?;
        cls + mlp
    }
}
