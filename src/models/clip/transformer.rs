use super::{AggregationBlock, ResidualAttentionBlock, TemporalAggregationBlock};
use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

/// Residual blocks interleaved with a query-token aggregation path, followed
/// by a gated temporal correlation step.
#[derive(Debug, Clone)]
pub struct Transformer {
    width: usize,
    resblocks: Vec<ResidualAttentionBlock>,
    query: Tensor,
    aggblocks: Vec<AggregationBlock>,
    taggblocks: TemporalAggregationBlock,
    temporal_ada_weight: Tensor,
}

impl Transformer {
    pub fn new(
        vb: VarBuilder,
        width: usize,
        layers: usize,
        heads: usize,
        attn_mask: Option<Tensor>,
    ) -> Result<Self> {
        let vb_blocks = vb.pp("resblocks");
        let resblocks = (0..layers)
            .map(|i| ResidualAttentionBlock::new(vb_blocks.pp(i), width, heads, attn_mask.clone()))
            .collect::<Result<Vec<_>>>()?;
        let query = vb.get_with_hints((1, 1, width), "query", Init::Uniform { lo: 0., up: 1. })?;
        let vb_blocks = vb.pp("aggblocks");
        let aggblocks = (0..layers)
            .map(|i| AggregationBlock::new(vb_blocks.pp(i), width, heads, attn_mask.clone()))
            .collect::<Result<Vec<_>>>()?;
        let taggblocks = TemporalAggregationBlock::new(vb.pp("taggblocks"), width)?;
        let temporal_ada_weight = vb.get_with_hints(1, "temporal_ada_weight", Init::Const(0.))?;
        Ok(Self {
            width,
            resblocks,
            query,
            aggblocks,
            taggblocks,
            temporal_ada_weight,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn layers(&self) -> usize {
        self.resblocks.len()
    }

    /// `xs`: `(L, N*T, D)`. Returns the tokens and the aggregated query `(1, N*T, D)`.
    pub fn forward(&self, xs: &Tensor, frames: usize) -> Result<(Tensor, Tensor)> {
        let n = xs.dim(1)?;
        let mut query = self.query.repeat((1, n, 1))?;
        let mut xs = xs.clone();
        for (resblock, aggblock) in self.resblocks.iter().zip(self.aggblocks.iter()) {
            xs = resblock.forward(&xs)?;
            query = aggblock.forward(&xs, &query)?;
        }
        let temporal = self
            .taggblocks
            .forward(&xs, frames)?
            .broadcast_mul(&self.temporal_ada_weight)?;
        let xs = xs.broadcast_add(&temporal)?;
        Ok((xs, query))
    }
}
