use super::{LayerNorm, Transformer};
use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, Module, VarBuilder};

#[derive(Debug, Clone)]
pub struct VisionTransformer {
    input_resolution: usize,
    output_dim: usize,
    patch_size: usize,
    conv1: Conv2d,
    class_embedding: Tensor,
    positional_embedding: Tensor,
    ln_pre: LayerNorm,
    transformer: Transformer,
    ln_post: LayerNorm,
    ln_post_cls: LayerNorm,
    proj: Tensor,
    ada_weight: Tensor,
}

impl VisionTransformer {
    pub fn new(
        vb: VarBuilder,
        input_resolution: usize,
        patch_size: usize,
        width: usize,
        layers: usize,
        heads: usize,
        output_dim: usize,
    ) -> Result<Self> {
        log::debug!("building {} ({layers} layers, width {width})", vb.prefix());
        if input_resolution % patch_size != 0 {
            candle_core::bail!("resolution {input_resolution} is not a multiple of patch {patch_size}")
        }
        let conv1 = candle_nn::conv2d_no_bias(
            3,
            width,
            patch_size,
            Conv2dConfig {
                stride: patch_size,
                ..Default::default()
            },
            vb.pp("conv1"),
        )?;
        let scaled = Init::Randn {
            mean: 0.,
            stdev: (width as f64).powf(-0.5),
        };
        let grid = input_resolution / patch_size;
        let class_embedding = vb.get_with_hints(width, "class_embedding", scaled)?;
        let positional_embedding =
            vb.get_with_hints((grid * grid + 1, width), "positional_embedding", scaled)?;
        let ln_pre = LayerNorm::new(vb.pp("ln_pre"), width)?;
        let transformer = Transformer::new(vb.pp("transformer"), width, layers, heads, None)?;
        let ln_post = LayerNorm::new(vb.pp("ln_post"), width)?;
        let ln_post_cls = LayerNorm::new(vb.pp("ln_post_cls"), width)?;
        let proj = vb.get_with_hints((width, output_dim), "proj", scaled)?;
        let ada_weight = vb.get_with_hints(2, "ada_weight", Init::Const(0.5))?;
        Ok(Self {
            input_resolution,
            output_dim,
            patch_size,
            conv1,
            class_embedding,
            positional_embedding,
            ln_pre,
            transformer,
            ln_post,
            ln_post_cls,
            proj,
            ada_weight,
        })
    }

    pub fn input_resolution(&self) -> usize {
        self.input_resolution
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn conv1_weight(&self) -> &Tensor {
        self.conv1.weight()
    }

    /// `xs`: `(N*T, 3, H, W)` with the frames of each clip adjacent.
    pub fn forward(&self, xs: &Tensor, frames: usize) -> Result<Tensor> {
        let (b, _c, h, w) = xs.dims4()?;
        if frames == 0 || b % frames != 0 {
            candle_core::bail!("batch {b} is not a whole number of {frames}-frame clips")
        }
        if h % self.patch_size != 0 || w % self.patch_size != 0 {
            candle_core::bail!("image {h}x{w} is not a multiple of patch {}", self.patch_size)
        }
        let xs = self.conv1.forward(xs)?; // [*, width, grid, grid]
        let (b, width, gh, gw) = xs.dims4()?;
        let num_tokens = self.positional_embedding.dim(0)?;
        if gh * gw + 1 != num_tokens {
            candle_core::bail!("{gh}x{gw} patch grid does not match {num_tokens} positions")
        }
        let xs = xs.reshape((b, width, gh * gw))?.transpose(1, 2)?; // [*, grid ** 2, width]
        let cls = self
            .class_embedding
            .to_dtype(xs.dtype())?
            .reshape((1, 1, width))?
            .repeat((b, 1, 1))?;
        let xs = Tensor::cat(&[&cls, &xs], 1)?; // [*, grid ** 2 + 1, width]
        let xs = xs
            .broadcast_add(&self.positional_embedding.to_dtype(xs.dtype())?)?
            .apply(&self.ln_pre)?;

        let xs = xs.transpose(0, 1)?.contiguous()?; // NLD -> LND
        let (xs, query) = self.transformer.forward(&xs, frames)?;

        let cls = xs.i(0)?.apply(&self.ln_post)?;
        let query = query.i(0)?.apply(&self.ln_post_cls)?;
        let xs = (cls.broadcast_mul(&self.ada_weight.narrow(0, 0, 1)?)?
            + query.broadcast_mul(&self.ada_weight.narrow(0, 1, 1)?)?)?;
        xs.matmul(&self.proj)
    }
}
