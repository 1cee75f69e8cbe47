use super::MultiheadAttention;
use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, Module, VarBuilder};

const EXPANSION: usize = 4;

// Backbone statistics stay frozen: batch norm always runs on running stats.
fn batch_norm(vb: VarBuilder, num_features: usize, zero_weight: bool) -> Result<BatchNorm> {
    let weight_init = Init::Const(if zero_weight { 0. } else { 1. });
    BatchNorm::new(
        num_features,
        vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?,
        vb.get_with_hints(num_features, "running_var", Init::Const(1.))?,
        vb.get_with_hints(num_features, "weight", weight_init)?,
        vb.get_with_hints(num_features, "bias", Init::Const(0.))?,
        1e-5,
    )
}

fn conv(vb: VarBuilder, c_in: usize, c_out: usize, kernel: usize, stride: usize) -> Result<Conv2d> {
    candle_nn::conv2d_no_bias(
        c_in,
        c_out,
        kernel,
        Conv2dConfig {
            stride,
            padding: kernel / 2,
            ..Default::default()
        },
        vb,
    )
}

fn avg_pool(xs: Tensor, stride: usize) -> Result<Tensor> {
    if stride > 1 {
        xs.avg_pool2d(stride)
    } else {
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
struct Downsample {
    stride: usize,
    conv: Conv2d,
    bn: BatchNorm,
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        avg_pool(xs.clone(), self.stride)?
            .apply(&self.conv)?
            .apply_t(&self.bn, false)
    }
}

/// Anti-aliased bottleneck: strided blocks average-pool after the 3x3 conv
/// instead of striding the convolution.
#[derive(Debug, Clone)]
pub struct Bottleneck {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    stride: usize,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    pub fn new(vb: VarBuilder, inplanes: usize, planes: usize, stride: usize) -> Result<Self> {
        log::debug!("building {}", vb.prefix());
        let conv1 = conv(vb.pp("conv1"), inplanes, planes, 1, 1)?;
        let bn1 = batch_norm(vb.pp("bn1"), planes, false)?;
        let conv2 = conv(vb.pp("conv2"), planes, planes, 3, 1)?;
        let bn2 = batch_norm(vb.pp("bn2"), planes, false)?;
        let conv3 = conv(vb.pp("conv3"), planes, planes * EXPANSION, 1, 1)?;
        let bn3 = batch_norm(vb.pp("bn3"), planes * EXPANSION, true)?;
        let downsample = if stride > 1 || inplanes != planes * EXPANSION {
            let vb = vb.pp("downsample");
            Some(Downsample {
                stride,
                conv: conv(vb.pp("0"), inplanes, planes * EXPANSION, 1, 1)?,
                bn: batch_norm(vb.pp("1"), planes * EXPANSION, false)?,
            })
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            stride,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?
            .relu()?;
        let out = avg_pool(out, self.stride)?
            .apply(&self.conv3)?
            .apply_t(&self.bn3, false)?;
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(xs)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

/// QKV attention pooling: the spatial mean token attends over the feature map.
#[derive(Debug, Clone)]
pub struct AttentionPool2d {
    positional_embedding: Tensor,
    attn: MultiheadAttention,
}

impl AttentionPool2d {
    pub fn new(
        vb: VarBuilder,
        spacial_dim: usize,
        embed_dim: usize,
        num_heads: usize,
        output_dim: usize,
    ) -> Result<Self> {
        let std = (embed_dim as f64).powf(-0.5);
        let positional_embedding = vb.get_with_hints(
            (spacial_dim * spacial_dim + 1, embed_dim),
            "positional_embedding",
            Init::Randn {
                mean: 0.,
                stdev: std,
            },
        )?;
        let attn = MultiheadAttention::new_separate(vb, embed_dim, num_heads, output_dim, std)?;
        Ok(Self {
            positional_embedding,
            attn,
        })
    }
}

impl Module for AttentionPool2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.flatten_from(2)?.permute((2, 0, 1))?; // NCHW -> (HW)NC
        let xs = Tensor::cat(&[&xs.mean_keepdim(0)?, &xs], 0)?; // (HW+1)NC
        let (tokens, _, _) = xs.dims3()?;
        if tokens != self.positional_embedding.dim(0)? {
            candle_core::bail!(
                "{} spatial tokens do not match {} positions",
                tokens - 1,
                self.positional_embedding.dim(0)? - 1
            )
        }
        let pos = self.positional_embedding.to_dtype(xs.dtype())?.unsqueeze(1)?;
        let xs = xs.broadcast_add(&pos)?;
        let query = xs.narrow(0, 0, 1)?;
        self.attn.forward(&query, &xs, &xs, None)?.squeeze(0)
    }
}

/// ResNet with a 3-conv stem, anti-aliased strided blocks and an attention
/// pooling head.
#[derive(Debug, Clone)]
pub struct ModifiedResNet {
    output_dim: usize,
    input_resolution: usize,
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    layers: Vec<Vec<Bottleneck>>,
    attnpool: AttentionPool2d,
}

impl ModifiedResNet {
    pub fn new(
        vb: VarBuilder,
        layers: [usize; 4],
        output_dim: usize,
        heads: usize,
        input_resolution: usize,
        width: usize,
    ) -> Result<Self> {
        log::debug!("building {} ({layers:?} blocks, width {width})", vb.prefix());
        let conv1 = conv(vb.pp("conv1"), 3, width / 2, 3, 2)?;
        let bn1 = batch_norm(vb.pp("bn1"), width / 2, false)?;
        let conv2 = conv(vb.pp("conv2"), width / 2, width / 2, 3, 1)?;
        let bn2 = batch_norm(vb.pp("bn2"), width / 2, false)?;
        let conv3 = conv(vb.pp("conv3"), width / 2, width, 3, 1)?;
        let bn3 = batch_norm(vb.pp("bn3"), width, false)?;

        let mut inplanes = width;
        let mut stages = Vec::with_capacity(4);
        for (i, &blocks) in layers.iter().enumerate() {
            let planes = width << i;
            let stride = if i == 0 { 1 } else { 2 };
            let vb_layer = vb.pp(format!("layer{}", i + 1));
            let mut stage = Vec::with_capacity(blocks);
            for b in 0..blocks {
                let stride = if b == 0 { stride } else { 1 };
                stage.push(Bottleneck::new(vb_layer.pp(b), inplanes, planes, stride)?);
                inplanes = planes * EXPANSION;
            }
            stages.push(stage);
        }

        let embed_dim = width * 32; // the ResNet feature dimension
        let attnpool = AttentionPool2d::new(
            vb.pp("attnpool"),
            input_resolution / 32,
            embed_dim,
            heads,
            output_dim,
        )?;
        Ok(Self {
            output_dim,
            input_resolution,
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            layers: stages,
            attnpool,
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

    fn stem(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv1)?
            .apply_t(&self.bn1, false)?
            .relu()?
            .apply(&self.conv2)?
            .apply_t(&self.bn2, false)?
            .relu()?
            .apply(&self.conv3)?
            .apply_t(&self.bn3, false)?
            .relu()?
            .avg_pool2d(2)
    }
}

impl Module for ModifiedResNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.stem(&xs.to_dtype(self.conv1.weight().dtype())?)?;
        for block in self.layers.iter().flatten() {
            xs = block.forward(&xs)?;
        }
        self.attnpool.forward(&xs)
    }
}
