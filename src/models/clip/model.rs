use super::{ModifiedResNet, VisionTransformer};
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionLayers {
    ResNet([usize; 4]),
    ViT(usize),
}

/// Hyperparameters of the visual tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipVisionConfig {
    pub embed_dim: usize,
    pub image_resolution: usize,
    pub vision_layers: VisionLayers,
    pub vision_width: usize,
    /// Only meaningful for the ViT backbone.
    pub vision_patch_size: Option<usize>,
}

impl ClipVisionConfig {
    pub fn vision_heads(&self) -> usize {
        match self.vision_layers {
            VisionLayers::ResNet(_) => self.vision_width * 32 / 64,
            VisionLayers::ViT(_) => self.vision_width / 64,
        }
    }

    pub fn vit_b_32() -> Self {
        Self {
            embed_dim: 512,
            image_resolution: 224,
            vision_layers: VisionLayers::ViT(12),
            vision_width: 768,
            vision_patch_size: Some(32),
        }
    }

    pub fn vit_b_16() -> Self {
        Self {
            vision_patch_size: Some(16),
            ..Self::vit_b_32()
        }
    }

    pub fn vit_l_14() -> Self {
        Self {
            embed_dim: 768,
            image_resolution: 224,
            vision_layers: VisionLayers::ViT(24),
            vision_width: 1024,
            vision_patch_size: Some(14),
        }
    }

    pub fn rn50() -> Self {
        Self {
            embed_dim: 1024,
            image_resolution: 224,
            vision_layers: VisionLayers::ResNet([3, 4, 6, 3]),
            vision_width: 64,
            vision_patch_size: None,
        }
    }

    pub fn rn101() -> Self {
        Self {
            embed_dim: 512,
            vision_layers: VisionLayers::ResNet([3, 4, 23, 3]),
            ..Self::rn50()
        }
    }
}

#[derive(Debug, Clone)]
pub enum Visual {
    ResNet(ModifiedResNet),
    ViT(VisionTransformer),
}

impl Visual {
    /// The ResNet backbone has no temporal path and ignores `frames`.
    pub fn forward(&self, image: &Tensor, frames: usize) -> Result<Tensor> {
        match self {
            Visual::ResNet(resnet) => resnet.forward(image),
            Visual::ViT(vit) => vit.forward(image, frames),
        }
    }

    pub fn conv1_weight(&self) -> &Tensor {
        match self {
            Visual::ResNet(resnet) => resnet.conv1_weight(),
            Visual::ViT(vit) => vit.conv1_weight(),
        }
    }

    pub fn input_resolution(&self) -> usize {
        match self {
            Visual::ResNet(resnet) => resnet.input_resolution(),
            Visual::ViT(vit) => vit.input_resolution(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Visual::ResNet(resnet) => resnet.output_dim(),
            Visual::ViT(vit) => vit.output_dim(),
        }
    }
}

/// Divides each row by its L2 norm.
pub fn normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    xs.broadcast_div(&norm)
}

/// Averages `(N*T, D)` frame features into `(N, D)` clip features.
pub fn pool_frames(features: &Tensor, frames: usize) -> Result<Tensor> {
    let (b, d) = features.dims2()?;
    if frames == 0 || b % frames != 0 {
        candle_core::bail!("batch {b} is not a whole number of {frames}-frame clips")
    }
    features.reshape((b / frames, frames, d))?.mean(1)
}

#[derive(Debug, Clone)]
pub struct Clip {
    config: ClipVisionConfig,
    visual: Visual,
    logit_scale: Tensor,
}

impl Clip {
    pub fn new(vb: VarBuilder, config: ClipVisionConfig) -> Result<Self> {
        let heads = config.vision_heads();
        let vb_visual = vb.pp("visual");
        let visual = match config.vision_layers {
            VisionLayers::ResNet(layers) => Visual::ResNet(ModifiedResNet::new(
                vb_visual,
                layers,
                config.embed_dim,
                heads,
                config.image_resolution,
                config.vision_width,
            )?),
            VisionLayers::ViT(layers) => {
                let Some(patch_size) = config.vision_patch_size else {
                    candle_core::bail!("a ViT backbone needs a patch size")
                };
                Visual::ViT(VisionTransformer::new(
                    vb_visual,
                    config.image_resolution,
                    patch_size,
                    config.vision_width,
                    layers,
                    heads,
                    config.embed_dim,
                )?)
            }
        };
        let logit_scale =
            vb.get_with_hints((), "logit_scale", Init::Const((1. / 0.07f64).ln()))?;
        Ok(Self {
            config,
            visual,
            logit_scale,
        })
    }

    pub fn config(&self) -> &ClipVisionConfig {
        &self.config
    }

    pub fn visual(&self) -> &Visual {
        &self.visual
    }

    pub fn dtype(&self) -> DType {
        self.visual.conv1_weight().dtype()
    }

    /// `image`: `(N*T, 3, H, W)`, returns `(N*T, embed_dim)`.
    pub fn encode_image(&self, image: &Tensor, frames: usize) -> Result<Tensor> {
        self.visual.forward(&image.to_dtype(self.dtype())?, frames)
    }

    /// One embedding per clip: frame features averaged over time, `(N, embed_dim)`.
    pub fn encode_video(&self, image: &Tensor, frames: usize) -> Result<Tensor> {
        pool_frames(&self.encode_image(image, frames)?, frames)
    }

    /// Contrastive logits against externally computed text features.
    /// Returns `(logits_per_image, logits_per_text)`.
    pub fn forward(
        &self,
        image: &Tensor,
        frames: usize,
        text_features: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let image_features = normalize(&self.encode_image(image, frames)?)?;
        let text_features = normalize(&text_features.to_dtype(image_features.dtype())?)?;
        let logit_scale = self.logit_scale.to_dtype(image_features.dtype())?.exp()?;
        let logits_per_image =
            logit_scale.broadcast_mul(&image_features.matmul(&text_features.t()?)?)?;
        let logits_per_text = logits_per_image.t()?;
        Ok((logits_per_image, logits_per_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_vit() -> ClipVisionConfig {
        ClipVisionConfig {
            embed_dim: 8,
            image_resolution: 16,
            vision_layers: VisionLayers::ViT(1),
            vision_width: 64,
            vision_patch_size: Some(8),
        }
    }

    #[test]
    fn heads_follow_backbone() {
        assert_eq!(ClipVisionConfig::vit_b_16().vision_heads(), 12);
        assert_eq!(ClipVisionConfig::vit_l_14().vision_heads(), 16);
        assert_eq!(ClipVisionConfig::rn50().vision_heads(), 32);
    }

    #[test]
    fn vit_without_patch_size_is_rejected() {
        let config = ClipVisionConfig {
            vision_patch_size: None,
            ..tiny_vit()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(Clip::new(vb, config).is_err());
    }

    #[test]
    fn contrastive_logits() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let clip = Clip::new(vb, tiny_vit())?;
        assert_eq!(clip.dtype(), DType::F32);

        let frames = Tensor::randn(0f32, 1., (4, 3, 16, 16), &Device::Cpu)?;
        let text = Tensor::randn(0f32, 1., (3, 8), &Device::Cpu)?;
        let (per_image, per_text) = clip.forward(&frames, 2, &text)?;
        assert_eq!(per_image.dims(), &[4, 3]);
        assert_eq!(per_text.dims(), &[3, 4]);

        // cosine similarities scaled by 1/0.07
        let max = per_image.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
        assert!(max <= 1. / 0.07 + 1e-3);
        Ok(())
    }

    #[test]
    fn video_embedding_averages_frames() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let clip = Clip::new(vb, tiny_vit())?;
        let frames = Tensor::randn(0f32, 1., (6, 3, 16, 16), &Device::Cpu)?;
        let per_frame = clip.encode_image(&frames, 3)?;
        let per_clip = clip.encode_video(&frames, 3)?;
        assert_eq!(per_clip.dims(), &[2, 8]);
        let expected = per_frame.narrow(0, 3, 3)?.mean(0)?;
        let diff = (per_clip.get(1)? - expected)?.abs()?.sum_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn resnet_ignores_frame_count() -> Result<()> {
        let config = ClipVisionConfig {
            embed_dim: 6,
            image_resolution: 32,
            vision_layers: VisionLayers::ResNet([1, 1, 1, 1]),
            vision_width: 4,
            vision_patch_size: None,
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let clip = Clip::new(vb, config)?;
        let frames = Tensor::randn(0f32, 1., (3, 3, 32, 32), &Device::Cpu)?;
        assert_eq!(clip.encode_image(&frames, 2)?.dims(), &[3, 6]);
        Ok(())
    }

    #[test]
    fn normalize_gives_unit_rows() -> Result<()> {
        let xs = Tensor::new(&[[3f32, 4.], [0., 2.]], &Device::Cpu)?;
        let ys = normalize(&xs)?.to_vec2::<f32>()?;
        assert_eq!(ys, vec![vec![0.6, 0.8], vec![0., 1.]]);
        Ok(())
    }
}
