pub mod clip;
pub use clip::{build_model, read_state_dict, trainable_vars, Clip, ClipVisionConfig, VisionLayers};

/// Architectures that can be built without a checkpoint.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum WhichModel {
    #[value(name = "vit-b32")]
    ViTB32,
    #[value(name = "vit-b16")]
    ViTB16,
    #[value(name = "vit-l14")]
    ViTL14,
    #[value(name = "rn50")]
    RN50,
    #[value(name = "rn101")]
    RN101,
}

impl WhichModel {
    pub fn config(&self) -> ClipVisionConfig {
        match self {
            WhichModel::ViTB32 => ClipVisionConfig::vit_b_32(),
            WhichModel::ViTB16 => ClipVisionConfig::vit_b_16(),
            WhichModel::ViTL14 => ClipVisionConfig::vit_l_14(),
            WhichModel::RN50 => ClipVisionConfig::rn50(),
            WhichModel::RN101 => ClipVisionConfig::rn101(),
        }
    }
}

pub fn get_model(
    vb: candle_nn::VarBuilder,
    model: WhichModel,
) -> candle_core::Result<Clip> {
    Clip::new(vb, model.config())
}
