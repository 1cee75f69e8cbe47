use crate::models::WhichModel;
use clap::Parser;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum WhichDType {
    F32,
    F16,
    BF16,
}

impl From<WhichDType> for candle_core::DType {
    fn from(dtype: WhichDType) -> Self {
        match dtype {
            WhichDType::F32 => candle_core::DType::F32,
            WhichDType::F16 => candle_core::DType::F16,
            WhichDType::BF16 => candle_core::DType::BF16,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "Video CLIP encoder with candle")]
#[command(version = "0.1")]
#[command(about = "Encode video clips with an adapter-tuned CLIP vision tower", long_about = None)]
pub struct Learner {
    /// Name of this run
    #[arg(short, long)]
    pub name: String,

    /// architecture to build when no checkpoint is given
    #[arg(short, long, value_enum, default_value_t=WhichModel::ViTB16)]
    pub model: WhichModel,

    /// checkpoint (.safetensors or .npz); hyperparameters are inferred from it
    #[arg(short, long)]
    pub checkpoint: Option<String>,

    /// directory holding the frames of one clip
    #[arg(short, long)]
    pub frames_dir: Option<String>,

    /// frames per clip
    #[arg(short = 't', long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 8)]
    pub num_frames: u32,

    /// clips per batch when no frames directory is given
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 1)]
    pub batch_size: u32,

    /// parameter dtype
    #[arg(short, long, value_enum, default_value_t = WhichDType::F32)]
    pub dtype: WhichDType,

    /// run on cpu even when cuda is available
    #[arg(long, default_value_t = false)]
    pub cpu: bool,

    /// save encoded features (.npz)
    #[arg(short, long)]
    pub output: Option<String>,

    /// save the full parameter set after loading (.safetensors)
    #[arg(long)]
    pub save: Option<String>,

    /// recoder home path
    #[arg(short, long, default_value_t = String::from("tmp"))]
    pub recoder_home: String,

    /// print debug records to stderr as well
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}
