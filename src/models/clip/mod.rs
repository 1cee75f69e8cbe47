mod adapter;
mod attention;
mod block;
mod layers;
pub mod loader;
mod model;
mod resnet;
mod temporal;
mod transformer;
mod vit;

pub use adapter::Adapter;
pub use attention::MultiheadAttention;
pub use block::{AggregationBlock, ResidualAttentionBlock};
pub use layers::{LayerNorm, Mlp, QuickGelu};
pub use loader::{build_model, infer_config, read_state_dict, trainable_vars, LoadReport};
pub use model::{normalize, pool_frames, Clip, ClipVisionConfig, Visual, VisionLayers};
pub use resnet::{AttentionPool2d, Bottleneck, ModifiedResNet};
pub use temporal::{CorrelationModule, TemporalAggregationBlock, UnfoldTemporalWindows};
pub use transformer::Transformer;
pub use vit::VisionTransformer;
