mod frames;
pub use frames::{preprocess, sample_indices, VideoFrames, CLIP_MEAN, CLIP_STD};
