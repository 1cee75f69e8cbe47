use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

const FRAME_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Decoded frames of one video, stored as image files in a directory.
#[derive(Debug, Clone)]
pub struct VideoFrames {
    pub paths: Vec<PathBuf>,
}

impl VideoFrames {
    pub fn new<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let mut paths = walkdir::WalkDir::new(dir.as_ref())
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        if paths.is_empty() {
            anyhow::bail!("no frames found in {}", dir.as_ref().display())
        }
        paths.sort();
        log::info!("found {} frames in {}", paths.len(), dir.as_ref().display());
        Ok(Self { paths })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Loads `frames` uniformly spaced frames as a `(frames, 3, R, R)` tensor.
    pub fn load(&self, frames: usize, resolution: u32, device: &Device) -> anyhow::Result<Tensor> {
        let picked = sample_indices(self.len(), frames)
            .into_iter()
            .map(|i| &self.paths[i])
            .collect::<Vec<_>>();
        let data = picked
            .par_iter()
            .map(|p| -> anyhow::Result<Vec<f32>> {
                let img = image::open(p)?;
                Ok(preprocess(&img, resolution))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
            .concat();
        let r = resolution as usize;
        Ok(Tensor::from_vec(data, (frames, 3, r, r), device)?)
    }
}

/// Centers of `frames` equal segments over `len` items.
pub fn sample_indices(len: usize, frames: usize) -> Vec<usize> {
    (0..frames)
        .map(|i| ((2 * i + 1) * len / (2 * frames)).min(len.saturating_sub(1)))
        .collect()
}

/// Short side resized to `resolution` (bicubic), center crop, CLIP
/// normalization. Returns CHW values.
pub fn preprocess(img: &DynamicImage, resolution: u32) -> Vec<f32> {
    let (w, h) = (img.width().max(1), img.height().max(1));
    let scale = resolution as f64 / w.min(h) as f64;
    let nw = ((w as f64 * scale).round() as u32).max(resolution);
    let nh = ((h as f64 * scale).round() as u32).max(resolution);
    let img = img
        .resize_exact(nw, nh, FilterType::CatmullRom)
        .crop_imm((nw - resolution) / 2, (nh - resolution) / 2, resolution, resolution)
        .to_rgb8();

    let plane = (resolution * resolution) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 / 255. - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    data
}
