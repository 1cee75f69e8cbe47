use crate::core::Learner;
use crate::datasets::VideoFrames;
use crate::models::clip::{loader::count_params, pool_frames};
use crate::models::{build_model, get_model, read_state_dict, trainable_vars, Clip};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::time::Instant;

pub fn count_size(vm: &VarMap) -> usize {
    vm.all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum()
}

/// Parameter memory in MiB.
pub fn count_size_human(elems: usize, dtype: DType) -> f32 {
    (elems * dtype.size_in_bytes()) as f32 / 2f32.powf(20.0)
}

fn load_model(lnr: &Learner, device: &Device) -> anyhow::Result<(Clip, VarMap)> {
    let dtype: DType = lnr.dtype.into();
    match &lnr.checkpoint {
        Some(path) => {
            log::info!("loading weights from {path}");
            let state_dict = read_state_dict(path, device)?;
            let (model, varmap, report) = build_model(state_dict, dtype, device)?;
            for key in report.missing_keys.iter() {
                log::debug!("`{key}` keeps its initial value");
            }
            Ok((model, varmap))
        }
        None => {
            log::info!("building {:?} with fresh weights", lnr.model);
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, dtype, device);
            let model = get_model(vb, lnr.model)?;
            Ok((model, varmap))
        }
    }
}

pub fn run(lnr: &Learner) -> anyhow::Result<()> {
    let device = if lnr.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let loop_time = Instant::now();
    let (model, varmap) = load_model(lnr, &device)?;
    let total = count_size(&varmap);
    let trainable = trainable_vars(&varmap)?
        .into_iter()
        .map(|(_, var)| var)
        .collect::<Vec<_>>();
    let trainable = count_params(&trainable);
    log::info!(
        "{:?} ready in {:5.2?}: {total} parameters ({:.1} MiB), {trainable} trainable ({:.2}%)",
        model.config().vision_layers,
        loop_time.elapsed(),
        count_size_human(total, model.dtype()),
        trainable as f32 * 100. / total.max(1) as f32,
    );

    let frames = lnr.num_frames as usize;
    let resolution = model.visual().input_resolution();
    let images = match &lnr.frames_dir {
        Some(dir) => VideoFrames::new(dir)?.load(frames, resolution as u32, &device)?,
        None => {
            log::warn!("no frames directory given, encoding random frames");
            let batch = lnr.batch_size as usize * frames;
            Tensor::randn(0f32, 1., (batch, 3, resolution, resolution), &device)?
        }
    };

    let encode_time = Instant::now();
    let features = model.encode_image(&images, frames)?;
    let clips = pool_frames(&features, frames)?;
    log::info!(
        "encoded {:?} -> frames {:?}, clips {:?} in {:5.2?}",
        images.dims(),
        features.dims(),
        clips.dims(),
        encode_time.elapsed()
    );

    if let Some(path) = &lnr.output {
        let features = features.to_dtype(DType::F32)?;
        let clips = clips.to_dtype(DType::F32)?;
        Tensor::write_npz(&[("frame_features", &features), ("clip_features", &clips)], path)?;
        log::info!("Saved features to {path}");
    }
    if let Some(path) = &lnr.save {
        varmap.save(path)?;
        log::info!("Saved weights to {path}");
    }
    Ok(())
}
