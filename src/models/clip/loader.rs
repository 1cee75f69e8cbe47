//! Rebuilds a model from a bare parameter dictionary.
//!
//! Hyperparameters are never stored alongside the weights; they are read
//! back from the shapes of a handful of well-known entries.
use super::{Clip, ClipVisionConfig, VisionLayers};
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Keys that are metadata rather than weights.
const METADATA_KEYS: [&str; 3] = ["input_resolution", "context_length", "vocab_size"];

/// Name fragments of the parameters that fine-tuning updates; everything
/// else is the frozen image backbone.
const TRAINABLE_MARKERS: [&str; 8] = [
    "Adapter",
    "prefix_embedding",
    "aggblocks",
    "taggblocks",
    "transformer.query",
    "temporal_ada_weight",
    "ada_weight",
    "ln_post_cls",
];

fn dims<'a>(shapes: &'a HashMap<String, Vec<usize>>, key: &str) -> Result<&'a [usize]> {
    match shapes.get(key) {
        Some(dims) if !dims.is_empty() => Ok(dims),
        Some(_) => candle_core::bail!("`{key}` is a scalar, expected a tensor"),
        None => candle_core::bail!("state dict has no `{key}`"),
    }
}

fn square_side(tokens: usize) -> usize {
    (tokens.saturating_sub(1) as f64).sqrt().round() as usize
}

/// Infers the visual configuration from parameter shapes.
pub fn infer_config(shapes: &HashMap<String, Vec<usize>>) -> Result<ClipVisionConfig> {
    let vit = shapes.contains_key("visual.proj");
    let (vision_layers, vision_width, vision_patch_size, image_resolution) = if vit {
        let conv1 = dims(shapes, "visual.conv1.weight")?;
        // aggregation blocks carry attention weights too, only resblocks count
        let layers = shapes
            .keys()
            .filter(|k| {
                k.starts_with("visual.transformer.resblocks.")
                    && k.ends_with(".attn.in_proj_weight")
            })
            .count();
        let patch_size = conv1[conv1.len() - 1];
        let grid = square_side(dims(shapes, "visual.positional_embedding")?[0]);
        (
            VisionLayers::ViT(layers),
            conv1[0],
            Some(patch_size),
            patch_size * grid,
        )
    } else {
        let mut layers = [0usize; 4];
        for (b, count) in layers.iter_mut().enumerate() {
            let prefix = format!("visual.layer{}.", b + 1);
            *count = shapes
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix))
                .filter_map(|rest| rest.split('.').next())
                .collect::<BTreeSet<_>>()
                .len();
        }
        let width = dims(shapes, "visual.layer1.0.conv1.weight")?[0];
        let positions = dims(shapes, "visual.attnpool.positional_embedding")?[0];
        let output_width = square_side(positions);
        if output_width * output_width + 1 != positions {
            candle_core::bail!(
                "attnpool positional embedding has {positions} rows, not a square grid plus one"
            )
        }
        (VisionLayers::ResNet(layers), width, None, output_width * 32)
    };

    let embed_dim = match shapes.get("text_projection") {
        Some(proj) if proj.len() == 2 => proj[1],
        _ if vit => dims(shapes, "visual.proj")?[1],
        _ => dims(shapes, "visual.attnpool.c_proj.weight")?[0],
    };

    Ok(ClipVisionConfig {
        embed_dim,
        image_resolution,
        vision_layers,
        vision_width,
        vision_patch_size,
    })
}

/// Outcome of a non-strict load.
#[derive(Debug, Default, Clone)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// Model parameters absent from the state dict; they keep their init.
    pub missing_keys: Vec<String>,
    /// Visual entries of the state dict the model has no parameter for.
    pub unexpected_keys: Vec<String>,
}

/// Copies every matching entry into `varmap`, casting to the variable dtype.
pub fn load_state_dict(varmap: &VarMap, state_dict: &HashMap<String, Tensor>) -> Result<LoadReport> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("var map lock poisoned: {e}")))?;
    let mut report = LoadReport::default();
    for (name, var) in vars.iter() {
        match state_dict.get(name) {
            Some(tensor) => {
                if tensor.dims() != var.dims() {
                    candle_core::bail!(
                        "shape mismatch for `{name}`: checkpoint {:?}, model {:?}",
                        tensor.dims(),
                        var.dims()
                    )
                }
                let tensor = tensor
                    .to_device(var.device())?
                    .to_dtype(var.dtype())?
                    .contiguous()?;
                var.set(&tensor)?;
                report.loaded.push(name.clone());
            }
            None => report.missing_keys.push(name.clone()),
        }
    }
    report.unexpected_keys = state_dict
        .keys()
        .filter(|k| !vars.contains_key(*k))
        .cloned()
        .collect();
    report.loaded.sort();
    report.missing_keys.sort();
    report.unexpected_keys.sort();
    Ok(report)
}

/// Builds a trainable model from a state dict: infers the configuration,
/// initializes every parameter, then overwrites those the dict provides.
pub fn build_model(
    mut state_dict: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<(Clip, VarMap, LoadReport)> {
    let shapes = state_dict
        .iter()
        .map(|(k, v)| (k.clone(), v.dims().to_vec()))
        .collect::<HashMap<_, _>>();
    let config = infer_config(&shapes)?;
    log::info!("inferred {config:?}");

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let model = Clip::new(vb, config)?;

    for key in METADATA_KEYS {
        state_dict.remove(key);
    }
    state_dict.retain(|k, _| k.contains("visual") || k == "logit_scale");

    let report = load_state_dict(&varmap, &state_dict)?;
    log::info!(
        "loaded {} tensors, {} left at init, {} unused",
        report.loaded.len(),
        report.missing_keys.len(),
        report.unexpected_keys.len()
    );
    for key in report.unexpected_keys.iter() {
        log::warn!("unused checkpoint entry `{key}`");
    }
    Ok((model, varmap, report))
}

/// Reads a `.safetensors` or `.npz` parameter dictionary.
pub fn read_state_dict<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => candle_core::safetensors::load(path, device),
        Some("npz") => Tensor::read_npz(path)?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(device)?)))
            .collect(),
        _ => candle_core::bail!("unsupported checkpoint format: {}", path.display()),
    }
}

pub fn is_trainable(name: &str) -> bool {
    TRAINABLE_MARKERS.iter().any(|m| name.contains(m))
}

/// The parameters fine-tuning updates, sorted by name.
pub fn trainable_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("var map lock poisoned: {e}")))?;
    let mut trainable = vars
        .iter()
        .filter(|(name, _)| is_trainable(name))
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect::<Vec<_>>();
    trainable.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(trainable)
}

pub fn count_params(vars: &[Var]) -> usize {
    vars.iter().map(|v| v.as_tensor().elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(entries: &[(&str, &[usize])]) -> HashMap<String, Vec<usize>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn infers_vit_config() -> Result<()> {
        let mut s = shapes(&[
            ("visual.proj", &[768, 512]),
            ("visual.conv1.weight", &[768, 3, 16, 16]),
            ("visual.positional_embedding", &[197, 768]),
            ("text_projection", &[512, 512]),
        ]);
        for i in 0..12 {
            s.insert(
                format!("visual.transformer.resblocks.{i}.attn.in_proj_weight"),
                vec![2304, 768],
            );
            s.insert(
                format!("visual.transformer.aggblocks.{i}.attn.in_proj_weight"),
                vec![2304, 768],
            );
        }
        let config = infer_config(&s)?;
        assert_eq!(config, ClipVisionConfig::vit_b_16());
        Ok(())
    }

    #[test]
    fn infers_resnet_config() -> Result<()> {
        let mut s = HashMap::new();
        for (layer, blocks) in [(1, 3), (2, 4), (3, 6), (4, 3)] {
            for b in 0..blocks {
                for p in ["conv2.weight", "bn1.running_mean", "downsample.0.weight"] {
                    s.insert(format!("visual.layer{layer}.{b}.{p}"), vec![1]);
                }
            }
        }
        // layer10 must not be mistaken for layer1
        s.insert("visual.layer10.7.conv1.weight".to_string(), vec![1]);
        s.extend(shapes(&[
            ("visual.layer1.0.conv1.weight", &[64, 64, 1, 1]),
            ("visual.attnpool.positional_embedding", &[50, 2048]),
            ("text_projection", &[512, 1024]),
        ]));
        let config = infer_config(&s)?;
        assert_eq!(config, ClipVisionConfig::rn50());
        Ok(())
    }

    #[test]
    fn rejects_non_square_attnpool() {
        let s = shapes(&[
            ("visual.layer1.0.conv1.weight", &[64, 64, 1, 1]),
            ("visual.attnpool.positional_embedding", &[51, 2048]),
            ("text_projection", &[512, 1024]),
        ]);
        assert!(infer_config(&s).is_err());
    }

    #[test]
    fn embed_dim_falls_back_to_visual_projection() -> Result<()> {
        let s = shapes(&[
            ("visual.proj", &[64, 24]),
            ("visual.conv1.weight", &[64, 3, 8, 8]),
            ("visual.positional_embedding", &[5, 64]),
        ]);
        let config = infer_config(&s)?;
        assert_eq!(config.embed_dim, 24);
        assert_eq!(config.image_resolution, 16);
        assert_eq!(config.vision_layers, VisionLayers::ViT(0));
        Ok(())
    }

    fn tiny_state_dict(dev: &Device) -> Result<HashMap<String, Tensor>> {
        let mut sd = HashMap::new();
        sd.insert("visual.proj".to_string(), Tensor::ones((64, 8), DType::F32, dev)?);
        sd.insert(
            "visual.conv1.weight".to_string(),
            Tensor::ones((64, 3, 8, 8), DType::F32, dev)?,
        );
        sd.insert(
            "visual.positional_embedding".to_string(),
            Tensor::ones((5, 64), DType::F32, dev)?,
        );
        sd.insert(
            "visual.class_embedding".to_string(),
            Tensor::ones(64, DType::F32, dev)?,
        );
        sd.insert(
            "visual.transformer.resblocks.0.attn.in_proj_weight".to_string(),
            Tensor::ones((192, 64), DType::F32, dev)?,
        );
        sd.insert("text_projection".to_string(), Tensor::ones((16, 8), DType::F32, dev)?);
        sd.insert(
            "transformer.resblocks.0.attn.in_proj_weight".to_string(),
            Tensor::ones((48, 16), DType::F32, dev)?,
        );
        sd.insert("vocab_size".to_string(), Tensor::new(49408u32, dev)?);
        sd.insert("visual.legacy_head".to_string(), Tensor::ones(3, DType::F32, dev)?);
        Ok(sd)
    }

    #[test]
    fn builds_and_loads_non_strictly() -> Result<()> {
        let dev = Device::Cpu;
        let (model, varmap, report) = build_model(tiny_state_dict(&dev)?, DType::F32, &dev)?;
        assert_eq!(model.config().vision_layers, VisionLayers::ViT(1));
        assert_eq!(model.config().embed_dim, 8);

        assert!(report.loaded.contains(&"visual.class_embedding".to_string()));
        assert_eq!(report.unexpected_keys, vec!["visual.legacy_head".to_string()]);
        assert!(report
            .missing_keys
            .contains(&"visual.transformer.resblocks.0.S_Adapter.mlp.c_out.weight".to_string()));

        let data = varmap.data().lock().unwrap();
        let cls = data["visual.class_embedding"].to_vec1::<f32>()?;
        assert!(cls.iter().all(|&v| v == 1.));
        let adapter = data["visual.transformer.resblocks.0.MLP_Adapter.mlp.c_out.bias"]
            .to_vec1::<f32>()?;
        assert!(adapter.iter().all(|&v| v == 0.));
        assert!(!data.keys().any(|k| k.starts_with("transformer.")));
        drop(data);

        let frames = Tensor::randn(0f32, 1., (2, 3, 16, 16), &dev)?;
        assert_eq!(model.encode_image(&frames, 2)?.dims(), &[2, 8]);
        Ok(())
    }

    #[test]
    fn casts_to_model_dtype() -> Result<()> {
        let dev = Device::Cpu;
        let (model, varmap, _) = build_model(tiny_state_dict(&dev)?, DType::F16, &dev)?;
        assert_eq!(model.dtype(), DType::F16);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["visual.proj"].dtype(), DType::F16);
        assert_eq!(data["visual.ln_post.weight"].dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn half_model_uses_loaded_values() -> Result<()> {
        // Both post norms reduce to their bias, so every output is
        // (0.5 * 1 + 0.5 * 1) summed over 64 ones of `visual.proj`.
        let dev = Device::Cpu;
        let frames = (Tensor::randn(0f32, 1., (2, 3, 16, 16), &dev)? * 0.1)?;
        let mut outputs = Vec::new();
        for dtype in [DType::F32, DType::F16] {
            let mut sd = tiny_state_dict(&dev)?;
            for ln in ["visual.ln_post", "visual.ln_post_cls"] {
                sd.insert(format!("{ln}.weight"), Tensor::zeros(64, DType::F32, &dev)?);
                sd.insert(format!("{ln}.bias"), Tensor::ones(64, DType::F32, &dev)?);
            }
            let (model, _, report) = build_model(sd, dtype, &dev)?;
            assert!(report.loaded.contains(&"visual.ln_post_cls.bias".to_string()));
            let out = model.encode_image(&frames, 2)?.to_dtype(DType::F32)?;
            assert_eq!(out.dims(), &[2, 8]);
            outputs.push(out);
        }
        for out in outputs.iter() {
            let sum = out.abs()?.sum_all()?.to_vec0::<f32>()?;
            assert!((sum - 1024.).abs() < 1e-2, "{sum}");
        }
        let diff = (&outputs[0] - &outputs[1])?.abs()?.max_keepdim(0)?.max_keepdim(1)?;
        assert!(diff.flatten_all()?.to_vec1::<f32>()?[0] < 1e-2);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_an_error() -> Result<()> {
        let dev = Device::Cpu;
        let mut sd = tiny_state_dict(&dev)?;
        sd.insert("visual.ln_pre.weight".to_string(), Tensor::ones(32, DType::F32, &dev)?);
        assert!(build_model(sd, DType::F32, &dev).is_err());
        Ok(())
    }

    #[test]
    fn selects_fine_tuning_parameters() -> Result<()> {
        let dev = Device::Cpu;
        let (_, varmap, _) = build_model(tiny_state_dict(&dev)?, DType::F32, &dev)?;
        let names = trainable_vars(&varmap)?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        for expected in [
            "visual.ada_weight",
            "visual.ln_post_cls.weight",
            "visual.transformer.query",
            "visual.transformer.temporal_ada_weight",
            "visual.transformer.taggblocks.ln_1.bias",
            "visual.transformer.aggblocks.0.mlp.c_fc.weight",
            "visual.transformer.resblocks.0.prefix_embedding_v",
            "visual.transformer.resblocks.0.S_Adapter.mlp.c_in.weight",
        ] {
            assert!(names.iter().any(|n| n == expected), "{expected} not trainable");
        }
        for frozen in ["visual.conv1.weight", "visual.proj", "visual.ln_post.weight"] {
            assert!(!is_trainable(frozen), "{frozen} should be frozen");
        }
        assert!(!is_trainable("visual.transformer.resblocks.0.attn.in_proj_weight"));
        Ok(())
    }
}
