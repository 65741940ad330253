//! Transfer-learning backend: fine-tunes a pretrained classifier on an
//! image-folder dataset and scores the result.
//!
//! Everything here is synchronous and CPU/GPU bound; callers run it inside
//! `spawn_blocking`.

pub mod data;
pub mod metrics;
pub mod vision;

pub use data::{discover_layout, DatasetLayout, Sample};
pub use metrics::{ClassMetrics, EvaluationReport};
pub use vision::build_model;

use crate::models::ModelArchitecture;
use crate::{ForgeError, Result};
use candle_core::{DType, Device, D};
use candle_nn::{loss, AdamW, ModuleT, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TrainSpec {
    pub arch: ModelArchitecture,
    pub num_classes: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Optional safetensors checkpoint to warm-start feature weights from.
    pub pretrained_weights: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EpochStats {
    pub epoch: usize,
    pub epochs: usize,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub final_loss: f64,
    pub final_val_loss: Option<f64>,
    pub epochs: usize,
    pub training_seconds: f64,
}

/// Best available device; CPU when no accelerator is present.
pub fn device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

pub fn accelerator_available() -> bool {
    candle_core::utils::cuda_is_available()
}

/// Copy every pretrained tensor whose name and shape match into the model
/// variables. The classifier head never matches (its shape depends on
/// `num_classes`), so it keeps its fresh initialization.
fn load_pretrained(varmap: &VarMap, path: &Path, device: &Device) -> Result<(usize, usize)> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0;
    let mut skipped = 0;
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(tensor) if tensor.shape() == var.shape() => {
                var.set(tensor)?;
                loaded += 1;
            }
            _ => skipped += 1,
        }
    }
    Ok((loaded, skipped))
}

fn epoch_loss(
    model: &dyn ModuleT,
    samples: &[Sample],
    batch_size: usize,
    device: &Device,
) -> Result<f64> {
    let mut total = 0f64;
    let mut count = 0usize;
    for batch in samples.chunks(batch_size) {
        let (images, labels) = data::load_batch(batch, device)?;
        let logits = model.forward_t(&images, false)?;
        let batch_loss = loss::cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
        total += batch_loss as f64 * batch.len() as f64;
        count += batch.len();
    }
    Ok(total / count.max(1) as f64)
}

/// Fine-tune `spec.arch` on the layout's train split, report per-epoch
/// losses through `on_epoch`, and save the weights to `weights_out`.
pub fn train_classifier(
    layout: &DatasetLayout,
    spec: &TrainSpec,
    weights_out: &Path,
    mut on_epoch: impl FnMut(&EpochStats),
) -> Result<TrainOutcome> {
    if layout.train.is_empty() {
        return Err(ForgeError::BadDatasetLayout {
            detail: "train split is empty".to_string(),
        });
    }

    let device = device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(spec.arch, spec.num_classes, vb)?;

    match &spec.pretrained_weights {
        Some(path) if path.exists() => {
            let (loaded, skipped) = load_pretrained(&varmap, path, &device)?;
            info!(
                "loaded {loaded} pretrained tensors from {} ({skipped} kept fresh)",
                path.display()
            );
        }
        Some(path) => {
            warn!(
                "pretrained checkpoint {} not found, training from scratch",
                path.display()
            );
        }
        None => {
            warn!("no pretrained checkpoint configured, training from scratch");
        }
    }

    let params = ParamsAdamW {
        lr: spec.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;

    let started = Instant::now();
    let mut train_samples = layout.train.clone();
    let mut final_loss = f64::NAN;
    let mut final_val_loss = None;

    for epoch in 1..=spec.epochs {
        data::shuffle_samples(&mut train_samples);
        let mut total = 0f64;
        let mut count = 0usize;
        for batch in train_samples.chunks(spec.batch_size) {
            let (images, labels) = data::load_batch(batch, &device)?;
            let logits = model.forward_t(&images, true)?;
            let batch_loss = loss::cross_entropy(&logits, &labels)?;
            optimizer.backward_step(&batch_loss)?;
            total += batch_loss.to_scalar::<f32>()? as f64 * batch.len() as f64;
            count += batch.len();
        }
        final_loss = total / count.max(1) as f64;

        final_val_loss = if layout.val.is_empty() {
            None
        } else {
            Some(epoch_loss(&model, &layout.val, spec.batch_size, &device)?)
        };

        on_epoch(&EpochStats {
            epoch,
            epochs: spec.epochs,
            train_loss: final_loss,
            val_loss: final_val_loss,
        });
    }

    varmap.save(weights_out)?;

    Ok(TrainOutcome {
        final_loss,
        final_val_loss,
        epochs: spec.epochs,
        training_seconds: started.elapsed().as_secs_f64(),
    })
}

/// Rebuild `arch`, load `weights_path`, and score `samples`.
pub fn evaluate_classifier(
    arch: ModelArchitecture,
    class_names: &[String],
    weights_path: &Path,
    samples: &[Sample],
    batch_size: usize,
) -> Result<EvaluationReport> {
    if samples.is_empty() {
        return Err(ForgeError::BadDatasetLayout {
            detail: "no samples available to score".to_string(),
        });
    }

    let device = device();
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = build_model(arch, class_names.len(), vb)?;
    varmap.load(weights_path)?;

    let n = class_names.len();
    let mut confusion = vec![vec![0u64; n]; n];
    for batch in samples.chunks(batch_size.max(1)) {
        let (images, labels) = data::load_batch(batch, &device)?;
        let logits = model.forward_t(&images, false)?;
        let predicted = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let actual = labels.to_vec1::<u32>()?;
        for (a, p) in actual.iter().zip(predicted.iter()) {
            confusion[*a as usize][*p as usize] += 1;
        }
    }

    Ok(metrics::report_from_confusion(class_names, &confusion))
}

/// A loaded classifier ready for one-off inference; used by the gateway's
/// test endpoint.
pub struct Predictor {
    model: candle_nn::FuncT<'static>,
    device: Device,
    class_names: Vec<String>,
}

impl Predictor {
    pub fn load(
        arch: ModelArchitecture,
        class_names: Vec<String>,
        weights_path: &Path,
    ) -> Result<Self> {
        let device = device();
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_model(arch, class_names.len(), vb)?;
        varmap.load(weights_path)?;
        Ok(Self {
            model,
            device,
            class_names,
        })
    }

    /// Classify one encoded image; returns `(label, confidence)`.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<(String, f64)> {
        let image = data::image_tensor_from_bytes(bytes, &self.device)?;
        let batch = image.unsqueeze(0)?;
        let logits = self.model.forward_t(&batch, false)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        let probs: Vec<f32> = probs.squeeze(0)?.to_vec1()?;
        let (index, confidence) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| ForgeError::Internal(anyhow::anyhow!("empty probability vector")))?;
        Ok((self.class_names[index].clone(), *confidence as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_image(path: &PathBuf, color: [u8; 3]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(32, 32, Rgb(color)).save(path).unwrap();
    }

    /// Tiny two-class dataset with strongly separable colors.
    fn tiny_layout(dir: &TempDir) -> DatasetLayout {
        for split in ["train", "val", "test"] {
            let count = if split == "train" { 4 } else { 2 };
            for (class, color) in [("red", [220, 20, 20]), ("blue", [20, 20, 220])] {
                for i in 0..count {
                    write_image(
                        &dir.path().join(split).join(class).join(format!("{i}.png")),
                        color,
                    );
                }
            }
        }
        discover_layout(dir.path()).unwrap()
    }

    #[test]
    fn train_saves_weights_and_reports_epochs() {
        let dir = TempDir::new().unwrap();
        let layout = tiny_layout(&dir);
        let weights = dir.path().join("model.safetensors");
        let spec = TrainSpec {
            arch: ModelArchitecture::Resnet18,
            num_classes: layout.num_classes(),
            epochs: 1,
            learning_rate: 1e-3,
            batch_size: 4,
            pretrained_weights: None,
        };

        let mut seen = Vec::new();
        let outcome = train_classifier(&layout, &spec, &weights, |stats| {
            seen.push(stats.clone());
        })
        .unwrap();

        assert!(weights.exists());
        assert_eq!(outcome.epochs, 1);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].train_loss.is_finite());
        assert!(seen[0].val_loss.unwrap().is_finite());
        assert!(outcome.training_seconds >= 0.0);
    }

    #[test]
    fn evaluate_scores_the_test_split() {
        let dir = TempDir::new().unwrap();
        let layout = tiny_layout(&dir);
        let weights = dir.path().join("model.safetensors");
        let spec = TrainSpec {
            arch: ModelArchitecture::Resnet18,
            num_classes: layout.num_classes(),
            epochs: 1,
            learning_rate: 1e-3,
            batch_size: 4,
            pretrained_weights: None,
        };
        train_classifier(&layout, &spec, &weights, |_| {}).unwrap();

        let report = evaluate_classifier(
            ModelArchitecture::Resnet18,
            &layout.class_names,
            &weights,
            layout.scoring_split().unwrap(),
            4,
        )
        .unwrap();

        assert!(report.accuracy >= 0.0 && report.accuracy <= 1.0);
        assert_eq!(report.per_class.len(), 2);
    }

    #[test]
    fn predictor_returns_a_known_label() {
        let dir = TempDir::new().unwrap();
        let layout = tiny_layout(&dir);
        let weights = dir.path().join("model.safetensors");
        let spec = TrainSpec {
            arch: ModelArchitecture::Resnet18,
            num_classes: layout.num_classes(),
            epochs: 1,
            learning_rate: 1e-3,
            batch_size: 4,
            pretrained_weights: None,
        };
        train_classifier(&layout, &spec, &weights, |_| {}).unwrap();

        let predictor =
            Predictor::load(ModelArchitecture::Resnet18, layout.class_names.clone(), &weights)
                .unwrap();

        let mut png = Vec::new();
        let img = RgbImage::from_pixel(32, 32, Rgb([220, 20, 20]));
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let (label, confidence) = predictor.predict_bytes(&png).unwrap();
        assert!(layout.class_names.contains(&label));
        assert!(confidence > 0.0 && confidence <= 1.0);
    }
}
