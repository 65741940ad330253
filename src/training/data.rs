//! Image-folder datasets: layout discovery, deterministic splitting, and
//! batched tensor loading.

use crate::{ForgeError, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGE_SIZE: usize = 224;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

/// One labeled image on disk.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub class_index: usize,
}

/// The recognized dataset shape: three splits over one ordered class list.
/// Class indices follow the alphabetical order of class names, and that
/// order is what `labels.json` in the user bundle reflects.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub class_names: Vec<String>,
    pub train: Vec<Sample>,
    pub val: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl DatasetLayout {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Split to score against: `test/` when present, `val/` otherwise.
    pub fn scoring_split(&self) -> Option<&[Sample]> {
        if !self.test.is_empty() {
            Some(&self.test)
        } else if !self.val.is_empty() {
            Some(&self.val)
        } else {
            None
        }
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name == "__MACOSX"
}

/// Map of class name -> image files directly under `dir/<class>/`.
fn class_dirs(dir: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let mut classes = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_hidden(&name) {
            continue;
        }
        let mut files: Vec<PathBuf> = WalkDir::new(entry.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_image_file(p))
            .collect();
        files.sort();
        if !files.is_empty() {
            classes.insert(name, files);
        }
    }
    Ok(classes)
}

/// Archives commonly unpack into a single wrapper directory; descend through
/// those before judging the layout.
fn effective_root(root: &Path) -> Result<PathBuf> {
    let mut current = root.to_path_buf();
    for _ in 0..3 {
        let mut dirs = Vec::new();
        let mut has_files = false;
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            } else {
                has_files = true;
            }
        }
        if dirs.len() == 1 && !has_files {
            current = dirs.pop().unwrap();
        } else {
            break;
        }
    }
    Ok(current)
}

/// 32-bit FNV-1a over the file name; stable across platforms and runs so
/// re-running an agent reproduces the same split.
fn filename_bucket(path: &Path) -> u32 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % 100
}

fn samples_from(classes: &BTreeMap<String, Vec<PathBuf>>, names: &[String]) -> Vec<Sample> {
    let mut samples = Vec::new();
    for (index, name) in names.iter().enumerate() {
        if let Some(files) = classes.get(name) {
            samples.extend(files.iter().map(|path| Sample {
                path: path.clone(),
                class_index: index,
            }));
        }
    }
    samples
}

/// Inspect an extracted archive and produce the split layout.
///
/// Accepts either explicit `train/`, `val/` (or `validation/`), optional
/// `test/` directories of class subdirectories, or a bare class-subdirectory
/// root which is auto-split 70/15/15 by filename hash. Anything else is a
/// `bad_dataset_layout` failure.
pub fn discover_layout(root: &Path) -> Result<DatasetLayout> {
    let root = effective_root(root)?;

    let train_dir = root.join("train");
    if train_dir.is_dir() {
        let train_classes = class_dirs(&train_dir)?;
        if train_classes.is_empty() {
            return Err(ForgeError::BadDatasetLayout {
                detail: "train/ contains no class subdirectories with images".to_string(),
            });
        }
        let val_dir = ["val", "validation"]
            .iter()
            .map(|d| root.join(d))
            .find(|d| d.is_dir())
            .ok_or_else(|| ForgeError::BadDatasetLayout {
                detail: "train/ present but no val/ split found".to_string(),
            })?;
        let val_classes = class_dirs(&val_dir)?;

        let class_names: Vec<String> = train_classes.keys().cloned().collect();
        let val_names: Vec<String> = val_classes.keys().cloned().collect();
        if class_names != val_names {
            return Err(ForgeError::BadDatasetLayout {
                detail: format!(
                    "class sets differ between train/ ({}) and val/ ({})",
                    class_names.join(","),
                    val_names.join(",")
                ),
            });
        }

        let test_dir = root.join("test");
        let test_classes = if test_dir.is_dir() {
            let test_classes = class_dirs(&test_dir)?;
            let test_names: Vec<String> = test_classes.keys().cloned().collect();
            if class_names != test_names {
                return Err(ForgeError::BadDatasetLayout {
                    detail: "class sets differ between train/ and test/".to_string(),
                });
            }
            test_classes
        } else {
            BTreeMap::new()
        };

        return Ok(DatasetLayout {
            train: samples_from(&train_classes, &class_names),
            val: samples_from(&val_classes, &class_names),
            test: samples_from(&test_classes, &class_names),
            class_names,
        });
    }

    // Bare class-subdirectory root, deterministically auto-split 70/15/15.
    let classes = class_dirs(&root)?;
    if classes.len() < 2 {
        return Err(ForgeError::BadDatasetLayout {
            detail: format!(
                "expected train/val/test splits or at least two class directories, found {}",
                classes.len()
            ),
        });
    }
    let class_names: Vec<String> = classes.keys().cloned().collect();
    let mut train = Vec::new();
    let mut val = Vec::new();
    let mut test = Vec::new();
    for sample in samples_from(&classes, &class_names) {
        match filename_bucket(&sample.path) {
            0..=69 => train.push(sample),
            70..=84 => val.push(sample),
            _ => test.push(sample),
        }
    }
    if train.is_empty() || (val.is_empty() && test.is_empty()) {
        return Err(ForgeError::BadDatasetLayout {
            detail: "auto-split produced an empty split; dataset is too small".to_string(),
        });
    }
    Ok(DatasetLayout {
        class_names,
        train,
        val,
        test,
    })
}

/// Decode one image into a normalized `(3, 224, 224)` float tensor.
pub fn load_image_tensor(path: &Path, device: &Device) -> Result<Tensor> {
    let decoded = image::open(path)?;
    let resized = decoded
        .resize_exact(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Triangle)
        .to_rgb8();
    let raw = resized.into_raw();

    let mut data = vec![0f32; 3 * IMAGE_SIZE * IMAGE_SIZE];
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    for (i, chunk) in raw.chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (chunk[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    Ok(Tensor::from_vec(
        data,
        (3, IMAGE_SIZE, IMAGE_SIZE),
        device,
    )?)
}

/// Decode raw image bytes the same way the loaders do; used by the gateway
/// test-inference endpoint.
pub fn image_tensor_from_bytes(bytes: &[u8], device: &Device) -> Result<Tensor> {
    let decoded = image::load_from_memory(bytes)?;
    let resized = decoded
        .resize_exact(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Triangle)
        .to_rgb8();
    let raw = resized.into_raw();

    let mut data = vec![0f32; 3 * IMAGE_SIZE * IMAGE_SIZE];
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    for (i, chunk) in raw.chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (chunk[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    Ok(Tensor::from_vec(
        data,
        (3, IMAGE_SIZE, IMAGE_SIZE),
        device,
    )?)
}

/// Assemble one `(images, labels)` batch from a slice of samples.
pub fn load_batch(samples: &[Sample], device: &Device) -> Result<(Tensor, Tensor)> {
    let mut images = Vec::with_capacity(samples.len());
    let mut labels = Vec::with_capacity(samples.len());
    for sample in samples {
        images.push(load_image_tensor(&sample.path, device)?);
        labels.push(sample.class_index as u32);
    }
    let images = Tensor::stack(&images, 0)?;
    let labels = Tensor::from_vec(labels, (samples.len(),), device)?;
    Ok((images, labels))
}

/// Shuffle samples in place; train split only.
pub fn shuffle_samples(samples: &mut [Sample]) {
    samples.shuffle(&mut rand::thread_rng());
}
