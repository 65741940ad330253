//! User bundle assembly: the zip a project owner downloads when their model
//! is done.
//!
//! Contents are exactly `model.safetensors`, `predict.py`, `labels.json`,
//! and `README.txt`; `labels.json` is the ordered class list matching the
//! training class index.

use crate::models::ModelArchitecture;
use crate::Result;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const BUNDLE_ENTRIES: [&str; 4] =
    ["model.safetensors", "predict.py", "labels.json", "README.txt"];

fn torchvision_constructor(arch: ModelArchitecture) -> &'static str {
    match arch {
        ModelArchitecture::Resnet18 => "models.resnet18",
        ModelArchitecture::Resnet34 => "models.resnet34",
        ModelArchitecture::Resnet50 => "models.resnet50",
        ModelArchitecture::MobilenetV2 => "models.mobilenet_v2",
        ModelArchitecture::EfficientnetB0 => "models.efficientnet_b0",
    }
}

fn predict_script(arch: ModelArchitecture, project_name: &str) -> String {
    format!(
        r#"#!/usr/bin/env python3
"""Standalone inference for "{project_name}".

Usage:
    python predict.py path/to/image.jpg

Requires: torch, torchvision, safetensors, pillow
"""
import json
import sys

import torch
from PIL import Image
from safetensors.torch import load_file
from torchvision import models, transforms

WEIGHTS = "model.safetensors"
LABELS = "labels.json"


def main() -> None:
    if len(sys.argv) != 2:
        print(__doc__)
        raise SystemExit(1)

    with open(LABELS) as fh:
        labels = json.load(fh)

    model = {constructor}(num_classes=len(labels))
    model.load_state_dict(load_file(WEIGHTS), strict=False)
    model.eval()

    preprocess = transforms.Compose(
        [
            transforms.Resize((224, 224)),
            transforms.ToTensor(),
            transforms.Normalize(
                mean=[0.485, 0.456, 0.406], std=[0.229, 0.224, 0.225]
            ),
        ]
    )
    image = Image.open(sys.argv[1]).convert("RGB")
    batch = preprocess(image).unsqueeze(0)

    with torch.no_grad():
        probs = torch.softmax(model(batch), dim=1)[0]
    confidence, index = probs.max(dim=0)
    print(json.dumps({{"label": labels[index], "confidence": float(confidence)}}))


if __name__ == "__main__":
    main()
"#,
        project_name = project_name,
        constructor = torchvision_constructor(arch),
    )
}

fn readme_text(project_name: &str, arch: ModelArchitecture, class_names: &[String]) -> String {
    format!(
        "{project_name}\n\
         {underline}\n\n\
         This bundle contains your trained image classifier.\n\n\
         Files:\n\
         - model.safetensors  trained {arch} weights\n\
         - labels.json        class names in model output order\n\
         - predict.py         standalone inference script\n\
         - README.txt         this file\n\n\
         Classes ({count}): {classes}\n\n\
         Quick start:\n\
         \x20   pip install torch torchvision safetensors pillow\n\
         \x20   python predict.py your-image.jpg\n",
        project_name = project_name,
        underline = "=".repeat(project_name.len()),
        arch = arch,
        count = class_names.len(),
        classes = class_names.join(", "),
    )
}

/// Write the four bundle files and zip them up; returns the zip path.
pub fn assemble_bundle(
    out_dir: &Path,
    weights_path: &Path,
    class_names: &[String],
    arch: ModelArchitecture,
    project_name: &str,
) -> Result<PathBuf> {
    let zip_path = out_dir.join("bundle.zip");
    let file = File::create(&zip_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer.start_file("model.safetensors", options)?;
    let mut weights = File::open(weights_path)?;
    let mut buf = Vec::new();
    weights.read_to_end(&mut buf)?;
    writer.write_all(&buf)?;

    writer.start_file("predict.py", options)?;
    writer.write_all(predict_script(arch, project_name).as_bytes())?;

    writer.start_file("labels.json", options)?;
    writer.write_all(serde_json::to_string_pretty(class_names)?.as_bytes())?;

    writer.start_file("README.txt", options)?;
    writer.write_all(readme_text(project_name, arch, class_names).as_bytes())?;

    writer.finish()?;
    Ok(zip_path)
}
