//! Classifier architectures built with candle-nn.
//!
//! Parameter names follow torchvision's state-dict naming (`conv1`, `bn1`,
//! `layer1.0.conv1`, `features.3.conv.0.0`, …) so safetensors checkpoints
//! exported from torchvision load as pretrained feature weights, and the
//! weights this crate saves load back into PyTorch from the user bundle.

use crate::models::ModelArchitecture;
use candle_core::{Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, func_t, linear, BatchNorm, BatchNormConfig, Conv2d,
    Conv2dConfig, FuncT, Module, ModuleT, VarBuilder,
};

/// Build `arch` with a fresh classifier head sized for `num_classes`.
pub fn build_model(
    arch: ModelArchitecture,
    num_classes: usize,
    vb: VarBuilder,
) -> Result<FuncT<'static>> {
    match arch {
        ModelArchitecture::Resnet18 => resnet(vb, num_classes, &[2, 2, 2, 2], false),
        ModelArchitecture::Resnet34 => resnet(vb, num_classes, &[3, 4, 6, 3], false),
        ModelArchitecture::Resnet50 => resnet(vb, num_classes, &[3, 4, 6, 3], true),
        ModelArchitecture::MobilenetV2 => mobilenet_v2(vb, num_classes),
        ModelArchitecture::EfficientnetB0 => efficientnet_b0(vb, num_classes),
    }
}

fn conv_cfg(stride: usize, padding: usize, groups: usize) -> Conv2dConfig {
    Conv2dConfig {
        stride,
        padding,
        groups,
        ..Default::default()
    }
}

struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.bn.forward_t(&self.conv.forward(xs)?, train)
    }
}

fn conv_bn(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    cfg: Conv2dConfig,
    conv_vb: VarBuilder,
    bn_vb: VarBuilder,
) -> Result<ConvBn> {
    Ok(ConvBn {
        conv: conv2d_no_bias(in_c, out_c, kernel, cfg, conv_vb)?,
        bn: batch_norm(out_c, BatchNormConfig::default(), bn_vb)?,
    })
}

fn relu6(xs: &Tensor) -> Result<Tensor> {
    xs.clamp(0f32, 6f32)
}

fn global_avg_pool(xs: &Tensor) -> Result<Tensor> {
    xs.mean(D::Minus1)?.mean(D::Minus1)
}

// --- ResNet -----------------------------------------------------------------

fn basic_block(
    vb: VarBuilder,
    in_c: usize,
    out_c: usize,
    stride: usize,
) -> Result<FuncT<'static>> {
    let conv1 = conv2d_no_bias(in_c, out_c, 3, conv_cfg(stride, 1, 1), vb.pp("conv1"))?;
    let bn1 = batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn1"))?;
    let conv2 = conv2d_no_bias(out_c, out_c, 3, conv_cfg(1, 1, 1), vb.pp("conv2"))?;
    let bn2 = batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn2"))?;
    let downsample = if stride != 1 || in_c != out_c {
        let ds = vb.pp("downsample");
        Some(conv_bn(
            in_c,
            out_c,
            1,
            conv_cfg(stride, 0, 1),
            ds.pp("0"),
            ds.pp("1"),
        )?)
    } else {
        None
    };
    Ok(func_t(move |xs, train| {
        let ys = bn1.forward_t(&conv1.forward(xs)?, train)?.relu()?;
        let ys = bn2.forward_t(&conv2.forward(&ys)?, train)?;
        let shortcut = match &downsample {
            Some(ds) => ds.forward(xs, train)?,
            None => xs.clone(),
        };
        (ys + shortcut)?.relu()
    }))
}

fn bottleneck_block(
    vb: VarBuilder,
    in_c: usize,
    width: usize,
    stride: usize,
) -> Result<FuncT<'static>> {
    let out_c = width * 4;
    let conv1 = conv2d_no_bias(in_c, width, 1, conv_cfg(1, 0, 1), vb.pp("conv1"))?;
    let bn1 = batch_norm(width, BatchNormConfig::default(), vb.pp("bn1"))?;
    let conv2 = conv2d_no_bias(width, width, 3, conv_cfg(stride, 1, 1), vb.pp("conv2"))?;
    let bn2 = batch_norm(width, BatchNormConfig::default(), vb.pp("bn2"))?;
    let conv3 = conv2d_no_bias(width, out_c, 1, conv_cfg(1, 0, 1), vb.pp("conv3"))?;
    let bn3 = batch_norm(out_c, BatchNormConfig::default(), vb.pp("bn3"))?;
    let downsample = if stride != 1 || in_c != out_c {
        let ds = vb.pp("downsample");
        Some(conv_bn(
            in_c,
            out_c,
            1,
            conv_cfg(stride, 0, 1),
            ds.pp("0"),
            ds.pp("1"),
        )?)
    } else {
        None
    };
    Ok(func_t(move |xs, train| {
        let ys = bn1.forward_t(&conv1.forward(xs)?, train)?.relu()?;
        let ys = bn2.forward_t(&conv2.forward(&ys)?, train)?.relu()?;
        let ys = bn3.forward_t(&conv3.forward(&ys)?, train)?;
        let shortcut = match &downsample {
            Some(ds) => ds.forward(xs, train)?,
            None => xs.clone(),
        };
        (ys + shortcut)?.relu()
    }))
}

fn resnet_layer(
    vb: VarBuilder,
    in_c: usize,
    width: usize,
    blocks: usize,
    stride: usize,
    bottleneck: bool,
) -> Result<(FuncT<'static>, usize)> {
    let expansion = if bottleneck { 4 } else { 1 };
    let mut layers = Vec::with_capacity(blocks);
    let mut current = in_c;
    for index in 0..blocks {
        let block_stride = if index == 0 { stride } else { 1 };
        let block_vb = vb.pp(index.to_string());
        let block = if bottleneck {
            bottleneck_block(block_vb, current, width, block_stride)?
        } else {
            basic_block(block_vb, current, width, block_stride)?
        };
        layers.push(block);
        current = width * expansion;
    }
    let layer = func_t(move |xs, train| {
        let mut ys = xs.clone();
        for block in &layers {
            ys = block.forward_t(&ys, train)?;
        }
        Ok(ys)
    });
    Ok((layer, current))
}

fn resnet(
    vb: VarBuilder,
    num_classes: usize,
    block_counts: &[usize; 4],
    bottleneck: bool,
) -> Result<FuncT<'static>> {
    let conv1 = conv2d_no_bias(3, 64, 7, conv_cfg(2, 3, 1), vb.pp("conv1"))?;
    let bn1 = batch_norm(64, BatchNormConfig::default(), vb.pp("bn1"))?;
    let (layer1, c1) = resnet_layer(vb.pp("layer1"), 64, 64, block_counts[0], 1, bottleneck)?;
    let (layer2, c2) = resnet_layer(vb.pp("layer2"), c1, 128, block_counts[1], 2, bottleneck)?;
    let (layer3, c3) = resnet_layer(vb.pp("layer3"), c2, 256, block_counts[2], 2, bottleneck)?;
    let (layer4, c4) = resnet_layer(vb.pp("layer4"), c3, 512, block_counts[3], 2, bottleneck)?;
    let fc = linear(c4, num_classes, vb.pp("fc"))?;

    Ok(func_t(move |xs, train| {
        let ys = bn1.forward_t(&conv1.forward(xs)?, train)?.relu()?;
        // 3x3/2 max pool with padding 1; inputs are post-relu so zero
        // padding cannot win a max.
        let ys = ys
            .pad_with_zeros(D::Minus2, 1, 1)?
            .pad_with_zeros(D::Minus1, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        let ys = layer1.forward_t(&ys, train)?;
        let ys = layer2.forward_t(&ys, train)?;
        let ys = layer3.forward_t(&ys, train)?;
        let ys = layer4.forward_t(&ys, train)?;
        fc.forward(&global_avg_pool(&ys)?)
    }))
}

// --- MobileNetV2 ------------------------------------------------------------

/// (expand ratio, output channels, repeats, first stride)
const MOBILENET_V2_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

fn inverted_residual(
    vb: VarBuilder,
    in_c: usize,
    out_c: usize,
    stride: usize,
    expand: usize,
) -> Result<FuncT<'static>> {
    let hidden = in_c * expand;
    let conv = vb.pp("conv");

    let expand_layer = if expand != 1 {
        let e = conv.pp("0");
        Some(conv_bn(in_c, hidden, 1, conv_cfg(1, 0, 1), e.pp("0"), e.pp("1"))?)
    } else {
        None
    };
    // Depthwise and pointwise-linear indices shift with the expansion layer,
    // matching torchvision's Sequential numbering.
    let (dw_idx, pw_idx, pw_bn_idx) = if expand == 1 {
        ("0", "1", "2")
    } else {
        ("1", "2", "3")
    };
    let dw = conv.pp(dw_idx);
    let depthwise = conv_bn(
        hidden,
        hidden,
        3,
        conv_cfg(stride, 1, hidden),
        dw.pp("0"),
        dw.pp("1"),
    )?;
    let pointwise = conv_bn(
        hidden,
        out_c,
        1,
        conv_cfg(1, 0, 1),
        conv.pp(pw_idx),
        conv.pp(pw_bn_idx),
    )?;
    let residual = stride == 1 && in_c == out_c;

    Ok(func_t(move |xs, train| {
        let ys = match &expand_layer {
            Some(e) => relu6(&e.forward(xs, train)?)?,
            None => xs.clone(),
        };
        let ys = relu6(&depthwise.forward(&ys, train)?)?;
        let ys = pointwise.forward(&ys, train)?;
        if residual {
            ys + xs
        } else {
            Ok(ys)
        }
    }))
}

fn mobilenet_v2(vb: VarBuilder, num_classes: usize) -> Result<FuncT<'static>> {
    let features = vb.pp("features");
    let stem = features.pp("0");
    let stem = conv_bn(3, 32, 3, conv_cfg(2, 1, 1), stem.pp("0"), stem.pp("1"))?;

    let mut blocks = Vec::new();
    let mut in_c = 32;
    let mut feature_index = 1;
    for (expand, out_c, repeats, first_stride) in MOBILENET_V2_SETTINGS {
        for repeat in 0..repeats {
            let stride = if repeat == 0 { first_stride } else { 1 };
            blocks.push(inverted_residual(
                features.pp(feature_index.to_string()),
                in_c,
                out_c,
                stride,
                expand,
            )?);
            in_c = out_c;
            feature_index += 1;
        }
    }

    let head = features.pp(feature_index.to_string());
    let head = conv_bn(in_c, 1280, 1, conv_cfg(1, 0, 1), head.pp("0"), head.pp("1"))?;
    let classifier = linear(1280, num_classes, vb.pp("classifier").pp("1"))?;

    Ok(func_t(move |xs, train| {
        let mut ys = relu6(&stem.forward(xs, train)?)?;
        for block in &blocks {
            ys = block.forward_t(&ys, train)?;
        }
        let ys = relu6(&head.forward(&ys, train)?)?;
        classifier.forward(&global_avg_pool(&ys)?)
    }))
}

// --- EfficientNet-B0 --------------------------------------------------------

/// (expand ratio, output channels, repeats, first stride, kernel)
const EFFICIENTNET_B0_SETTINGS: [(usize, usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1, 3),
    (6, 24, 2, 2, 3),
    (6, 40, 2, 2, 5),
    (6, 80, 3, 2, 3),
    (6, 112, 3, 1, 5),
    (6, 192, 4, 2, 5),
    (6, 320, 1, 1, 3),
];

struct SqueezeExcite {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcite {
    fn new(vb: VarBuilder, channels: usize, squeezed: usize) -> Result<Self> {
        Ok(Self {
            fc1: conv2d(channels, squeezed, 1, conv_cfg(1, 0, 1), vb.pp("fc1"))?,
            fc2: conv2d(squeezed, channels, 1, conv_cfg(1, 0, 1), vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let scale = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let scale = self.fc1.forward(&scale)?.silu()?;
        let scale = candle_nn::ops::sigmoid(&self.fc2.forward(&scale)?)?;
        xs.broadcast_mul(&scale)
    }
}

fn mbconv(
    vb: VarBuilder,
    in_c: usize,
    out_c: usize,
    stride: usize,
    expand: usize,
    kernel: usize,
) -> Result<FuncT<'static>> {
    let hidden = in_c * expand;
    let squeezed = std::cmp::max(1, in_c / 4);
    let block = vb.pp("block");

    let mut index = 0;
    let expand_layer = if expand != 1 {
        let e = block.pp(index.to_string());
        index += 1;
        Some(conv_bn(in_c, hidden, 1, conv_cfg(1, 0, 1), e.pp("0"), e.pp("1"))?)
    } else {
        None
    };
    let dw = block.pp(index.to_string());
    index += 1;
    let depthwise = conv_bn(
        hidden,
        hidden,
        kernel,
        conv_cfg(stride, kernel / 2, hidden),
        dw.pp("0"),
        dw.pp("1"),
    )?;
    let se = SqueezeExcite::new(block.pp(index.to_string()), hidden, squeezed)?;
    index += 1;
    let project_vb = block.pp(index.to_string());
    let project = conv_bn(
        hidden,
        out_c,
        1,
        conv_cfg(1, 0, 1),
        project_vb.pp("0"),
        project_vb.pp("1"),
    )?;
    let residual = stride == 1 && in_c == out_c;

    Ok(func_t(move |xs, train| {
        let ys = match &expand_layer {
            Some(e) => e.forward(xs, train)?.silu()?,
            None => xs.clone(),
        };
        let ys = depthwise.forward(&ys, train)?.silu()?;
        let ys = se.forward(&ys)?;
        let ys = project.forward(&ys, train)?;
        if residual {
            ys + xs
        } else {
            Ok(ys)
        }
    }))
}

fn efficientnet_b0(vb: VarBuilder, num_classes: usize) -> Result<FuncT<'static>> {
    let features = vb.pp("features");
    let stem = features.pp("0");
    let stem = conv_bn(3, 32, 3, conv_cfg(2, 1, 1), stem.pp("0"), stem.pp("1"))?;

    let mut blocks = Vec::new();
    let mut in_c = 32;
    for (stage, (expand, out_c, repeats, first_stride, kernel)) in
        EFFICIENTNET_B0_SETTINGS.into_iter().enumerate()
    {
        let stage_vb = features.pp((stage + 1).to_string());
        for repeat in 0..repeats {
            let stride = if repeat == 0 { first_stride } else { 1 };
            blocks.push(mbconv(
                stage_vb.pp(repeat.to_string()),
                in_c,
                out_c,
                stride,
                expand,
                kernel,
            )?);
            in_c = out_c;
        }
    }

    let head = features.pp("8");
    let head = conv_bn(in_c, 1280, 1, conv_cfg(1, 0, 1), head.pp("0"), head.pp("1"))?;
    let classifier = linear(1280, num_classes, vb.pp("classifier").pp("1"))?;

    Ok(func_t(move |xs, train| {
        let mut ys = stem.forward(xs, train)?.silu()?;
        for block in &blocks {
            ys = block.forward_t(&ys, train)?;
        }
        let ys = head.forward(&ys, train)?.silu()?;
        classifier.forward(&global_avg_pool(&ys)?)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn forward_shape(arch: ModelArchitecture) -> Vec<usize> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_model(arch, 3, vb).unwrap();
        let input = Tensor::zeros((2, 3, 224, 224), DType::F32, &device).unwrap();
        let output = model.forward_t(&input, false).unwrap();
        output.dims().to_vec()
    }

    #[test]
    fn resnet18_produces_class_logits() {
        assert_eq!(forward_shape(ModelArchitecture::Resnet18), vec![2, 3]);
    }

    #[test]
    fn resnet50_produces_class_logits() {
        assert_eq!(forward_shape(ModelArchitecture::Resnet50), vec![2, 3]);
    }

    #[test]
    fn mobilenet_v2_produces_class_logits() {
        assert_eq!(forward_shape(ModelArchitecture::MobilenetV2), vec![2, 3]);
    }

    #[test]
    fn efficientnet_b0_produces_class_logits() {
        assert_eq!(forward_shape(ModelArchitecture::EfficientnetB0), vec![2, 3]);
    }

    #[test]
    fn resnet_uses_torchvision_parameter_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        build_model(ModelArchitecture::Resnet18, 5, vb).unwrap();

        let names: Vec<String> = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for expected in [
            "conv1.weight",
            "bn1.weight",
            "layer1.0.conv1.weight",
            "layer2.0.downsample.0.weight",
            "fc.weight",
            "fc.bias",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing parameter {expected}"
            );
        }
    }
}
