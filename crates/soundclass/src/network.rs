//! Residual CNN classifier over log-mel input.
//!
//! Layout (names match the checkpoint's layer paths):
//! - `conv1`: 7x7/2 conv (1 -> 64), batch norm, relu, 3x3/2 max pool
//! - `layer1`..`layer4`: residual stages from [`STAGES`]
//! - global average pool, dropout, `fc` (512 -> classes)

use crate::block::{BlockConfig, Projection, ResidualBlock};
use crate::checkpoint::CheckpointError;
use crate::constants::{BATCH_NORM_EPS, DROPOUT_P};
use crate::conv::{global_avg_pool, max_pool2d, relu_inplace, BatchNorm2d, Conv2d, Conv2dShape, Mode};
use crate::ops::{dropout_inplace, linear};
use crate::tensor::FeatureMap;
use crate::weights::TensorSource;

pub const STEM: Conv2dShape = Conv2dShape {
    in_channels: 1,
    out_channels: 64,
    kernel: 7,
    stride: 2,
    padding: 3,
};

const B64: BlockConfig = BlockConfig::new(64, 64, 1);
const B128: BlockConfig = BlockConfig::new(128, 128, 1);
const B256: BlockConfig = BlockConfig::new(256, 256, 1);
const B512: BlockConfig = BlockConfig::new(512, 512, 1);

const LAYER1: [BlockConfig; 3] = [B64, B64, B64];
const LAYER2: [BlockConfig; 4] = [BlockConfig::new(64, 128, 2), B128, B128, B128];
const LAYER3: [BlockConfig; 6] = [BlockConfig::new(128, 256, 2), B256, B256, B256, B256, B256];
const LAYER4: [BlockConfig; 3] = [BlockConfig::new(256, 512, 2), B512, B512];

#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub name: &'static str,
    pub blocks: &'static [BlockConfig],
}

/// The four residual stages, in execution order.
pub const STAGES: [StageConfig; 4] = [
    StageConfig { name: "layer1", blocks: &LAYER1 },
    StageConfig { name: "layer2", blocks: &LAYER2 },
    StageConfig { name: "layer3", blocks: &LAYER3 },
    StageConfig { name: "layer4", blocks: &LAYER4 },
];

/// Width of the pooled embedding fed to `fc`.
pub const EMBEDDING_DIM: usize = 512;

/// Named intermediate activations, in the order they were produced.
#[derive(Debug, Clone, Default)]
pub struct FeatureMaps {
    entries: Vec<(String, FeatureMap)>,
}

impl FeatureMaps {
    pub fn insert(&mut self, name: String, map: FeatureMap) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = map;
        } else {
            self.entries.push((name, map));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FeatureMap> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureMap)> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m))
    }
}

/// One named parameter or buffer of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
    /// `false` for batch-norm running statistics.
    pub trainable: bool,
}

impl ParameterSpec {
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

fn push_conv(out: &mut Vec<ParameterSpec>, name: String, shape: Conv2dShape) {
    out.push(ParameterSpec {
        name,
        shape: shape.weight_shape().to_vec(),
        trainable: true,
    });
}

fn push_bn(out: &mut Vec<ParameterSpec>, prefix: &str, channels: usize) {
    for (suffix, trainable) in [
        ("weight", true),
        ("bias", true),
        ("running_mean", false),
        ("running_var", false),
    ] {
        out.push(ParameterSpec {
            name: format!("{prefix}.{suffix}"),
            shape: vec![channels],
            trainable,
        });
    }
}

fn load_exact(
    source: &dyn TensorSource,
    name: &str,
    expected: &[usize],
) -> Result<Vec<f32>, CheckpointError> {
    let t = source.tensor_f32(name)?;
    if t.shape != expected {
        return Err(CheckpointError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            found: t.shape,
        });
    }
    Ok(t.data)
}

fn load_conv(
    source: &dyn TensorSource,
    name: &str,
    shape: Conv2dShape,
) -> Result<Conv2d, CheckpointError> {
    let weight = load_exact(source, name, &shape.weight_shape())?;
    Ok(Conv2d::new(shape, weight))
}

fn load_bn(
    source: &dyn TensorSource,
    prefix: &str,
    channels: usize,
) -> Result<BatchNorm2d, CheckpointError> {
    let shape = [channels];
    Ok(BatchNorm2d {
        weight: load_exact(source, &format!("{prefix}.weight"), &shape)?,
        bias: load_exact(source, &format!("{prefix}.bias"), &shape)?,
        running_mean: load_exact(source, &format!("{prefix}.running_mean"), &shape)?,
        running_var: load_exact(source, &format!("{prefix}.running_var"), &shape)?,
        eps: BATCH_NORM_EPS,
    })
}

fn load_block(
    source: &dyn TensorSource,
    prefix: &str,
    cfg: BlockConfig,
) -> Result<ResidualBlock, CheckpointError> {
    let shortcut = if cfg.uses_projection() {
        Some(Projection {
            conv: load_conv(source, &format!("{prefix}.shortcut.0.weight"), cfg.projection_shape())?,
            bn: load_bn(source, &format!("{prefix}.shortcut.1"), cfg.out_channels)?,
        })
    } else {
        None
    };
    Ok(ResidualBlock::new(
        cfg,
        load_conv(source, &format!("{prefix}.conv1.weight"), cfg.conv1_shape())?,
        load_bn(source, &format!("{prefix}.bn1"), cfg.out_channels)?,
        load_conv(source, &format!("{prefix}.conv2.weight"), cfg.conv2_shape())?,
        load_bn(source, &format!("{prefix}.bn2"), cfg.out_channels)?,
        shortcut,
    ))
}

#[derive(Debug, Clone)]
struct Stage {
    name: &'static str,
    blocks: Vec<ResidualBlock>,
}

#[derive(Debug, Clone)]
pub struct ClassifierNetwork {
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    stages: Vec<Stage>,
    fc_weight: Vec<f32>, // [num_classes, EMBEDDING_DIM]
    fc_bias: Vec<f32>,   // [num_classes]
    num_classes: usize,
    mode: Mode,
}

impl ClassifierNetwork {
    /// Every tensor a checkpoint must provide for `num_classes` outputs, in layer order.
    #[must_use]
    pub fn parameter_shapes(num_classes: usize) -> Vec<ParameterSpec> {
        let mut out = Vec::new();
        push_conv(&mut out, "conv1.0.weight".to_string(), STEM);
        push_bn(&mut out, "conv1.1", STEM.out_channels);
        for stage in &STAGES {
            for (i, cfg) in stage.blocks.iter().enumerate() {
                let prefix = format!("{}.{i}", stage.name);
                push_conv(&mut out, format!("{prefix}.conv1.weight"), cfg.conv1_shape());
                push_bn(&mut out, &format!("{prefix}.bn1"), cfg.out_channels);
                push_conv(&mut out, format!("{prefix}.conv2.weight"), cfg.conv2_shape());
                push_bn(&mut out, &format!("{prefix}.bn2"), cfg.out_channels);
                if cfg.uses_projection() {
                    push_conv(&mut out, format!("{prefix}.shortcut.0.weight"), cfg.projection_shape());
                    push_bn(&mut out, &format!("{prefix}.shortcut.1"), cfg.out_channels);
                }
            }
        }
        out.push(ParameterSpec {
            name: "fc.weight".to_string(),
            shape: vec![num_classes, EMBEDDING_DIM],
            trainable: true,
        });
        out.push(ParameterSpec {
            name: "fc.bias".to_string(),
            shape: vec![num_classes],
            trainable: true,
        });
        out
    }

    /// Number of trainable scalars for `num_classes` outputs.
    #[must_use]
    pub fn parameter_count(num_classes: usize) -> usize {
        Self::parameter_shapes(num_classes)
            .iter()
            .filter(|p| p.trainable)
            .map(ParameterSpec::numel)
            .sum()
    }

    /// Build the network from named tensors. Every tensor must match its expected shape exactly.
    ///
    /// The returned network is in [`Mode::Eval`].
    pub fn load(source: &dyn TensorSource, num_classes: usize) -> Result<Self, CheckpointError> {
        let stem_conv = load_conv(source, "conv1.0.weight", STEM)?;
        let stem_bn = load_bn(source, "conv1.1", STEM.out_channels)?;

        let mut stages = Vec::with_capacity(STAGES.len());
        for stage in &STAGES {
            let mut blocks = Vec::with_capacity(stage.blocks.len());
            for (i, &cfg) in stage.blocks.iter().enumerate() {
                blocks.push(load_block(source, &format!("{}.{i}", stage.name), cfg)?);
            }
            stages.push(Stage {
                name: stage.name,
                blocks,
            });
        }

        let fc_weight = load_exact(source, "fc.weight", &[num_classes, EMBEDDING_DIM])?;
        let fc_bias = load_exact(source, "fc.bias", &[num_classes])?;

        tracing::debug!(
            stages = stages.len(),
            blocks = stages.iter().map(|s| s.blocks.len()).sum::<usize>(),
            num_classes,
            "classifier network assembled"
        );

        Ok(Self {
            stem_conv,
            stem_bn,
            stages,
            fc_weight,
            fc_bias,
            num_classes,
            mode: Mode::Eval,
        })
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Freeze batch statistics and disable dropout.
    pub fn eval(&mut self) {
        self.set_mode(Mode::Eval);
    }

    /// Class logits for a single-channel `[1, n_mels, n_frames]` input.
    #[must_use]
    pub fn forward(&self, input: &FeatureMap) -> Vec<f32> {
        self.run(input, None)
    }

    /// Class logits plus every intermediate activation.
    ///
    /// Keys: `conv1` (stem output), `{stage}.block{i}.conv1` (pre-activation residual sum),
    /// `{stage}.block{i}.relu` (block output) and `{stage}` (stage output).
    #[must_use]
    pub fn forward_with_feature_maps(&self, input: &FeatureMap) -> (Vec<f32>, FeatureMaps) {
        let mut maps = FeatureMaps::default();
        let logits = self.run(input, Some(&mut maps));
        (logits, maps)
    }

    fn run(&self, input: &FeatureMap, mut maps: Option<&mut FeatureMaps>) -> Vec<f32> {
        assert_eq!(input.channels, STEM.in_channels, "network input must be single-channel");

        let mut x = self.stem_conv.forward(input);
        self.stem_bn.forward_inplace(&mut x, self.mode);
        relu_inplace(&mut x.data);
        let mut x = max_pool2d(&x, 3, 2, 1);
        if let Some(m) = maps.as_deref_mut() {
            m.insert("conv1".to_string(), x.clone());
        }

        for stage in &self.stages {
            for (i, block) in stage.blocks.iter().enumerate() {
                x = match maps.as_deref_mut() {
                    Some(m) => {
                        let prefix = format!("{}.block{i}", stage.name);
                        block.forward(&x, self.mode, Some((m, prefix.as_str())))
                    }
                    None => block.forward(&x, self.mode, None),
                };
            }
            if let Some(m) = maps.as_deref_mut() {
                m.insert(stage.name.to_string(), x.clone());
            }
        }

        let mut pooled = global_avg_pool(&x);
        if self.mode == Mode::Train {
            dropout_inplace(&mut pooled, DROPOUT_P, &mut rand::rng());
        }
        linear(
            &pooled,
            1,
            EMBEDDING_DIM,
            &self.fc_weight,
            self.num_classes,
            Some(&self.fc_bias),
        )
    }
}
