//! Two-convolution residual unit with optional 1x1 projection shortcut.

use crate::conv::{relu_inplace, BatchNorm2d, Conv2d, Conv2dShape, Mode};
use crate::network::FeatureMaps;
use crate::ops::add_inplace;
use crate::tensor::FeatureMap;

/// `(input channels, output channels, stride)` of one residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
}

impl BlockConfig {
    #[must_use]
    pub const fn new(in_channels: usize, out_channels: usize, stride: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            stride,
        }
    }

    /// A projection is required exactly when the block changes channel count or resolution.
    #[must_use]
    pub const fn uses_projection(&self) -> bool {
        self.stride != 1 || self.in_channels != self.out_channels
    }

    #[must_use]
    pub const fn conv1_shape(&self) -> Conv2dShape {
        Conv2dShape {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: 3,
            stride: self.stride,
            padding: 1,
        }
    }

    /// Second convolution always runs at stride 1 so it preserves the first one's extent.
    #[must_use]
    pub const fn conv2_shape(&self) -> Conv2dShape {
        Conv2dShape {
            in_channels: self.out_channels,
            out_channels: self.out_channels,
            kernel: 3,
            stride: 1,
            padding: 1,
        }
    }

    #[must_use]
    pub const fn projection_shape(&self) -> Conv2dShape {
        Conv2dShape {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: 1,
            stride: self.stride,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Projection {
    pub conv: Conv2d,
    pub bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct ResidualBlock {
    config: BlockConfig,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    shortcut: Option<Projection>,
}

impl ResidualBlock {
    /// Assemble a block from its layers.
    ///
    /// Panics if the layer shapes disagree with `config`, or if `shortcut` is present
    /// exactly when the config says it must not be (and vice versa).
    #[must_use]
    pub fn new(
        config: BlockConfig,
        conv1: Conv2d,
        bn1: BatchNorm2d,
        conv2: Conv2d,
        bn2: BatchNorm2d,
        shortcut: Option<Projection>,
    ) -> Self {
        assert_eq!(conv1.shape(), config.conv1_shape(), "conv1 shape for {config:?}");
        assert_eq!(conv2.shape(), config.conv2_shape(), "conv2 shape for {config:?}");
        assert_eq!(bn1.channels(), config.out_channels);
        assert_eq!(bn2.channels(), config.out_channels);
        assert_eq!(
            shortcut.is_some(),
            config.uses_projection(),
            "shortcut projection presence must follow stride/channel change for {config:?}"
        );
        if let Some(p) = &shortcut {
            assert_eq!(p.conv.shape(), config.projection_shape());
            assert_eq!(p.bn.channels(), config.out_channels);
        }
        Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
        }
    }

    #[must_use]
    pub fn config(&self) -> BlockConfig {
        self.config
    }

    #[must_use]
    pub fn use_shortcut(&self) -> bool {
        self.shortcut.is_some()
    }

    /// Output extent for an input of `height x width`.
    #[must_use]
    pub fn output_shape(&self, height: usize, width: usize) -> [usize; 3] {
        let (h, w) = self.config.conv1_shape().output_hw(height, width);
        [self.config.out_channels, h, w]
    }

    /// `relu(bn2(conv2(relu(bn1(conv1(x))))) + shortcut(x))`.
    ///
    /// With `maps` present, records the pre-activation sum under `{prefix}.conv1` and the
    /// activated output under `{prefix}.relu`. The returned tensor is identical either way.
    ///
    /// Panics if `input` does not carry `in_channels` channels, or if an identity shortcut
    /// would be added to a main path of a different shape.
    #[must_use]
    pub fn forward(
        &self,
        input: &FeatureMap,
        mode: Mode,
        maps: Option<(&mut FeatureMaps, &str)>,
    ) -> FeatureMap {
        assert_eq!(
            input.channels, self.config.in_channels,
            "residual block expects {} input channels",
            self.config.in_channels
        );

        let mut out = self.conv1.forward(input);
        self.bn1.forward_inplace(&mut out, mode);
        relu_inplace(&mut out.data);

        let mut out = self.conv2.forward(&out);
        self.bn2.forward_inplace(&mut out, mode);

        match &self.shortcut {
            Some(p) => {
                let mut sc = p.conv.forward(input);
                p.bn.forward_inplace(&mut sc, mode);
                add_inplace(&mut out.data, &sc.data);
            }
            None => {
                assert_eq!(
                    out.shape(),
                    input.shape(),
                    "identity shortcut with mismatched shapes"
                );
                add_inplace(&mut out.data, &input.data);
            }
        }

        match maps {
            Some((maps, prefix)) => {
                maps.insert(format!("{prefix}.conv1"), out.clone());
                relu_inplace(&mut out.data);
                maps.insert(format!("{prefix}.relu"), out.clone());
            }
            None => relu_inplace(&mut out.data),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BATCH_NORM_EPS;

    fn identity_bn(channels: usize) -> BatchNorm2d {
        BatchNorm2d {
            weight: vec![1.0; channels],
            bias: vec![0.0; channels],
            running_mean: vec![0.0; channels],
            running_var: vec![1.0 - BATCH_NORM_EPS; channels],
            eps: BATCH_NORM_EPS,
        }
    }

    fn lcg_vec(n: usize, seed: u32, scale: f32) -> Vec<f32> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(1664525).wrapping_add(1013904223);
                (((s >> 8) as f32) / ((1u32 << 24) as f32) * 2.0 - 1.0) * scale
            })
            .collect()
    }

    fn block(config: BlockConfig, seed: u32) -> ResidualBlock {
        let c1 = config.conv1_shape();
        let c2 = config.conv2_shape();
        let shortcut = config.uses_projection().then(|| {
            let ps = config.projection_shape();
            Projection {
                conv: Conv2d::new(ps, lcg_vec(ps.weight_len(), seed + 2, 0.3)),
                bn: identity_bn(config.out_channels),
            }
        });
        ResidualBlock::new(
            config,
            Conv2d::new(c1, lcg_vec(c1.weight_len(), seed, 0.2)),
            identity_bn(config.out_channels),
            Conv2d::new(c2, lcg_vec(c2.weight_len(), seed + 1, 0.2)),
            identity_bn(config.out_channels),
            shortcut,
        )
    }

    fn input(channels: usize, h: usize, w: usize) -> FeatureMap {
        FeatureMap::from_vec(channels, h, w, lcg_vec(channels * h * w, 99, 1.0))
    }

    #[test]
    fn projection_rule() {
        assert!(!BlockConfig::new(64, 64, 1).uses_projection());
        assert!(BlockConfig::new(64, 128, 2).uses_projection());
        assert!(BlockConfig::new(64, 128, 1).uses_projection());
        assert!(BlockConfig::new(64, 64, 2).uses_projection());
    }

    #[test]
    fn identity_block_preserves_shape() {
        let b = block(BlockConfig::new(8, 8, 1), 1);
        assert!(!b.use_shortcut());
        let x = input(8, 6, 5);
        let y = b.forward(&x, Mode::Eval, None);
        assert_eq!(y.shape(), [8, 6, 5]);
        assert_eq!(b.output_shape(6, 5), [8, 6, 5]);
        assert!(y.data.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn strided_block_projects() {
        let b = block(BlockConfig::new(4, 8, 2), 3);
        assert!(b.use_shortcut());
        for (h, w) in [(6usize, 5usize), (7, 7), (1, 3)] {
            let y = b.forward(&input(4, h, w), Mode::Eval, None);
            assert_eq!(y.shape(), [8, h.div_ceil(2), w.div_ceil(2)], "input {h}x{w}");
            assert_eq!(y.shape(), b.output_shape(h, w));
        }
    }

    #[test]
    fn zero_main_path_passes_input_through_relu() {
        let cfg = BlockConfig::new(3, 3, 1);
        let zero_bn = BatchNorm2d {
            weight: vec![0.0; 3],
            ..identity_bn(3)
        };
        let b = ResidualBlock::new(
            cfg,
            Conv2d::new(cfg.conv1_shape(), lcg_vec(cfg.conv1_shape().weight_len(), 5, 1.0)),
            identity_bn(3),
            Conv2d::new(cfg.conv2_shape(), lcg_vec(cfg.conv2_shape().weight_len(), 6, 1.0)),
            zero_bn,
            None,
        );
        let x = input(3, 4, 4);
        let y = b.forward(&x, Mode::Eval, None);
        let expect: Vec<f32> = x.data.iter().map(|v| v.max(0.0)).collect();
        assert_eq!(y.data, expect);
    }

    #[test]
    fn records_feature_maps_without_changing_output() {
        let b = block(BlockConfig::new(4, 8, 2), 11);
        let x = input(4, 6, 6);
        let plain = b.forward(&x, Mode::Eval, None);

        let mut maps = FeatureMaps::default();
        let traced = b.forward(&x, Mode::Eval, Some((&mut maps, "layer2.block0")));
        assert_eq!(plain, traced);
        assert_eq!(maps.len(), 2);

        let pre = maps.get("layer2.block0.conv1").expect("pre-activation");
        let post = maps.get("layer2.block0.relu").expect("post-activation");
        assert_eq!(post, &traced);
        let relu_of_pre: Vec<f32> = pre.data.iter().map(|v| v.max(0.0)).collect();
        assert_eq!(post.data, relu_of_pre);
        assert!(pre.data.iter().any(|&v| v < 0.0));
    }

    #[test]
    #[should_panic(expected = "shortcut projection presence")]
    fn channel_change_without_projection_is_fatal() {
        let cfg = BlockConfig::new(4, 8, 1);
        let _ = ResidualBlock::new(
            cfg,
            Conv2d::new(cfg.conv1_shape(), vec![0.0; cfg.conv1_shape().weight_len()]),
            identity_bn(8),
            Conv2d::new(cfg.conv2_shape(), vec![0.0; cfg.conv2_shape().weight_len()]),
            identity_bn(8),
            None,
        );
    }

    #[test]
    #[should_panic(expected = "input channels")]
    fn wrong_input_depth_is_fatal() {
        let b = block(BlockConfig::new(8, 8, 1), 1);
        let _ = b.forward(&input(4, 3, 3), Mode::Eval, None);
    }
}
