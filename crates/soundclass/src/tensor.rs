//! Dense `[channels, height, width]` activation storage.

/// Channel-major activation tensor for a single example: `data[(c * height + y) * width + x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl FeatureMap {
    #[must_use]
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0f32; channels * height * width],
        }
    }

    #[must_use]
    pub fn from_vec(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            channels * height * width,
            "feature map data does not match [{channels}, {height}, {width}]"
        );
        Self {
            channels,
            height,
            width,
            data,
        }
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    #[must_use]
    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    #[must_use]
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    #[must_use]
    pub fn channel(&self, c: usize) -> &[f32] {
        let n = self.plane_len();
        &self.data[c * n..(c + 1) * n]
    }

    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        let n = self.plane_len();
        &mut self.data[c * n..(c + 1) * n]
    }

    /// Average over channels, producing a row-major `[height, width]` plane.
    #[must_use]
    pub fn channel_mean(&self) -> Vec<f32> {
        let n = self.plane_len();
        let mut out = vec![0.0f32; n];
        if self.channels == 0 {
            return out;
        }
        for plane in self.data.chunks_exact(n.max(1)) {
            for (o, &v) in out.iter_mut().zip(plane) {
                *o += v;
            }
        }
        let scale = 1.0 / self.channels as f32;
        for o in &mut out {
            *o *= scale;
        }
        out
    }
}
