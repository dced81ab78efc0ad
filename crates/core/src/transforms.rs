//! Batch-level augmentation: channel normalization and random flips.
//!
//! Flips rewrite the batch's own corner array. Cached recipes are shared
//! through `Arc` and never see the flipped coordinates.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collate::Batch;
use crate::error::{AtrainError, AtrainResult};
use crate::fields::ChannelLayout;

const FLIP_PROBABILITY: f64 = 0.5;

/// Per-raw-channel statistics, indexed like the raw sensor array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
}

impl NormalizationStats {
    pub fn load(path: &Path) -> AtrainResult<Self> {
        let raw = fs::read_to_string(path).map_err(|source| AtrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| AtrainError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, batch: &mut Batch, rng: &mut StdRng);
}

/// `(x - mean) / std` over the selected input channels.
#[derive(Debug, Clone)]
pub struct Normalize {
    means: Array1<f32>,
    stds: Array1<f32>,
}

impl Normalize {
    /// Pick the statistics of the layout's selected channels.
    pub fn new(stats: &NormalizationStats, layout: &ChannelLayout) -> AtrainResult<Self> {
        let needed = layout.total_channels;
        if stats.means.len() < needed || stats.stds.len() < needed {
            return Err(AtrainError::ShapeMismatch {
                context: "normalization statistics".to_string(),
                expected: vec![needed, needed],
                actual: vec![stats.means.len(), stats.stds.len()],
            });
        }
        let pick = |values: &[f32]| -> Array1<f32> {
            layout.multi_angle_idx.iter().map(|&idx| values[idx]).collect()
        };
        Ok(Self {
            means: pick(&stats.means),
            stds: pick(&stats.stds),
        })
    }
}

impl Transform for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, batch: &mut Batch, _rng: &mut StdRng) {
        for (mut channel, (&mean, &std)) in batch
            .sensor_input
            .axis_iter_mut(Axis(1))
            .zip(self.means.iter().zip(self.stds.iter()))
        {
            channel.mapv_inplace(|v| (v - mean) / std);
        }
    }
}

/// Mirror left-right with probability 0.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomHorizontalFlip;

impl Transform for RandomHorizontalFlip {
    fn name(&self) -> &'static str {
        "hflip"
    }

    fn apply(&self, batch: &mut Batch, rng: &mut StdRng) {
        if !rng.random_bool(FLIP_PROBABILITY) {
            return;
        }
        let (_, width) = batch.patch_shape();
        batch.sensor_input.invert_axis(Axis(3));
        if let Some(fields) = batch.nondirectional_fields.as_mut() {
            for plane in fields.values_mut() {
                plane.invert_axis(Axis(2));
            }
        }
        batch
            .corners
            .index_axis_mut(Axis(2), 1)
            .mapv_inplace(|col| width as i64 - 1 - col);
    }
}

/// Mirror top-bottom with probability 0.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomVerticalFlip;

impl Transform for RandomVerticalFlip {
    fn name(&self) -> &'static str {
        "vflip"
    }

    fn apply(&self, batch: &mut Batch, rng: &mut StdRng) {
        if !rng.random_bool(FLIP_PROBABILITY) {
            return;
        }
        let (height, _) = batch.patch_shape();
        batch.sensor_input.invert_axis(Axis(2));
        if let Some(fields) = batch.nondirectional_fields.as_mut() {
            for plane in fields.values_mut() {
                plane.invert_axis(Axis(1));
            }
        }
        batch
            .corners
            .index_axis_mut(Axis(2), 0)
            .mapv_inplace(|row| height as i64 - 1 - row);
    }
}

/// Ordered transforms sharing one random source.
pub struct TransformPipeline {
    steps: Vec<Box<dyn Transform>>,
    rng: StdRng,
}

impl TransformPipeline {
    pub fn new(steps: Vec<Box<dyn Transform>>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { steps, rng }
    }

    /// `train` gets normalization and both flips; every other mode only
    /// normalization. Without statistics normalization is skipped.
    pub fn for_mode(mode: &str, normalize: Option<Normalize>, seed: Option<u64>) -> Self {
        let mut steps: Vec<Box<dyn Transform>> = Vec::new();
        if let Some(normalize) = normalize {
            steps.push(Box::new(normalize));
        }
        if mode == "train" {
            steps.push(Box::new(RandomHorizontalFlip));
            steps.push(Box::new(RandomVerticalFlip));
        }
        let pipeline = Self::new(steps, seed);
        debug!(mode, steps = ?pipeline.step_names(), "transform pipeline ready");
        pipeline
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&mut self, batch: &mut Batch) {
        for step in &self.steps {
            step.apply(batch, &mut self.rng);
        }
    }
}

impl std::fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ndarray::{Array2, Array4};

    use super::*;
    use crate::collate::collate;
    use crate::collate::tests::record;
    use crate::interp::interpolate_output;

    /// A flip that always fires, for deterministic checks.
    fn always(rng_seed: u64, flip: &dyn Transform, batch: &mut Batch) {
        let mut rng = StdRng::seed_from_u64(rng_seed);
        // Draw until the flip fires; each apply consumes one draw.
        loop {
            let before = batch.corners.clone();
            let mut probe = rng.clone();
            if probe.random_bool(FLIP_PROBABILITY) {
                flip.apply(batch, &mut rng);
                assert_ne!(batch.corners, before);
                return;
            }
            let _ = rng.random_bool(FLIP_PROBABILITY);
        }
    }

    fn layout(multi_angle_idx: Vec<usize>, total_channels: usize) -> ChannelLayout {
        ChannelLayout {
            multi_angle_idx,
            nondir_idx: Vec::new(),
            nondir_fields: Vec::new(),
            num_angles: 16,
            total_channels,
        }
    }

    #[test]
    fn normalize_uses_selected_channel_stats() {
        let stats = NormalizationStats {
            means: vec![0.0, 1.0, 2.0, 3.0],
            stds: vec![1.0, 2.0, 4.0, 8.0],
        };
        let normalize = Normalize::new(&stats, &layout(vec![1, 3], 4)).unwrap();
        let mut batch = collate(&[record(1, &[0.5], &[0.5], 2)]).unwrap();
        batch.sensor_input.fill(5.0);

        normalize.apply(&mut batch, &mut StdRng::seed_from_u64(0));
        assert!((batch.sensor_input[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((batch.sensor_input[[0, 1, 1, 1]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn normalize_rejects_short_stats() {
        let stats = NormalizationStats {
            means: vec![0.0],
            stds: vec![1.0],
        };
        let err = Normalize::new(&stats, &layout(vec![0, 1], 2)).unwrap_err();
        assert!(matches!(err, AtrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn horizontal_flip_keeps_interpolated_values() {
        let mut batch = collate(&[record(1, &[1.25, 2.5], &[0.75, 3.0], 4)]).unwrap();
        batch.sensor_input = Array4::from_shape_fn((1, 2, 4, 4), |(_, ch, r, c)| {
            (ch * 16 + r * 4 + c) as f32
        });
        let expected = interpolate_output(&batch, batch.sensor_input.view()).unwrap();

        always(3, &RandomHorizontalFlip, &mut batch);
        assert_eq!(batch.sensor_input[[0, 0, 0, 3]], 0.0);
        let flipped = interpolate_output(&batch, batch.sensor_input.view()).unwrap();
        for (a, b) in expected.iter().zip(flipped.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn vertical_flip_keeps_interpolated_values() {
        let mut batch = collate(&[record(1, &[1.25, 0.5], &[0.75, 2.5], 4)]).unwrap();
        batch.sensor_input = Array4::from_shape_fn((1, 2, 4, 4), |(_, ch, r, c)| {
            (ch * 16 + r * 4 + c) as f32
        });
        let expected = interpolate_output(&batch, batch.sensor_input.view()).unwrap();

        always(11, &RandomVerticalFlip, &mut batch);
        assert_eq!(batch.sensor_input[[0, 0, 3, 0]], 0.0);
        let flipped = interpolate_output(&batch, batch.sensor_input.view()).unwrap();
        for (a, b) in expected.iter().zip(flipped.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn flips_leave_cached_recipe_untouched() {
        let records = vec![record(1, &[1.5], &[0.5], 4)];
        let original = records[0].recipe.corners.clone();
        let mut batch = collate(&records).unwrap();

        always(5, &RandomHorizontalFlip, &mut batch);
        assert_eq!(records[0].recipe.corners, original);
    }

    #[test]
    fn flips_mirror_nondirectional_planes() {
        let mut batch = collate(&[record(1, &[0.5], &[0.5], 2)]).unwrap();
        let mut fields = BTreeMap::new();
        let plane = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        fields.insert(
            "Latitude".to_string(),
            plane.insert_axis(Axis(0)),
        );
        batch.nondirectional_fields = Some(fields);

        always(7, &RandomVerticalFlip, &mut batch);
        let lat = &batch.nondirectional_fields.as_ref().unwrap()["Latitude"];
        assert_eq!(lat[[0, 0, 0]], 3.0);
        assert_eq!(lat[[0, 1, 1]], 2.0);
    }

    #[test]
    fn pipeline_steps_depend_on_mode() {
        let normalize = Normalize::new(
            &NormalizationStats {
                means: vec![0.0],
                stds: vec![1.0],
            },
            &layout(vec![0], 1),
        )
        .unwrap();

        let train = TransformPipeline::for_mode("train", Some(normalize.clone()), Some(1));
        assert_eq!(train.step_names(), vec!["normalize", "hflip", "vflip"]);

        let val = TransformPipeline::for_mode("val", Some(normalize), Some(1));
        assert_eq!(val.step_names(), vec!["normalize"]);

        let bare = TransformPipeline::for_mode("val", None, None);
        assert!(bare.is_empty());
    }

    #[test]
    fn seeded_pipelines_flip_identically() {
        let base = collate(&[record(1, &[1.25, 2.5], &[0.75, 3.0], 4)]).unwrap();
        let mut first = TransformPipeline::for_mode("train", None, Some(42));
        let mut second = TransformPipeline::for_mode("train", None, Some(42));

        for _ in 0..8 {
            let mut a = base.clone();
            let mut b = base.clone();
            first.apply(&mut a);
            second.apply(&mut b);
            assert_eq!(a.corners, b.corners);
            assert_eq!(a.sensor_input, b.sensor_input);
        }
    }
}
