//! Cloud scenario evaluation metrics.
//!
//! Predictions and labels are compared point by point. A prediction with a
//! single column is a "squashed" cloud mask; the labels are OR-reduced over
//! their height bins before comparison in that case.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AtrainError, AtrainResult};

/// Top-bin index of a point with no cloud.
pub const NO_CLOUD_BIN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    CloudMaskAccuracy,
    CloudScenarioAccuracy,
    CloudtopHeightBinAccuracy,
    CloudtopHeightBinOffsetError,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        Self::CloudMaskAccuracy,
        Self::CloudScenarioAccuracy,
        Self::CloudtopHeightBinAccuracy,
        Self::CloudtopHeightBinOffsetError,
    ];

    /// Metrics that stay meaningful for single-column mask predictions.
    pub const MASK_ONLY: [MetricKind; 3] = [
        Self::CloudMaskAccuracy,
        Self::CloudtopHeightBinAccuracy,
        Self::CloudtopHeightBinOffsetError,
    ];

    pub const SQUASH_BINS: [MetricKind; 1] = [Self::CloudMaskAccuracy];

    pub fn name(self) -> &'static str {
        match self {
            Self::CloudMaskAccuracy => "cloud_mask_accuracy",
            Self::CloudScenarioAccuracy => "cloud_scenario_accuracy",
            Self::CloudtopHeightBinAccuracy => "cloudtop_height_bin_accuracy",
            Self::CloudtopHeightBinOffsetError => "cloudtop_height_bin_offset_error",
        }
    }

    fn compute(self) -> MetricFn {
        match self {
            Self::CloudMaskAccuracy => cloud_mask_accuracy,
            Self::CloudScenarioAccuracy => cloud_scenario_accuracy,
            Self::CloudtopHeightBinAccuracy => cloudtop_height_bin_accuracy,
            Self::CloudtopHeightBinOffsetError => cloudtop_height_bin_offset_error,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = AtrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| AtrainError::UnknownMetric(s.to_string()))
    }
}

/// Parse a comma-separated metric list; `all` expands to every metric.
pub fn parse_metric_list(list: &str) -> AtrainResult<Vec<MetricKind>> {
    if list.trim() == "all" {
        return Ok(MetricKind::ALL.to_vec());
    }
    list.split(',')
        .filter(|name| !name.trim().is_empty())
        .map(str::parse)
        .collect()
}

type MetricFn = fn(&PointComparison) -> f64;

/// Labels and predictions of one instance reduced to the per-point quantities
/// the metrics need.
#[derive(Debug, Clone)]
pub struct PointComparison {
    /// Labels as compared, squashed to one column when the prediction is.
    pub ground_truth: Array2<f32>,
    pub prediction: Array2<f32>,
    pub gt_mask: Array1<bool>,
    pub pred_mask: Array1<bool>,
    pub gt_top_bin: Array1<i64>,
    pub pred_top_bin: Array1<i64>,
}

impl PointComparison {
    pub fn new(
        instance_id: u32,
        ground_truth: ArrayView2<u8>,
        prediction: ArrayView2<f32>,
    ) -> AtrainResult<Self> {
        let ground_truth = if prediction.ncols() == 1 {
            ground_truth
                .map_axis(Axis(1), |bins| bins.iter().any(|&b| b > 0))
                .mapv(|cloudy| if cloudy { 1.0_f32 } else { 0.0 })
                .insert_axis(Axis(1))
        } else {
            ground_truth.mapv(f32::from)
        };

        if ground_truth.dim() != prediction.dim() {
            return Err(AtrainError::ShapeMismatch {
                context: format!("prediction for instance {instance_id}"),
                expected: ground_truth.shape().to_vec(),
                actual: prediction.shape().to_vec(),
            });
        }

        Ok(Self {
            gt_mask: ground_truth.map_axis(Axis(1), any_positive),
            pred_mask: prediction.map_axis(Axis(1), any_positive),
            gt_top_bin: ground_truth.map_axis(Axis(1), top_bin),
            pred_top_bin: prediction.map_axis(Axis(1), top_bin),
            ground_truth,
            prediction: prediction.to_owned(),
        })
    }

    pub fn num_points(&self) -> usize {
        self.gt_mask.len()
    }
}

fn any_positive(bins: ArrayView1<f32>) -> bool {
    bins.iter().any(|&v| v > 0.0)
}

/// Lowest set bin index, i.e. the highest cloud layer.
fn top_bin(bins: ArrayView1<f32>) -> i64 {
    bins.iter()
        .position(|&v| v != 0.0)
        .map_or(NO_CLOUD_BIN, |bin| bin as i64)
}

fn mean_of<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

fn agreement<T: PartialEq>(a: &Array1<T>, b: &Array1<T>) -> f64 {
    mean_of(a.iter().zip(b).map(|(x, y)| f64::from(u8::from(x == y))))
}

fn cloud_mask_accuracy(cmp: &PointComparison) -> f64 {
    agreement(&cmp.gt_mask, &cmp.pred_mask)
}

fn cloud_scenario_accuracy(cmp: &PointComparison) -> f64 {
    let mut matches = Vec::with_capacity(cmp.ground_truth.len());
    Zip::from(&cmp.ground_truth)
        .and(&cmp.prediction)
        .for_each(|gt, pred| matches.push(f64::from(u8::from(gt == pred))));
    mean_of(matches)
}

fn cloudtop_height_bin_accuracy(cmp: &PointComparison) -> f64 {
    agreement(&cmp.gt_top_bin, &cmp.pred_top_bin)
}

/// Mean |pred top bin - gt top bin| over points cloudy in both.
fn cloudtop_height_bin_offset_error(cmp: &PointComparison) -> f64 {
    mean_of(
        (0..cmp.num_points())
            .filter(|&i| cmp.gt_mask[i] && cmp.pred_mask[i])
            .map(|i| (cmp.pred_top_bin[i] - cmp.gt_top_bin[i]).abs() as f64),
    )
}

/// Per-instance metric values for one evaluation call.
///
/// Output only: NaN entries are written as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    /// Evaluated instances, in split order; aligned with every metric array.
    pub instance_ids: Vec<u32>,
    pub metrics: BTreeMap<MetricKind, Vec<f64>>,
    /// Instances that had no prediction and were scored 0.
    pub missing_predictions: Vec<u32>,
}

impl MetricsReport {
    pub fn values(&self, kind: MetricKind) -> Option<ArrayView1<'_, f64>> {
        self.metrics
            .get(&kind)
            .map(|values| ArrayView1::from(values.as_slice()))
    }

    /// Mean of each metric over instances, skipping NaN entries.
    pub fn summary(&self) -> BTreeMap<MetricKind, f64> {
        self.metrics
            .iter()
            .map(|(kind, values)| {
                (
                    *kind,
                    mean_of(values.iter().copied().filter(|v| !v.is_nan())),
                )
            })
            .collect()
    }
}

/// Score every instance in `instance_ids`.
///
/// Instances without a prediction contribute 0 to every requested metric and
/// remain in the report. Labels are only loaded for instances that have a
/// prediction; any label loading error aborts the whole evaluation.
pub fn evaluate<L>(
    instance_ids: &[u32],
    mut load_labels: L,
    predictions: &HashMap<u32, Array2<f32>>,
    metrics: &[MetricKind],
) -> AtrainResult<MetricsReport>
where
    L: FnMut(u32) -> AtrainResult<Array2<u8>>,
{
    let mut requested: Vec<MetricKind> = Vec::with_capacity(metrics.len());
    for kind in metrics {
        if !requested.contains(kind) {
            requested.push(*kind);
        }
    }

    let mut values: BTreeMap<MetricKind, Vec<f64>> = requested
        .iter()
        .map(|kind| (*kind, Vec::with_capacity(instance_ids.len())))
        .collect();
    let mut missing_predictions = Vec::new();

    for &instance_id in instance_ids {
        let Some(prediction) = predictions.get(&instance_id) else {
            missing_predictions.push(instance_id);
            for series in values.values_mut() {
                series.push(0.0);
            }
            continue;
        };

        let ground_truth = load_labels(instance_id)?;
        let comparison = PointComparison::new(instance_id, ground_truth.view(), prediction.view())?;
        for kind in &requested {
            let value = (kind.compute())(&comparison);
            if let Some(series) = values.get_mut(kind) {
                series.push(value);
            }
        }
        debug!(
            instance_id,
            points = comparison.num_points(),
            "Evaluated instance"
        );
    }

    if !missing_predictions.is_empty() {
        warn!(
            missing = missing_predictions.len(),
            total = instance_ids.len(),
            "Instances without predictions scored as 0"
        );
    }

    Ok(MetricsReport {
        generated_at: Utc::now(),
        instance_ids: instance_ids.to_vec(),
        metrics: values,
        missing_predictions,
    })
}
