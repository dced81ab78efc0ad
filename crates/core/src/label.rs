//! Per-instance label artifacts.
//!
//! A label artifact is a JSON document shaped like:
//!
//! ```json
//! {
//!   "instance_id": 17,
//!   "patch_idx": [[12.4, 40.9], [7.5, 7.6]],
//!   "cloud_scenario": {
//!     "cloud_scenario": [[0, 1, ...], [0, 0, ...]],
//!     "cloud_scenario_quality": [[3], [1]]
//!   },
//!   "lat": [...], "lon": [...], "height": [...], "time": [...]
//! }
//! ```
//!
//! `patch_idx` holds the fractional row coordinates followed by the fractional
//! column coordinates. Every key of `cloud_scenario` other than
//! `cloud_scenario` itself is an auxiliary per-point flag array.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{AtrainError, AtrainResult};

/// Number of vertical height bins in a cloud scenario vector.
pub const NUM_HEIGHT_BINS: usize = 125;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelArtifact {
    pub instance_id: u32,
    pub patch_idx: (Vec<f64>, Vec<f64>),
    pub cloud_scenario: CloudScenario,
    #[serde(default)]
    pub lat: Vec<f64>,
    #[serde(default)]
    pub lon: Vec<f64>,
    #[serde(default)]
    pub height: Vec<f64>,
    #[serde(default)]
    pub time: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudScenario {
    pub cloud_scenario: Vec<Vec<u8>>,
    #[serde(flatten)]
    pub flags: BTreeMap<String, FlagValues>,
}

/// A flag array with either one value or a row of values per point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValues {
    PerPoint(Vec<f64>),
    PerPointRows(Vec<Vec<f64>>),
}

impl FlagValues {
    /// Always `(points, columns)`; a flat array becomes a single column.
    pub fn to_array(&self, context: &str) -> AtrainResult<Array2<f64>> {
        match self {
            Self::PerPoint(values) => Array2::from_shape_vec((values.len(), 1), values.clone())
                .map_err(|_| shape_error(context, vec![values.len(), 1], vec![values.len()])),
            Self::PerPointRows(rows) => rows_to_array(rows, context),
        }
    }
}

/// Per-point geometry copied from the label artifact.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Geometry {
    pub lat: Array1<f64>,
    pub lon: Array1<f64>,
    pub height: Array1<f64>,
    pub time: Array1<f64>,
}

impl LabelArtifact {
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

    pub fn num_points(&self) -> usize {
        self.patch_idx.0.len()
    }

    /// The multi-hot label matrix, `(points, NUM_HEIGHT_BINS)`.
    pub fn cloud_scenario_array(&self) -> AtrainResult<Array2<u8>> {
        let context = format!("cloud scenario of instance {}", self.instance_id);
        let rows = &self.cloud_scenario.cloud_scenario;
        let array = if rows.is_empty() {
            Array2::zeros((0, NUM_HEIGHT_BINS))
        } else {
            rows_to_array(rows, &context)?
        };
        if array.nrows() != self.num_points() {
            return Err(shape_error(
                &context,
                vec![self.num_points(), array.ncols()],
                array.shape().to_vec(),
            ));
        }
        Ok(array)
    }

    /// Every flag as `(points, columns)`.
    pub fn flag_arrays(&self) -> AtrainResult<BTreeMap<String, Array2<f64>>> {
        self.cloud_scenario
            .flags
            .iter()
            .map(|(name, values)| {
                let context = format!("flag '{name}' of instance {}", self.instance_id);
                let array = values.to_array(&context)?;
                if array.nrows() != self.num_points() {
                    return Err(shape_error(
                        &context,
                        vec![self.num_points(), array.ncols()],
                        array.shape().to_vec(),
                    ));
                }
                Ok((name.clone(), array))
            })
            .collect()
    }

    /// Per-point geometry; each of `lat`, `lon`, `height` and `time` must
    /// have one value per point.
    pub fn geometry(&self) -> AtrainResult<Geometry> {
        let column = |name: &str, values: &[f64]| {
            if values.len() != self.num_points() {
                return Err(shape_error(
                    &format!("{name} of instance {}", self.instance_id),
                    vec![self.num_points()],
                    vec![values.len()],
                ));
            }
            Ok(Array1::from_vec(values.to_vec()))
        };
        Ok(Geometry {
            lat: column("lat", &self.lat)?,
            lon: column("lon", &self.lon)?,
            height: column("height", &self.height)?,
            time: column("time", &self.time)?,
        })
    }
}

fn rows_to_array<T: Clone>(rows: &[Vec<T>], context: &str) -> AtrainResult<Array2<T>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().find(|row| row.len() != ncols) {
        return Err(shape_error(
            context,
            vec![rows.len(), ncols],
            vec![rows.len(), bad.len()],
        ));
    }
    let flat: Vec<T> = rows.iter().flatten().cloned().collect();
    Array2::from_shape_vec((rows.len(), ncols), flat)
        .map_err(|_| shape_error(context, vec![rows.len(), ncols], vec![rows.len()]))
}

fn shape_error(context: &str, expected: Vec<usize>, actual: Vec<usize>) -> AtrainError {
    AtrainError::ShapeMismatch {
        context: context.to_string(),
        expected,
        actual,
    }
}
