//! The A-Train dataset: PARASOL multi-angle polarimetry inputs paired with
//! sparse CALTRACK cloud scenario labels.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array2, Array3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::RecipeCache;
use crate::config::DatasetConfig;
use crate::error::{AtrainError, AtrainResult};
use crate::fields::{ChannelLayout, Field, FieldPreset};
use crate::label::{Geometry, LabelArtifact};
use crate::metrics::{self, MetricKind, MetricsReport};
use crate::recipe::{build_recipe, count_integral_points, InterpRecipe};
use crate::sensor::{load_sensor_array, select_input_channels, select_nondirectional};

pub const INSTANCE_INFO_FILE: &str = "instance_info.json";
pub const GENERATION_INFO_FILE: &str = "dataset_generation_info.json";

/// File locations of one instance, relative to the dataset root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInfo {
    /// Raw sensor array channel catalog, in storage order.
    pub par_fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOptions {
    pub mode: String,
    pub split_name: String,
    pub fields: Vec<Field>,
    pub angles_to_omit: Vec<usize>,
    pub get_nondir: bool,
    pub get_flags: bool,
    pub cache_recipes: bool,
}

impl DatasetOptions {
    pub fn from_config(config: &DatasetConfig) -> AtrainResult<Self> {
        let preset: FieldPreset = config.fields.parse()?;
        Ok(Self {
            mode: config.mode.clone(),
            split_name: config.split_name.clone(),
            fields: preset.fields(),
            angles_to_omit: config.angles_to_omit.clone(),
            get_nondir: config.get_nondir,
            get_flags: config.get_flags,
            cache_recipes: config.cache_recipes,
        })
    }
}

/// Everything the model needs for one instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub instance_id: u32,
    /// `(C, H, W)`, directional channels clipped to `[0, 1]`.
    pub sensor_input: Array3<f32>,
    pub recipe: Arc<InterpRecipe>,
    /// `(points, bins)` multi-hot cloud scenario.
    pub cloud_scenario: Array2<u8>,
    pub nondirectional: Option<NondirectionalData>,
    pub cloud_scenario_flags: Option<BTreeMap<String, Array2<f64>>>,
}

impl InstanceRecord {
    pub fn num_points(&self) -> usize {
        self.recipe.num_points()
    }
}

#[derive(Debug, Clone)]
pub struct NondirectionalData {
    /// `(H, W)` planes keyed by field name.
    pub fields: BTreeMap<String, Array2<f32>>,
    pub geometry: Geometry,
}

pub struct ATrainDataset {
    root: PathBuf,
    options: DatasetOptions,
    instance_info: BTreeMap<u32, InstanceInfo>,
    instance_ids: Vec<u32>,
    layout: ChannelLayout,
    recipes: Option<Arc<RecipeCache>>,
}

impl std::fmt::Debug for ATrainDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ATrainDataset")
            .field("root", &self.root)
            .field("mode", &self.options.mode)
            .field("instances", &self.instance_ids.len())
            .finish()
    }
}

impl ATrainDataset {
    /// Read the index, split and channel catalog under `root`.
    pub fn open(root: impl Into<PathBuf>, options: DatasetOptions) -> AtrainResult<Self> {
        let root = root.into();
        let generation_info: GenerationInfo = read_json(&root.join(GENERATION_INFO_FILE))?;
        let instance_info: BTreeMap<u32, InstanceInfo> =
            read_json(&root.join(INSTANCE_INFO_FILE))?;
        let mut splits: BTreeMap<String, Vec<u32>> =
            read_json(&root.join(format!("{}.json", options.split_name)))?;
        let instance_ids = splits
            .remove(&options.mode)
            .ok_or_else(|| AtrainError::UnknownSplit {
                split: options.mode.clone(),
                split_name: options.split_name.clone(),
            })?;

        let layout = ChannelLayout::new(
            &generation_info.par_fields,
            &options.fields,
            &options.angles_to_omit,
        )?;
        let recipes = options.cache_recipes.then(|| Arc::new(RecipeCache::new()));

        debug!(
            root = %root.display(),
            mode = %options.mode,
            instances = instance_ids.len(),
            channels = layout.input_channels(),
            "Opened A-Train dataset"
        );

        Ok(Self {
            root,
            options,
            instance_info,
            instance_ids,
            layout,
            recipes,
        })
    }

    pub fn from_config(config: &DatasetConfig) -> AtrainResult<Self> {
        Self::open(config.root.clone(), DatasetOptions::from_config(config)?)
    }

    pub fn len(&self) -> usize {
        self.instance_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    pub fn instance_ids(&self) -> &[u32] {
        &self.instance_ids
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn recipe_cache(&self) -> Option<&Arc<RecipeCache>> {
        self.recipes.as_ref()
    }

    /// Load the instance at position `idx` of the split.
    pub fn get(&self, idx: usize) -> AtrainResult<InstanceRecord> {
        let instance_id = *self
            .instance_ids
            .get(idx)
            .ok_or(AtrainError::IndexOutOfRange {
                index: idx,
                len: self.instance_ids.len(),
            })?;
        self.load_instance(instance_id)
    }

    pub fn load_instance(&self, instance_id: u32) -> AtrainResult<InstanceRecord> {
        let info = self.info(instance_id)?;

        let raw = load_sensor_array(instance_id, &self.root.join(&info.input_path))?;
        let sensor_input = select_input_channels(&raw, &self.layout)?;

        let label = self.load_label(instance_id, info)?;
        let recipe = match &self.recipes {
            Some(cache) => cache.get_or_try_insert(instance_id, || recipe_for(&label))?,
            None => Arc::new(recipe_for(&label)?),
        };
        let cloud_scenario = label.cloud_scenario_array()?;

        let nondirectional = if self.options.get_nondir {
            Some(NondirectionalData {
                fields: select_nondirectional(&raw, &self.layout)?,
                geometry: label.geometry()?,
            })
        } else {
            None
        };
        let cloud_scenario_flags = if self.options.get_flags {
            Some(label.flag_arrays()?)
        } else {
            None
        };

        debug!(instance_id, points = recipe.num_points(), "Loaded instance");

        Ok(InstanceRecord {
            instance_id,
            sensor_input,
            recipe,
            cloud_scenario,
            nondirectional,
            cloud_scenario_flags,
        })
    }

    /// Ground-truth cloud scenario for one instance, `(points, bins)`.
    pub fn load_cloud_scenario(&self, instance_id: u32) -> AtrainResult<Array2<u8>> {
        let info = self.info(instance_id)?;
        self.load_label(instance_id, info)?.cloud_scenario_array()
    }

    /// Score `predictions` (instance id -> `(points, bins)` or `(points, 1)`)
    /// against the labels of every instance in the split.
    ///
    /// Every label artifact must exist, even for instances without a
    /// prediction; those instances score 0 on every metric.
    pub fn evaluate(
        &self,
        predictions: &HashMap<u32, Array2<f32>>,
        metrics: &[MetricKind],
    ) -> AtrainResult<MetricsReport> {
        for &instance_id in &self.instance_ids {
            let info = self.info(instance_id)?;
            let path = self.root.join(&info.output_path);
            if !path.exists() {
                return Err(AtrainError::MissingLabelFile { instance_id, path });
            }
        }

        metrics::evaluate(
            &self.instance_ids,
            |instance_id| self.load_cloud_scenario(instance_id),
            predictions,
            metrics,
        )
    }

    fn info(&self, instance_id: u32) -> AtrainResult<&InstanceInfo> {
        self.instance_info
            .get(&instance_id)
            .ok_or(AtrainError::MissingInstance { instance_id })
    }

    fn load_label(&self, instance_id: u32, info: &InstanceInfo) -> AtrainResult<LabelArtifact> {
        let path = self.root.join(&info.output_path);
        if !path.exists() {
            return Err(AtrainError::MissingLabelFile { instance_id, path });
        }
        let label = LabelArtifact::load(&path)?;
        if label.instance_id != instance_id {
            return Err(AtrainError::CorruptLabel {
                requested: instance_id,
                found: label.instance_id,
            });
        }
        Ok(label)
    }
}

fn recipe_for(label: &LabelArtifact) -> AtrainResult<InterpRecipe> {
    let (rows, cols) = &label.patch_idx;
    if let Some(point) = rows
        .iter()
        .zip(cols)
        .position(|(y, x)| !y.is_finite() || !x.is_finite())
    {
        return Err(AtrainError::NonFiniteCoordinate {
            instance_id: label.instance_id,
            point,
        });
    }

    let integral = count_integral_points(rows, cols);
    if integral > 0 {
        warn!(
            instance_id = label.instance_id,
            points = integral,
            "Label points on exact grid coordinates; recipe weights exceed unit mass"
        );
    }

    build_recipe(rows, cols)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> AtrainResult<T> {
    let raw = fs::read_to_string(path).map_err(|source| AtrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| AtrainError::Json {
        path: path.to_path_buf(),
        source,
    })
}
