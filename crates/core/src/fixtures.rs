//! On-disk dataset fixtures for unit tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use ndarray_npy::write_npy;

use crate::dataset::{DatasetOptions, GenerationInfo, InstanceInfo, GENERATION_INFO_FILE, INSTANCE_INFO_FILE};
use crate::fields::{Field, FieldGroup, NUM_ANGLES};
use crate::label::{CloudScenario, LabelArtifact, NUM_HEIGHT_BINS};

pub(crate) const PATCH: usize = 4;

pub(crate) fn catalog() -> Vec<Field> {
    vec![
        Field::new(FieldGroup::DataDirectional, "I443NP"),
        Field::new(FieldGroup::Geolocation, "Latitude"),
    ]
}

pub(crate) fn options(mode: &str) -> DatasetOptions {
    DatasetOptions {
        mode: mode.to_string(),
        split_name: "split_default".to_string(),
        fields: catalog(),
        angles_to_omit: Vec::new(),
        get_nondir: false,
        get_flags: false,
        cache_recipes: true,
    }
}

/// Instance `id` has `id % 3 + 1` points on the diagonal; point `k` has only
/// bin `k` set.
pub(crate) fn label_for(instance_id: u32) -> LabelArtifact {
    let points = instance_id as usize % 3 + 1;
    let coords: Vec<f64> = (0..points).map(|k| k as f64 + 0.5).collect();
    let cloud_scenario = (0..points)
        .map(|k| {
            let mut bins = vec![0_u8; NUM_HEIGHT_BINS];
            bins[k] = 1;
            bins
        })
        .collect();
    LabelArtifact {
        instance_id,
        patch_idx: (coords.clone(), coords),
        cloud_scenario: CloudScenario {
            cloud_scenario,
            flags: BTreeMap::new(),
        },
        lat: vec![10.0; points],
        lon: vec![20.0; points],
        height: vec![0.0; points],
        time: vec![instance_id as f64; points],
    }
}

/// Write a dataset whose `train` split lists `ids` and `val` split the first
/// id only.
pub(crate) fn write_dataset(root: &Path, ids: &[u32]) -> PathBuf {
    fs::create_dir_all(root.join("inputs")).unwrap();
    fs::create_dir_all(root.join("labels")).unwrap();

    let channels = NUM_ANGLES + 1;
    let mut index = BTreeMap::new();
    for &id in ids {
        let input_path = PathBuf::from(format!("inputs/{id}.npy"));
        let output_path = PathBuf::from(format!("labels/{id}.json"));

        let sensor = Array3::from_shape_fn((PATCH, PATCH, channels), |(r, c, ch)| {
            (id as f32 * 0.01 + (r * PATCH + c) as f32 * 0.001 + ch as f32 * 0.0001).min(1.0)
        });
        write_npy(root.join(&input_path), &sensor).unwrap();
        fs::write(
            root.join(&output_path),
            serde_json::to_string(&label_for(id)).unwrap(),
        )
        .unwrap();

        index.insert(id, InstanceInfo { input_path, output_path });
    }

    fs::write(
        root.join(INSTANCE_INFO_FILE),
        serde_json::to_string(&index).unwrap(),
    )
    .unwrap();
    fs::write(
        root.join(GENERATION_INFO_FILE),
        serde_json::to_string(&GenerationInfo { par_fields: catalog() }).unwrap(),
    )
    .unwrap();
    let splits = serde_json::json!({ "train": ids, "val": &ids[..1.min(ids.len())] });
    fs::write(root.join("split_default.json"), splits.to_string()).unwrap();

    root.to_path_buf()
}
