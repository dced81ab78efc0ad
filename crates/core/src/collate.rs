//! Batch collation.
//!
//! Patches are stacked along a new batch axis; label points of all instances
//! are concatenated in instance order, with `batch_idx` recording the owning
//! instance of each point so interpolation can run over the whole batch at
//! once.

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{
    concatenate, stack, Array, Array1, Array2, Array3, Array4, ArrayView, Axis, Dimension,
    RemoveAxis,
};

use crate::dataset::InstanceRecord;
use crate::error::{AtrainError, AtrainResult};
use crate::label::Geometry;

#[derive(Debug, Clone)]
pub struct Batch {
    pub instance_ids: Vec<u32>,
    /// `(B, C, H, W)`.
    pub sensor_input: Array4<f32>,
    /// `(points,)` index of the owning instance within the batch.
    pub batch_idx: Array1<usize>,
    /// `(points, 4, 2)` corner `(row, col)` coordinates. Owned by the batch,
    /// so augmentation may rewrite them without touching cached recipes.
    pub corners: Array3<i64>,
    /// `(points, 4, 1)`.
    pub weights: Array3<f32>,
    /// `(points, bins)`.
    pub cloud_scenario: Array2<u8>,
    /// `(B, H, W)` planes keyed by field name.
    pub nondirectional_fields: Option<BTreeMap<String, Array3<f32>>>,
    pub geometry: Option<Geometry>,
    pub cloud_scenario_flags: Option<BTreeMap<String, Array2<f64>>>,
    point_offsets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.instance_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
    }

    pub fn num_points(&self) -> usize {
        self.batch_idx.len()
    }

    /// `(height, width)` of the stacked patches.
    pub fn patch_shape(&self) -> (usize, usize) {
        let (_, _, height, width) = self.sensor_input.dim();
        (height, width)
    }

    /// Rows of the concatenated point arrays that belong to instance `i`.
    pub fn points_of(&self, i: usize) -> Range<usize> {
        self.point_offsets[i]..self.point_offsets[i + 1]
    }
}

/// Merge instance records into one batch.
///
/// All records must share the same channel count and patch size. Point order
/// within each instance and instance order within the batch are preserved.
pub fn collate(records: &[InstanceRecord]) -> AtrainResult<Batch> {
    let Some(first) = records.first() else {
        return Err(AtrainError::ShapeMismatch {
            context: "collate: batch has no instances".to_string(),
            expected: vec![1],
            actual: vec![0],
        });
    };

    let sensor_views: Vec<_> = records.iter().map(|r| r.sensor_input.view()).collect();
    let sensor_input = stack(Axis(0), &sensor_views)
        .map_err(|_| mismatch("collate: sensor input", first.sensor_input.shape(), records, |r| {
            r.sensor_input.shape().to_vec()
        }))?;

    let mut point_offsets = Vec::with_capacity(records.len() + 1);
    point_offsets.push(0);
    let mut batch_idx = Vec::new();
    for (inst_idx, record) in records.iter().enumerate() {
        let points = record.num_points();
        batch_idx.extend(std::iter::repeat(inst_idx).take(points));
        point_offsets.push(batch_idx.len());
    }

    let corners = concat_points(
        "collate: corners",
        records.iter().map(|r| r.recipe.corners.view()),
    )?;
    let weights = concat_points(
        "collate: weights",
        records.iter().map(|r| r.recipe.weights.view()),
    )?;
    let cloud_scenario = concat_points(
        "collate: cloud scenario",
        records.iter().map(|r| r.cloud_scenario.view()),
    )?;

    let (nondirectional_fields, geometry) = if first.nondirectional.is_some() {
        let (fields, geometry) = collate_nondirectional(records)?;
        (Some(fields), Some(geometry))
    } else {
        (None, None)
    };
    let cloud_scenario_flags = if first.cloud_scenario_flags.is_some() {
        Some(collate_flags(records)?)
    } else {
        None
    };

    Ok(Batch {
        instance_ids: records.iter().map(|r| r.instance_id).collect(),
        sensor_input,
        batch_idx: Array1::from_vec(batch_idx),
        corners,
        weights,
        cloud_scenario,
        nondirectional_fields,
        geometry,
        cloud_scenario_flags,
        point_offsets,
    })
}

/// Concatenate per-instance point arrays along axis 0. Instances without
/// points are skipped so their placeholder column counts cannot clash.
fn concat_points<'a, A, D, I>(context: &str, parts: I) -> AtrainResult<Array<A, D>>
where
    A: Clone + 'a,
    D: Dimension + RemoveAxis,
    I: Iterator<Item = ArrayView<'a, A, D>>,
{
    let parts: Vec<ArrayView<'a, A, D>> = parts.collect();
    let non_empty: Vec<ArrayView<'a, A, D>> = parts
        .iter()
        .filter(|part| part.len_of(Axis(0)) > 0)
        .cloned()
        .collect();
    let views = if non_empty.is_empty() {
        parts
    } else {
        non_empty
    };
    concatenate(Axis(0), &views).map_err(|_| AtrainError::ShapeMismatch {
        context: context.to_string(),
        expected: views.first().map(|v| v.shape().to_vec()).unwrap_or_default(),
        actual: views
            .iter()
            .map(|v| v.shape()[1..].iter().product())
            .collect(),
    })
}

fn collate_nondirectional(
    records: &[InstanceRecord],
) -> AtrainResult<(BTreeMap<String, Array3<f32>>, Geometry)> {
    let data: Vec<_> = records
        .iter()
        .map(|r| {
            r.nondirectional
                .as_ref()
                .ok_or(AtrainError::ShapeMismatch {
                    context: format!(
                        "collate: instance {} has no non-directional fields",
                        r.instance_id
                    ),
                    expected: vec![1],
                    actual: vec![0],
                })
        })
        .collect::<AtrainResult<_>>()?;

    let mut fields = BTreeMap::new();
    for name in data[0].fields.keys() {
        let planes = data
            .iter()
            .zip(records)
            .map(|(d, r)| {
                d.fields.get(name).map(|plane| plane.view()).ok_or_else(|| {
                    AtrainError::ShapeMismatch {
                        context: format!(
                            "collate: instance {} lacks field '{name}'",
                            r.instance_id
                        ),
                        expected: vec![1],
                        actual: vec![0],
                    }
                })
            })
            .collect::<AtrainResult<Vec<_>>>()?;
        let stacked = stack(Axis(0), &planes).map_err(|_| AtrainError::ShapeMismatch {
            context: format!("collate: field '{name}'"),
            expected: planes[0].shape().to_vec(),
            actual: planes.iter().flat_map(|p| p.shape().to_vec()).collect(),
        })?;
        fields.insert(name.clone(), stacked);
    }

    let geometry = Geometry {
        lat: concat_points("collate: lat", data.iter().map(|d| d.geometry.lat.view()))?,
        lon: concat_points("collate: lon", data.iter().map(|d| d.geometry.lon.view()))?,
        height: concat_points(
            "collate: height",
            data.iter().map(|d| d.geometry.height.view()),
        )?,
        time: concat_points("collate: time", data.iter().map(|d| d.geometry.time.view()))?,
    };

    Ok((fields, geometry))
}

fn collate_flags(records: &[InstanceRecord]) -> AtrainResult<BTreeMap<String, Array2<f64>>> {
    let empty = BTreeMap::new();
    let first = records[0].cloud_scenario_flags.as_ref().unwrap_or(&empty);

    let mut flags = BTreeMap::new();
    for name in first.keys() {
        let parts = records
            .iter()
            .map(|r| {
                r.cloud_scenario_flags
                    .as_ref()
                    .and_then(|f| f.get(name))
                    .map(|values| values.view())
                    .ok_or_else(|| AtrainError::ShapeMismatch {
                        context: format!(
                            "collate: instance {} lacks flag '{name}'",
                            r.instance_id
                        ),
                        expected: vec![1],
                        actual: vec![0],
                    })
            })
            .collect::<AtrainResult<Vec<_>>>()?;
        let merged = concat_points(&format!("collate: flag '{name}'"), parts.into_iter())?;
        flags.insert(name.clone(), merged);
    }
    Ok(flags)
}

fn mismatch(
    context: &str,
    expected: &[usize],
    records: &[InstanceRecord],
    shape: impl Fn(&InstanceRecord) -> Vec<usize>,
) -> AtrainError {
    let actual = records
        .iter()
        .map(shape)
        .find(|s| s.as_slice() != expected)
        .unwrap_or_default();
    AtrainError::ShapeMismatch {
        context: context.to_string(),
        expected: expected.to_vec(),
        actual,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use ndarray::Array2;

    use super::*;
    use crate::dataset::NondirectionalData;
    use crate::recipe::build_recipe;

    pub(crate) fn record(instance_id: u32, rows: &[f64], cols: &[f64], hw: usize) -> InstanceRecord {
        let points = rows.len();
        InstanceRecord {
            instance_id,
            sensor_input: Array3::from_elem((2, hw, hw), instance_id as f32),
            recipe: Arc::new(build_recipe(rows, cols).unwrap()),
            cloud_scenario: Array2::from_shape_fn((points, 3), |(p, b)| {
                u8::from((p + b + instance_id as usize) % 2 == 0)
            }),
            nondirectional: None,
            cloud_scenario_flags: None,
        }
    }

    #[test]
    fn point_count_is_preserved() {
        let records = vec![
            record(10, &[0.5, 1.5], &[0.5, 1.5], 4),
            record(11, &[2.5], &[2.5], 4),
            record(12, &[0.25, 1.25, 2.25], &[3.5, 2.5, 1.5], 4),
        ];
        let batch = collate(&records).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.num_points(), 6);
        assert_eq!(batch.batch_idx.to_vec(), vec![0, 0, 1, 2, 2, 2]);
        assert_eq!(batch.corners.dim(), (6, 4, 2));
        assert_eq!(batch.weights.dim(), (6, 4, 1));
        assert_eq!(batch.cloud_scenario.dim(), (6, 3));
        assert_eq!(batch.sensor_input.dim(), (3, 2, 4, 4));
        assert_eq!(batch.instance_ids, vec![10, 11, 12]);
        assert_eq!(batch.points_of(2), 3..6);
    }

    #[test]
    fn point_order_matches_concatenation_order() {
        let records = vec![
            record(1, &[0.5, 1.5], &[0.5, 1.5], 4),
            record(2, &[2.5], &[2.5], 4),
        ];
        let batch = collate(&records).unwrap();

        assert_eq!(batch.corners[[0, 0, 0]], 0);
        assert_eq!(batch.corners[[1, 0, 0]], 1);
        assert_eq!(batch.corners[[2, 0, 0]], 2);
        assert_eq!(
            batch.cloud_scenario.row(2),
            records[1].cloud_scenario.row(0)
        );
        assert_eq!(batch.sensor_input[[1, 0, 0, 0]], 2.0);
    }

    #[test]
    fn instances_without_points_are_allowed() {
        let mut empty = record(3, &[], &[], 4);
        empty.cloud_scenario = Array2::zeros((0, 0));
        let records = vec![record(1, &[0.5], &[0.5], 4), empty, record(2, &[1.5], &[1.5], 4)];
        let batch = collate(&records).unwrap();

        assert_eq!(batch.num_points(), 2);
        assert_eq!(batch.batch_idx.to_vec(), vec![0, 2]);
        assert_eq!(batch.points_of(1), 1..1);
        assert_eq!(batch.cloud_scenario.dim(), (2, 3));
    }

    #[test]
    fn mismatched_patch_sizes_are_rejected() {
        let records = vec![record(1, &[0.5], &[0.5], 4), record(2, &[0.5], &[0.5], 5)];
        let err = collate(&records).unwrap_err();
        assert!(matches!(err, AtrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(collate(&[]).is_err());
    }

    #[test]
    fn nondirectional_fields_and_geometry_are_merged() {
        let mut records = vec![record(1, &[0.5], &[0.5], 4), record(2, &[1.5, 2.5], &[1.5, 2.5], 4)];
        for r in &mut records {
            let points = r.num_points();
            let mut fields = BTreeMap::new();
            fields.insert("Latitude".to_string(), Array2::from_elem((4, 4), r.instance_id as f32));
            r.nondirectional = Some(NondirectionalData {
                fields,
                geometry: Geometry {
                    lat: Array1::from_elem(points, 1.0),
                    lon: Array1::from_elem(points, 2.0),
                    height: Array1::from_elem(points, 3.0),
                    time: Array1::from_elem(points, r.instance_id as f64),
                },
            });
            let mut flags = BTreeMap::new();
            flags.insert("quality".to_string(), Array2::from_elem((points, 1), 5.0));
            r.cloud_scenario_flags = Some(flags);
        }

        let batch = collate(&records).unwrap();
        let fields = batch.nondirectional_fields.as_ref().unwrap();
        assert_eq!(fields["Latitude"].dim(), (2, 4, 4));
        assert_eq!(fields["Latitude"][[1, 0, 0]], 2.0);

        let geometry = batch.geometry.as_ref().unwrap();
        assert_eq!(geometry.time.to_vec(), vec![1.0, 2.0, 2.0]);

        let flags = batch.cloud_scenario_flags.as_ref().unwrap();
        assert_eq!(flags["quality"].dim(), (3, 1));
    }
}
