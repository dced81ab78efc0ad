//! Sensor array loading and channel selection.

use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use ndarray_npy::{read_npy, ReadNpyError};

use crate::error::{AtrainError, AtrainResult};
use crate::fields::ChannelLayout;

/// Read a `(height, width, channels)` sensor array.
///
/// Arrays stored as float64 are narrowed to float32.
pub fn load_sensor_array(instance_id: u32, path: &Path) -> AtrainResult<Array3<f32>> {
    if !path.exists() {
        return Err(AtrainError::MissingSensorFile {
            instance_id,
            path: path.to_path_buf(),
        });
    }

    let npy_error = |source: ReadNpyError| AtrainError::Npy {
        path: path.to_path_buf(),
        source,
    };
    match read_npy::<_, Array3<f32>>(path) {
        Ok(array) => Ok(array),
        Err(ReadNpyError::WrongDescriptor(_)) => read_npy::<_, Array3<f64>>(path)
            .map(|array| array.mapv(|v| v as f32))
            .map_err(npy_error),
        Err(source) => Err(npy_error(source)),
    }
}

/// Select the layout's directional channels, clip them to `[0, 1]` and move
/// channels first: `(H, W, total)` -> `(C, H, W)`.
pub fn select_input_channels(
    raw: &Array3<f32>,
    layout: &ChannelLayout,
) -> AtrainResult<Array3<f32>> {
    check_channel_count(raw, layout)?;
    let selected = raw
        .select(Axis(2), &layout.multi_angle_idx)
        .mapv(|v| v.clamp(0.0, 1.0));
    Ok(selected
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned())
}

/// Unclipped `(H, W)` planes of the layout's non-directional fields, keyed by
/// field name.
pub fn select_nondirectional(
    raw: &Array3<f32>,
    layout: &ChannelLayout,
) -> AtrainResult<BTreeMap<String, Array2<f32>>> {
    check_channel_count(raw, layout)?;
    Ok(layout
        .nondir_fields
        .iter()
        .zip(&layout.nondir_idx)
        .map(|(name, &channel)| (name.clone(), raw.index_axis(Axis(2), channel).to_owned()))
        .collect())
}

fn check_channel_count(raw: &Array3<f32>, layout: &ChannelLayout) -> AtrainResult<()> {
    let (height, width, channels) = raw.dim();
    if channels != layout.total_channels {
        return Err(AtrainError::ShapeMismatch {
            context: "sensor array channel count".to_string(),
            expected: vec![height, width, layout.total_channels],
            actual: vec![height, width, channels],
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{Field, FieldGroup};

    fn layout() -> ChannelLayout {
        let catalog = vec![
            Field::new(FieldGroup::DataDirectional, "I443NP"),
            Field::new(FieldGroup::Data, "Nviews"),
        ];
        ChannelLayout::new(&catalog, &catalog, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14])
            .unwrap()
    }

    fn raw() -> Array3<f32> {
        Array3::from_shape_fn((2, 3, 17), |(r, c, ch)| {
            if ch == 16 {
                7.0
            } else {
                (r * 10 + c) as f32 * 0.1 - 0.2 + ch as f32
            }
        })
    }

    #[test]
    fn input_is_channel_first_and_clipped() {
        let input = select_input_channels(&raw(), &layout()).unwrap();
        assert_eq!(input.dim(), (2, 2, 3));
        assert_eq!(input[[0, 0, 0]], 0.0);
        assert!((input[[0, 0, 2]] - 0.0).abs() < 1e-6);
        assert!((input[[0, 1, 0]] - 0.8).abs() < 1e-6);
        assert_eq!(input[[1, 1, 2]], 1.0);
        assert!(input.is_standard_layout());
    }

    #[test]
    fn nondirectional_planes_are_not_clipped() {
        let planes = select_nondirectional(&raw(), &layout()).unwrap();
        assert_eq!(planes.len(), 1);
        assert_eq!(planes["Nviews"].dim(), (2, 3));
        assert!(planes["Nviews"].iter().all(|&v| v == 7.0));
    }

    #[test]
    fn channel_count_mismatch_is_reported() {
        let short = Array3::<f32>::zeros((2, 3, 5));
        let err = select_input_channels(&short, &layout()).unwrap_err();
        assert!(matches!(err, AtrainError::ShapeMismatch { .. }));
    }

    #[test]
    fn missing_file_names_instance() {
        let err = load_sensor_array(9, Path::new("/nonexistent/atrain/9.npy")).unwrap_err();
        assert!(matches!(
            err,
            AtrainError::MissingSensorFile { instance_id: 9, .. }
        ));
    }
}
