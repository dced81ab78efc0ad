//! Bilinear interpolation of dense model output at sparse label points.

use ndarray::{Array2, Array3, ArrayView1, ArrayView3, ArrayView4, Axis, Zip};

use crate::collate::Batch;
use crate::error::{AtrainError, AtrainResult};
use crate::recipe::NUM_CORNERS;

/// Interpolate a `(B, C, H, W)` output at every label point of `batch`.
///
/// Returns `(points, C)`, row `i` aligned with row `i` of the batch's cloud
/// scenario. The batch corners are left untouched.
pub fn interpolate_output(batch: &Batch, output: ArrayView4<f32>) -> AtrainResult<Array2<f32>> {
    if output.len_of(Axis(0)) != batch.len() {
        return Err(AtrainError::ShapeMismatch {
            context: "interpolate: output batch size".to_string(),
            expected: vec![batch.len()],
            actual: vec![output.len_of(Axis(0))],
        });
    }
    interpolate(
        output,
        batch.corners.view(),
        batch.weights.view(),
        batch.batch_idx.view(),
    )
}

/// Gather the four corners of each point from `output` and sum them with
/// their weights.
///
/// Corners are clamped to the grid on a private copy. The flat cell index is
/// `row * H + col`, offset by `batch_idx * H * W`.
pub fn interpolate(
    output: ArrayView4<f32>,
    corners: ArrayView3<i64>,
    weights: ArrayView3<f32>,
    batch_idx: ArrayView1<usize>,
) -> AtrainResult<Array2<f32>> {
    let (batch, channels, height, width) = output.dim();
    let points = batch_idx.len();

    if corners.dim() != (points, NUM_CORNERS, 2) {
        return Err(AtrainError::ShapeMismatch {
            context: "interpolate: corners".to_string(),
            expected: vec![points, NUM_CORNERS, 2],
            actual: corners.shape().to_vec(),
        });
    }
    if weights.dim() != (points, NUM_CORNERS, 1) {
        return Err(AtrainError::ShapeMismatch {
            context: "interpolate: weights".to_string(),
            expected: vec![points, NUM_CORNERS, 1],
            actual: weights.shape().to_vec(),
        });
    }
    if points == 0 {
        return Ok(Array2::zeros((0, channels)));
    }
    if height == 0 || width == 0 {
        return Err(AtrainError::ShapeMismatch {
            context: "interpolate: output grid is empty".to_string(),
            expected: vec![batch, channels, 1, 1],
            actual: output.shape().to_vec(),
        });
    }
    if let Some(&owner) = batch_idx.iter().find(|&&owner| owner >= batch) {
        return Err(AtrainError::IndexOutOfRange {
            index: owner,
            len: batch,
        });
    }

    let mut clamped = corners.to_owned();
    clamped
        .index_axis_mut(Axis(2), 0)
        .mapv_inplace(|row| row.clamp(0, height as i64 - 1));
    clamped
        .index_axis_mut(Axis(2), 1)
        .mapv_inplace(|col| col.clamp(0, width as i64 - 1));

    let cells = height * width;
    let mut flat_index = Array2::<usize>::zeros((points, NUM_CORNERS));
    Zip::from(flat_index.rows_mut())
        .and(clamped.outer_iter())
        .and(&batch_idx)
        .for_each(|mut index, corner, &owner| {
            Zip::from(&mut index)
                .and(corner.rows())
                .for_each(|slot, rc| {
                    *slot = rc[0] as usize * height + rc[1] as usize + owner * cells;
                });
        });

    let table_len = batch * cells;
    if let Some(&index) = flat_index.iter().find(|&&index| index >= table_len) {
        return Err(AtrainError::IndexOutOfRange {
            index,
            len: table_len,
        });
    }

    let table = output
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((table_len, channels))
        .map_err(|_| AtrainError::ShapeMismatch {
            context: "interpolate: flatten output".to_string(),
            expected: vec![table_len, channels],
            actual: output.shape().to_vec(),
        })?;

    let indices: Vec<usize> = flat_index.iter().copied().collect();
    let gathered: Array3<f32> = table
        .select(Axis(0), &indices)
        .into_shape_with_order((points, NUM_CORNERS, channels))
        .map_err(|_| AtrainError::ShapeMismatch {
            context: "interpolate: gathered corners".to_string(),
            expected: vec![points, NUM_CORNERS, channels],
            actual: vec![points * NUM_CORNERS, channels],
        })?;

    Ok((gathered * &weights).sum_axis(Axis(1)))
}
