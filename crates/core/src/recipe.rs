//! Bilinear interpolation recipes for fractional label locations.

use ndarray::{Array1, Array3, Axis};

use crate::error::{AtrainError, AtrainResult};

/// Corner order within a recipe: top-left, top-right, bottom-left, bottom-right.
pub const NUM_CORNERS: usize = 4;

/// Precomputed bilinear gather for a set of points.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpRecipe {
    /// `(points, 4, 2)` integer `(row, col)` corners, unclamped.
    pub corners: Array3<i64>,
    /// `(points, 4, 1)` per-corner weights.
    pub weights: Array3<f32>,
}

impl InterpRecipe {
    pub fn empty() -> Self {
        Self {
            corners: Array3::zeros((0, NUM_CORNERS, 2)),
            weights: Array3::zeros((0, NUM_CORNERS, 1)),
        }
    }

    pub fn num_points(&self) -> usize {
        self.corners.len_of(Axis(0))
    }

    /// Total weight mass per point.
    pub fn weight_sums(&self) -> Array1<f32> {
        self.weights.sum_axis(Axis(2)).sum_axis(Axis(1))
    }
}

/// Build the recipe for points at fractional `(rows[i], cols[i])`.
///
/// Each axis contributes `floor` and `ceil` corners weighted by
/// `1 - |corner - coordinate|`; a corner's weight is the product of its two
/// axis weights. Corners are not clamped to any grid. On an exactly integral
/// coordinate `floor == ceil`, so both corners on that axis get weight 1 and
/// the point's total mass is 2 (one integral axis) or 4 (both).
pub fn build_recipe(rows: &[f64], cols: &[f64]) -> AtrainResult<InterpRecipe> {
    if rows.len() != cols.len() {
        return Err(AtrainError::ShapeMismatch {
            context: "label point coordinates".to_string(),
            expected: vec![rows.len()],
            actual: vec![cols.len()],
        });
    }

    let points = rows.len();
    let mut corners = Array3::<i64>::zeros((points, NUM_CORNERS, 2));
    let mut weights = Array3::<f32>::zeros((points, NUM_CORNERS, 1));

    for (p, (&y, &x)) in rows.iter().zip(cols).enumerate() {
        let top_bottom = [y.floor(), y.ceil()];
        let left_right = [x.floor(), x.ceil()];

        for (corner, (row, col)) in [
            (top_bottom[0], left_right[0]),
            (top_bottom[0], left_right[1]),
            (top_bottom[1], left_right[0]),
            (top_bottom[1], left_right[1]),
        ]
        .into_iter()
        .enumerate()
        {
            corners[[p, corner, 0]] = row as i64;
            corners[[p, corner, 1]] = col as i64;
            let weight_y = 1.0 - (row - y).abs();
            let weight_x = 1.0 - (col - x).abs();
            weights[[p, corner, 0]] = (weight_y * weight_x) as f32;
        }
    }

    Ok(InterpRecipe { corners, weights })
}

/// Number of points with at least one exactly integral coordinate, i.e. the
/// points whose recipe weights do not sum to one.
pub fn count_integral_points(rows: &[f64], cols: &[f64]) -> usize {
    rows.iter()
        .zip(cols)
        .filter(|(y, x)| y.fract() == 0.0 || x.fract() == 0.0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn corners_follow_fixed_order() {
        let recipe = build_recipe(&[2.25], &[5.75]).unwrap();
        let corners: Vec<[i64; 2]> = (0..4)
            .map(|c| [recipe.corners[[0, c, 0]], recipe.corners[[0, c, 1]]])
            .collect();
        assert_eq!(corners, vec![[2, 5], [2, 6], [3, 5], [3, 6]]);
    }

    #[test]
    fn weights_are_bilinear_products() {
        let recipe = build_recipe(&[2.25], &[5.75]).unwrap();
        assert_close(recipe.weights[[0, 0, 0]], 0.75 * 0.25);
        assert_close(recipe.weights[[0, 1, 0]], 0.75 * 0.75);
        assert_close(recipe.weights[[0, 2, 0]], 0.25 * 0.25);
        assert_close(recipe.weights[[0, 3, 0]], 0.25 * 0.75);
    }

    #[test]
    fn fractional_points_have_unit_weight_mass() {
        let rows = [0.5, 1.1, 7.999, 0.001, 12.3];
        let cols = [0.5, 3.7, 0.25, 9.9, 1.000_5];
        let recipe = build_recipe(&rows, &cols).unwrap();
        for sum in recipe.weight_sums() {
            assert_close(sum, 1.0);
        }
        assert_eq!(count_integral_points(&rows, &cols), 0);
    }

    #[test]
    fn integral_coordinates_collapse_corners_and_overcount_mass() {
        // Both axes integral: all four corners coincide and each claims weight 1.
        let recipe = build_recipe(&[3.0, 3.0], &[4.0, 4.5]).unwrap();
        for c in 0..4 {
            assert_eq!(recipe.corners[[0, c, 0]], 3);
            assert_eq!(recipe.corners[[0, c, 1]], 4);
            assert_close(recipe.weights[[0, c, 0]], 1.0);
        }
        let sums = recipe.weight_sums();
        assert_close(sums[0], 4.0);
        // Only the row is integral: mass doubles.
        assert_close(sums[1], 2.0);
        assert_eq!(count_integral_points(&[3.0, 3.0], &[4.0, 4.5]), 2);
    }

    #[test]
    fn out_of_grid_coordinates_are_left_unclamped() {
        let recipe = build_recipe(&[-0.5], &[7.5]).unwrap();
        assert_eq!(recipe.corners[[0, 0, 0]], -1);
        assert_eq!(recipe.corners[[0, 2, 0]], 0);
        assert_eq!(recipe.corners[[0, 1, 1]], 8);
    }

    #[test]
    fn non_finite_input_propagates_to_weights() {
        let recipe = build_recipe(&[f64::NAN], &[1.5]).unwrap();
        assert!(recipe.weights.iter().all(|w| w.is_nan()));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(build_recipe(&[1.5, 2.5], &[1.5]).is_err());
    }

    #[test]
    fn empty_input_yields_empty_recipe() {
        let recipe = build_recipe(&[], &[]).unwrap();
        assert_eq!(recipe, InterpRecipe::empty());
        assert_eq!(recipe.num_points(), 0);
    }
}
