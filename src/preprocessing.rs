//! Observation-matrix preprocessing: standardization and row/column views.

use crate::math_utils::constants::MIN_STD_DEV;
use nalgebra::DMatrix;

/// Standardizes every column to zero mean and unit variance in place.
///
/// Uses the population standard deviation (denominator T). Columns whose
/// deviation falls below the variance floor are only centered, so a
/// constant feature cannot blow up to ±∞.
pub fn standardize_columns(data: &mut DMatrix<f64>) {
    let rows = data.nrows();
    if rows == 0 {
        return;
    }
    for col in 0..data.ncols() {
        let mut mean = 0.0;
        for row in 0..rows {
            mean += data[(row, col)];
        }
        mean /= rows as f64;

        let mut variance = 0.0;
        for row in 0..rows {
            let centered = data[(row, col)] - mean;
            variance += centered * centered;
        }
        let mut std_dev = (variance / rows as f64).sqrt();
        if std_dev < MIN_STD_DEV {
            std_dev = 1.0;
        }

        for row in 0..rows {
            data[(row, col)] = (data[(row, col)] - mean) / std_dev;
        }
    }
}

/// Materializes a copy of `data` with rows rearranged by `order`.
///
/// `order[i]` names the source row placed at destination row `i`; `order`
/// must be a permutation of `0..data.nrows()`.
pub fn permute_rows(data: &DMatrix<f64>, order: &[usize]) -> DMatrix<f64> {
    debug_assert_eq!(order.len(), data.nrows());
    let mut permuted = DMatrix::zeros(data.nrows(), data.ncols());
    for (dest, &src) in order.iter().enumerate() {
        permuted.set_row(dest, &data.row(src));
    }
    permuted
}

/// Extracts the listed columns of `data` into a new T×k matrix.
pub fn select_columns(data: &DMatrix<f64>, indices: &[usize]) -> DMatrix<f64> {
    let mut subset = DMatrix::zeros(data.nrows(), indices.len());
    for (dest, &src) in indices.iter().enumerate() {
        subset.set_column(dest, &data.column(src));
    }
    subset
}
