//! Dense linear algebra kernels for HMM fitting and ridge regression.
//!
//! Everything here is built on `nalgebra` dynamic matrices. The routines
//! favor recovery over failure: positive definiteness is restored by bounded
//! ridge escalation, and singular normal equations fall back to a
//! pseudo-inverse rather than aborting a long-running analysis.

use nalgebra::DMatrix;

/// Maximum number of ridge-escalation attempts before giving up on a
/// Cholesky factorization.
const MAX_CHOLESKY_ATTEMPTS: usize = 10;

/// Log-determinant and inverse extracted from a successful Cholesky
/// factorization of a symmetric positive-definite matrix.
#[derive(Debug, Clone)]
pub struct CholeskyFactors {
    /// ln|Σ| computed from the Cholesky diagonal.
    pub log_det: f64,
    /// Σ⁻¹ solved from the factorization.
    pub inverse: DMatrix<f64>,
}

/// Factorizes `matrix`, escalating the diagonal by `ridge·I` on failure.
///
/// Up to ten escalation attempts are made. `None` means the matrix stayed
/// indefinite even after escalation; callers are expected to degrade to a
/// best-effort evaluation rather than abort.
pub fn regularized_cholesky(matrix: &DMatrix<f64>, ridge: f64) -> Option<CholeskyFactors> {
    let n = matrix.nrows();
    let mut candidate = matrix.clone();

    for _attempt in 0..MAX_CHOLESKY_ATTEMPTS {
        if let Some(cholesky) = nalgebra::Cholesky::new(candidate.clone()) {
            let l = cholesky.l();
            let mut log_det = 0.0;
            for i in 0..n {
                log_det += l[(i, i)].ln();
            }
            return Some(CholeskyFactors {
                log_det: 2.0 * log_det,
                inverse: cholesky.inverse(),
            });
        }
        for i in 0..n {
            candidate[(i, i)] += ridge;
        }
    }
    None
}

/// Projects `matrix` onto the positive-definite cone in place.
///
/// Adds `ridge·I` until a Cholesky factorization succeeds, bounded by the
/// same attempt limit as [`regularized_cholesky`]. Returns `true` when the
/// final matrix factorizes.
pub fn ensure_positive_definite(matrix: &mut DMatrix<f64>, ridge: f64) -> bool {
    let n = matrix.nrows();
    for _attempt in 0..MAX_CHOLESKY_ATTEMPTS {
        if nalgebra::Cholesky::new(matrix.clone()).is_some() {
            return true;
        }
        for i in 0..n {
            matrix[(i, i)] += ridge;
        }
    }
    nalgebra::Cholesky::new(matrix.clone()).is_some()
}

/// Inverts the ridge-regularized normal-equations matrix `XᵗX + ridge·I`.
///
/// Tries a Cholesky solve first, escalates once with `10·ridge`, then falls
/// back to an SVD pseudo-inverse for ill-conditioned designs.
pub fn ridge_normal_equations_inverse(xtx: &DMatrix<f64>, ridge: f64) -> DMatrix<f64> {
    let n = xtx.nrows();
    let identity = DMatrix::<f64>::identity(n, n);

    let mut regularized = xtx + &identity * ridge;
    if let Some(cholesky) = nalgebra::Cholesky::new(regularized.clone()) {
        return cholesky.inverse();
    }

    regularized += &identity * (10.0 * ridge);
    if let Some(cholesky) = nalgebra::Cholesky::new(regularized.clone()) {
        return cholesky.inverse();
    }

    match regularized.clone().pseudo_inverse(f64::EPSILON * n as f64) {
        Ok(pinv) => pinv,
        Err(_) => DMatrix::zeros(n, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_regularized_cholesky_well_conditioned() {
        let m = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let factors = regularized_cholesky(&m, 1e-6).unwrap();

        // det = 11, so log_det = ln(11).
        assert_approx_eq!(factors.log_det, 11.0f64.ln(), 1e-9);

        let product = &m * &factors.inverse;
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(product[(i, j)], expected, 1e-9);
            }
        }
    }

    #[test]
    fn test_regularized_cholesky_recovers_semidefinite() {
        // Rank-1 matrix is only positive semi-definite; escalation must fix it.
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(regularized_cholesky(&m, 1e-6).is_some());
    }

    #[test]
    fn test_ensure_positive_definite() {
        let mut m = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.0, 0.0]);
        assert!(ensure_positive_definite(&mut m, 1e-6));
        assert!(m[(0, 0)] > 0.0);

        let mut ok = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]);
        let before = ok.clone();
        assert!(ensure_positive_definite(&mut ok, 1e-6));
        assert_eq!(ok, before);
    }

    #[test]
    fn test_ridge_inverse_identity() {
        let xtx = DMatrix::<f64>::identity(3, 3);
        let inv = ridge_normal_equations_inverse(&xtx, 1e-9);
        for i in 0..3 {
            assert_approx_eq!(inv[(i, i)], 1.0, 1e-6);
        }
    }

    #[test]
    fn test_ridge_inverse_singular_design() {
        // Perfectly collinear design: XᵗX is singular, but the ridge (and
        // ultimately the pseudo-inverse) must still produce a usable matrix.
        let xtx = DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 2.0, 2.0]);
        let inv = ridge_normal_equations_inverse(&xtx, 1e-6);
        assert!(inv.iter().all(|v| v.is_finite()));
    }
}
