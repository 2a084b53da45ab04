//! Shared numeric kernels for log-space HMM computation.

/// Mathematical constants used across the crate.
pub mod constants {
    /// ln(2π), the normalization constant of the Gaussian log-density.
    pub const LN_TWO_PI: f64 = 1.8378770664093454835606594728112;

    /// Floor applied to probabilities before taking logarithms.
    pub const LOG_PROB_FLOOR: f64 = 1e-18;

    /// Variance floor used when standardizing near-constant columns.
    pub const MIN_STD_DEV: f64 = 1e-12;
}

/// Numerically stable evaluation of `ln(Σ exp(x_i))`.
///
/// Returns negative infinity for an empty slice or when the maximum is not
/// finite, mirroring the convention that an impossible event has log
/// probability −∞.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Arithmetic mean of a slice; 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation with an explicit denominator.
///
/// The permutation distribution uses `max(1, n - 1)` as denominator so a
/// single replication still yields a finite (zero) deviation.
pub fn sample_std(values: &[f64], center: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sq_sum: f64 = values.iter().map(|&v| (v - center) * (v - center)).sum();
    (sq_sum / (values.len().saturating_sub(1)).max(1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_log_sum_exp_matches_naive() {
        let values: [f64; 4] = [-1.0, 0.5, 2.0, -3.0];
        let naive = values.iter().map(|v| v.exp()).sum::<f64>().ln();
        assert_approx_eq!(log_sum_exp(&values), naive, 1e-12);
    }

    #[test]
    fn test_log_sum_exp_extreme_values() {
        // Naive evaluation overflows; stable version must not.
        let values = [1000.0, 1000.0];
        assert_approx_eq!(log_sum_exp(&values), 1000.0 + 2f64.ln(), 1e-9);

        let values = [-1e308, -1e308];
        assert!(log_sum_exp(&values).is_finite() || log_sum_exp(&values) == f64::NEG_INFINITY);
    }

    #[test]
    fn test_log_sum_exp_degenerate() {
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
        assert_eq!(log_sum_exp(&[f64::INFINITY]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_mean_and_sample_std() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let m = mean(&values);
        assert_approx_eq!(m, 2.5, 1e-12);
        // Sample variance of 1..4 is 5/3.
        assert_approx_eq!(sample_std(&values, m), (5.0f64 / 3.0).sqrt(), 1e-12);

        assert_eq!(mean(&[]), 0.0);
        assert_eq!(sample_std(&[], 0.0), 0.0);
        assert_eq!(sample_std(&[7.0], 7.0), 0.0);
    }
}
