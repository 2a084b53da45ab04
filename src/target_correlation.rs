//! Feature-combination correlation search against an external target.
//!
//! Enumerates every k-element subset of a candidate feature set, fits a
//! Gaussian HMM per subset, and regresses the target series on the inferred
//! state-posterior matrix with ridge regularization. Subsets are ranked by
//! R², and a Monte Carlo permutation test over shuffled targets assigns each
//! subset a solo p-value (its own shuffled statistic against its own
//! original) and a best-of p-value (the best shuffled statistic across all
//! subsets against its original, a multiple-comparisons correction).

use crate::{
    backend::{BackendDispatcher, ExecutionBackend, HmmDims},
    errors::{validate_count, validate_positive, HmmAnalysisError, HmmResult},
    hmm_core::{HmmConfig, HmmFitResult},
    linear_algebra::ridge_normal_equations_inverse,
    preprocessing::{select_columns, standardize_columns},
    secure_rng::SecureRng,
    task_pool::{resolve_worker_count, run_indexed},
    ProgressFn,
};
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Slack applied when comparing shuffled R² against the original, so exact
/// ties count as exceedances.
const MCPT_EPSILON: f64 = 1e-12;

/// Configuration for the target correlation search.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetCorrelationConfig {
    /// Number of hidden states per subset fit
    pub num_states: usize,
    /// Predictor subset size, between 1 and 3
    pub combination_size: usize,
    /// EM iteration limit per restart
    pub max_iterations: usize,
    /// Random restarts per fit
    pub num_restarts: usize,
    /// EM convergence tolerance
    pub tolerance: f64,
    /// Ridge strength for covariances and the normal equations
    pub regularization: f64,
    /// MCPT replications over shuffled targets; 0 disables the test
    pub mcpt_replications: usize,
    /// Maximum concurrent subset fits; 0 uses one worker per CPU
    pub max_threads: usize,
    /// Standardize feature columns before fitting
    pub standardize: bool,
    /// Attempt the registered accelerated backend before the CPU path
    pub use_accelerated_backend: bool,
    /// Restart selection policy forwarded to [`HmmConfig`]
    pub exclude_nonconverged_restarts: bool,
}

impl Default for TargetCorrelationConfig {
    fn default() -> Self {
        Self {
            num_states: 3,
            combination_size: 2,
            max_iterations: 500,
            num_restarts: 5,
            tolerance: 1e-6,
            regularization: 1e-6,
            mcpt_replications: 0,
            max_threads: 8,
            standardize: true,
            use_accelerated_backend: false,
            exclude_nonconverged_restarts: false,
        }
    }
}

/// Result for one feature combination.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ComboResult {
    /// Indices into the candidate feature columns, strictly increasing
    pub feature_indices: Vec<usize>,
    /// Names of the chosen features
    pub feature_names: Vec<String>,
    /// Coefficient of determination of the posterior regression, in [0, 1]
    pub r_squared: f64,
    /// Root mean squared error of the regression residuals
    pub rmse: f64,
    /// Log-likelihood of the subset's HMM fit
    pub log_likelihood: f64,
    /// Solo MCPT p-value
    pub mcpt_solo_p_value: f64,
    /// Best-of MCPT p-value
    pub mcpt_best_of_p_value: f64,
    /// Solo exceedance count, initialized to 1 for the unpermuted baseline
    pub mcpt_solo_count: usize,
    /// Best-of exceedance count, initialized to 1 for the unpermuted baseline
    pub mcpt_best_of_count: usize,
    /// Full HMM fit for this subset
    pub hmm_fit: HmmFitResult,
    /// Regression design matrix, T×(S+1): posterior columns plus intercept
    pub design_matrix: DMatrix<f64>,
    /// Cached transpose of the design matrix
    pub design_matrix_transpose: DMatrix<f64>,
    /// Cached ridge-regularized (XᵗX)⁻¹
    pub xtx_inverse: DMatrix<f64>,
}

/// Result of a full correlation search: combinations sorted descending
/// by R².
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TargetCorrelationResult {
    /// Per-combination results, best R² first
    pub combinations: Vec<ComboResult>,
    /// MCPT replications evaluated, including the unpermuted baseline
    pub mcpt_replications_evaluated: usize,
}

/// Combination correlation search over candidate predictor subsets.
pub struct TargetCorrelationAnalyzer {
    config: TargetCorrelationConfig,
    accelerated: Option<Arc<dyn ExecutionBackend>>,
}

impl TargetCorrelationAnalyzer {
    /// Create an analyzer, validating the configuration.
    pub fn new(config: TargetCorrelationConfig) -> HmmResult<Self> {
        if config.combination_size < 1 || config.combination_size > 3 {
            return Err(HmmAnalysisError::InvalidParameter {
                parameter: "combination_size".to_string(),
                value: config.combination_size as f64,
                constraint: "in [1, 3]".to_string(),
            });
        }
        validate_count(config.num_states, 2, "num_states")?;
        validate_count(config.max_iterations, 1, "max_iterations")?;
        validate_count(config.num_restarts, 1, "num_restarts")?;
        validate_positive(config.tolerance, "tolerance")?;
        Ok(Self {
            config,
            accelerated: None,
        })
    }

    /// Register an accelerated execution backend.
    pub fn with_backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.accelerated = Some(backend);
        self
    }

    /// Run the search.
    ///
    /// `candidate_features` holds one column per candidate predictor
    /// (rows = time steps); `target` must have one entry per row. The
    /// caller's RNG drives subset-fit seeding and the MCPT target shuffles;
    /// an identical RNG state reproduces the full result.
    pub fn analyze(
        &self,
        candidate_features: &DMatrix<f64>,
        feature_names: &[String],
        target: &DVector<f64>,
        rng: &mut SecureRng,
        progress: Option<&ProgressFn>,
    ) -> HmmResult<TargetCorrelationResult> {
        if candidate_features.nrows() != target.len() {
            return Err(HmmAnalysisError::DimensionMismatch {
                what: "target length".to_string(),
                expected: candidate_features.nrows(),
                actual: target.len(),
            });
        }
        if feature_names.len() != candidate_features.ncols() {
            return Err(HmmAnalysisError::DimensionMismatch {
                what: "feature name count".to_string(),
                expected: candidate_features.ncols(),
                actual: feature_names.len(),
            });
        }
        if candidate_features.ncols() < self.config.combination_size {
            return Err(HmmAnalysisError::InvalidParameter {
                parameter: "combination_size".to_string(),
                value: self.config.combination_size as f64,
                constraint: format!(
                    "<= number of candidate features ({})",
                    candidate_features.ncols()
                ),
            });
        }

        let mut processed = candidate_features.clone();
        if self.config.standardize {
            standardize_columns(&mut processed);
        }

        let combinations =
            generate_combinations(processed.ncols(), self.config.combination_size);
        if combinations.is_empty() {
            return Err(HmmAnalysisError::NumericalError {
                reason: "Failed to generate predictor combinations".to_string(),
                operation: Some("TargetCorrelationAnalyzer::analyze".to_string()),
            });
        }

        let model_config = HmmConfig {
            num_states: self.config.num_states,
            num_features: self.config.combination_size,
            max_iterations: self.config.max_iterations,
            num_restarts: self.config.num_restarts,
            tolerance: self.config.tolerance,
            regularization: self.config.regularization,
            exclude_nonconverged_restarts: self.config.exclude_nonconverged_restarts,
        };
        let dims = HmmDims {
            num_states: model_config.num_states,
            num_features: model_config.num_features,
        };
        let accelerated = if self.config.use_accelerated_backend {
            self.accelerated.as_deref()
        } else {
            None
        };
        let dispatcher = BackendDispatcher::new(accelerated, dims);

        let total_combos = combinations.len();
        // Seeds are drawn single-threaded before dispatch so the result is
        // independent of scheduling.
        let seeds: Vec<u64> = (0..total_combos).map(|_| rng.next_seed()).collect();

        let completed = AtomicUsize::new(0);
        let report = |done: usize| {
            if let Some(callback) = progress {
                callback((done as f64 / total_combos as f64).min(1.0));
            }
        };

        let workers = resolve_worker_count(self.config.max_threads).min(total_combos);
        let outcomes: Vec<HmmResult<ComboResult>> =
            run_indexed(workers, total_combos, |idx| {
                let mut local = SecureRng::with_seed(seeds[idx]);
                let combo = &combinations[idx];
                let subset = select_columns(&processed, combo);
                let result = self.evaluate_combination(
                    &dispatcher,
                    &model_config,
                    &subset,
                    combo,
                    feature_names,
                    target,
                    &mut local,
                );
                report(completed.fetch_add(1, Ordering::SeqCst) + 1);
                result
            });

        let mut combos = Vec::with_capacity(total_combos);
        for outcome in outcomes {
            combos.push(outcome?);
        }

        combos.sort_by(|a, b| {
            b.r_squared
                .partial_cmp(&a.r_squared)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut result = TargetCorrelationResult {
            combinations: combos,
            mcpt_replications_evaluated: 1,
        };

        if self.config.mcpt_replications > 0 {
            self.run_mcpt(&mut result, target, rng);
        } else {
            for combo in &mut result.combinations {
                combo.mcpt_solo_p_value = 1.0;
                combo.mcpt_best_of_p_value = 1.0;
            }
        }

        if let Some(callback) = progress {
            callback(1.0);
        }

        Ok(result)
    }

    /// Fit one subset and build its regression caches.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_combination(
        &self,
        dispatcher: &BackendDispatcher<'_>,
        model_config: &HmmConfig,
        subset: &DMatrix<f64>,
        feature_indices: &[usize],
        feature_names: &[String],
        target: &DVector<f64>,
        rng: &mut SecureRng,
    ) -> HmmResult<ComboResult> {
        let fit = dispatcher.fit(subset, model_config, rng)?;

        let num_observations = subset.nrows();
        let num_states = self.config.num_states;
        let mut design_matrix = DMatrix::zeros(num_observations, num_states + 1);
        for state in 0..num_states {
            design_matrix.set_column(state, &fit.state_posterior.column(state));
        }
        for row in 0..num_observations {
            design_matrix[(row, num_states)] = 1.0;
        }

        let design_matrix_transpose = design_matrix.transpose();
        let xtx = &design_matrix_transpose * &design_matrix;
        let xtx_inverse = ridge_normal_equations_inverse(&xtx, self.config.regularization);

        let (r_squared, coefficients) = regression_r_squared(
            &design_matrix,
            &design_matrix_transpose,
            &xtx_inverse,
            target,
        );

        let predictions = &design_matrix * &coefficients;
        let residuals = target - &predictions;
        let rmse = (residuals.norm_squared() / num_observations as f64).sqrt();

        Ok(ComboResult {
            feature_indices: feature_indices.to_vec(),
            feature_names: feature_indices
                .iter()
                .map(|&idx| feature_names[idx].clone())
                .collect(),
            r_squared,
            rmse,
            log_likelihood: fit.log_likelihood,
            mcpt_solo_p_value: 1.0,
            mcpt_best_of_p_value: 1.0,
            mcpt_solo_count: 1,
            mcpt_best_of_count: 1,
            hmm_fit: fit,
            design_matrix,
            design_matrix_transpose,
            xtx_inverse,
        })
    }

    /// MCPT over shuffled targets against the cached design matrices.
    ///
    /// Sequential on purpose: the recomputation per combination is a cheap
    /// matrix-vector solve, and a single shared RNG keeps the shuffle
    /// sequence reproducible.
    fn run_mcpt(
        &self,
        result: &mut TargetCorrelationResult,
        target: &DVector<f64>,
        rng: &mut SecureRng,
    ) {
        let replications = self.config.mcpt_replications;
        let mut indices: Vec<usize> = (0..target.len()).collect();
        let mut permuted = target.clone();

        for _rep in 0..replications {
            rng.shuffle(&mut indices);
            for (dest, &src) in indices.iter().enumerate() {
                permuted[dest] = target[src];
            }

            let mut best_this_rep = 0.0f64;
            for combo in &mut result.combinations {
                let (r_squared, _) = regression_r_squared(
                    &combo.design_matrix,
                    &combo.design_matrix_transpose,
                    &combo.xtx_inverse,
                    &permuted,
                );
                if r_squared >= combo.r_squared - MCPT_EPSILON {
                    combo.mcpt_solo_count += 1;
                }
                if r_squared > best_this_rep {
                    best_this_rep = r_squared;
                }
            }

            for combo in &mut result.combinations {
                if best_this_rep >= combo.r_squared - MCPT_EPSILON {
                    combo.mcpt_best_of_count += 1;
                }
            }
        }

        let denominator = (replications + 1) as f64;
        for combo in &mut result.combinations {
            combo.mcpt_solo_p_value = combo.mcpt_solo_count as f64 / denominator;
            combo.mcpt_best_of_p_value = combo.mcpt_best_of_count as f64 / denominator;
        }
        result.mcpt_replications_evaluated = replications + 1;
    }
}

/// Ridge regression R² of `target` on a cached design matrix.
///
/// Returns the R² clamped to [0, 1] together with the coefficient vector.
/// A target with essentially zero variance, or a non-finite ratio, yields 0.
fn regression_r_squared(
    design_matrix: &DMatrix<f64>,
    design_matrix_transpose: &DMatrix<f64>,
    xtx_inverse: &DMatrix<f64>,
    target: &DVector<f64>,
) -> (f64, DVector<f64>) {
    let xty = design_matrix_transpose * target;
    let coefficients = xtx_inverse * xty;

    let predictions = design_matrix * &coefficients;
    let residuals = target - &predictions;
    let ss_res = residuals.norm_squared();

    let target_mean = target.mean();
    let ss_tot: f64 = target.iter().map(|&v| (v - target_mean) * (v - target_mean)).sum();
    if ss_tot <= 1e-12 {
        return (0.0, coefficients);
    }

    let r_squared = 1.0 - ss_res / ss_tot;
    if !r_squared.is_finite() {
        return (0.0, coefficients);
    }
    (r_squared.clamp(0.0, 1.0), coefficients)
}

/// Enumerate all strictly-increasing k-element index combinations of
/// `0..num_features` in lexicographic order.
pub fn generate_combinations(num_features: usize, combination_size: usize) -> Vec<Vec<usize>> {
    if combination_size == 0 || combination_size > num_features {
        return Vec::new();
    }

    fn backtrack(
        num_features: usize,
        combination_size: usize,
        start: usize,
        depth: usize,
        current: &mut Vec<usize>,
        combos: &mut Vec<Vec<usize>>,
    ) {
        if depth == combination_size {
            combos.push(current.clone());
            return;
        }
        let upper = num_features - (combination_size - depth);
        for i in start..=upper {
            current[depth] = i;
            backtrack(num_features, combination_size, i + 1, depth + 1, current, combos);
        }
    }

    let mut combos = Vec::new();
    let mut current = vec![0usize; combination_size];
    backtrack(num_features, combination_size, 0, 0, &mut current, &mut combos);
    combos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_combinations_counts() {
        assert_eq!(generate_combinations(4, 2).len(), 6);
        assert_eq!(generate_combinations(5, 3).len(), 10);
        assert_eq!(generate_combinations(6, 1).len(), 6);
        assert_eq!(generate_combinations(3, 3).len(), 1);
        assert!(generate_combinations(2, 3).is_empty());
        assert!(generate_combinations(4, 0).is_empty());
    }

    #[test]
    fn test_generate_combinations_exact_set() {
        let combos = generate_combinations(4, 2);
        let expected: Vec<Vec<usize>> = vec![
            vec![0, 1],
            vec![0, 2],
            vec![0, 3],
            vec![1, 2],
            vec![1, 3],
            vec![2, 3],
        ];
        assert_eq!(combos, expected);
    }

    #[test]
    fn test_generate_combinations_strictly_increasing() {
        for combo in generate_combinations(7, 3) {
            assert!(combo.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_config_validation() {
        for bad_size in [0usize, 4] {
            let config = TargetCorrelationConfig {
                combination_size: bad_size,
                ..TargetCorrelationConfig::default()
            };
            assert!(TargetCorrelationAnalyzer::new(config).is_err());
        }

        let config = TargetCorrelationConfig {
            num_states: 1,
            ..TargetCorrelationConfig::default()
        };
        assert!(TargetCorrelationAnalyzer::new(config).is_err());
    }

    #[test]
    fn test_regression_r_squared_perfect_fit() {
        // Design = [x | 1], target = 2x + 3: R² must be 1.
        let xs: Vec<f64> = (0..10).map(|v| v as f64).collect();
        let mut design = DMatrix::zeros(10, 2);
        for (row, &x) in xs.iter().enumerate() {
            design[(row, 0)] = x;
            design[(row, 1)] = 1.0;
        }
        let design_t = design.transpose();
        let xtx = &design_t * &design;
        let xtx_inv = ridge_normal_equations_inverse(&xtx, 1e-9);
        let target = DVector::from_fn(10, |row, _| 2.0 * xs[row] + 3.0);

        let (r_squared, _) = regression_r_squared(&design, &design_t, &xtx_inv, &target);
        assert!(r_squared > 0.999999, "expected near-perfect R², got {}", r_squared);
    }

    #[test]
    fn test_regression_r_squared_constant_target() {
        let design = DMatrix::from_element(8, 1, 1.0);
        let design_t = design.transpose();
        let xtx = &design_t * &design;
        let xtx_inv = ridge_normal_equations_inverse(&xtx, 1e-9);
        let target = DVector::from_element(8, 4.2);

        let (r_squared, _) = regression_r_squared(&design, &design_t, &xtx_inv, &target);
        assert_eq!(r_squared, 0.0);
    }

    #[test]
    fn test_analyze_input_validation() {
        let analyzer = TargetCorrelationAnalyzer::new(TargetCorrelationConfig {
            combination_size: 2,
            ..TargetCorrelationConfig::default()
        })
        .unwrap();
        let features = DMatrix::zeros(20, 3);
        let names: Vec<String> = (0..3).map(|i| format!("f{}", i)).collect();
        let mut rng = SecureRng::with_seed(1);

        let short_target = DVector::zeros(19);
        assert!(matches!(
            analyzer.analyze(&features, &names, &short_target, &mut rng, None),
            Err(HmmAnalysisError::DimensionMismatch { .. })
        ));

        let target = DVector::zeros(20);
        let wrong_names: Vec<String> = (0..2).map(|i| format!("f{}", i)).collect();
        assert!(matches!(
            analyzer.analyze(&features, &wrong_names, &target, &mut rng, None),
            Err(HmmAnalysisError::DimensionMismatch { .. })
        ));

        let narrow = DMatrix::zeros(20, 1);
        let narrow_names = vec!["only".to_string()];
        assert!(matches!(
            analyzer.analyze(&narrow, &narrow_names, &target, &mut rng, None),
            Err(HmmAnalysisError::InvalidParameter { .. })
        ));
    }
}
