//! Core Gaussian hidden Markov model fit by Baum-Welch EM.
//!
//! The model has a fixed topology: `num_states` hidden states, each emitting
//! `num_features`-dimensional continuous observations through a full-
//! covariance multivariate Gaussian. All sequence-level computation runs in
//! log-space so long series cannot underflow, and every fit performs
//! `num_restarts` independent random initializations, keeping the restart
//! with the highest terminal log-likelihood.

use crate::{
    errors::{validate_count, validate_data_length, validate_positive, HmmAnalysisError, HmmResult},
    linear_algebra::{ensure_positive_definite, regularized_cholesky},
    math_utils::{
        constants::{LN_TWO_PI, LOG_PROB_FLOOR},
        log_sum_exp,
    },
    secure_rng::SecureRng,
};
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Posterior values below this log-space bound are clamped before
/// exponentiation in the gamma computation.
const GAMMA_LOG_CLAMP: f64 = -1e6;

/// Configuration for a [`GaussianHmm`] fit.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HmmConfig {
    /// Number of hidden states (at least 2)
    pub num_states: usize,
    /// Observation dimensionality (at least 1)
    pub num_features: usize,
    /// EM iteration limit per restart
    pub max_iterations: usize,
    /// Number of independent random initializations
    pub num_restarts: usize,
    /// Absolute log-likelihood improvement below which EM stops
    pub tolerance: f64,
    /// Ridge strength for covariance and normal-equation protection
    pub regularization: f64,
    /// When set, a restart that converged always outranks one that did
    /// not, regardless of log-likelihood
    pub exclude_nonconverged_restarts: bool,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            num_states: 2,
            num_features: 1,
            max_iterations: 500,
            num_restarts: 5,
            tolerance: 1e-6,
            regularization: 1e-6,
            exclude_nonconverged_restarts: false,
        }
    }
}

/// Parameters of a fitted Gaussian HMM.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HmmParameters {
    /// Initial state distribution, length S, sums to 1
    pub initial_probabilities: DVector<f64>,
    /// Row-stochastic transition matrix, S×S
    pub transition_matrix: DMatrix<f64>,
    /// Per-state emission means, S×F
    pub means: DMatrix<f64>,
    /// Per-state emission covariances, S matrices of F×F
    pub covariances: Vec<DMatrix<f64>>,
}

/// Outcome of a [`GaussianHmm::fit`] call.
///
/// When every restart diverges the result carries
/// `log_likelihood = -∞` and `converged = false` instead of an error;
/// downstream statistics must check `converged` before trusting the fit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HmmFitResult {
    /// Fitted model parameters
    pub parameters: HmmParameters,
    /// State posterior matrix, T×S, each row sums to 1
    pub state_posterior: DMatrix<f64>,
    /// Terminal log-likelihood of the winning restart
    pub log_likelihood: f64,
    /// EM iterations performed by the winning restart
    pub iterations: usize,
    /// Whether the winning restart met the tolerance criterion
    pub converged: bool,
}

/// Per-restart scratch space, discarded unless the restart wins.
struct WorkingState {
    /// Log emission densities, S×T
    log_emission: DMatrix<f64>,
    /// Forward log probabilities, T×S
    alpha: DMatrix<f64>,
    /// Backward log probabilities, T×S
    beta: DMatrix<f64>,
    /// State posterior, T×S
    gamma: DMatrix<f64>,
    /// Expected transition counts, S×S
    xi_sum: DMatrix<f64>,
    /// Per-state posterior mass
    gamma_sums: DVector<f64>,
    /// Scratch for per-timestep joint log probabilities, S×S
    log_xi: DMatrix<f64>,
}

impl WorkingState {
    fn new(num_observations: usize, num_states: usize) -> Self {
        Self {
            log_emission: DMatrix::zeros(num_states, num_observations),
            alpha: DMatrix::zeros(num_observations, num_states),
            beta: DMatrix::zeros(num_observations, num_states),
            gamma: DMatrix::zeros(num_observations, num_states),
            xi_sum: DMatrix::zeros(num_states, num_states),
            gamma_sums: DVector::zeros(num_states),
            log_xi: DMatrix::zeros(num_states, num_states),
        }
    }
}

/// Multivariate Gaussian HMM with full per-state covariance.
#[derive(Debug, Clone)]
pub struct GaussianHmm {
    config: HmmConfig,
}

impl GaussianHmm {
    /// Create a model, validating the configuration before any computation.
    pub fn new(config: HmmConfig) -> HmmResult<Self> {
        validate_count(config.num_states, 2, "num_states")?;
        validate_count(config.num_features, 1, "num_features")?;
        validate_count(config.max_iterations, 1, "max_iterations")?;
        validate_count(config.num_restarts, 1, "num_restarts")?;
        validate_positive(config.tolerance, "tolerance")?;
        Ok(Self { config })
    }

    /// The validated configuration this model was built with.
    pub fn config(&self) -> &HmmConfig {
        &self.config
    }

    /// Fit the model to an observation sequence (rows = time steps).
    ///
    /// Runs `num_restarts` independent EM fits and returns the restart with
    /// the highest terminal log-likelihood. The caller's RNG drives every
    /// random draw, so an identical RNG state reproduces the fit exactly.
    pub fn fit(
        &self,
        observations: &DMatrix<f64>,
        rng: &mut SecureRng,
    ) -> HmmResult<HmmFitResult> {
        let num_observations = observations.nrows();
        validate_data_length(num_observations, 2, "GaussianHmm::fit")?;
        if observations.ncols() != self.config.num_features {
            return Err(HmmAnalysisError::DimensionMismatch {
                what: "observation feature count".to_string(),
                expected: self.config.num_features,
                actual: observations.ncols(),
            });
        }

        let mut best: Option<HmmFitResult> = None;

        for _restart in 0..self.config.num_restarts {
            let mut params = self.initialize_parameters(observations, rng);
            let mut work = WorkingState::new(num_observations, self.config.num_states);

            let mut previous_log_likelihood = f64::NEG_INFINITY;
            let mut converged = false;
            let mut iterations = 0;

            for iteration in 0..self.config.max_iterations {
                self.compute_log_emissions(observations, &params, &mut work.log_emission);
                let log_likelihood = self.forward_backward(&params, &mut work);
                iterations = iteration + 1;

                if !log_likelihood.is_finite() {
                    break;
                }

                if iteration > 0
                    && (log_likelihood - previous_log_likelihood).abs() < self.config.tolerance
                {
                    converged = true;
                }
                previous_log_likelihood = log_likelihood;

                self.maximization_step(observations, &work, &mut params);

                if converged {
                    break;
                }
            }

            let candidate = HmmFitResult {
                parameters: params,
                state_posterior: work.gamma,
                log_likelihood: previous_log_likelihood,
                iterations,
                converged,
            };

            let replace = match best.as_ref() {
                None => true,
                Some(current) => {
                    if self.config.exclude_nonconverged_restarts
                        && current.converged != candidate.converged
                    {
                        candidate.converged
                    } else {
                        candidate.log_likelihood > current.log_likelihood
                    }
                }
            };
            if replace {
                best = Some(candidate);
            }
        }

        best.ok_or_else(|| HmmAnalysisError::NumericalError {
            reason: "No restart produced a fit result".to_string(),
            operation: Some("GaussianHmm::fit".to_string()),
        })
    }

    /// Uniform initial/transition distributions, means drawn from random
    /// observation rows, shared sample covariance for every state.
    fn initialize_parameters(
        &self,
        observations: &DMatrix<f64>,
        rng: &mut SecureRng,
    ) -> HmmParameters {
        let num_observations = observations.nrows();
        let num_states = self.config.num_states;
        let num_features = self.config.num_features;

        let initial_probabilities = DVector::from_element(num_states, 1.0 / num_states as f64);
        let transition_matrix =
            DMatrix::from_element(num_states, num_states, 1.0 / num_states as f64);

        let mut means = DMatrix::zeros(num_states, num_features);
        for state in 0..num_states {
            let row = rng.usize(0..num_observations);
            means.set_row(state, &observations.row(row));
        }

        let mut centered = observations.clone();
        for col in 0..num_features {
            let mut mean = 0.0;
            for row in 0..num_observations {
                mean += centered[(row, col)];
            }
            mean /= num_observations as f64;
            for row in 0..num_observations {
                centered[(row, col)] -= mean;
            }
        }
        let mut shared_cov = (centered.transpose() * &centered) / num_observations as f64;
        for i in 0..num_features {
            shared_cov[(i, i)] += self.config.regularization;
        }

        HmmParameters {
            initial_probabilities,
            transition_matrix,
            means,
            covariances: vec![shared_cov; num_states],
        }
    }

    /// Fill the S×T log emission matrix with multivariate Gaussian
    /// log-densities.
    ///
    /// Each state's covariance is factorized with bounded ridge escalation;
    /// if the factorization stays unavailable the state degrades to a
    /// diagonal best-effort evaluation instead of aborting the fit.
    fn compute_log_emissions(
        &self,
        observations: &DMatrix<f64>,
        params: &HmmParameters,
        log_emission: &mut DMatrix<f64>,
    ) {
        let num_observations = observations.nrows();
        let num_features = self.config.num_features;
        let norm_constant = num_features as f64 * LN_TWO_PI;
        let mut diff = vec![0.0; num_features];

        for state in 0..self.config.num_states {
            let covariance = &params.covariances[state];
            match regularized_cholesky(covariance, self.config.regularization) {
                Some(factors) => {
                    for t in 0..num_observations {
                        for i in 0..num_features {
                            diff[i] = observations[(t, i)] - params.means[(state, i)];
                        }
                        let mut quad_form = 0.0;
                        for i in 0..num_features {
                            for j in 0..num_features {
                                quad_form += diff[i] * factors.inverse[(i, j)] * diff[j];
                            }
                        }
                        log_emission[(state, t)] =
                            -0.5 * (norm_constant + factors.log_det + quad_form);
                    }
                }
                None => {
                    // Best-effort: indefinite even after escalation, treat
                    // the covariance as diagonal with floored variances.
                    let mut log_det = 0.0;
                    for i in 0..num_features {
                        log_det += covariance[(i, i)].max(self.config.regularization).ln();
                    }
                    for t in 0..num_observations {
                        let mut quad_form = 0.0;
                        for i in 0..num_features {
                            let variance = covariance[(i, i)].max(self.config.regularization);
                            let d = observations[(t, i)] - params.means[(state, i)];
                            quad_form += d * d / variance;
                        }
                        log_emission[(state, t)] =
                            -0.5 * (norm_constant + log_det + quad_form);
                    }
                }
            }
        }
    }

    /// Log-space forward-backward pass.
    ///
    /// Fills alpha, beta, gamma, the xi accumulator, and the per-state
    /// gamma mass; returns the sequence log-likelihood. Posterior
    /// quantities are left untouched when the likelihood is non-finite.
    fn forward_backward(&self, params: &HmmParameters, work: &mut WorkingState) -> f64 {
        let num_observations = work.alpha.nrows();
        let num_states = self.config.num_states;

        let log_transition = params
            .transition_matrix
            .map(|p| p.max(LOG_PROB_FLOOR).ln());
        let log_init = params
            .initial_probabilities
            .map(|p| p.max(LOG_PROB_FLOOR).ln());

        let mut scratch = vec![0.0; num_states];

        // Forward pass
        for j in 0..num_states {
            work.alpha[(0, j)] = log_init[j] + work.log_emission[(j, 0)];
        }
        for t in 1..num_observations {
            for j in 0..num_states {
                for k in 0..num_states {
                    scratch[k] = work.alpha[(t - 1, k)] + log_transition[(k, j)];
                }
                work.alpha[(t, j)] = work.log_emission[(j, t)] + log_sum_exp(&scratch);
            }
        }

        for k in 0..num_states {
            scratch[k] = work.alpha[(num_observations - 1, k)];
        }
        let log_likelihood = log_sum_exp(&scratch);
        if !log_likelihood.is_finite() {
            return log_likelihood;
        }

        // Backward pass
        for j in 0..num_states {
            work.beta[(num_observations - 1, j)] = 0.0;
        }
        for t in (0..num_observations - 1).rev() {
            for i in 0..num_states {
                for j in 0..num_states {
                    scratch[j] = log_transition[(i, j)]
                        + work.log_emission[(j, t + 1)]
                        + work.beta[(t + 1, j)];
                }
                work.beta[(t, i)] = log_sum_exp(&scratch);
            }
        }

        // State posterior and per-state mass
        work.gamma_sums.fill(0.0);
        work.xi_sum.fill(0.0);
        for t in 0..num_observations {
            for i in 0..num_states {
                let value = work.alpha[(t, i)] + work.beta[(t, i)] - log_likelihood;
                let posterior = value.max(GAMMA_LOG_CLAMP).exp();
                work.gamma[(t, i)] = posterior;
                work.gamma_sums[i] += posterior;
            }
            let row_sum: f64 = (0..num_states).map(|i| work.gamma[(t, i)]).sum();
            if row_sum > 0.0 {
                for i in 0..num_states {
                    work.gamma[(t, i)] /= row_sum;
                }
            }
        }

        // Expected transitions, normalized per timestep in log-space
        for t in 0..num_observations - 1 {
            let mut normalizer = f64::NEG_INFINITY;
            for i in 0..num_states {
                for j in 0..num_states {
                    let value = work.alpha[(t, i)]
                        + log_transition[(i, j)]
                        + work.log_emission[(j, t + 1)]
                        + work.beta[(t + 1, j)];
                    work.log_xi[(i, j)] = value;
                    if value > normalizer {
                        normalizer = value;
                    }
                }
            }
            if !normalizer.is_finite() {
                continue;
            }
            let mut sum_exp = 0.0;
            for i in 0..num_states {
                for j in 0..num_states {
                    sum_exp += (work.log_xi[(i, j)] - normalizer).exp();
                }
            }
            let log_sum = normalizer + sum_exp.ln();
            for i in 0..num_states {
                for j in 0..num_states {
                    work.xi_sum[(i, j)] += (work.log_xi[(i, j)] - log_sum).exp();
                }
            }
        }

        log_likelihood
    }

    /// M-step: re-estimate initial distribution, transitions, and per-state
    /// Gaussian parameters from the posterior statistics.
    fn maximization_step(
        &self,
        observations: &DMatrix<f64>,
        work: &WorkingState,
        params: &mut HmmParameters,
    ) {
        let num_observations = observations.nrows();
        let num_states = self.config.num_states;
        let num_features = self.config.num_features;

        // Initial distribution from the first posterior row
        let init_sum: f64 = (0..num_states).map(|i| work.gamma[(0, i)]).sum();
        if init_sum > 0.0 {
            for i in 0..num_states {
                params.initial_probabilities[i] = work.gamma[(0, i)] / init_sum;
            }
        } else {
            params.initial_probabilities.fill(1.0 / num_states as f64);
        }

        // Transition rows from accumulated xi, uniform fallback on zero mass
        for i in 0..num_states {
            let row_sum: f64 = (0..num_states).map(|j| work.xi_sum[(i, j)]).sum();
            if row_sum > 0.0 {
                for j in 0..num_states {
                    params.transition_matrix[(i, j)] = work.xi_sum[(i, j)] / row_sum;
                }
            } else {
                for j in 0..num_states {
                    params.transition_matrix[(i, j)] = 1.0 / num_states as f64;
                }
            }
        }

        // Emission parameters
        let mut mean = vec![0.0; num_features];
        let mut diff = vec![0.0; num_features];
        for state in 0..num_states {
            let gamma_sum = work.gamma_sums[state];
            if gamma_sum <= self.config.regularization {
                // Reinitialize on insufficient support
                for col in 0..num_features {
                    let mut column_mean = 0.0;
                    for row in 0..num_observations {
                        column_mean += observations[(row, col)];
                    }
                    params.means[(state, col)] = column_mean / num_observations as f64;
                }
                params.covariances[state] =
                    DMatrix::identity(num_features, num_features) * self.config.regularization;
                continue;
            }

            mean.iter_mut().for_each(|m| *m = 0.0);
            for row in 0..num_observations {
                let weight = work.gamma[(row, state)];
                for col in 0..num_features {
                    mean[col] += weight * observations[(row, col)];
                }
            }
            for col in 0..num_features {
                mean[col] /= gamma_sum;
                params.means[(state, col)] = mean[col];
            }

            let mut cov = DMatrix::zeros(num_features, num_features);
            for row in 0..num_observations {
                let weight = work.gamma[(row, state)];
                for col in 0..num_features {
                    diff[col] = observations[(row, col)] - mean[col];
                }
                for p in 0..num_features {
                    for q in p..num_features {
                        let contribution = weight * diff[p] * diff[q];
                        cov[(p, q)] += contribution;
                        if p != q {
                            cov[(q, p)] += contribution;
                        }
                    }
                }
            }
            cov /= gamma_sum;
            for i in 0..num_features {
                cov[(i, i)] += self.config.regularization;
            }
            ensure_positive_definite(&mut cov, self.config.regularization);
            params.covariances[state] = cov;
        }
    }
}
