//! # HMM Analysis
//!
//! Gaussian hidden Markov model fitting and statistical validation for
//! multivariate time series.
//!
//! The crate trains a continuous-observation HMM by Expectation-Maximization
//! (Baum-Welch) entirely in log-space, with multiple random restarts, and
//! wraps the fitter in two validation procedures used in quantitative
//! research:
//!
//! - **Memory test** ([`MemoryAnalyzer`]): a Monte Carlo permutation test of
//!   whether the original time ordering carries more sequential structure
//!   than randomly permuted orderings.
//! - **Target correlation search** ([`TargetCorrelationAnalyzer`]): fits one
//!   HMM per k-element feature subset, regresses an external target on the
//!   state posterior, ranks subsets by R², and assigns permutation-test
//!   solo and best-of p-values.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use hmm_analysis::{MemoryAnalyzer, MemoryTestConfig, SecureRng};
//! use nalgebra::DMatrix;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 300 observations of 2 features, rows in time order.
//!     let observations = DMatrix::<f64>::from_fn(300, 2, |r, c| {
//!         ((r * 7 + c) % 13) as f64
//!     });
//!
//!     let analyzer = MemoryAnalyzer::new(MemoryTestConfig {
//!         num_states: 3,
//!         mcpt_replications: 100,
//!         ..MemoryTestConfig::default()
//!     })?;
//!
//!     let mut rng = SecureRng::with_seed(42);
//!     let result = analyzer.analyze(&observations, &mut rng, None)?;
//!     println!(
//!         "original loglik = {:.2}, p = {:.4}",
//!         result.original_log_likelihood, result.p_value
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Design
//!
//! All randomness flows from a caller-owned seeded [`SecureRng`]; Monte
//! Carlo units of work receive seeds drawn sequentially before dispatch, so
//! results are bit-for-bit reproducible regardless of worker scheduling.
//! Independent fits run on a bounded worker pool (`parallel` feature,
//! enabled by default). Numerical degeneracy is recovered locally through
//! ridge escalation and pseudo-inverse fallbacks; an accelerated
//! [`ExecutionBackend`] that fails mid-run is logged and transparently
//! replaced by the CPU path.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod errors;
pub mod hmm_core;
pub mod linear_algebra;
pub mod math_utils;
pub mod memory_test;
pub mod preprocessing;
pub mod secure_rng;
pub mod target_correlation;
pub mod task_pool;

/// Progress callback invoked with completed-work fractions in [0, 1].
///
/// May be called from worker threads; observed values are non-decreasing up
/// to scheduling jitter between units completing out of order. Callers are
/// responsible for marshaling to a UI thread.
pub type ProgressFn = dyn Fn(f64) + Sync;

pub use backend::{BackendDispatcher, CpuBackend, ExecutionBackend, HmmDims};
pub use errors::{HmmAnalysisError, HmmResult};
pub use hmm_core::{GaussianHmm, HmmConfig, HmmFitResult, HmmParameters};
pub use memory_test::{MemoryAnalyzer, MemoryTestConfig, MemoryTestResult};
pub use secure_rng::SecureRng;
pub use target_correlation::{
    generate_combinations, ComboResult, TargetCorrelationAnalyzer, TargetCorrelationConfig,
    TargetCorrelationResult,
};
