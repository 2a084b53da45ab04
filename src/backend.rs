//! Pluggable execution backends for HMM fitting.
//!
//! The statistical testers fit many independent models and may route those
//! fits through an accelerated implementation (GPU, SIMD batch, remote
//! worker). A backend advertises its capability envelope through
//! [`ExecutionBackend::supports`], queried once before dispatch; runtime
//! failures are absorbed by [`BackendDispatcher`], which reroutes the failed
//! unit and every not-yet-started unit to the default CPU path. A backend
//! failure is therefore a logged soft condition, never a caller-visible
//! error.

use crate::{
    errors::HmmResult,
    hmm_core::{GaussianHmm, HmmConfig, HmmFitResult},
    secure_rng::SecureRng,
};
use log::warn;
use nalgebra::DMatrix;
use std::sync::atomic::{AtomicBool, Ordering};

/// Problem dimensions a backend is asked to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmmDims {
    /// Number of hidden states
    pub num_states: usize,
    /// Observation dimensionality
    pub num_features: usize,
}

/// Strategy interface for fitting a Gaussian HMM.
///
/// Implementations must be safe to call from worker threads; each call
/// receives its own RNG and owns no shared mutable state.
pub trait ExecutionBackend: Send + Sync {
    /// Human-readable backend name used in log messages.
    fn name(&self) -> &str;

    /// Whether this backend can handle the given problem dimensions.
    fn supports(&self, dims: HmmDims) -> bool;

    /// Fit a model to the observation sequence.
    fn fit(
        &self,
        observations: &DMatrix<f64>,
        config: &HmmConfig,
        rng: &mut SecureRng,
    ) -> HmmResult<HmmFitResult>;
}

/// Default CPU backend wrapping [`GaussianHmm`] directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl ExecutionBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supports(&self, _dims: HmmDims) -> bool {
        true
    }

    fn fit(
        &self,
        observations: &DMatrix<f64>,
        config: &HmmConfig,
        rng: &mut SecureRng,
    ) -> HmmResult<HmmFitResult> {
        GaussianHmm::new(config.clone())?.fit(observations, rng)
    }
}

/// Orchestration wrapper implementing first-attempt-accelerated with
/// transparent CPU fallback.
///
/// The healthy flag is shared across all units of a dispatch batch: once an
/// accelerated fit fails, no further unit attempts it.
pub struct BackendDispatcher<'a> {
    accelerated: Option<&'a dyn ExecutionBackend>,
    healthy: AtomicBool,
}

impl<'a> BackendDispatcher<'a> {
    /// Build a dispatcher, dropping the accelerated backend up-front when
    /// it does not support the problem dimensions.
    pub fn new(accelerated: Option<&'a dyn ExecutionBackend>, dims: HmmDims) -> Self {
        let usable = accelerated.filter(|backend| backend.supports(dims));
        Self {
            accelerated: usable,
            healthy: AtomicBool::new(true),
        }
    }

    /// Whether the accelerated backend is still being attempted.
    pub fn accelerated_active(&self) -> bool {
        self.accelerated.is_some() && self.healthy.load(Ordering::Relaxed)
    }

    /// Fit one unit of work, falling back to the CPU path on any
    /// accelerated failure.
    pub fn fit(
        &self,
        observations: &DMatrix<f64>,
        config: &HmmConfig,
        rng: &mut SecureRng,
    ) -> HmmResult<HmmFitResult> {
        if let Some(backend) = self.accelerated {
            if self.healthy.load(Ordering::Relaxed) {
                match backend.fit(observations, config, rng) {
                    Ok(result) => return Ok(result),
                    Err(error) => {
                        warn!(
                            "accelerated backend '{}' failed, rerouting to cpu: {}",
                            backend.name(),
                            error
                        );
                        self.healthy.store(false, Ordering::Relaxed);
                    }
                }
            }
        }
        CpuBackend.fit(observations, config, rng)
    }
}
