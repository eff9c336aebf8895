use crate::algorithm::GaussianProcess;
use crate::errors::{GpError, Result};
use crate::kernels::Kernels;
use crate::mask::HypsMask;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Hyperparameter optimization strategy; explicit model state so the
/// numerical-failure fallback is an observable, persistent transition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptAlgorithm {
    /// Quasi-Newton with box bounds (the default)
    #[default]
    #[serde(rename = "lbfgs_bounded")]
    LbfgsBounded,
    /// Unconstrained quasi-Newton
    #[serde(rename = "lbfgs")]
    Lbfgs,
    /// Derivative-free Nelder-Mead simplex
    #[serde(rename = "nelder_mead")]
    NelderMead,
}

/// Per-call training options
#[derive(Clone, Debug)]
pub struct TrainOpts {
    /// Bounds overriding both the defaults and any mask-supplied bounds
    pub custom_bounds: Option<Vec<(f64, f64)>>,
    /// Relative objective tolerance for the quasi-Newton runs
    pub gradient_tolerance: f64,
    /// Relative parameter tolerance; the simplex convergence threshold
    pub parameter_tolerance: f64,
    /// Line-search step cap. Currently ignored: the backend exposes no
    /// line-search knob.
    pub max_line_search_steps: usize,
}

impl Default for TrainOpts {
    fn default() -> Self {
        TrainOpts {
            custom_bounds: None,
            gradient_tolerance: 1e-4,
            parameter_tolerance: 1e-5,
            max_line_search_steps: 20,
        }
    }
}

/// The set of parameters configuring a [`GaussianProcess`] model before any
/// training data is seen. `check` validates them once, at construction.
#[derive(Clone, Debug)]
pub struct GpParams {
    pub(crate) kernel: Kernels,
    pub(crate) hyps: Array1<f64>,
    pub(crate) cutoffs: Array1<f64>,
    pub(crate) hyp_labels: Option<Vec<String>>,
    pub(crate) opt_algorithm: OptAlgorithm,
    pub(crate) maxiter: usize,
    pub(crate) par: bool,
    pub(crate) per_atom_par: bool,
    pub(crate) no_cpus: Option<usize>,
    pub(crate) mask: Option<HypsMask>,
}

impl GpParams {
    pub fn new(kernel: Kernels, hyps: Array1<f64>, cutoffs: Array1<f64>) -> GpParams {
        GpParams {
            kernel,
            hyps,
            cutoffs,
            hyp_labels: None,
            opt_algorithm: OptAlgorithm::default(),
            maxiter: 10,
            par: false,
            per_atom_par: true,
            no_cpus: None,
            mask: None,
        }
    }

    /// Set human-readable hyperparameter labels
    pub fn hyp_labels(mut self, labels: Vec<String>) -> Self {
        self.hyp_labels = Some(labels);
        self
    }

    /// Set the optimization strategy
    pub fn opt_algorithm(mut self, algorithm: OptAlgorithm) -> Self {
        self.opt_algorithm = algorithm;
        self
    }

    /// Set the optimizer evaluation cap
    pub fn maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    /// Enable worker-pool evaluation of covariance matrices and kernel vectors
    pub fn par(mut self, par: bool) -> Self {
        self.par = par;
        self
    }

    /// When parallelism is on, keep prediction-time kernel vectors serial
    /// (the caller parallelizes over atoms instead)
    pub fn per_atom_par(mut self, per_atom_par: bool) -> Self {
        self.per_atom_par = per_atom_par;
        self
    }

    /// Cap the worker-pool size; defaults to all available cores
    pub fn no_cpus(mut self, no_cpus: Option<usize>) -> Self {
        self.no_cpus = no_cpus;
        self
    }

    /// Group hyperparameters by species/bond/triplet classes
    pub fn mask(mut self, mask: HypsMask) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Validate the configuration and build the model
    pub fn check(self) -> Result<GaussianProcess> {
        if self.cutoffs.is_empty() {
            return Err(GpError::ConfigError(
                "at least one cutoff is required".to_string(),
            ));
        }
        match &self.mask {
            Some(mask) => {
                if !self.kernel.is_multicomponent() {
                    return Err(GpError::ConfigError(format!(
                        "a hyperparameter mask requires a multi-component kernel, got {}",
                        self.kernel
                    )));
                }
                mask.validate(&self.hyps)?;
            }
            None => {
                let expected = self.kernel.n_kernel_hyps(None) + 1;
                if self.hyps.len() != expected {
                    return Err(GpError::ConfigError(format!(
                        "kernel {} expects {expected} hyperparameters (noise included), got {}",
                        self.kernel,
                        self.hyps.len()
                    )));
                }
            }
        }
        Ok(GaussianProcess::from_params(self))
    }
}
