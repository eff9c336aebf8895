//! Gaussian process regression over atomic environments.
//!
//! The model accumulates (environment, force) pairs, maximizes the marginal
//! likelihood of the observed forces over the kernel hyperparameters, and
//! predicts force components and local energies with uncertainty at new
//! environments. Covariance factors are cached as one value object and
//! replaced wholesale on every rebuild or extension, so the Cholesky factor,
//! its inverse, the full inverse and the weight vector never drift apart.

use crate::covariance;
use crate::environment::{quadratic_cutoff, AtomicEnvironment, Structure};
use crate::errors::{GpError, Result};
use crate::kernels::Kernels;
use crate::mask::HypsMask;
use crate::optimization::{self, OptimizeSpec};
use crate::parameters::{GpParams, OptAlgorithm, TrainOpts};

use linfa_linalg::{cholesky::*, triangular::*};
use log::warn;
use ndarray::{s, Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Persistence formats, chosen from the file extension
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpFileFormat {
    /// `.json`
    Json,
    /// `.bin` or `.dat`
    Binary,
}

impl GpFileFormat {
    /// Resolve the format from a file extension
    pub fn from_path(path: &str) -> Result<GpFileFormat> {
        match Path::new(path).extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(GpFileFormat::Json),
            Some("bin") | Some("dat") => Ok(GpFileFormat::Binary),
            other => Err(GpError::UnsupportedFormatError(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Covariance factorization computed from the training set, used later on in
/// prediction computations. Kept consistent as a whole: every rebuild or
/// extension replaces the entire struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct GpInnerParams {
    /// Covariance matrix over training force components, noise included
    pub(crate) k_mat: Array2<f64>,
    /// Lower Cholesky factor of the covariance matrix
    pub(crate) k_chol: Array2<f64>,
    /// Inverse of the Cholesky factor
    pub(crate) k_chol_inv: Array2<f64>,
    /// Full covariance inverse
    pub(crate) k_inv: Array2<f64>,
    /// Weight vector: covariance inverse applied to the training labels
    pub(crate) alpha: Array1<f64>,
}

impl GpInnerParams {
    /// Factorize a covariance matrix and solve for the weights
    fn from_covariance(k_mat: Array2<f64>, labels: &Array1<f64>) -> Result<GpInnerParams> {
        let k_chol = k_mat.cholesky()?;
        let k_chol_inv = k_chol.solve_triangular(&Array2::eye(k_mat.nrows()), UPLO::Lower)?;
        let k_inv = k_chol_inv.t().dot(&k_chol_inv);
        let alpha = k_inv.dot(labels);
        Ok(GpInnerParams {
            k_mat,
            k_chol,
            k_chol_inv,
            k_inv,
            alpha,
        })
    }
}

/// Gaussian process force-field surrogate.
///
/// Training data is append-only; the cached factorization is refreshed
/// explicitly through [`compute_factors`](GaussianProcess::compute_factors)
/// (full rebuild) or [`update_factors`](GaussianProcess::update_factors)
/// (incremental extension). Prediction checks that the cache matches the
/// training set and fails with a [`GpError::StaleFactorsError`] otherwise,
/// never recomputing implicitly.
///
/// # Example
///
/// ```no_run
/// use forcegp::{GaussianProcess, Kernels, TrainOpts};
/// use forcegp::environment::Structure;
/// use ndarray::array;
///
/// let structure = Structure::new(
///     ndarray::Array2::eye(3) * 10.0,
///     vec![0, 0],
///     array![[0.0, 0.0, 0.0], [1.5, 0.0, 0.0]],
/// );
/// let forces = array![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]];
///
/// let mut gp = GaussianProcess::params(
///     Kernels::TwoBody,
///     array![1.0, 1.0, 1e-3],
///     array![4.0],
/// )
/// .check()
/// .expect("valid configuration");
///
/// gp.add_structure(&structure, &forces, None);
/// gp.train(&TrainOpts::default()).expect("training");
/// let env = gp.training_data()[0].clone();
/// let (mean, variance) = gp.predict(&env, 1).expect("prediction");
/// # let _ = (mean, variance);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GaussianProcess {
    /// Kernel family, persisted by name
    kernel: Kernels,
    /// Current hyperparameters (kernel hyperparameters plus trailing noise)
    hyps: Array1<f64>,
    /// Optional human-readable hyperparameter labels
    hyp_labels: Option<Vec<String>>,
    /// Interaction cutoffs, one per interaction order
    cutoffs: Array1<f64>,
    /// Optimization strategy; switched permanently to the unconstrained
    /// method when the bounded run hits a numerical failure
    opt_algorithm: OptAlgorithm,
    /// Mask-supplied optimizer bounds, when any
    bounds: Option<Vec<(f64, f64)>>,
    /// Optimizer evaluation cap
    maxiter: usize,
    /// Evaluate covariance matrices and kernel vectors on a worker pool
    par: bool,
    /// Keep prediction-time kernel vectors serial even when `par` is set
    per_atom_par: bool,
    /// Worker-pool size cap; all available cores when unset
    no_cpus: Option<usize>,
    /// Hyperparameter grouping, when any
    mask: Option<HypsMask>,
    /// Training environments, append-only
    training_data: Vec<AtomicEnvironment>,
    /// Force label per training environment
    training_labels: Vec<[f64; 3]>,
    /// Row-major flattening of the force labels
    label_vector: Array1<f64>,
    /// Cached covariance factorization
    inner: Option<GpInnerParams>,
    /// Log marginal likelihood at the current hyperparameters
    likelihood: Option<f64>,
    /// Gradient of the log marginal likelihood
    likelihood_gradient: Option<Array1<f64>>,
}

impl GaussianProcess {
    /// Model parameters constructor
    pub fn params(kernel: Kernels, hyps: Array1<f64>, cutoffs: Array1<f64>) -> GpParams {
        GpParams::new(kernel, hyps, cutoffs)
    }

    pub(crate) fn from_params(params: GpParams) -> GaussianProcess {
        let bounds = params.mask.as_ref().and_then(|m| m.bounds.clone());
        GaussianProcess {
            kernel: params.kernel,
            hyps: params.hyps,
            hyp_labels: params.hyp_labels,
            cutoffs: params.cutoffs,
            opt_algorithm: params.opt_algorithm,
            bounds,
            maxiter: params.maxiter,
            par: params.par,
            per_atom_par: params.per_atom_par,
            no_cpus: params.no_cpus,
            mask: params.mask,
            training_data: Vec::new(),
            training_labels: Vec::new(),
            label_vector: Array1::zeros(0),
            inner: None,
            likelihood: None,
            likelihood_gradient: None,
        }
    }

    /// Current hyperparameters
    pub fn hyps(&self) -> &Array1<f64> {
        &self.hyps
    }

    /// Kernel family
    pub fn kernel(&self) -> Kernels {
        self.kernel
    }

    /// Interaction cutoffs
    pub fn cutoffs(&self) -> &Array1<f64> {
        &self.cutoffs
    }

    /// Active optimization strategy
    pub fn opt_algorithm(&self) -> OptAlgorithm {
        self.opt_algorithm
    }

    /// Log marginal likelihood from the last rebuild or training pass
    pub fn likelihood(&self) -> Option<f64> {
        self.likelihood
    }

    /// Likelihood gradient from the last rebuild or training pass
    pub fn likelihood_gradient(&self) -> Option<&Array1<f64>> {
        self.likelihood_gradient.as_ref()
    }

    /// Training environments
    pub fn training_data(&self) -> &[AtomicEnvironment] {
        &self.training_data
    }

    /// Flattened force labels
    pub fn label_vector(&self) -> &Array1<f64> {
        &self.label_vector
    }

    /// Hyperparameter mask, when any
    pub fn mask(&self) -> Option<&HypsMask> {
        self.mask.as_ref()
    }

    /// Build environments for the selected atoms of `structure` (all atoms by
    /// default) and append them with their force labels.
    ///
    /// The covariance dimension grows by 3 per appended atom; factors must be
    /// refreshed before the next prediction.
    pub fn add_structure(
        &mut self,
        structure: &Structure,
        forces: &Array2<f64>,
        custom_range: Option<&[usize]>,
    ) {
        let all: Vec<usize> = (0..structure.len()).collect();
        let update_indices = custom_range.unwrap_or(&all);
        for &atom in update_indices {
            let env = AtomicEnvironment::new(structure, atom, &self.cutoffs);
            self.training_data.push(env);
            self.training_labels.push([
                forces[[atom, 0]],
                forces[[atom, 1]],
                forces[[atom, 2]],
            ]);
        }
        self.label_vector = flatten_forces(&self.training_labels);
    }

    /// Append a single environment / force pair, optionally chaining into a
    /// training pass
    pub fn add_environment(
        &mut self,
        env: AtomicEnvironment,
        force: [f64; 3],
        train: bool,
    ) -> Result<()> {
        self.training_data.push(env);
        self.training_labels.push(force);
        self.label_vector = flatten_forces(&self.training_labels);
        if train {
            self.train(&TrainOpts::default())?;
        }
        Ok(())
    }

    /// Tune hyperparameters by maximizing the marginal likelihood, then
    /// rebuild the covariance factors.
    ///
    /// The bounded quasi-Newton strategy runs with the default bounds
    /// `(1e-6, +inf)` (or the mask-supplied ones); a numerical failure inside
    /// its objective demotes the model permanently to the unconstrained
    /// method, with a warning. Caller-supplied `custom_bounds` force one more
    /// bounded run whose result overrides the previous one.
    pub fn train(&mut self, opts: &TrainOpts) -> Result<()> {
        if self.training_data.is_empty() {
            return Err(GpError::OptimizationError(
                "cannot train a model with no training data".to_string(),
            ));
        }
        let x0 = self.hyps.to_owned();
        let mut res: Option<(Array1<f64>, f64)> = None;

        if self.opt_algorithm == OptAlgorithm::LbfgsBounded {
            let bounds = self
                .bounds
                .clone()
                .unwrap_or_else(|| vec![(1e-6, f64::INFINITY); x0.len()]);
            match self.optimize_hyps(&x0, Some(bounds.as_slice()), false, opts) {
                Ok(out) => res = Some(out),
                Err(err) => {
                    warn!(
                        "bounded quasi-Newton optimization failed ({err}); switching to the \
                         unconstrained method for this and all later training calls"
                    );
                    self.opt_algorithm = OptAlgorithm::Lbfgs;
                }
            }
        }

        if let Some(custom) = &opts.custom_bounds {
            res = Some(self.optimize_hyps(&x0, Some(custom.as_slice()), false, opts)?);
        } else if self.opt_algorithm == OptAlgorithm::Lbfgs {
            res = Some(self.optimize_hyps(&x0, None, false, opts)?);
        } else if self.opt_algorithm == OptAlgorithm::NelderMead {
            res = Some(self.optimize_hyps(&x0, None, true, opts)?);
        }

        let (hyps, fmin) = res.ok_or_else(|| {
            GpError::OptimizationError("no optimization strategy executed".to_string())
        })?;
        self.hyps = hyps;
        self.compute_factors()?;
        if fmin.is_finite() {
            self.likelihood = Some(-fmin);
        }
        Ok(())
    }

    /// One optimizer run. Fails if any objective evaluation hit a numerical
    /// error, discarding whatever the backend returned for that run.
    fn optimize_hyps(
        &self,
        x0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
        simplex: bool,
        opts: &TrainOpts,
    ) -> Result<(Array1<f64>, f64)> {
        let failure: RefCell<Option<GpError>> = RefCell::new(None);
        let objfn = |x: &[f64], grad: Option<&mut [f64]>, _: &mut ()| -> f64 {
            let trial = Array1::from(x.to_vec());
            let outcome = if simplex {
                covariance::neg_likelihood(
                    &trial,
                    &self.training_data,
                    &self.label_vector,
                    &self.kernel,
                    &self.cutoffs,
                    self.mask.as_ref(),
                    self.par,
                    self.no_cpus,
                )
                .map(|value| (value, None))
            } else {
                covariance::neg_likelihood_and_grads(
                    &trial,
                    &self.training_data,
                    &self.label_vector,
                    &self.kernel,
                    &self.cutoffs,
                    self.mask.as_ref(),
                    self.par,
                    self.no_cpus,
                )
                .map(|(value, g)| (value, Some(g)))
            };
            match outcome {
                Ok((value, g)) => {
                    if let (Some(grad), Some(g)) = (grad, g) {
                        for (dst, src) in grad.iter_mut().zip(g.iter()) {
                            *dst = *src;
                        }
                    }
                    value
                }
                Err(err) => {
                    if let Some(grad) = grad {
                        for dst in grad.iter_mut() {
                            *dst = 0.0;
                        }
                    }
                    failure.borrow_mut().get_or_insert(err);
                    f64::INFINITY
                }
            }
        };
        let spec = OptimizeSpec {
            maxeval: self.maxiter,
            ftol_rel: opts.gradient_tolerance,
            xtol_rel: opts.parameter_tolerance,
        };
        let out = optimization::minimize(objfn, x0, bounds, simplex, &spec);
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        Ok(out)
    }

    /// Rebuild the covariance matrix, its factorization and the weight vector
    /// from scratch, refreshing the likelihood and its gradient.
    ///
    /// All cached quantities are replaced together; on error the previous
    /// cache is left untouched.
    pub fn compute_factors(&mut self) -> Result<()> {
        let (hyp_grads, k_mat) = match (&self.mask, self.par) {
            (Some(m), true) => covariance::build_covariance_masked_par(
                &self.hyps,
                m,
                &self.training_data,
                &self.kernel,
                &self.cutoffs,
                self.no_cpus,
            )?,
            (Some(m), false) => covariance::build_covariance_masked(
                &self.hyps,
                m,
                &self.training_data,
                &self.kernel,
                &self.cutoffs,
            )?,
            (None, true) => covariance::build_covariance_par(
                &self.hyps,
                &self.training_data,
                &self.kernel,
                &self.cutoffs,
                self.no_cpus,
            )?,
            (None, false) => covariance::build_covariance(
                &self.hyps,
                &self.training_data,
                &self.kernel,
                &self.cutoffs,
            )?,
        };
        let (like, like_grad) =
            covariance::likelihood_and_grads(&k_mat, &hyp_grads, &self.label_vector)?;
        let inner = GpInnerParams::from_covariance(k_mat, &self.label_vector)?;
        self.inner = Some(inner);
        self.likelihood = Some(like);
        self.likelihood_gradient = Some(like_grad);
        Ok(())
    }

    /// Extend the cached covariance matrix with the rows and columns of newly
    /// added training entries and refactorize. Falls back to a full
    /// [`compute_factors`](GaussianProcess::compute_factors) when no factors
    /// exist yet.
    ///
    /// The likelihood and its gradient are NOT refreshed here; they stay at
    /// their last computed values until the next full rebuild or training
    /// pass, signaling that no new optimization has run.
    pub fn update_factors(&mut self) -> Result<()> {
        let prev = match &self.inner {
            Some(inner) => &inner.k_mat,
            None => return self.compute_factors(),
        };
        let k_mat = covariance::extend_covariance(
            prev,
            &self.training_data,
            &self.hyps,
            &self.kernel,
            &self.cutoffs,
            self.mask.as_ref(),
            self.par,
            self.no_cpus,
        )?;
        let inner = GpInnerParams::from_covariance(k_mat, &self.label_vector)?;
        self.inner = Some(inner);
        Ok(())
    }

    /// Refresh the factors only if they are missing or out of sync with the
    /// training set
    pub fn check_factors(&mut self) -> Result<()> {
        let stale = match &self.inner {
            Some(inner) => inner.alpha.len() != 3 * self.training_data.len(),
            None => true,
        };
        if stale {
            self.update_factors()?;
        }
        Ok(())
    }

    fn factors(&self) -> Result<&GpInnerParams> {
        match &self.inner {
            Some(inner) if inner.alpha.len() == 3 * self.training_data.len() => Ok(inner),
            Some(inner) => Err(GpError::StaleFactorsError(format!(
                "weight vector has length {} but the training set holds {} environments \
                 ({} force components); refresh the factors after mutating the training set",
                inner.alpha.len(),
                self.training_data.len(),
                3 * self.training_data.len()
            ))),
            None => Err(GpError::StaleFactorsError(
                "no covariance factorization has been computed yet".to_string(),
            )),
        }
    }

    /// Kernel hyperparameters (noise stripped), mask-expanded when needed
    fn kernel_hyps(&self) -> Vec<f64> {
        let full = match &self.mask {
            Some(m) if self.kernel.is_multicomponent() => m.expand(&self.hyps),
            _ => self.hyps.to_owned(),
        };
        full.slice(s![..full.len() - 1]).to_vec()
    }

    /// Covariance between `env`'s force component `d` and every training
    /// force component, in training order
    pub fn kernel_vector(&self, env: &AtomicEnvironment, d: usize) -> Array1<f64> {
        let kernel_hyps = self.kernel_hyps();
        let size = 3 * self.training_data.len();
        Array1::from_iter((0..size).map(|m| {
            self.kernel.force_force(
                env,
                &self.training_data[m / 3],
                d,
                m % 3 + 1,
                &kernel_hyps,
                &self.cutoffs,
                quadratic_cutoff,
                self.mask.as_ref(),
            )
        }))
    }

    /// Worker-pool variant of [`kernel_vector`](GaussianProcess::kernel_vector);
    /// results are collected in training order and the pool is drained before
    /// returning
    pub fn kernel_vector_par(&self, env: &AtomicEnvironment, d: usize) -> Result<Array1<f64>> {
        let kernel_hyps = self.kernel_hyps();
        let size = 3 * self.training_data.len();
        let pool = covariance::worker_pool(self.no_cpus)?;
        let values: Vec<f64> = pool.install(|| {
            (0..size)
                .into_par_iter()
                .map(|m| {
                    self.kernel.force_force(
                        env,
                        &self.training_data[m / 3],
                        d,
                        m % 3 + 1,
                        &kernel_hyps,
                        &self.cutoffs,
                        quadratic_cutoff,
                        self.mask.as_ref(),
                    )
                })
                .collect()
        });
        Ok(Array1::from(values))
    }

    /// Covariance between `env`'s local energy and every training force
    /// component
    pub fn energy_kernel_vector(&self, env: &AtomicEnvironment) -> Array1<f64> {
        let kernel_hyps = self.kernel_hyps();
        let size = 3 * self.training_data.len();
        Array1::from_iter((0..size).map(|m| {
            self.kernel.force_energy(
                &self.training_data[m / 3],
                m % 3 + 1,
                env,
                &kernel_hyps,
                &self.cutoffs,
                quadratic_cutoff,
                self.mask.as_ref(),
            )
        }))
    }

    /// Predictive mean and variance for force component `component`
    /// (1-indexed Cartesian axis) of `env`
    pub fn predict(&self, env: &AtomicEnvironment, component: usize) -> Result<(f64, f64)> {
        check_component(component)?;
        let inner = self.factors()?;
        let k_v = if self.par && !self.per_atom_par {
            self.kernel_vector_par(env, component)?
        } else {
            self.kernel_vector(env, component)
        };
        let mean = k_v.dot(&inner.alpha);
        let kernel_hyps = self.kernel_hyps();
        let self_kern = self.kernel.force_force(
            env,
            env,
            component,
            component,
            &kernel_hyps,
            &self.cutoffs,
            quadratic_cutoff,
            self.mask.as_ref(),
        );
        let variance = self_kern - k_v.dot(&inner.k_inv.dot(&k_v));
        Ok((mean, variance))
    }

    /// Predictive mean of the local energy of `env` (up to a constant)
    pub fn predict_local_energy(&self, env: &AtomicEnvironment) -> Result<f64> {
        let inner = self.factors()?;
        let k_v = self.energy_kernel_vector(env);
        Ok(k_v.dot(&inner.alpha))
    }

    /// Predictive mean and variance of the local energy of `env`. The
    /// variance uses the triangular factor directly, which is cheaper and
    /// better conditioned than going through the explicit inverse.
    pub fn predict_local_energy_var(&self, env: &AtomicEnvironment) -> Result<(f64, f64)> {
        let inner = self.factors()?;
        let k_v = self.energy_kernel_vector(env);
        let mean = k_v.dot(&inner.alpha);

        let rhs = k_v.view().insert_axis(Axis(1)).to_owned();
        let v = inner.k_chol.solve_triangular(&rhs, UPLO::Lower)?;
        let kernel_hyps = self.kernel_hyps();
        let self_kern = self.kernel.energy_energy(
            env,
            env,
            &kernel_hyps,
            &self.cutoffs,
            quadratic_cutoff,
            self.mask.as_ref(),
        );
        let variance = self_kern - v.iter().map(|x| x * x).sum::<f64>();
        Ok((mean, variance))
    }

    /// Serialize the whole model to `path`; the format follows the file
    /// extension (`.json`, `.bin`/`.dat`)
    pub fn save(&self, path: &str) -> Result<()> {
        let bytes = match GpFileFormat::from_path(path)? {
            GpFileFormat::Json => serde_json::to_vec(self)?,
            GpFileFormat::Binary => bincode::serialize(self)?,
        };
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a model saved by [`save`](GaussianProcess::save). The kernel
    /// family is re-resolved from its persisted name and cached factors are
    /// restored when present, so no recomputation is needed.
    pub fn load(path: &str) -> Result<GaussianProcess> {
        let data = fs::read(path)?;
        let model = match GpFileFormat::from_path(path)? {
            GpFileFormat::Json => serde_json::from_slice(&data)?,
            GpFileFormat::Binary => bincode::deserialize(&data)?,
        };
        Ok(model)
    }
}

impl fmt::Display for GaussianProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "GaussianProcess model")?;
        writeln!(f, "Kernel: {}", self.kernel)?;
        writeln!(f, "Training points: {}", self.training_data.len())?;
        writeln!(f, "Cutoffs: {}", self.cutoffs)?;
        if let Some(like) = self.likelihood {
            writeln!(f, "Likelihood: {like}")?;
        }
        match &self.hyp_labels {
            Some(labels) => {
                for (label, hyp) in labels.iter().zip(self.hyps.iter()) {
                    writeln!(f, "{label}: {hyp}")?;
                }
            }
            None => writeln!(f, "Hyperparameters: {}", self.hyps)?,
        }
        if let Some(mask) = &self.mask {
            writeln!(
                f,
                "Mask: nspec={}, nbond={}, ntriplet={}",
                mask.nspec, mask.nbond, mask.ntriplet
            )?;
        }
        Ok(())
    }
}

/// Row-major flattening of per-atom force vectors
pub fn flatten_forces(forces: &[[f64; 3]]) -> Array1<f64> {
    Array1::from_iter(forces.iter().flat_map(|force| force.iter().copied()))
}

fn check_component(component: usize) -> Result<()> {
    if (1..=3).contains(&component) {
        Ok(())
    } else {
        Err(GpError::InvalidValueError(format!(
            "force component must be 1, 2 or 3, got {component}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample_structure() -> (Structure, Array2<f64>) {
        let structure = Structure::new(
            Array2::eye(3) * 10.0,
            vec![0, 1, 0],
            array![[0.0, 0.0, 0.0], [1.4, 0.3, 0.0], [0.2, 1.7, 0.4]],
        );
        let forces = array![[0.3, -0.1, 0.2], [-0.2, 0.4, 0.1], [0.1, 0.0, -0.3]];
        (structure, forces)
    }

    fn fitted_model() -> GaussianProcess {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        gp.compute_factors().unwrap();
        gp
    }

    #[test]
    fn invalid_mask_fails_at_construction() {
        let mask = HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 1,
            bond_mask: vec![0, 0, 0, 1],
            ntriplet: 0,
            triplet_mask: vec![],
            original: None,
            map: None,
            bounds: None,
        };
        let err = GaussianProcess::params(
            Kernels::TwoBodyMc,
            array![1.0, 0.5, 1e-3],
            array![3.0],
        )
        .mask(mask)
        .check()
        .unwrap_err();
        assert!(matches!(err, GpError::ConfigError(_)));
    }

    #[test]
    fn mask_needs_multicomponent_kernel() {
        let mask = HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 1,
            bond_mask: vec![0; 4],
            ntriplet: 0,
            triplet_mask: vec![],
            original: None,
            map: None,
            bounds: None,
        };
        let err = GaussianProcess::params(Kernels::TwoBody, array![1.0, 0.5, 1e-3], array![3.0])
            .mask(mask)
            .check()
            .unwrap_err();
        assert!(err.to_string().contains("multi-component"));
    }

    #[test]
    fn factors_are_consistent_after_rebuild() {
        let gp = fitted_model();
        let inner = gp.inner.as_ref().unwrap();
        assert_eq!(inner.alpha.len(), 3 * gp.training_data.len());
        let identity = inner.k_inv.dot(&inner.k_mat);
        assert_abs_diff_eq!(identity, Array2::eye(9), epsilon = 1e-8);
        assert_abs_diff_eq!(
            inner.k_chol.dot(&inner.k_chol.t()),
            inner.k_mat,
            epsilon = 1e-10
        );
        assert!(gp.likelihood.unwrap().is_finite());
        assert_eq!(gp.likelihood_gradient.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn predict_before_rebuild_fails() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-2],
            array![3.0],
        )
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        let env = gp.training_data[0].clone();
        let err = gp.predict(&env, 1).unwrap_err();
        assert!(matches!(err, GpError::StaleFactorsError(_)));
    }

    #[test]
    fn predict_with_stale_factors_fails() {
        let mut gp = fitted_model();
        let env = gp.training_data[0].clone();
        gp.add_environment(env.clone(), [0.0, 0.1, 0.0], false).unwrap();
        let err = gp.predict(&env, 2).unwrap_err();
        assert!(matches!(err, GpError::StaleFactorsError(_)));
        gp.check_factors().unwrap();
        assert!(gp.predict(&env, 2).is_ok());
    }

    #[test]
    fn predict_component_is_validated() {
        let gp = fitted_model();
        let env = gp.training_data[0].clone();
        assert!(matches!(
            gp.predict(&env, 0).unwrap_err(),
            GpError::InvalidValueError(_)
        ));
        assert!(matches!(
            gp.predict(&env, 4).unwrap_err(),
            GpError::InvalidValueError(_)
        ));
    }

    #[test]
    fn model_reproduces_labels_drawn_from_the_prior() {
        // labels in the kernel's span: y = G w, so the posterior mean at a
        // training point deviates from the label only by O(noise^2)
        let (structure, _) = sample_structure();
        let cutoffs = array![3.0];
        let hyps = array![1.0, 0.8, 1e-3];
        let envs: Vec<AtomicEnvironment> = (0..structure.len())
            .map(|i| AtomicEnvironment::new(&structure, i, &cutoffs))
            .collect();
        let gram = covariance::build_gram(
            &array![1.0, 0.8, 0.0],
            &envs,
            &Kernels::TwoBody,
            &cutoffs,
            None,
            false,
            None,
        )
        .unwrap();
        let y = gram.dot(&Array1::ones(gram.nrows()));

        let mut gp = GaussianProcess::params(Kernels::TwoBody, hyps, cutoffs)
            .check()
            .unwrap();
        for (i, env) in envs.iter().enumerate() {
            gp.add_environment(env.clone(), [y[3 * i], y[3 * i + 1], y[3 * i + 2]], false)
                .unwrap();
        }
        gp.compute_factors().unwrap();
        for (i, env) in envs.iter().enumerate() {
            for d in 1..=3 {
                let (mean, variance) = gp.predict(env, d).unwrap();
                assert_abs_diff_eq!(mean, y[3 * i + d - 1], epsilon = 1e-2);
                assert!(variance > -1e-8);
            }
        }
    }

    #[test]
    fn variance_shrinks_as_duplicates_are_added() {
        let mut gp = fitted_model();
        let env = gp.training_data[0].clone();
        let label = gp.training_labels[0];
        let (_, var_before) = gp.predict(&env, 1).unwrap();
        gp.add_environment(env.clone(), label, false).unwrap();
        gp.compute_factors().unwrap();
        let (_, var_after) = gp.predict(&env, 1).unwrap();
        assert!(var_after < var_before + 1e-12);
    }

    #[test]
    fn incremental_update_matches_full_rebuild() {
        let mut gp = fitted_model();
        let extra = gp.training_data[1].clone();
        gp.add_environment(extra, [0.05, -0.2, 0.15], false).unwrap();

        let mut incremental = gp.clone();
        incremental.update_factors().unwrap();
        gp.compute_factors().unwrap();

        let k_inc = &incremental.inner.as_ref().unwrap().k_mat;
        let k_full = &gp.inner.as_ref().unwrap().k_mat;
        assert_abs_diff_eq!(k_inc, k_full, epsilon = 1e-10);
        assert_abs_diff_eq!(
            &incremental.inner.as_ref().unwrap().alpha,
            &gp.inner.as_ref().unwrap().alpha,
            epsilon = 1e-8
        );
    }

    #[test]
    fn incremental_update_leaves_likelihood_stale() {
        let mut gp = fitted_model();
        let like_before = gp.likelihood.unwrap();
        let env = gp.training_data[0].clone();
        gp.add_environment(env, [0.2, 0.0, -0.1], false).unwrap();
        gp.update_factors().unwrap();
        assert_eq!(gp.likelihood.unwrap(), like_before);
        assert_eq!(
            gp.inner.as_ref().unwrap().alpha.len(),
            3 * gp.training_data.len()
        );
    }

    #[test]
    fn update_factors_without_prior_fit_rebuilds() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        gp.update_factors().unwrap();
        assert!(gp.inner.is_some());
        assert!(gp.likelihood.is_some());
    }

    #[test]
    fn custom_range_selects_atoms() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-2],
            array![3.0],
        )
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, Some(&[1]));
        assert_eq!(gp.training_data.len(), 1);
        assert_eq!(gp.label_vector, array![-0.2, 0.4, 0.1]);
    }

    #[test]
    fn flattening_is_row_major() {
        let flat = flatten_forces(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(flat, array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn training_with_simplex_completes() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .opt_algorithm(OptAlgorithm::NelderMead)
        .maxiter(30)
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        gp.train(&TrainOpts::default()).unwrap();
        assert!(gp.likelihood.unwrap().is_finite());
        assert_eq!(gp.opt_algorithm(), OptAlgorithm::NelderMead);
    }

    #[test]
    fn training_with_bounded_quasi_newton_completes() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .maxiter(15)
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        gp.train(&TrainOpts::default()).unwrap();
        assert!(gp.likelihood.unwrap().is_finite());
        assert!(gp.hyps.iter().all(|h| *h >= 1e-6));
    }

    #[test]
    fn custom_bounds_force_a_bounded_run() {
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .maxiter(15)
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        let opts = TrainOpts {
            custom_bounds: Some(vec![(0.5, 2.0), (0.5, 2.0), (0.05, 0.5)]),
            ..TrainOpts::default()
        };
        gp.train(&opts).unwrap();
        for (hyp, (lo, hi)) in gp.hyps.iter().zip(opts.custom_bounds.as_ref().unwrap()) {
            assert!(*hyp >= *lo - 1e-12 && *hyp <= *hi + 1e-12);
        }
    }

    #[test]
    fn numerical_failure_demotes_the_bounded_algorithm_permanently() {
        let (structure, forces) = sample_structure();
        // sig large enough to overflow the covariance to infinity
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1e200, 0.8, 1e-1],
            array![3.0],
        )
        .maxiter(10)
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        assert_eq!(gp.opt_algorithm(), OptAlgorithm::LbfgsBounded);

        let err = gp.train(&TrainOpts::default()).unwrap_err();
        assert!(matches!(err, GpError::LikelihoodComputationError(_)));
        assert_eq!(gp.opt_algorithm(), OptAlgorithm::Lbfgs);

        // the switch persists and the unconstrained method completes once the
        // hyperparameters are sane again
        gp.hyps = array![1.0, 0.8, 1e-1];
        gp.train(&TrainOpts::default()).unwrap();
        assert_eq!(gp.opt_algorithm(), OptAlgorithm::Lbfgs);
        assert!(gp.likelihood.unwrap().is_finite());
    }

    #[test]
    fn training_an_empty_model_fails() {
        let mut gp = GaussianProcess::params(
            Kernels::TwoBody,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .check()
        .unwrap();
        let err = gp.train(&TrainOpts::default()).unwrap_err();
        assert!(matches!(err, GpError::OptimizationError(_)));
    }

    #[test]
    fn pooled_kernel_vector_matches_serial() {
        let gp = fitted_model();
        let env = gp.training_data[0].clone();
        let serial = gp.kernel_vector(&env, 2);
        let pooled = gp.kernel_vector_par(&env, 2).unwrap();
        assert_abs_diff_eq!(serial, pooled, epsilon = 1e-12);
    }

    #[test]
    fn masked_model_fits_and_predicts() {
        let mask = HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 1,
            bond_mask: vec![0; 4],
            ntriplet: 0,
            triplet_mask: vec![],
            original: None,
            map: None,
            bounds: None,
        };
        let (structure, forces) = sample_structure();
        let mut gp = GaussianProcess::params(
            Kernels::TwoBodyMc,
            array![1.0, 0.8, 1e-1],
            array![3.0],
        )
        .mask(mask)
        .check()
        .unwrap();
        gp.add_structure(&structure, &forces, None);
        gp.compute_factors().unwrap();
        assert_eq!(gp.likelihood_gradient.as_ref().unwrap().len(), 3);
        let env = gp.training_data[0].clone();
        let (mean, variance) = gp.predict(&env, 1).unwrap();
        assert!(mean.is_finite());
        assert!(variance.is_finite());
    }

    #[test]
    fn local_energy_prediction_has_uncertainty() {
        let gp = fitted_model();
        let env = gp.training_data[0].clone();
        let mean = gp.predict_local_energy(&env).unwrap();
        let (mean2, variance) = gp.predict_local_energy_var(&env).unwrap();
        assert_abs_diff_eq!(mean, mean2, epsilon = 1e-12);
        assert!(variance.is_finite());
    }

    #[test]
    fn json_round_trip_preserves_the_model() {
        let gp = fitted_model();
        let path = std::env::temp_dir().join("forcegp_roundtrip.json");
        let path = path.to_str().unwrap();
        gp.save(path).unwrap();
        let loaded = GaussianProcess::load(path).unwrap();
        assert_eq!(loaded.kernel(), gp.kernel());
        assert_eq!(loaded.hyps, gp.hyps);
        assert_eq!(loaded.label_vector, gp.label_vector);
        assert_eq!(loaded.training_data, gp.training_data);
        assert_abs_diff_eq!(
            &loaded.inner.as_ref().unwrap().alpha,
            &gp.inner.as_ref().unwrap().alpha,
            epsilon = 1e-12
        );
        let env = gp.training_data[1].clone();
        assert_eq!(
            loaded.predict(&env, 2).unwrap(),
            gp.predict(&env, 2).unwrap()
        );
    }

    #[test]
    fn binary_round_trip_preserves_the_model() {
        let gp = fitted_model();
        let path = std::env::temp_dir().join("forcegp_roundtrip.bin");
        let path = path.to_str().unwrap();
        gp.save(path).unwrap();
        let loaded = GaussianProcess::load(path).unwrap();
        assert_eq!(loaded.hyps, gp.hyps);
        assert_abs_diff_eq!(
            &loaded.inner.as_ref().unwrap().k_mat,
            &gp.inner.as_ref().unwrap().k_mat,
            epsilon = 1e-12
        );
    }

    #[test]
    fn unknown_format_is_rejected() {
        let gp = fitted_model();
        let err = gp.save("model.yaml").unwrap_err();
        assert!(matches!(err, GpError::UnsupportedFormatError(_)));
        assert!(err.to_string().contains("json"));
    }

    #[test]
    fn display_summarizes_the_model() {
        let gp = fitted_model();
        let text = gp.to_string();
        assert!(text.contains("two_body"));
        assert!(text.contains("Training points: 3"));
    }
}
