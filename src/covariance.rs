//! Covariance-matrix assembly and marginal-likelihood evaluation.
//!
//! Every training environment contributes three consecutive rows/columns to
//! the covariance matrix, one per Cartesian force component. Builders come in
//! serial and pooled flavors, with and without a hyperparameter mask; the
//! pooled flavors spin up a dedicated worker pool, collect results in
//! submission order and drain the pool before returning. The masked flavors
//! expand a reduced hyperparameter vector through the mask's `map`/`original`
//! indirection before kernel evaluation and select the mapped gradient slices
//! afterwards.

use crate::environment::{quadratic_cutoff, AtomicEnvironment};
use crate::errors::{GpError, Result};
use crate::kernels::Kernels;
use crate::mask::HypsMask;

use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array1, Array2, Array3, Axis};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Covariance matrix and per-hyperparameter gradient stack, serial
pub fn build_covariance(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
) -> Result<(Array3<f64>, Array2<f64>)> {
    assemble(hyps, training_data, kernel, cutoffs, None, None)
}

/// Covariance matrix and gradient stack, evaluated on a worker pool
pub fn build_covariance_par(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    no_cpus: Option<usize>,
) -> Result<(Array3<f64>, Array2<f64>)> {
    assemble(hyps, training_data, kernel, cutoffs, None, Some(no_cpus))
}

/// Mask-aware covariance and gradient stack, serial.
/// The gradient stack rows follow the optimized hyperparameter subset.
pub fn build_covariance_masked(
    hyps: &Array1<f64>,
    mask: &HypsMask,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
) -> Result<(Array3<f64>, Array2<f64>)> {
    let full = mask.expand(hyps);
    let (grads, k_mat) = assemble(&full, training_data, kernel, cutoffs, Some(mask), None)?;
    Ok((grads.select(Axis(0), &mask.opt_indices(full.len())), k_mat))
}

/// Mask-aware covariance and gradient stack, evaluated on a worker pool
pub fn build_covariance_masked_par(
    hyps: &Array1<f64>,
    mask: &HypsMask,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    no_cpus: Option<usize>,
) -> Result<(Array3<f64>, Array2<f64>)> {
    let full = mask.expand(hyps);
    let (grads, k_mat) = assemble(
        &full,
        training_data,
        kernel,
        cutoffs,
        Some(mask),
        Some(no_cpus),
    )?;
    Ok((grads.select(Axis(0), &mask.opt_indices(full.len())), k_mat))
}

/// Covariance matrix alone, without the gradient stack
pub fn build_gram(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    mask: Option<&HypsMask>,
    par: bool,
    no_cpus: Option<usize>,
) -> Result<Array2<f64>> {
    let full = expand_hyps(hyps, kernel, mask);
    let (kernel_hyps, noise) = split_noise(&full, kernel, mask)?;
    let size = 3 * training_data.len();
    let cells = upper_triangle(size);
    let eval = |&(m, n): &(usize, usize)| {
        kernel.force_force(
            &training_data[m / 3],
            &training_data[n / 3],
            m % 3 + 1,
            n % 3 + 1,
            &kernel_hyps,
            cutoffs,
            quadratic_cutoff,
            mask,
        )
    };
    let values: Vec<f64> = if par {
        let pool = worker_pool(no_cpus)?;
        pool.install(|| cells.par_iter().map(eval).collect())
    } else {
        cells.iter().map(eval).collect()
    };
    let mut k_mat = Array2::zeros((size, size));
    for (&(m, n), v) in cells.iter().zip(values) {
        k_mat[[m, n]] = v;
        k_mat[[n, m]] = v;
    }
    for i in 0..size {
        k_mat[[i, i]] += noise * noise;
    }
    Ok(k_mat)
}

/// Extend a cached covariance matrix after the training set has grown,
/// evaluating kernels only between new entries and (existing plus new)
/// entries. The untouched upper-left block is copied verbatim.
#[allow(clippy::too_many_arguments)]
pub fn extend_covariance(
    prev_k_mat: &Array2<f64>,
    training_data: &[AtomicEnvironment],
    hyps: &Array1<f64>,
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    mask: Option<&HypsMask>,
    par: bool,
    no_cpus: Option<usize>,
) -> Result<Array2<f64>> {
    let full = expand_hyps(hyps, kernel, mask);
    let (kernel_hyps, noise) = split_noise(&full, kernel, mask)?;
    let old = prev_k_mat.nrows();
    let size = 3 * training_data.len();
    if old > size {
        return Err(GpError::InvalidValueError(format!(
            "cached covariance has dimension {old} but the training set holds only {size} force components"
        )));
    }
    let mut k_mat = Array2::zeros((size, size));
    k_mat.slice_mut(s![..old, ..old]).assign(prev_k_mat);

    let cells: Vec<(usize, usize)> = (old..size)
        .flat_map(|m| (0..=m).map(move |n| (m, n)))
        .collect();
    let eval = |&(m, n): &(usize, usize)| {
        kernel.force_force(
            &training_data[m / 3],
            &training_data[n / 3],
            m % 3 + 1,
            n % 3 + 1,
            &kernel_hyps,
            cutoffs,
            quadratic_cutoff,
            mask,
        )
    };
    let values: Vec<f64> = if par {
        let pool = worker_pool(no_cpus)?;
        pool.install(|| cells.par_iter().map(eval).collect())
    } else {
        cells.iter().map(eval).collect()
    };
    for (&(m, n), v) in cells.iter().zip(values) {
        k_mat[[m, n]] = v;
        k_mat[[n, m]] = v;
    }
    for i in old..size {
        k_mat[[i, i]] += noise * noise;
    }
    Ok(k_mat)
}

/// Log marginal likelihood and its gradient with respect to every
/// hyperparameter, from a covariance matrix and its gradient stack
pub fn likelihood_and_grads(
    k_mat: &Array2<f64>,
    hyp_grads: &Array3<f64>,
    labels: &Array1<f64>,
) -> Result<(f64, Array1<f64>)> {
    let (chol, logdet) = factorize(k_mat)?;
    let n = k_mat.nrows();
    let chol_inv = chol.solve_triangular(&Array2::eye(n), UPLO::Lower)?;
    let k_inv = chol_inv.t().dot(&chol_inv);
    let alpha = k_inv.dot(labels);

    let like = -0.5 * labels.dot(&alpha) - logdet - 0.5 * n as f64 * (2.0 * PI).ln();

    let n_hyps = hyp_grads.shape()[0];
    let mut grad = Array1::zeros(n_hyps);
    for h in 0..n_hyps {
        let dk = hyp_grads.index_axis(Axis(0), h);
        let quad = alpha.dot(&dk.dot(&alpha));
        let trace: f64 = k_inv.iter().zip(dk.iter()).map(|(a, b)| a * b).sum();
        grad[h] = 0.5 * (quad - trace);
    }
    Ok((like, grad))
}

/// Log marginal likelihood alone, via one triangular solve
pub fn likelihood(k_mat: &Array2<f64>, labels: &Array1<f64>) -> Result<f64> {
    let (chol, logdet) = factorize(k_mat)?;
    let rhs = labels.view().insert_axis(Axis(1)).to_owned();
    let z = chol.solve_triangular(&rhs, UPLO::Lower)?;
    let quad: f64 = z.iter().map(|v| v * v).sum();
    Ok(-0.5 * quad - logdet - 0.5 * k_mat.nrows() as f64 * (2.0 * PI).ln())
}

/// Negative log likelihood and gradient at trial hyperparameters; the
/// gradient-based optimizer objective
#[allow(clippy::too_many_arguments)]
pub fn neg_likelihood_and_grads(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    labels: &Array1<f64>,
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    mask: Option<&HypsMask>,
    par: bool,
    no_cpus: Option<usize>,
) -> Result<(f64, Array1<f64>)> {
    let (hyp_grads, k_mat) = match (mask, par) {
        (Some(m), true) => build_covariance_masked_par(hyps, m, training_data, kernel, cutoffs, no_cpus)?,
        (Some(m), false) => build_covariance_masked(hyps, m, training_data, kernel, cutoffs)?,
        (None, true) => build_covariance_par(hyps, training_data, kernel, cutoffs, no_cpus)?,
        (None, false) => build_covariance(hyps, training_data, kernel, cutoffs)?,
    };
    let (like, grad) = likelihood_and_grads(&k_mat, &hyp_grads, labels)?;
    Ok((-like, grad.mapv(|v| -v)))
}

/// Negative log likelihood at trial hyperparameters; the simplex objective
#[allow(clippy::too_many_arguments)]
pub fn neg_likelihood(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    labels: &Array1<f64>,
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    mask: Option<&HypsMask>,
    par: bool,
    no_cpus: Option<usize>,
) -> Result<f64> {
    let k_mat = build_gram(hyps, training_data, kernel, cutoffs, mask, par, no_cpus)?;
    Ok(-likelihood(&k_mat, labels)?)
}

fn assemble(
    hyps: &Array1<f64>,
    training_data: &[AtomicEnvironment],
    kernel: &Kernels,
    cutoffs: &Array1<f64>,
    mask: Option<&HypsMask>,
    pooled: Option<Option<usize>>,
) -> Result<(Array3<f64>, Array2<f64>)> {
    let n_hyps = hyps.len();
    let (kernel_hyps, noise) = split_noise(hyps, kernel, mask)?;
    let size = 3 * training_data.len();
    let cells = upper_triangle(size);
    let eval = |&(m, n): &(usize, usize)| {
        kernel.force_force_grad(
            &training_data[m / 3],
            &training_data[n / 3],
            m % 3 + 1,
            n % 3 + 1,
            &kernel_hyps,
            cutoffs,
            quadratic_cutoff,
            mask,
        )
    };
    let values: Vec<(f64, Array1<f64>)> = match pooled {
        Some(no_cpus) => {
            let pool = worker_pool(no_cpus)?;
            pool.install(|| cells.par_iter().map(eval).collect())
        }
        None => cells.iter().map(eval).collect(),
    };

    let mut k_mat = Array2::zeros((size, size));
    let mut hyp_grads = Array3::zeros((n_hyps, size, size));
    for (&(m, n), (v, g)) in cells.iter().zip(values) {
        k_mat[[m, n]] = v;
        k_mat[[n, m]] = v;
        for (h, &gh) in g.iter().enumerate() {
            hyp_grads[[h, m, n]] = gh;
            hyp_grads[[h, n, m]] = gh;
        }
    }
    for i in 0..size {
        k_mat[[i, i]] += noise * noise;
        hyp_grads[[n_hyps - 1, i, i]] = 2.0 * noise;
    }
    Ok((hyp_grads, k_mat))
}

/// Split a full hyperparameter vector into kernel hyperparameters and the
/// trailing noise, checking the length the kernel family expects
fn split_noise(
    hyps: &Array1<f64>,
    kernel: &Kernels,
    mask: Option<&HypsMask>,
) -> Result<(Vec<f64>, f64)> {
    let expected = kernel.n_kernel_hyps(mask) + 1;
    if hyps.len() != expected {
        return Err(GpError::InvalidValueError(format!(
            "kernel {kernel} expects {expected} hyperparameters (noise included), got {}",
            hyps.len()
        )));
    }
    let kernel_hyps = hyps.slice(s![..hyps.len() - 1]).to_vec();
    Ok((kernel_hyps, hyps[hyps.len() - 1]))
}

fn expand_hyps(hyps: &Array1<f64>, kernel: &Kernels, mask: Option<&HypsMask>) -> Array1<f64> {
    match mask {
        Some(m) if kernel.is_multicomponent() => m.expand(hyps),
        _ => hyps.to_owned(),
    }
}

fn upper_triangle(size: usize) -> Vec<(usize, usize)> {
    (0..size)
        .flat_map(|m| (m..size).map(move |n| (m, n)))
        .collect()
}

fn factorize(k_mat: &Array2<f64>) -> Result<(Array2<f64>, f64)> {
    if k_mat.iter().any(|v| !v.is_finite()) {
        return Err(GpError::LikelihoodComputationError(
            "covariance matrix contains non-finite entries".to_string(),
        ));
    }
    let chol = k_mat.cholesky()?;
    let logdet = chol.diag().mapv(f64::ln).sum();
    Ok((chol, logdet))
}

pub(crate) fn worker_pool(no_cpus: Option<usize>) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(no_cpus.unwrap_or(0))
        .build()
        .map_err(|e| GpError::ThreadPoolError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    fn env(c: usize, bonds: &[(f64, [f64; 3], usize)]) -> AtomicEnvironment {
        AtomicEnvironment {
            ctype: c,
            bond_rs: bonds.iter().map(|b| b.0).collect(),
            bond_dirs: bonds.iter().map(|b| b.1).collect(),
            etypes: bonds.iter().map(|b| b.2).collect(),
        }
    }

    fn training_set() -> Vec<AtomicEnvironment> {
        vec![
            env(0, &[(1.2, [1.0, 0.0, 0.0], 0), (1.8, [0.0, 1.0, 0.0], 1)]),
            env(1, &[(1.4, [0.0, 0.0, 1.0], 0), (2.2, [0.6, 0.8, 0.0], 1)]),
            env(0, &[(1.6, [-0.8, 0.0, 0.6], 1)]),
        ]
    }

    fn labels(n: usize) -> Array1<f64> {
        Array1::linspace(-1.0, 1.0, 3 * n)
    }

    #[test]
    fn covariance_is_symmetric_and_factorizable() {
        let data = training_set();
        let hyps = array![1.1, 0.6, 1e-2];
        let (grads, k_mat) = build_covariance(&hyps, &data, &Kernels::TwoBody, &array![3.0]).unwrap();
        assert_eq!(k_mat.dim(), (9, 9));
        assert_eq!(grads.shape(), &[3, 9, 9]);
        for m in 0..9 {
            for n in 0..9 {
                assert_abs_diff_eq!(k_mat[[m, n]], k_mat[[n, m]], epsilon = 1e-12);
            }
        }
        assert!(k_mat.cholesky().is_ok());
    }

    #[test]
    fn pooled_builder_matches_serial() {
        let data = training_set();
        let hyps = array![1.1, 0.6, 1e-2];
        let cutoffs = array![3.0];
        let (g_ser, k_ser) = build_covariance(&hyps, &data, &Kernels::TwoBody, &cutoffs).unwrap();
        let (g_par, k_par) =
            build_covariance_par(&hyps, &data, &Kernels::TwoBody, &cutoffs, Some(2)).unwrap();
        assert_abs_diff_eq!(k_ser, k_par, epsilon = 1e-12);
        assert_abs_diff_eq!(g_ser, g_par, epsilon = 1e-12);
    }

    #[test]
    fn one_group_mask_matches_unmasked_build() {
        let data = training_set();
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
        let uniform: Vec<AtomicEnvironment> = data
            .iter()
            .map(|e| AtomicEnvironment {
                ctype: 0,
                etypes: vec![0; e.n_bonds()],
                ..e.clone()
            })
            .collect();
        let hyps = array![1.1, 0.6, 1e-2];
        let cutoffs = array![3.0];
        let (g_masked, k_masked) =
            build_covariance_masked(&hyps, &mask, &uniform, &Kernels::TwoBodyMc, &cutoffs).unwrap();
        let (g_plain, k_plain) =
            build_covariance(&hyps, &uniform, &Kernels::TwoBodyMc, &cutoffs).unwrap();
        assert_abs_diff_eq!(k_masked, k_plain, epsilon = 1e-12);
        assert_abs_diff_eq!(g_masked, g_plain, epsilon = 1e-12);
    }

    #[test]
    fn extension_matches_full_rebuild() {
        let data = training_set();
        let hyps = array![1.1, 0.6, 1e-2];
        let cutoffs = array![3.0];
        let kernel = Kernels::TwoBody;
        let full = build_gram(&hyps, &data, &kernel, &cutoffs, None, false, None).unwrap();
        let partial = build_gram(&hyps, &data[..2], &kernel, &cutoffs, None, false, None).unwrap();
        let extended =
            extend_covariance(&partial, &data, &hyps, &kernel, &cutoffs, None, false, None).unwrap();
        assert_abs_diff_eq!(full, extended, epsilon = 1e-12);
    }

    #[test]
    fn pooled_extension_matches_serial() {
        let data = training_set();
        let hyps = array![1.1, 0.6, 1e-2];
        let cutoffs = array![3.0];
        let kernel = Kernels::TwoBody;
        let partial = build_gram(&hyps, &data[..1], &kernel, &cutoffs, None, false, None).unwrap();
        let ser =
            extend_covariance(&partial, &data, &hyps, &kernel, &cutoffs, None, false, None).unwrap();
        let par =
            extend_covariance(&partial, &data, &hyps, &kernel, &cutoffs, None, true, Some(2))
                .unwrap();
        assert_abs_diff_eq!(ser, par, epsilon = 1e-12);
    }

    #[test]
    fn likelihood_gradient_matches_finite_differences() {
        let data = training_set();
        let y = labels(data.len());
        let cutoffs = array![3.0];
        let kernel = Kernels::TwoBody;
        let hyps = array![1.2, 0.7, 0.3];
        let (neg_like, grad) =
            neg_likelihood_and_grads(&hyps, &data, &y, &kernel, &cutoffs, None, false, None)
                .unwrap();
        assert!(neg_like.is_finite());
        let fd = hyps.central_diff(&|x: &Array1<f64>| {
            neg_likelihood(x, &data, &y, &kernel, &cutoffs, None, false, None).unwrap()
        });
        assert_abs_diff_eq!(grad, fd, epsilon = 1e-4);
    }

    #[test]
    fn non_finite_covariance_is_rejected() {
        let data = training_set();
        let y = labels(data.len());
        let hyps = array![1e200, 0.7, 0.3];
        let err = neg_likelihood_and_grads(
            &hyps,
            &data,
            &y,
            &Kernels::TwoBody,
            &array![3.0],
            None,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, GpError::LikelihoodComputationError(_)));
    }

    #[test]
    fn map_indirection_selects_gradient_rows() {
        let data = training_set();
        let mask = HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 1,
            bond_mask: vec![0; 4],
            ntriplet: 0,
            triplet_mask: vec![],
            original: Some(array![1.1, 0.6, 1e-2]),
            map: Some(vec![0, 2]),
            bounds: None,
        };
        let reduced = array![1.1, 1e-2];
        let (grads, k_mat) =
            build_covariance_masked(&reduced, &mask, &data, &Kernels::TwoBodyMc, &array![3.0])
                .unwrap();
        assert_eq!(grads.shape(), &[2, 9, 9]);
        let (full_grads, k_full) = build_covariance_masked(
            &array![1.1, 0.6, 1e-2],
            &HypsMask {
                original: None,
                map: None,
                ..mask.clone()
            },
            &data,
            &Kernels::TwoBodyMc,
            &array![3.0],
        )
        .unwrap();
        assert_abs_diff_eq!(k_mat, k_full, epsilon = 1e-12);
        assert_abs_diff_eq!(
            grads.index_axis(Axis(0), 0),
            full_grads.index_axis(Axis(0), 0),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            grads.index_axis(Axis(0), 1),
            full_grads.index_axis(Axis(0), 2),
            epsilon = 1e-12
        );
    }
}
