//! Facade over the nlopt backend for hyperparameter optimization.
//!
//! Three strategies are exposed: L-BFGS with box bounds, unconstrained
//! L-BFGS, and the derivative-free Nelder-Mead simplex. The objective
//! receives trial hyperparameters and an optional gradient slice to fill, so
//! gradient-based methods get value and gradient from one evaluation.

use log::debug;
use ndarray::{arr1, Array1};
use nlopt::{Algorithm, Nlopt, Target};

/// Stopping configuration forwarded to the backend
pub(crate) struct OptimizeSpec {
    /// Maximum number of objective evaluations
    pub maxeval: usize,
    /// Relative objective-decrease tolerance (quasi-Newton runs)
    pub ftol_rel: f64,
    /// Relative parameter tolerance (simplex convergence threshold)
    pub xtol_rel: f64,
}

/// Minimize `objfn` starting from `x0`. Returns the best parameters found and
/// the corresponding objective value (infinity when the backend reports a
/// non-finite optimum).
pub(crate) fn minimize<F>(
    objfn: F,
    x0: &Array1<f64>,
    bounds: Option<&[(f64, f64)]>,
    simplex: bool,
    spec: &OptimizeSpec,
) -> (Array1<f64>, f64)
where
    F: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
{
    let algo = if simplex {
        Algorithm::Neldermead
    } else {
        Algorithm::Lbfgs
    };
    let mut optimizer = Nlopt::new(algo, x0.len(), objfn, Target::Minimize, ());
    if let Some(bounds) = bounds {
        let lower: Vec<f64> = bounds.iter().map(|b| b.0).collect();
        optimizer.set_lower_bounds(&lower).unwrap();
        let upper: Vec<f64> = bounds.iter().map(|b| b.1).collect();
        optimizer.set_upper_bounds(&upper).unwrap();
    }
    optimizer.set_maxeval(spec.maxeval as u32).unwrap();
    optimizer.set_xtol_rel(spec.xtol_rel).unwrap();
    if !simplex {
        optimizer.set_ftol_rel(spec.ftol_rel).unwrap();
    }

    let mut x = x0.to_vec();
    let fval = match optimizer.optimize(&mut x) {
        Ok((_, fval)) => fval,
        Err((_, fval)) => fval,
    };
    let fval = if fval.is_nan() { f64::INFINITY } else { fval };
    debug!("hyperparameter optimization finished: f = {fval}");
    (arr1(&x), fval)
}
