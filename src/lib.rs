//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression over local atomic environments, for use as a machine-learned
//! interatomic force field in on-the-fly simulation workflows.
//!
//! A [`GaussianProcess`] model accumulates labeled environments
//! (force vectors from a reference calculation), tunes its kernel
//! hyperparameters by maximizing the marginal likelihood of the observed
//! forces, and predicts force components and local energies with
//! uncertainty at unseen environments. Covariance matrices can be rebuilt
//! from scratch after hyperparameters change, or extended incrementally in
//! O(N·dN) when new data arrives without re-optimizing.
//!
//! Kernels compare environments pairwise (bond lengths) and per triplet
//! (bond pairs with angles); species-resolved families support sharing
//! hyperparameters across bond and triplet classes through a [`HypsMask`].
//!
//! Models are built through [`GaussianProcess::params`] following the
//! builder-then-check pattern, and persist to JSON or binary files with the
//! kernel identified by name.
mod algorithm;
mod covariance;
pub mod environment;
mod errors;
pub mod kernels;
mod mask;
mod optimization;
mod parameters;

pub use algorithm::*;
pub use covariance::{
    build_covariance, build_covariance_masked, build_covariance_masked_par, build_covariance_par,
    build_gram, extend_covariance, likelihood, likelihood_and_grads, neg_likelihood,
    neg_likelihood_and_grads,
};
pub use errors::*;
pub use kernels::Kernels;
pub use mask::*;
pub use parameters::*;
