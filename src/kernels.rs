//! Covariance kernels over atomic environments.
//!
//! Kernels compare two local environments through sums over their bonds
//! (pairwise order) and bond pairs (triplet order), with a squared
//! exponential in the interatomic descriptors and a smooth cutoff damping.
//! Force components enter through the bond direction components, so a kernel
//! value is the covariance between two Cartesian force components (or a force
//! component and a local energy).
//!
//! The [`Kernels`] enum is a closed registry: a model persists the kernel by
//! name and resolves the behavior back from that name at load time.
//! Multi-component (`*_mc`) families restrict sums to matching species pairs
//! or triplets and, when a [`HypsMask`] is active, read per-group
//! signal/length hyperparameters through it.

use crate::environment::{AtomicEnvironment, CutoffFn};
use crate::errors::{GpError, Result};
use crate::mask::HypsMask;
use ndarray::{Array1, ArrayBase, Data, Ix1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of kernel families resolvable by name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kernels {
    /// Pairwise interactions, species-blind
    #[serde(rename = "two_body")]
    TwoBody,
    /// Triplet interactions, species-blind
    #[serde(rename = "three_body")]
    ThreeBody,
    /// Pairwise plus triplet interactions, species-blind
    #[serde(rename = "two_plus_three_body")]
    TwoPlusThreeBody,
    /// Pairwise interactions between matching species pairs
    #[serde(rename = "two_body_mc")]
    TwoBodyMc,
    /// Triplet interactions between matching species triplets
    #[serde(rename = "three_body_mc")]
    ThreeBodyMc,
    /// Pairwise plus triplet interactions, species-resolved
    #[serde(rename = "two_plus_three_body_mc")]
    TwoPlusThreeBodyMc,
}

impl Kernels {
    /// Resolve a kernel family from its persisted name
    pub fn from_name(name: &str) -> Result<Kernels> {
        match name {
            "two_body" => Ok(Kernels::TwoBody),
            "three_body" => Ok(Kernels::ThreeBody),
            "two_plus_three_body" => Ok(Kernels::TwoPlusThreeBody),
            "two_body_mc" => Ok(Kernels::TwoBodyMc),
            "three_body_mc" => Ok(Kernels::ThreeBodyMc),
            "two_plus_three_body_mc" => Ok(Kernels::TwoPlusThreeBodyMc),
            _ => Err(GpError::InvalidValueError(format!(
                "unknown kernel name: {name}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kernels::TwoBody => "two_body",
            Kernels::ThreeBody => "three_body",
            Kernels::TwoPlusThreeBody => "two_plus_three_body",
            Kernels::TwoBodyMc => "two_body_mc",
            Kernels::ThreeBodyMc => "three_body_mc",
            Kernels::TwoPlusThreeBodyMc => "two_plus_three_body_mc",
        }
    }

    /// Whether the family resolves species (the `mc` families)
    pub fn is_multicomponent(&self) -> bool {
        matches!(
            self,
            Kernels::TwoBodyMc | Kernels::ThreeBodyMc | Kernels::TwoPlusThreeBodyMc
        )
    }

    fn has_two_body(&self) -> bool {
        !matches!(self, Kernels::ThreeBody | Kernels::ThreeBodyMc)
    }

    fn has_three_body(&self) -> bool {
        !matches!(self, Kernels::TwoBody | Kernels::TwoBodyMc)
    }

    /// Number of kernel hyperparameters (noise excluded) the family expects
    pub fn n_kernel_hyps(&self, mask: Option<&HypsMask>) -> usize {
        match (self.is_multicomponent(), mask) {
            (true, Some(m)) => 2 * (m.nbond + m.ntriplet),
            _ => {
                let mut n = 0;
                if self.has_two_body() {
                    n += 2;
                }
                if self.has_three_body() {
                    n += 2;
                }
                n
            }
        }
    }

    /// Covariance between force component `d1` of `a` and `d2` of `b`
    /// (components are 1-indexed Cartesian axes).
    /// Symmetric: `k(a, b, d1, d2) == k(b, a, d2, d1)`.
    #[allow(clippy::too_many_arguments)]
    pub fn force_force(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        d1: usize,
        d2: usize,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: Option<&HypsMask>,
    ) -> f64 {
        self.force_force_grad(a, b, d1, d2, hyps, cutoffs, cutoff_fn, mask)
            .0
    }

    /// Force/force covariance together with its gradient with respect to
    /// every kernel hyperparameter (layout per [`Kernels::n_kernel_hyps`])
    #[allow(clippy::too_many_arguments)]
    pub fn force_force_grad(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        d1: usize,
        d2: usize,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: Option<&HypsMask>,
    ) -> (f64, Array1<f64>) {
        match (self.is_multicomponent(), mask) {
            (true, Some(m)) => self.ff_grad_masked(a, b, d1, d2, hyps, cutoffs, cutoff_fn, m),
            _ => self.ff_grad_plain(a, b, d1, d2, hyps, cutoffs, cutoff_fn),
        }
    }

    /// Covariance between the local energies of `a` and `b`
    pub fn energy_energy(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: Option<&HypsMask>,
    ) -> f64 {
        self.weighted_sum(a, b, None, None, hyps, cutoffs, cutoff_fn, mask)
    }

    /// Covariance between force component `d` of `a` and the local energy of `b`
    #[allow(clippy::too_many_arguments)]
    pub fn force_energy(
        &self,
        a: &AtomicEnvironment,
        d: usize,
        b: &AtomicEnvironment,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: Option<&HypsMask>,
    ) -> f64 {
        self.weighted_sum(a, b, Some(d), None, hyps, cutoffs, cutoff_fn, mask)
    }

    #[allow(clippy::too_many_arguments)]
    fn ff_grad_plain(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        d1: usize,
        d2: usize,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
    ) -> (f64, Array1<f64>) {
        let mc = self.is_multicomponent();
        let mut grad = Array1::zeros(self.n_kernel_hyps(None));
        let mut k = 0.0;
        let mut off = 0;
        if self.has_two_body() {
            let (v, d_sig, d_ls) = two_body_ff(
                a,
                b,
                d1,
                d2,
                hyps[off],
                hyps[off + 1],
                cutoffs[0],
                cutoff_fn,
                mc,
            );
            k += v;
            grad[off] = d_sig;
            grad[off + 1] = d_ls;
            off += 2;
        }
        if self.has_three_body() {
            let (v, d_sig, d_ls) = three_body_ff(
                a,
                b,
                d1,
                d2,
                hyps[off],
                hyps[off + 1],
                three_body_cutoff(cutoffs),
                cutoff_fn,
                mc,
            );
            k += v;
            grad[off] = d_sig;
            grad[off + 1] = d_ls;
        }
        (k, grad)
    }

    #[allow(clippy::too_many_arguments)]
    fn ff_grad_masked(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        d1: usize,
        d2: usize,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: &HypsMask,
    ) -> (f64, Array1<f64>) {
        let mut grad = Array1::zeros(2 * (mask.nbond + mask.ntriplet));
        let mut k = 0.0;
        if self.has_two_body() && mask.nbond > 0 {
            let r_cut = cutoffs[0];
            for i in 0..a.n_bonds() {
                let wi = a.bond_dirs[i][d1 - 1];
                let fi = cutoff_fn(a.bond_rs[i], r_cut);
                if wi == 0.0 || fi == 0.0 {
                    continue;
                }
                let ga = mask.bond_group(a.ctype, a.etypes[i]);
                for j in 0..b.n_bonds() {
                    if mask.bond_group(b.ctype, b.etypes[j]) != ga {
                        continue;
                    }
                    let sig = hyps[mask.sig2_index(ga)];
                    let ls = hyps[mask.ls2_index(ga)];
                    let wj = b.bond_dirs[j][d2 - 1];
                    let fj = cutoff_fn(b.bond_rs[j], r_cut);
                    let dr = a.bond_rs[i] - b.bond_rs[j];
                    let e = (-dr * dr / (2.0 * ls * ls)).exp();
                    let c = wi * wj * fi * fj * e;
                    k += sig * sig * c;
                    grad[mask.sig2_index(ga)] += 2.0 * sig * c;
                    grad[mask.ls2_index(ga)] += sig * sig * c * dr * dr / (ls * ls * ls);
                }
            }
        }
        if self.has_three_body() && mask.ntriplet > 0 {
            let r_cut = three_body_cutoff(cutoffs);
            for i1 in 0..a.n_bonds() {
                for i2 in (i1 + 1)..a.n_bonds() {
                    let fa = cutoff_fn(a.bond_rs[i1], r_cut) * cutoff_fn(a.bond_rs[i2], r_cut);
                    if fa == 0.0 {
                        continue;
                    }
                    let ga = mask.triplet_group(a.ctype, a.etypes[i1], a.etypes[i2]);
                    let wa = a.bond_dirs[i1][d1 - 1] + a.bond_dirs[i2][d1 - 1];
                    let qa = triplet_descriptor(a, i1, i2);
                    for j1 in 0..b.n_bonds() {
                        for j2 in (j1 + 1)..b.n_bonds() {
                            if mask.triplet_group(b.ctype, b.etypes[j1], b.etypes[j2]) != ga {
                                continue;
                            }
                            let fb = cutoff_fn(b.bond_rs[j1], r_cut)
                                * cutoff_fn(b.bond_rs[j2], r_cut);
                            if fb == 0.0 {
                                continue;
                            }
                            let sig = hyps[mask.sig3_index(ga)];
                            let ls = hyps[mask.ls3_index(ga)];
                            let wb = b.bond_dirs[j1][d2 - 1] + b.bond_dirs[j2][d2 - 1];
                            let qb = triplet_descriptor(b, j1, j2);
                            let dq = sq_dist(&qa, &qb);
                            let e = (-dq / (2.0 * ls * ls)).exp();
                            let c = wa * wb * fa * fb * e;
                            k += sig * sig * c;
                            grad[mask.sig3_index(ga)] += 2.0 * sig * c;
                            grad[mask.ls3_index(ga)] += sig * sig * c * dq / (ls * ls * ls);
                        }
                    }
                }
            }
        }
        (k, grad)
    }

    /// Shared energy-kernel accumulator. `da`/`db` select a force component on
    /// either side (None = energy side, no direction weight).
    #[allow(clippy::too_many_arguments)]
    fn weighted_sum(
        &self,
        a: &AtomicEnvironment,
        b: &AtomicEnvironment,
        da: Option<usize>,
        db: Option<usize>,
        hyps: &[f64],
        cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        cutoff_fn: CutoffFn,
        mask: Option<&HypsMask>,
    ) -> f64 {
        let masked = self.is_multicomponent() && mask.is_some();
        let mc = self.is_multicomponent();
        let mut k = 0.0;
        let mut off = 0;
        if self.has_two_body() && (!masked || mask.is_some_and(|m| m.nbond > 0)) {
            let r_cut = cutoffs[0];
            for i in 0..a.n_bonds() {
                let wi = da.map_or(1.0, |d| a.bond_dirs[i][d - 1]);
                let fi = cutoff_fn(a.bond_rs[i], r_cut);
                if wi == 0.0 || fi == 0.0 {
                    continue;
                }
                for j in 0..b.n_bonds() {
                    let (sig, ls) = if masked {
                        let m = mask.expect("masked dispatch");
                        let ga = m.bond_group(a.ctype, a.etypes[i]);
                        if m.bond_group(b.ctype, b.etypes[j]) != ga {
                            continue;
                        }
                        (hyps[m.sig2_index(ga)], hyps[m.ls2_index(ga)])
                    } else {
                        if mc && !same_pair(a.ctype, a.etypes[i], b.ctype, b.etypes[j]) {
                            continue;
                        }
                        (hyps[0], hyps[1])
                    };
                    let wj = db.map_or(1.0, |d| b.bond_dirs[j][d - 1]);
                    let fj = cutoff_fn(b.bond_rs[j], r_cut);
                    let dr = a.bond_rs[i] - b.bond_rs[j];
                    let e = (-dr * dr / (2.0 * ls * ls)).exp();
                    k += sig * sig * wi * wj * fi * fj * e;
                }
            }
            off += 2;
        }
        if self.has_three_body() && (!masked || mask.is_some_and(|m| m.ntriplet > 0)) {
            let r_cut = three_body_cutoff(cutoffs);
            for i1 in 0..a.n_bonds() {
                for i2 in (i1 + 1)..a.n_bonds() {
                    let fa = cutoff_fn(a.bond_rs[i1], r_cut) * cutoff_fn(a.bond_rs[i2], r_cut);
                    if fa == 0.0 {
                        continue;
                    }
                    let wa =
                        da.map_or(1.0, |d| a.bond_dirs[i1][d - 1] + a.bond_dirs[i2][d - 1]);
                    let qa = triplet_descriptor(a, i1, i2);
                    for j1 in 0..b.n_bonds() {
                        for j2 in (j1 + 1)..b.n_bonds() {
                            let (sig, ls) = if masked {
                                let m = mask.expect("masked dispatch");
                                let ga = m.triplet_group(a.ctype, a.etypes[i1], a.etypes[i2]);
                                if m.triplet_group(b.ctype, b.etypes[j1], b.etypes[j2]) != ga {
                                    continue;
                                }
                                (hyps[m.sig3_index(ga)], hyps[m.ls3_index(ga)])
                            } else {
                                if mc
                                    && !same_triplet(
                                        a.ctype,
                                        a.etypes[i1],
                                        a.etypes[i2],
                                        b.ctype,
                                        b.etypes[j1],
                                        b.etypes[j2],
                                    )
                                {
                                    continue;
                                }
                                (hyps[off], hyps[off + 1])
                            };
                            let fb = cutoff_fn(b.bond_rs[j1], r_cut)
                                * cutoff_fn(b.bond_rs[j2], r_cut);
                            if fb == 0.0 {
                                continue;
                            }
                            let wb = db
                                .map_or(1.0, |d| b.bond_dirs[j1][d - 1] + b.bond_dirs[j2][d - 1]);
                            let qb = triplet_descriptor(b, j1, j2);
                            let e = (-sq_dist(&qa, &qb) / (2.0 * ls * ls)).exp();
                            k += sig * sig * wa * wb * fa * fb * e;
                        }
                    }
                }
            }
        }
        k
    }
}

impl FromStr for Kernels {
    type Err = GpError;

    fn from_str(s: &str) -> Result<Self> {
        Kernels::from_name(s)
    }
}

impl fmt::Display for Kernels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Triplet cutoff is the second entry when given, the pairwise one otherwise
fn three_body_cutoff(cutoffs: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> f64 {
    if cutoffs.len() > 1 {
        cutoffs[1]
    } else {
        cutoffs[0]
    }
}

fn same_pair(c1: usize, e1: usize, c2: usize, e2: usize) -> bool {
    (c1 == c2 && e1 == e2) || (c1 == e2 && e1 == c2)
}

fn same_triplet(c1: usize, e11: usize, e12: usize, c2: usize, e21: usize, e22: usize) -> bool {
    c1 == c2 && ((e11 == e21 && e12 == e22) || (e11 == e22 && e12 == e21))
}

/// Symmetric descriptor of a bond pair: total length, length product, angle cosine
fn triplet_descriptor(env: &AtomicEnvironment, i1: usize, i2: usize) -> [f64; 3] {
    let cos = env.bond_dirs[i1][0] * env.bond_dirs[i2][0]
        + env.bond_dirs[i1][1] * env.bond_dirs[i2][1]
        + env.bond_dirs[i1][2] * env.bond_dirs[i2][2];
    [
        env.bond_rs[i1] + env.bond_rs[i2],
        env.bond_rs[i1] * env.bond_rs[i2],
        cos,
    ]
}

fn sq_dist(qa: &[f64; 3], qb: &[f64; 3]) -> f64 {
    let d0 = qa[0] - qb[0];
    let d1 = qa[1] - qb[1];
    let d2 = qa[2] - qb[2];
    d0 * d0 + d1 * d1 + d2 * d2
}

#[allow(clippy::too_many_arguments)]
fn two_body_ff(
    a: &AtomicEnvironment,
    b: &AtomicEnvironment,
    d1: usize,
    d2: usize,
    sig: f64,
    ls: f64,
    r_cut: f64,
    cutoff_fn: CutoffFn,
    mc: bool,
) -> (f64, f64, f64) {
    let mut s = 0.0;
    let mut s_ls = 0.0;
    for i in 0..a.n_bonds() {
        let wi = a.bond_dirs[i][d1 - 1];
        let fi = cutoff_fn(a.bond_rs[i], r_cut);
        if wi == 0.0 || fi == 0.0 {
            continue;
        }
        for j in 0..b.n_bonds() {
            if mc && !same_pair(a.ctype, a.etypes[i], b.ctype, b.etypes[j]) {
                continue;
            }
            let wj = b.bond_dirs[j][d2 - 1];
            let fj = cutoff_fn(b.bond_rs[j], r_cut);
            let dr = a.bond_rs[i] - b.bond_rs[j];
            let e = (-dr * dr / (2.0 * ls * ls)).exp();
            let c = wi * wj * fi * fj * e;
            s += c;
            s_ls += c * dr * dr / (ls * ls * ls);
        }
    }
    (sig * sig * s, 2.0 * sig * s, sig * sig * s_ls)
}

#[allow(clippy::too_many_arguments)]
fn three_body_ff(
    a: &AtomicEnvironment,
    b: &AtomicEnvironment,
    d1: usize,
    d2: usize,
    sig: f64,
    ls: f64,
    r_cut: f64,
    cutoff_fn: CutoffFn,
    mc: bool,
) -> (f64, f64, f64) {
    let mut s = 0.0;
    let mut s_ls = 0.0;
    for i1 in 0..a.n_bonds() {
        for i2 in (i1 + 1)..a.n_bonds() {
            let fa = cutoff_fn(a.bond_rs[i1], r_cut) * cutoff_fn(a.bond_rs[i2], r_cut);
            if fa == 0.0 {
                continue;
            }
            let wa = a.bond_dirs[i1][d1 - 1] + a.bond_dirs[i2][d1 - 1];
            let qa = triplet_descriptor(a, i1, i2);
            for j1 in 0..b.n_bonds() {
                for j2 in (j1 + 1)..b.n_bonds() {
                    if mc
                        && !same_triplet(
                            a.ctype,
                            a.etypes[i1],
                            a.etypes[i2],
                            b.ctype,
                            b.etypes[j1],
                            b.etypes[j2],
                        )
                    {
                        continue;
                    }
                    let fb = cutoff_fn(b.bond_rs[j1], r_cut) * cutoff_fn(b.bond_rs[j2], r_cut);
                    if fb == 0.0 {
                        continue;
                    }
                    let wb = b.bond_dirs[j1][d2 - 1] + b.bond_dirs[j2][d2 - 1];
                    let qb = triplet_descriptor(b, j1, j2);
                    let dq = sq_dist(&qa, &qb);
                    let e = (-dq / (2.0 * ls * ls)).exp();
                    let c = wa * wb * fa * fb * e;
                    s += c;
                    s_ls += c * dq / (ls * ls * ls);
                }
            }
        }
    }
    (sig * sig * s, 2.0 * sig * s, sig * sig * s_ls)
}
