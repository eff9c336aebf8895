//! Atomic structures and local environments.
//!
//! A [`Structure`] is a periodic cell with species and positions; an
//! [`AtomicEnvironment`] is the immutable neighbor-list descriptor of one
//! atom's surroundings, the only view of the data the kernels ever see.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Cutoff function type: `(r, cutoff) -> damping value in [0, 1]`
pub type CutoffFn = fn(f64, f64) -> f64;

/// Quadratic damping, 1 at r = 0 and smoothly 0 at the cutoff
pub fn quadratic_cutoff(r: f64, cutoff: f64) -> f64 {
    if r < cutoff {
        let t = 1.0 - r / cutoff;
        t * t
    } else {
        0.0
    }
}

/// A periodic atomic configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Row lattice vectors, shape (3, 3)
    pub cell: Array2<f64>,
    /// Species code per atom
    pub species: Vec<usize>,
    /// Cartesian positions, shape (n_atoms, 3)
    pub positions: Array2<f64>,
}

impl Structure {
    pub fn new(cell: Array2<f64>, species: Vec<usize>, positions: Array2<f64>) -> Self {
        assert_eq!(cell.dim(), (3, 3), "cell must be a (3, 3) matrix");
        assert_eq!(
            species.len(),
            positions.nrows(),
            "one species code per atom is required"
        );
        Structure {
            cell,
            species,
            positions,
        }
    }

    /// Number of atoms
    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }
}

/// Local neighborhood of one atom: bond lengths, unit bond directions and
/// neighbor species within the largest cutoff.
///
/// The neighbor scan covers periodic images at offsets -1..=1 along each
/// lattice vector, so cutoffs must not exceed the cell extent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtomicEnvironment {
    /// Species code of the central atom
    pub ctype: usize,
    /// Distance to each neighbor
    pub bond_rs: Vec<f64>,
    /// Unit vector from the center to each neighbor
    pub bond_dirs: Vec<[f64; 3]>,
    /// Species code of each neighbor
    pub etypes: Vec<usize>,
}

impl AtomicEnvironment {
    /// Build the environment of `atom` in `structure`, keeping every neighbor
    /// within the largest of `cutoffs`
    pub fn new(structure: &Structure, atom: usize, cutoffs: &Array1<f64>) -> AtomicEnvironment {
        let r_max = cutoffs.iter().fold(0.0f64, |a, &b| a.max(b));
        let center = [
            structure.positions[[atom, 0]],
            structure.positions[[atom, 1]],
            structure.positions[[atom, 2]],
        ];

        let mut bond_rs = Vec::new();
        let mut bond_dirs = Vec::new();
        let mut etypes = Vec::new();
        for j in 0..structure.len() {
            for ia in -1i64..=1 {
                for ib in -1i64..=1 {
                    for ic in -1i64..=1 {
                        let mut delta = [0.0f64; 3];
                        for (x, d) in delta.iter_mut().enumerate() {
                            *d = structure.positions[[j, x]]
                                + ia as f64 * structure.cell[[0, x]]
                                + ib as f64 * structure.cell[[1, x]]
                                + ic as f64 * structure.cell[[2, x]]
                                - center[x];
                        }
                        let r = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2])
                            .sqrt();
                        if r > 1e-8 && r < r_max {
                            bond_rs.push(r);
                            bond_dirs.push([delta[0] / r, delta[1] / r, delta[2] / r]);
                            etypes.push(structure.species[j]);
                        }
                    }
                }
            }
        }

        AtomicEnvironment {
            ctype: structure.species[atom],
            bond_rs,
            bond_dirs,
            etypes,
        }
    }

    /// Number of bonds in the environment
    pub fn n_bonds(&self) -> usize {
        self.bond_rs.len()
    }
}
