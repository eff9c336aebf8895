use crate::errors::{GpError, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Grouping of kernel hyperparameters by species, bond type and triplet type.
///
/// A mask lets several species pairs (resp. triplets) share one
/// signal-variance/length-scale group, so the optimized hyperparameter vector
/// stays small even for chemically diverse systems. The expected layout of the
/// associated hyperparameter vector is
/// `[sig2_0.., ls2_0.., sig3_0.., ls3_0.., noise]` with one signal and one
/// length entry per declared bond group, then per triplet group, and a single
/// trailing noise entry, i.e. `2 * (nbond + ntriplet) + 1` entries in total.
///
/// When `map`/`original` are given, `original` holds the full vector in the
/// layout above and `map` selects the subset of its indices that is actually
/// optimized; the model then carries only the reduced vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HypsMask {
    /// Number of species groups
    pub nspec: usize,
    /// Species code -> species group, indexed by the species codes in use
    pub spec_mask: Vec<usize>,
    /// Number of bond (pairwise) hyperparameter groups
    #[serde(default)]
    pub nbond: usize,
    /// Species-group pair -> bond group, row-major `(nspec, nspec)`, symmetric
    #[serde(default)]
    pub bond_mask: Vec<usize>,
    /// Number of triplet hyperparameter groups
    #[serde(default)]
    pub ntriplet: usize,
    /// Species-group triple -> triplet group, row-major `(nspec, nspec, nspec)`
    #[serde(default)]
    pub triplet_mask: Vec<usize>,
    /// Full hyperparameter vector when only a subset is optimized
    #[serde(default)]
    pub original: Option<Array1<f64>>,
    /// Indices into `original` selecting the optimized subset
    #[serde(default)]
    pub map: Option<Vec<usize>>,
    /// Optimizer bounds overriding the default `(1e-6, +inf)` per hyperparameter
    #[serde(default)]
    pub bounds: Option<Vec<(f64, f64)>>,
}

impl HypsMask {
    /// Check the internal consistency of the mask against the hyperparameter
    /// vector the model will carry. Run once at model construction.
    pub fn validate(&self, hyps: &Array1<f64>) -> Result<()> {
        if self.nspec == 0 {
            return Err(GpError::ConfigError("nspec must be positive".to_string()));
        }
        if self.spec_mask.is_empty() {
            return Err(GpError::ConfigError(
                "spec_mask must map at least one species code".to_string(),
            ));
        }
        if let Some(&bad) = self.spec_mask.iter().find(|&&g| g >= self.nspec) {
            return Err(GpError::ConfigError(format!(
                "spec_mask entry {bad} references a species group >= nspec ({})",
                self.nspec
            )));
        }
        if self.nbond > 0 {
            let expected = self.nspec * self.nspec;
            if self.bond_mask.len() != expected {
                return Err(GpError::ConfigError(format!(
                    "bond_mask has length {} but nspec^2 = {expected}",
                    self.bond_mask.len()
                )));
            }
            if let Some(&bad) = self.bond_mask.iter().find(|&&g| g >= self.nbond) {
                return Err(GpError::ConfigError(format!(
                    "bond_mask entry {bad} references a bond group >= nbond ({})",
                    self.nbond
                )));
            }
        }
        if self.ntriplet > 0 {
            let expected = self.nspec * self.nspec * self.nspec;
            if self.triplet_mask.len() != expected {
                return Err(GpError::ConfigError(format!(
                    "triplet_mask has length {} but nspec^3 = {expected}",
                    self.triplet_mask.len()
                )));
            }
            if let Some(&bad) = self.triplet_mask.iter().find(|&&g| g >= self.ntriplet) {
                return Err(GpError::ConfigError(format!(
                    "triplet_mask entry {bad} references a triplet group >= ntriplet ({})",
                    self.ntriplet
                )));
            }
        }
        if self.nbond + self.ntriplet == 0 {
            return Err(GpError::ConfigError(
                "at least one of nbond/ntriplet must declare a hyperparameter group".to_string(),
            ));
        }
        let full_len = self.n_hyps();
        match (&self.map, &self.original) {
            (Some(map), Some(original)) => {
                if original.len() != full_len {
                    return Err(GpError::ConfigError(format!(
                        "original has length {} but the mask declares 2*(nbond+ntriplet)+1 = {full_len} hyperparameters",
                        original.len()
                    )));
                }
                if map.len() != hyps.len() {
                    return Err(GpError::ConfigError(format!(
                        "map has length {} but {} hyperparameters were given",
                        map.len(),
                        hyps.len()
                    )));
                }
                if let Some(&bad) = map.iter().find(|&&i| i >= original.len()) {
                    return Err(GpError::ConfigError(format!(
                        "map entry {bad} is out of range for original (length {})",
                        original.len()
                    )));
                }
            }
            (Some(_), None) => {
                return Err(GpError::ConfigError(
                    "map requires the original hyperparameter vector".to_string(),
                ));
            }
            _ => {
                if hyps.len() != full_len {
                    return Err(GpError::ConfigError(format!(
                        "{} hyperparameters were given but the mask declares 2*(nbond+ntriplet)+1 = {full_len}",
                        hyps.len()
                    )));
                }
            }
        }
        if let Some(bounds) = &self.bounds {
            if bounds.len() != hyps.len() {
                return Err(GpError::ConfigError(format!(
                    "bounds has length {} but {} hyperparameters were given",
                    bounds.len(),
                    hyps.len()
                )));
            }
        }
        Ok(())
    }

    /// Effective hyperparameter count declared by the mask, noise included
    pub fn n_hyps(&self) -> usize {
        2 * (self.nbond + self.ntriplet) + 1
    }

    /// Expand an optimized hyperparameter vector into the full layout,
    /// applying the `map`/`original` indirection when present
    pub fn expand(&self, hyps: &Array1<f64>) -> Array1<f64> {
        match (&self.map, &self.original) {
            (Some(map), Some(original)) => {
                let mut full = original.to_owned();
                for (i, &j) in map.iter().enumerate() {
                    full[j] = hyps[i];
                }
                full
            }
            _ => hyps.to_owned(),
        }
    }

    /// Indices of the full hyperparameter vector that are actually optimized
    pub fn opt_indices(&self, full_len: usize) -> Vec<usize> {
        match &self.map {
            Some(map) => map.clone(),
            None => (0..full_len).collect(),
        }
    }

    /// Bond group shared by the species pair `(s1, s2)`; order-insensitive as
    /// long as `bond_mask` is symmetric
    pub fn bond_group(&self, s1: usize, s2: usize) -> usize {
        let i = self.spec_mask[s1];
        let j = self.spec_mask[s2];
        self.bond_mask[i * self.nspec + j]
    }

    /// Triplet group of the center `c` with neighbor species `(s1, s2)`;
    /// the neighbor pair is canonicalized so the lookup is order-insensitive
    pub fn triplet_group(&self, c: usize, s1: usize, s2: usize) -> usize {
        let ic = self.spec_mask[c];
        let i1 = self.spec_mask[s1];
        let i2 = self.spec_mask[s2];
        let (lo, hi) = if i1 <= i2 { (i1, i2) } else { (i2, i1) };
        self.triplet_mask[(ic * self.nspec + lo) * self.nspec + hi]
    }

    /// Index of the signal-variance entry of bond group `g`
    pub(crate) fn sig2_index(&self, g: usize) -> usize {
        g
    }

    /// Index of the length-scale entry of bond group `g`
    pub(crate) fn ls2_index(&self, g: usize) -> usize {
        self.nbond + g
    }

    /// Index of the signal-variance entry of triplet group `g`
    pub(crate) fn sig3_index(&self, g: usize) -> usize {
        2 * self.nbond + g
    }

    /// Index of the length-scale entry of triplet group `g`
    pub(crate) fn ls3_index(&self, g: usize) -> usize {
        2 * self.nbond + self.ntriplet + g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn pair_mask() -> HypsMask {
        HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 1,
            bond_mask: vec![0, 0, 0, 0],
            ntriplet: 0,
            triplet_mask: vec![],
            original: None,
            map: None,
            bounds: None,
        }
    }

    #[test]
    fn single_bond_group_validates() {
        let mask = pair_mask();
        assert!(mask.validate(&array![1.0, 0.5, 1e-3]).is_ok());
    }

    #[test]
    fn bond_mask_entry_out_of_range() {
        let mut mask = pair_mask();
        mask.bond_mask = vec![0, 0, 0, 1];
        let err = mask.validate(&array![1.0, 0.5, 1e-3]).unwrap_err();
        assert!(matches!(err, GpError::ConfigError(_)));
        assert!(err.to_string().contains("bond_mask"));
    }

    #[test]
    fn bond_mask_wrong_length() {
        let mut mask = pair_mask();
        mask.bond_mask = vec![0, 0, 0];
        let err = mask.validate(&array![1.0, 0.5, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("nspec^2"));
    }

    #[test]
    fn triplet_mask_wrong_length() {
        let mut mask = pair_mask();
        mask.ntriplet = 1;
        mask.triplet_mask = vec![0; 4];
        let err = mask.validate(&array![1.0, 0.5, 1.0, 0.5, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("nspec^3"));
    }

    #[test]
    fn triplet_mask_entry_out_of_range() {
        let mut mask = pair_mask();
        mask.ntriplet = 1;
        mask.triplet_mask = vec![0, 0, 0, 0, 0, 0, 0, 2];
        let err = mask.validate(&array![1.0, 0.5, 1.0, 0.5, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("triplet_mask"));
    }

    #[test]
    fn no_active_interaction_order() {
        let mut mask = pair_mask();
        mask.nbond = 0;
        mask.bond_mask = vec![];
        let err = mask.validate(&array![1e-3]).unwrap_err();
        assert!(err.to_string().contains("nbond/ntriplet"));
    }

    #[test]
    fn hyps_length_mismatch() {
        let mask = pair_mask();
        let err = mask.validate(&array![1.0, 0.5, 1.0, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("2*(nbond+ntriplet)+1"));
    }

    #[test]
    fn map_requires_original() {
        let mut mask = pair_mask();
        mask.map = Some(vec![0, 2]);
        let err = mask.validate(&array![1.0, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("original"));
    }

    #[test]
    fn map_indirection_validates_and_expands() {
        let mut mask = pair_mask();
        mask.original = Some(array![1.0, 0.5, 1e-3]);
        mask.map = Some(vec![0, 2]);
        let hyps = array![2.0, 1e-2];
        assert!(mask.validate(&hyps).is_ok());
        assert_eq!(mask.expand(&hyps), array![2.0, 0.5, 1e-2]);
        assert_eq!(mask.opt_indices(3), vec![0, 2]);
    }

    #[test]
    fn map_length_mismatch() {
        let mut mask = pair_mask();
        mask.original = Some(array![1.0, 0.5, 1e-3]);
        mask.map = Some(vec![0]);
        let err = mask.validate(&array![1.0, 1e-3]).unwrap_err();
        assert!(err.to_string().contains("map"));
    }

    #[test]
    fn group_lookups() {
        let mask = HypsMask {
            nspec: 2,
            spec_mask: vec![0, 1],
            nbond: 2,
            bond_mask: vec![0, 1, 1, 0],
            ntriplet: 1,
            triplet_mask: vec![0; 8],
            original: None,
            map: None,
            bounds: None,
        };
        assert_eq!(mask.bond_group(0, 0), 0);
        assert_eq!(mask.bond_group(0, 1), 1);
        assert_eq!(mask.bond_group(1, 0), 1);
        assert_eq!(mask.triplet_group(0, 1, 0), mask.triplet_group(0, 0, 1));
    }
}
