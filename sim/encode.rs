//! # Feature Encoder
//!
//! One-hot design rows for `(cluster, site)` pairs, in two layouts:
//!
//! - `Full`: `n_clusters` cluster indicators, then one indicator per site in hierarchy
//!   order. Exactly two entries are 1.
//! - `Reduced`: the site indicators alone. Exactly one entry is 1.
//!
//! Column `j` of the reduced layout is column `n_clusters + j` of the full layout, which
//! is the contract that lets [`crate::logit::reconcile`] line fitted weights up with
//! sites. No intercept column is ever emitted.

use crate::hierarchy::{Hierarchy, IndexError};
use crate::simulate::Observation;
use ndarray::{Array1, Array2, ArrayViewMut1};
use serde::{Deserialize, Serialize};

/// Which columns a design row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// Cluster indicators followed by site indicators.
    Full,
    /// Site indicators only.
    Reduced,
}

impl Layout {
    pub fn width(self, hierarchy: &Hierarchy) -> usize {
        match self {
            Layout::Full => hierarchy.full_width(),
            Layout::Reduced => hierarchy.n_sites(),
        }
    }

    /// Sets the hot columns of `row` for a site already resolved to its flat index.
    fn mark(self, mut row: ArrayViewMut1<f64>, cluster: usize, flat: usize, n_clusters: usize) {
        match self {
            Layout::Full => {
                row[cluster] = 1.0;
                row[n_clusters + flat] = 1.0;
            }
            Layout::Reduced => row[flat] = 1.0,
        }
    }

    /// Encodes a site whose flat index is already known to belong to `cluster`.
    pub(crate) fn encode_flat(
        self,
        cluster: usize,
        flat: usize,
        hierarchy: &Hierarchy,
    ) -> Array1<f64> {
        let mut row = Array1::zeros(self.width(hierarchy));
        self.mark(row.view_mut(), cluster, flat, hierarchy.n_clusters());
        row
    }

    pub fn encode(
        self,
        cluster: usize,
        site: usize,
        hierarchy: &Hierarchy,
    ) -> Result<Array1<f64>, IndexError> {
        let flat = hierarchy.flat_index(cluster, site)?;
        Ok(self.encode_flat(cluster, flat, hierarchy))
    }
}

/// Full-layout row: a one-hot over clusters followed by a one-hot over all sites.
pub fn encode_full(
    cluster: usize,
    site: usize,
    hierarchy: &Hierarchy,
) -> Result<Array1<f64>, IndexError> {
    Layout::Full.encode(cluster, site, hierarchy)
}

/// Reduced-layout row: the site one-hot alone.
pub fn encode_reduced(
    cluster: usize,
    site: usize,
    hierarchy: &Hierarchy,
) -> Result<Array1<f64>, IndexError> {
    Layout::Reduced.encode(cluster, site, hierarchy)
}

/// Stacks the encodings of `observations` into an `[n_rows, width]` matrix.
pub fn design_matrix(
    observations: &[Observation],
    hierarchy: &Hierarchy,
    layout: Layout,
) -> Result<Array2<f64>, IndexError> {
    let mut x = Array2::zeros((observations.len(), layout.width(hierarchy)));
    for (i, obs) in observations.iter().enumerate() {
        let flat = hierarchy.flat_index(obs.cluster, obs.site)?;
        layout.mark(x.row_mut(i), obs.cluster, flat, hierarchy.n_clusters());
    }
    Ok(x)
}
