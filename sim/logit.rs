//! # Logit Algebra
//!
//! Pure conversions between response rates and log-odds, and the reconciliation that
//! collapses a full-layout weight vector (cluster logits followed by site offsets) into
//! the equivalent site-only vector.
//!
//! Because the model is additive in logit space, a site's log-odds is simply its
//! cluster's weight plus its own offset weight. Reconciliation performs that sum for every
//! site in one pass over the hierarchy's prefix-offset table, so the two parameterizations
//! predict identically up to floating-point rounding of a single addition.

use crate::hierarchy::Hierarchy;
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogitError {
    #[error("Response rate {rate} is outside the open interval (0, 1); its logit is undefined.")]
    Domain { rate: f64 },

    #[error(
        "Full-form weight vector has length {found}, but the hierarchy requires {expected} \
         ({clusters} cluster weights followed by {sites} site offsets)."
    )]
    WeightLengthMismatch {
        found: usize,
        expected: usize,
        clusters: usize,
        sites: usize,
    },
}

/// Returns `ln(rate / (1 - rate))`.
///
/// Rates of exactly 0 or 1 (and NaN) are rejected rather than mapped to infinities.
pub fn rate_to_logit(rate: f64) -> Result<f64, LogitError> {
    if !(rate > 0.0 && rate < 1.0) {
        return Err(LogitError::Domain { rate });
    }
    Ok(rate.ln() - (-rate).ln_1p())
}

/// The logistic sigmoid `1 / (1 + e^-logit)`.
///
/// Defined for every real input. Mathematically the result lies strictly inside (0, 1),
/// but in `f64` it saturates: logits above roughly 36.7 return exactly `1.0` and logits
/// below roughly -745 return exactly `0.0`. That saturation is expected behavior and
/// callers sampling labels from the result handle it naturally.
pub fn logit_to_rate(logit: f64) -> f64 {
    if logit >= 0.0 {
        1.0 / (1.0 + (-logit).exp())
    } else {
        let e = logit.exp();
        e / (1.0 + e)
    }
}

/// Collapses a full-form weight vector into the equivalent site-only vector.
///
/// Input layout: `n_clusters` cluster weights, then each cluster's site offsets in
/// hierarchy order. Output: one weight per site, `cluster weight + site offset weight`.
pub fn reconcile(
    full_weights: ArrayView1<f64>,
    hierarchy: &Hierarchy,
) -> Result<Array1<f64>, LogitError> {
    let n_clusters = hierarchy.n_clusters();
    let n_sites = hierarchy.n_sites();
    if full_weights.len() != n_clusters + n_sites {
        return Err(LogitError::WeightLengthMismatch {
            found: full_weights.len(),
            expected: n_clusters + n_sites,
            clusters: n_clusters,
            sites: n_sites,
        });
    }

    let mut site_weights = Array1::zeros(n_sites);
    for cluster in 0..n_clusters {
        let cluster_weight = full_weights[cluster];
        for flat in hierarchy.block(cluster) {
            site_weights[flat] = cluster_weight + full_weights[n_clusters + flat];
        }
    }
    Ok(site_weights)
}
