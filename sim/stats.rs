//! # Aggregate Statistics
//!
//! True response rates implied by a hierarchy, and the observed frequencies in a
//! simulated dataset to validate them against. Nothing here feeds back into simulation or
//! fitting.

use crate::hierarchy::{Hierarchy, IndexError};
use crate::simulate::Dataset;
use ndarray::Array1;

/// Response rate of every site, in flat hierarchy order.
pub fn site_response_rates(hierarchy: &Hierarchy) -> Array1<f64> {
    hierarchy.site_rates()
}

/// A cluster's response rate: its site rates mixed by site occurrence probability.
pub fn cluster_response_rate(cluster: usize, hierarchy: &Hierarchy) -> Result<f64, IndexError> {
    let range = hierarchy.site_range(cluster)?;
    let rates = hierarchy.site_rates();
    let probs = hierarchy.flat_site_probabilities();
    Ok(range.map(|flat| rates[flat] * probs[flat]).sum())
}

pub fn cluster_response_rates(hierarchy: &Hierarchy) -> Array1<f64> {
    let rates = hierarchy.site_rates();
    let probs = hierarchy.flat_site_probabilities();
    (0..hierarchy.n_clusters())
        .map(|cluster| {
            hierarchy
                .block(cluster)
                .map(|flat| rates[flat] * probs[flat])
                .sum::<f64>()
        })
        .collect()
}

/// Marginal probability of a positive label over the whole hierarchy.
pub fn population_response_rate(hierarchy: &Hierarchy) -> f64 {
    cluster_response_rates(hierarchy)
        .iter()
        .zip(hierarchy.cluster_probabilities())
        .map(|(rate, prob)| rate * prob)
        .sum()
}

/// Row and positive-label counts per site and per cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmpiricalRates {
    pub site_rows: Vec<usize>,
    pub site_positives: Vec<usize>,
    pub cluster_rows: Vec<usize>,
    pub cluster_positives: Vec<usize>,
}

impl EmpiricalRates {
    pub fn from_dataset(dataset: &Dataset, hierarchy: &Hierarchy) -> Result<Self, IndexError> {
        let mut rates = Self {
            site_rows: vec![0; hierarchy.n_sites()],
            site_positives: vec![0; hierarchy.n_sites()],
            cluster_rows: vec![0; hierarchy.n_clusters()],
            cluster_positives: vec![0; hierarchy.n_clusters()],
        };
        for obs in dataset.observations() {
            let flat = hierarchy.flat_index(obs.cluster, obs.site)?;
            let positive = usize::from(obs.label);
            rates.site_rows[flat] += 1;
            rates.site_positives[flat] += positive;
            rates.cluster_rows[obs.cluster] += 1;
            rates.cluster_positives[obs.cluster] += positive;
        }
        Ok(rates)
    }

    /// Observed positive frequency per site; `None` where the site was never drawn.
    pub fn site_frequencies(&self) -> Vec<Option<f64>> {
        frequencies(&self.site_rows, &self.site_positives)
    }

    pub fn cluster_frequencies(&self) -> Vec<Option<f64>> {
        frequencies(&self.cluster_rows, &self.cluster_positives)
    }
}

fn frequencies(rows: &[usize], positives: &[usize]) -> Vec<Option<f64>> {
    rows.iter()
        .zip(positives)
        .map(|(&n, &k)| (n > 0).then(|| k as f64 / n as f64))
        .collect()
}
