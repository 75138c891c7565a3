//! # Hierarchy Definition
//!
//! A validated, immutable description of the two-level model: cluster occurrence
//! probabilities, cluster baseline response rates, and for every cluster its sites'
//! conditional occurrence probabilities and logit offsets.
//!
//! Sites are stored in a single flat arena in hierarchy order (all of cluster 0's sites,
//! then cluster 1's, ...). A prefix table of block starts maps a `(cluster, site)` pair to
//! its flat index in O(1); the same flat index is the site's column in the reduced
//! layout and, shifted by the cluster count, in the full layout.
//!
//! - Validate once: every invariant is checked in [`Hierarchy::new`]. A `Hierarchy` that
//!   exists is always a valid model, so downstream code never re-checks distributions.
//! - Sampling tables for the cluster and per-cluster site distributions are built at
//!   construction and reused by every simulation run.

use crate::logit::{logit_to_rate, rate_to_logit};
use ndarray::Array1;
use rand::distributions::{WeightedError, WeightedIndex};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Allowed deviation of a probability vector's sum from 1.
pub const PROBABILITY_SUM_TOLERANCE: f64 = 1e-9;

/// The raw, unvalidated parameters of a hierarchy, as they appear in a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchySpec {
    /// Occurrence probability of each cluster. Must sum to 1.
    pub cluster_probabilities: Vec<f64>,
    /// Baseline response rate of each cluster, strictly inside (0, 1).
    pub baseline_rates: Vec<f64>,
    /// Per cluster, the occurrence probability of each site given the cluster.
    pub site_probabilities: Vec<Vec<f64>>,
    /// Per cluster, each site's logit offset from the cluster baseline.
    pub site_offsets: Vec<Vec<f64>>,
}

/// Malformed hierarchy parameters. Raised only at construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HierarchyError {
    #[error("A hierarchy needs at least one cluster.")]
    NoClusters,

    #[error("'{field}' has {found} entries, but there are {expected} clusters.")]
    LengthMismatch {
        field: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("Cluster {cluster} has no sites.")]
    EmptyCluster { cluster: usize },

    #[error(
        "Cluster {cluster} declares {probabilities} site probabilities but {offsets} site offsets."
    )]
    SiteVectorMismatch {
        cluster: usize,
        probabilities: usize,
        offsets: usize,
    },

    #[error("Entry {index} of {what} is {value}; probabilities must be finite and non-negative.")]
    InvalidProbability {
        what: String,
        index: usize,
        value: f64,
    },

    #[error("{what} sums to {sum}, not 1 (tolerance 1e-9).")]
    NotADistribution { what: String, sum: f64 },

    #[error("Baseline rate of cluster {cluster} is {rate}; it must lie strictly inside (0, 1).")]
    RateOutOfRange { cluster: usize, rate: f64 },

    #[error("Site {site} of cluster {cluster} has non-finite logit offset {value}.")]
    NonFiniteOffset {
        cluster: usize,
        site: usize,
        value: f64,
    },

    #[error("Failed to build a sampling table: {0}")]
    Sampler(#[from] WeightedError),
}

/// A cluster or site index outside the hierarchy's declared bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Cluster index {cluster} is out of range; the hierarchy has {n_clusters} clusters.")]
    ClusterOutOfRange { cluster: usize, n_clusters: usize },

    #[error("Site index {site} is out of range; cluster {cluster} has {n_sites} sites.")]
    SiteOutOfRange {
        cluster: usize,
        site: usize,
        n_sites: usize,
    },

    #[error("Flat site index {index} is out of range; the hierarchy has {n_sites} sites.")]
    FlatIndexOutOfRange { index: usize, n_sites: usize },
}

#[derive(Debug, Clone)]
pub struct Hierarchy {
    cluster_probabilities: Vec<f64>,
    baseline_rates: Vec<f64>,
    baseline_logits: Vec<f64>,
    /// Flat, hierarchy-ordered site arena.
    site_probabilities: Vec<f64>,
    site_offsets: Vec<f64>,
    /// `block_starts[c]..block_starts[c + 1]` is cluster `c`'s slice of the arena.
    block_starts: Vec<usize>,
    cluster_sampler: WeightedIndex<f64>,
    site_samplers: Vec<WeightedIndex<f64>>,
}

impl Hierarchy {
    /// Validates the parameters and builds the hierarchy.
    pub fn new(
        cluster_probabilities: Vec<f64>,
        baseline_rates: Vec<f64>,
        site_probabilities: Vec<Vec<f64>>,
        site_offsets: Vec<Vec<f64>>,
    ) -> Result<Self, HierarchyError> {
        let n_clusters = cluster_probabilities.len();
        if n_clusters == 0 {
            return Err(HierarchyError::NoClusters);
        }
        for (field, found) in [
            ("baseline_rates", baseline_rates.len()),
            ("site_probabilities", site_probabilities.len()),
            ("site_offsets", site_offsets.len()),
        ] {
            if found != n_clusters {
                return Err(HierarchyError::LengthMismatch {
                    field,
                    found,
                    expected: n_clusters,
                });
            }
        }

        validate_distribution(&cluster_probabilities, "cluster_probabilities")?;

        let mut baseline_logits = Vec::with_capacity(n_clusters);
        for (cluster, &rate) in baseline_rates.iter().enumerate() {
            let logit = rate_to_logit(rate)
                .map_err(|_| HierarchyError::RateOutOfRange { cluster, rate })?;
            baseline_logits.push(logit);
        }

        let mut block_starts = Vec::with_capacity(n_clusters + 1);
        block_starts.push(0);
        for (cluster, (probs, offsets)) in site_probabilities.iter().zip(&site_offsets).enumerate()
        {
            if probs.len() != offsets.len() {
                return Err(HierarchyError::SiteVectorMismatch {
                    cluster,
                    probabilities: probs.len(),
                    offsets: offsets.len(),
                });
            }
            if probs.is_empty() {
                return Err(HierarchyError::EmptyCluster { cluster });
            }
            validate_distribution(probs, &format!("site_probabilities[{cluster}]"))?;
            if let Some((site, &value)) = offsets.iter().enumerate().find(|(_, v)| !v.is_finite())
            {
                return Err(HierarchyError::NonFiniteOffset {
                    cluster,
                    site,
                    value,
                });
            }
            block_starts.push(block_starts[cluster] + probs.len());
        }

        let cluster_sampler = WeightedIndex::new(&cluster_probabilities)?;
        let site_samplers = site_probabilities
            .iter()
            .map(|probs| WeightedIndex::new(probs))
            .collect::<Result<Vec<WeightedIndex<f64>>, _>>()?;

        Ok(Self {
            cluster_probabilities,
            baseline_rates,
            baseline_logits,
            site_probabilities: site_probabilities.into_iter().flatten().collect(),
            site_offsets: site_offsets.into_iter().flatten().collect(),
            block_starts,
            cluster_sampler,
            site_samplers,
        })
    }

    pub fn from_spec(spec: &HierarchySpec) -> Result<Self, HierarchyError> {
        Self::new(
            spec.cluster_probabilities.clone(),
            spec.baseline_rates.clone(),
            spec.site_probabilities.clone(),
            spec.site_offsets.clone(),
        )
    }

    /// Rebuilds the raw parameters this hierarchy was constructed from.
    pub fn to_spec(&self) -> HierarchySpec {
        let per_cluster = |flat: &[f64]| -> Vec<Vec<f64>> {
            (0..self.n_clusters())
                .map(|c| flat[self.block(c)].to_vec())
                .collect()
        };
        HierarchySpec {
            cluster_probabilities: self.cluster_probabilities.clone(),
            baseline_rates: self.baseline_rates.clone(),
            site_probabilities: per_cluster(&self.site_probabilities),
            site_offsets: per_cluster(&self.site_offsets),
        }
    }

    pub fn n_clusters(&self) -> usize {
        self.cluster_probabilities.len()
    }

    /// Total number of sites across all clusters.
    pub fn n_sites(&self) -> usize {
        self.site_offsets.len()
    }

    /// Width of a full-layout row: cluster indicators followed by site indicators.
    pub fn full_width(&self) -> usize {
        self.n_clusters() + self.n_sites()
    }

    pub fn cluster_probabilities(&self) -> &[f64] {
        &self.cluster_probabilities
    }

    pub fn site_count(&self, cluster: usize) -> Result<usize, IndexError> {
        Ok(self.site_range(cluster)?.len())
    }

    pub fn baseline_rate(&self, cluster: usize) -> Result<f64, IndexError> {
        self.check_cluster(cluster)?;
        Ok(self.baseline_rates[cluster])
    }

    pub fn baseline_logit(&self, cluster: usize) -> Result<f64, IndexError> {
        self.check_cluster(cluster)?;
        Ok(self.baseline_logits[cluster])
    }

    pub fn site_probabilities(&self, cluster: usize) -> Result<&[f64], IndexError> {
        Ok(&self.site_probabilities[self.site_range(cluster)?])
    }

    pub fn site_offsets(&self, cluster: usize) -> Result<&[f64], IndexError> {
        Ok(&self.site_offsets[self.site_range(cluster)?])
    }

    /// The flat (hierarchy-order) indices occupied by `cluster`'s sites.
    pub fn site_range(&self, cluster: usize) -> Result<Range<usize>, IndexError> {
        self.check_cluster(cluster)?;
        Ok(self.block(cluster))
    }

    /// Maps `(cluster, site)` to the site's flat index.
    pub fn flat_index(&self, cluster: usize, site: usize) -> Result<usize, IndexError> {
        let range = self.site_range(cluster)?;
        if site >= range.len() {
            return Err(IndexError::SiteOutOfRange {
                cluster,
                site,
                n_sites: range.len(),
            });
        }
        Ok(range.start + site)
    }

    /// Inverse of [`Hierarchy::flat_index`].
    pub fn locate(&self, flat: usize) -> Result<(usize, usize), IndexError> {
        if flat >= self.n_sites() {
            return Err(IndexError::FlatIndexOutOfRange {
                index: flat,
                n_sites: self.n_sites(),
            });
        }
        // Last block whose start is <= flat; empty clusters are rejected at construction.
        let cluster = self.block_starts.partition_point(|&start| start <= flat) - 1;
        Ok((cluster, flat - self.block_starts[cluster]))
    }

    /// Log-odds of a positive label at `(cluster, site)`: baseline logit plus offset.
    pub fn site_logit(&self, cluster: usize, site: usize) -> Result<f64, IndexError> {
        let flat = self.flat_index(cluster, site)?;
        Ok(self.logit_at(cluster, flat))
    }

    /// The generating model in full form: baseline logits, then every site offset.
    pub fn full_weights(&self) -> Array1<f64> {
        self.baseline_logits
            .iter()
            .chain(&self.site_offsets)
            .copied()
            .collect()
    }

    /// The generating model in site-only form: one log-odds per site.
    pub fn site_weights(&self) -> Array1<f64> {
        let mut weights = Array1::zeros(self.n_sites());
        for cluster in 0..self.n_clusters() {
            for flat in self.block(cluster) {
                weights[flat] = self.logit_at(cluster, flat);
            }
        }
        weights
    }

    /// Response rate of every site in flat order.
    pub fn site_rates(&self) -> Array1<f64> {
        self.site_weights().mapv(logit_to_rate)
    }

    /// Flat site probabilities; each cluster's block sums to 1.
    pub(crate) fn flat_site_probabilities(&self) -> &[f64] {
        &self.site_probabilities
    }

    /// Caller guarantees `flat` lies in `cluster`'s block.
    pub(crate) fn logit_at(&self, cluster: usize, flat: usize) -> f64 {
        self.baseline_logits[cluster] + self.site_offsets[flat]
    }

    pub(crate) fn block(&self, cluster: usize) -> Range<usize> {
        self.block_starts[cluster]..self.block_starts[cluster + 1]
    }

    pub(crate) fn cluster_sampler(&self) -> &WeightedIndex<f64> {
        &self.cluster_sampler
    }

    pub(crate) fn site_sampler(&self, cluster: usize) -> &WeightedIndex<f64> {
        &self.site_samplers[cluster]
    }

    fn check_cluster(&self, cluster: usize) -> Result<(), IndexError> {
        if cluster >= self.n_clusters() {
            return Err(IndexError::ClusterOutOfRange {
                cluster,
                n_clusters: self.n_clusters(),
            });
        }
        Ok(())
    }
}

impl TryFrom<&HierarchySpec> for Hierarchy {
    type Error = HierarchyError;

    fn try_from(spec: &HierarchySpec) -> Result<Self, Self::Error> {
        Self::from_spec(spec)
    }
}

fn validate_distribution(values: &[f64], what: &str) -> Result<(), HierarchyError> {
    if let Some((index, &value)) = values
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite() || **v < 0.0)
    {
        return Err(HierarchyError::InvalidProbability {
            what: what.to_string(),
            index,
            value,
        });
    }
    let sum: f64 = values.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
        return Err(HierarchyError::NotADistribution {
            what: what.to_string(),
            sum,
        });
    }
    Ok(())
}
