//! # Response Simulator
//!
//! Draws labeled observations from a [`Hierarchy`]: a cluster from the cluster
//! distribution, a site from that cluster's site distribution, then a Bernoulli label
//! with the site's response rate.
//!
//! Randomness is always an explicit argument. There is no process-wide generator, so two
//! runs with independently seeded generators are independent and each is reproducible
//! bit-for-bit from its seed.
//!
//! ### Parallel generation ###
//!
//! [`par_generate_dataset`] pre-splits one top-level seed into per-row seeds
//! ([`row_seeds`]) and gives every row its own generator. Row `i` therefore consumes the
//! same randomness regardless of which thread draws it, and the result equals
//! [`generate_dataset_seeded`] for the same seed.

use crate::encode::{self, Layout};
use crate::hierarchy::{Hierarchy, IndexError};
use crate::logit::logit_to_rate;
use ndarray::{Array1, Array2};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;

/// One generated row: where it was drawn and its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub cluster: usize,
    /// Index of the site within its cluster.
    pub site: usize,
    pub label: u8,
}

/// An observation together with both of its design rows.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedObservation {
    pub observation: Observation,
    pub full: Array1<f64>,
    pub reduced: Array1<f64>,
}

/// The generator used for every seeded run.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// True probability of a positive label at `(cluster, site)`.
pub fn site_response_rate(
    cluster: usize,
    site: usize,
    hierarchy: &Hierarchy,
) -> Result<f64, IndexError> {
    Ok(logit_to_rate(hierarchy.site_logit(cluster, site)?))
}

/// Bernoulli draw: 1 iff a uniform `u` in [0, 1) satisfies `u < rate`.
///
/// The comparison is strict, so a draw landing exactly on `rate` yields 0. A rate of 0
/// never produces a positive and a rate of 1 always does.
pub fn sample_label<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> u8 {
    let u: f64 = rng.r#gen();
    u8::from(u < rate)
}

/// Cluster, then site, then label, consuming exactly three draws from `rng`.
fn draw<R: Rng + ?Sized>(hierarchy: &Hierarchy, rng: &mut R) -> (Observation, usize) {
    let cluster = hierarchy.cluster_sampler().sample(rng);
    let site = hierarchy.site_sampler(cluster).sample(rng);
    let flat = hierarchy.block(cluster).start + site;
    let label = sample_label(logit_to_rate(hierarchy.logit_at(cluster, flat)), rng);
    (
        Observation {
            cluster,
            site,
            label,
        },
        flat,
    )
}

/// Draws one observation and encodes it in both layouts.
pub fn sample_observation<R: Rng + ?Sized>(
    hierarchy: &Hierarchy,
    rng: &mut R,
) -> EncodedObservation {
    let (observation, flat) = draw(hierarchy, rng);
    EncodedObservation {
        observation,
        full: Layout::Full.encode_flat(observation.cluster, flat, hierarchy),
        reduced: Layout::Reduced.encode_flat(observation.cluster, flat, hierarchy),
    }
}

/// A finite, lazy sequence of observations drawn from one generator.
#[derive(Debug)]
pub struct ObservationStream<'h, R> {
    hierarchy: &'h Hierarchy,
    rng: R,
    remaining: usize,
}

impl<R: Rng> Iterator for ObservationStream<'_, R> {
    type Item = Observation;

    fn next(&mut self) -> Option<Observation> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(draw(self.hierarchy, &mut self.rng).0)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<R: Rng> ExactSizeIterator for ObservationStream<'_, R> {}

impl<R: Rng> FusedIterator for ObservationStream<'_, R> {}

/// Lazily yields `n_rows` observations. Pass `&mut rng` to keep using the generator
/// afterwards.
pub fn observations<R: Rng>(
    hierarchy: &Hierarchy,
    n_rows: usize,
    rng: R,
) -> ObservationStream<'_, R> {
    ObservationStream {
        hierarchy,
        rng,
        remaining: n_rows,
    }
}

/// The generated observations; design matrices and labels are derived views.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataset {
    observations: Vec<Observation>,
}

impl Dataset {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Labels as `0.0` / `1.0`, parallel to the design rows.
    pub fn labels(&self) -> Array1<f64> {
        self.observations
            .iter()
            .map(|obs| f64::from(obs.label))
            .collect()
    }

    pub fn design(
        &self,
        hierarchy: &Hierarchy,
        layout: Layout,
    ) -> Result<Array2<f64>, IndexError> {
        encode::design_matrix(&self.observations, hierarchy, layout)
    }

    pub fn full_design(&self, hierarchy: &Hierarchy) -> Result<Array2<f64>, IndexError> {
        self.design(hierarchy, Layout::Full)
    }

    pub fn reduced_design(&self, hierarchy: &Hierarchy) -> Result<Array2<f64>, IndexError> {
        self.design(hierarchy, Layout::Reduced)
    }

    pub fn positives(&self) -> usize {
        self.observations.iter().filter(|obs| obs.label == 1).count()
    }
}

impl FromIterator<Observation> for Dataset {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// `n_rows` independent observations drawn sequentially from `rng`.
pub fn generate_dataset<R: Rng + ?Sized>(
    hierarchy: &Hierarchy,
    n_rows: usize,
    rng: &mut R,
) -> Dataset {
    let dataset: Dataset = observations(hierarchy, n_rows, rng).collect();
    log::info!(
        "Generated {} observations ({} positive).",
        dataset.len(),
        dataset.positives()
    );
    dataset
}

/// Splits `seed` into one seed per row, in row order.
pub fn row_seeds(seed: u64, n_rows: usize) -> Vec<u64> {
    let mut rng = seeded_rng(seed);
    (0..n_rows).map(|_| rng.r#gen::<u64>()).collect()
}

fn draw_row(hierarchy: &Hierarchy, row_seed: u64) -> Observation {
    draw(hierarchy, &mut seeded_rng(row_seed)).0
}

/// Serial generation over per-row seeds. Matches [`par_generate_dataset`] exactly.
pub fn generate_dataset_seeded(hierarchy: &Hierarchy, n_rows: usize, seed: u64) -> Dataset {
    let dataset: Dataset = row_seeds(seed, n_rows)
        .into_iter()
        .map(|row_seed| draw_row(hierarchy, row_seed))
        .collect();
    log::info!(
        "Generated {} observations from seed {} ({} positive).",
        dataset.len(),
        seed,
        dataset.positives()
    );
    dataset
}

/// Parallel generation over per-row seeds, reproducing [`generate_dataset_seeded`].
pub fn par_generate_dataset(hierarchy: &Hierarchy, n_rows: usize, seed: u64) -> Dataset {
    let rows: Vec<Observation> = row_seeds(seed, n_rows)
        .into_par_iter()
        .map(|row_seed| draw_row(hierarchy, row_seed))
        .collect();
    let dataset = Dataset::new(rows);
    log::info!(
        "Generated {} observations from seed {} on {} threads ({} positive).",
        dataset.len(),
        seed,
        rayon::current_num_threads(),
        dataset.positives()
    );
    dataset
}
