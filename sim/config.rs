//! # Run Configuration and Artifacts
//!
//! The human-editable description of a simulation run, and the files a run produces.
//!
//! - `SimulationConfig` is stored as TOML. It carries the raw hierarchy parameters, which
//!   are only trusted after [`SimulationConfig::hierarchy`] validates them.
//! - Datasets are written as CSV with one `cluster,site,label` row per observation.
//! - Fit reports are written as TOML so fitted and true weights can be diffed by eye.

use crate::fit::{FitConfig, FitReport};
use crate::hierarchy::{Hierarchy, HierarchyError, HierarchySpec};
use crate::simulate::{Dataset, Observation};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to read or write CSV data: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Invalid hierarchy in configuration: {0}")]
    InvalidHierarchy(#[from] HierarchyError),
}

/// Everything needed to reproduce one simulation-and-fit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub n_rows: usize,
    /// Generate rows on the rayon pool. The dataset is identical either way.
    #[serde(default)]
    pub parallel: bool,
    pub hierarchy: HierarchySpec,
    #[serde(default)]
    pub fit: FitConfig,
}

impl Default for SimulationConfig {
    /// Three clusters of 6, 3 and 3 equally likely sites. Cluster 0's third site sits two
    /// logits above its baseline and cluster 2's second site five logits below.
    fn default() -> Self {
        Self {
            seed: 42,
            n_rows: 100_000,
            parallel: false,
            hierarchy: HierarchySpec {
                cluster_probabilities: vec![0.2, 0.2, 0.6],
                baseline_rates: vec![0.2, 0.6, 0.1],
                site_probabilities: vec![
                    vec![1.0 / 6.0; 6],
                    vec![1.0 / 3.0; 3],
                    vec![1.0 / 3.0; 3],
                ],
                site_offsets: vec![
                    vec![0.0, 0.0, 2.0, 0.0, 0.0, 0.0],
                    vec![0.0, 0.0, 0.0],
                    vec![0.0, -5.0, 0.0],
                ],
            },
            fit: FitConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Validates the hierarchy parameters.
    pub fn hierarchy(&self) -> Result<Hierarchy, HierarchyError> {
        Hierarchy::from_spec(&self.hierarchy)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        write_toml(self, path.as_ref())
    }

    /// Loads a config and rejects it up front if its hierarchy is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.hierarchy()?;
        Ok(config)
    }
}

impl FitReport {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        write_toml(self, path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ConfigError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Writes `cluster,site,label` rows with a header line.
pub fn write_dataset_csv(dataset: &Dataset, path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let mut writer = csv::Writer::from_path(path)?;
    for obs in dataset.observations() {
        writer.serialize(obs)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_dataset_csv(path: impl AsRef<Path>) -> Result<Dataset, ConfigError> {
    let mut reader = csv::Reader::from_path(path)?;
    let observations = reader
        .deserialize::<Observation>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Dataset::new(observations))
}
