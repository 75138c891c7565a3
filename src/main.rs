// ========================================================================================
//
//                      THE SIMULATION ORCHESTRATOR: HIERLOGIT
//
// ========================================================================================
//
// This binary is a thin conductor over the `hierlogit` library. It parses arguments,
// loads and validates a run configuration, drives simulation and fitting, and writes
// the resulting artifacts. All modelling decisions live in the library.
//
// ### The Orchestration Mandate ###
//
// 1.  **One Source of Truth:** Every run is described by a TOML `SimulationConfig`.
//     Command-line flags may override the seed and row count, nothing else.
//
// 2.  **Reproducibility:** A seed fully determines the dataset, whether rows are
//     generated serially or on the rayon pool.
//
// 3.  **Fail Loudly:** Any error ends the run with a message on stderr and exit code 1.
//     No partial artifacts are reported as success.

use clap::{Parser, Subcommand};
use hierlogit::config::{SimulationConfig, write_dataset_csv};
use hierlogit::fit::{FitReport, IrlsFitter};
use hierlogit::hierarchy::Hierarchy;
use hierlogit::simulate::{Dataset, generate_dataset_seeded, par_generate_dataset};
use hierlogit::stats::{cluster_response_rates, population_response_rate};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "hierlogit",
    version,
    about = "Simulate and recover two-level cluster/site binary-response models",
    long_about = "Generates labeled observations from a cluster -> site hierarchy defined \
                  additively in logit space, and fits both the cluster+site and the \
                  site-only logistic parameterizations."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to a file
    #[command(about = "Write a starter configuration (outputs: TOML config)")]
    InitConfig {
        /// Destination for the configuration file
        path: PathBuf,
    },

    /// Simulate a dataset and write it as CSV
    #[command(about = "Simulate observations (outputs: cluster,site,label CSV)")]
    Simulate {
        /// Path to the TOML run configuration
        #[arg(long)]
        config: PathBuf,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the configured number of rows
        #[arg(long, value_name = "N")]
        rows: Option<usize>,

        /// Generate rows in parallel (same dataset as serial generation)
        #[arg(long)]
        parallel: bool,

        /// Destination CSV file
        #[arg(long, default_value = "dataset.csv")]
        output: PathBuf,
    },

    /// Simulate a dataset, fit both parameterizations and reconcile them
    #[command(about = "Fit full and site-only models (outputs: TOML fit report)")]
    Fit {
        /// Path to the TOML run configuration
        #[arg(long)]
        config: PathBuf,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override the configured number of rows
        #[arg(long, value_name = "N")]
        rows: Option<usize>,

        /// Destination TOML report
        #[arg(long, default_value = "fit_report.toml")]
        output: PathBuf,
    },
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let start_time = Instant::now();

    let result = match cli.command {
        Commands::InitConfig { path } => init_config_command(&path),
        Commands::Simulate {
            config,
            seed,
            rows,
            parallel,
            output,
        } => simulate_command(&config, seed, rows, parallel, &output),
        Commands::Fit {
            config,
            seed,
            rows,
            output,
        } => fit_command(&config, seed, rows, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
    log::info!("Finished in {:.2?}.", start_time.elapsed());
}

fn init_config_command(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    SimulationConfig::default().save(path)?;
    println!("Default configuration written to: {}", path.display());
    Ok(())
}

/// Loads the config, applies overrides and validates the hierarchy.
fn load_run(
    config_path: &Path,
    seed: Option<u64>,
    rows: Option<usize>,
) -> Result<(SimulationConfig, Hierarchy), Box<dyn std::error::Error>> {
    println!("Loading configuration from: {}", config_path.display());
    let mut config = SimulationConfig::load(config_path)?;
    if let Some(seed) = seed {
        config.seed = seed;
    }
    if let Some(rows) = rows {
        config.n_rows = rows;
    }
    let hierarchy = config.hierarchy()?;

    println!(
        "Hierarchy: {} clusters, {} sites. Population response rate: {:.4}",
        hierarchy.n_clusters(),
        hierarchy.n_sites(),
        population_response_rate(&hierarchy)
    );
    println!(
        "Cluster response rates: {}",
        cluster_response_rates(&hierarchy)
            .iter()
            .enumerate()
            .map(|(c, rate)| format!("C{}: {:.4}", c, rate))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok((config, hierarchy))
}

fn generate(config: &SimulationConfig, hierarchy: &Hierarchy) -> Dataset {
    println!(
        "Generating {} rows with seed {}{}...",
        config.n_rows,
        config.seed,
        if config.parallel { " (parallel)" } else { "" }
    );
    if config.parallel {
        par_generate_dataset(hierarchy, config.n_rows, config.seed)
    } else {
        generate_dataset_seeded(hierarchy, config.n_rows, config.seed)
    }
}

fn simulate_command(
    config_path: &Path,
    seed: Option<u64>,
    rows: Option<usize>,
    parallel: bool,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mut config, hierarchy) = load_run(config_path, seed, rows)?;
    config.parallel |= parallel;

    let dataset = generate(&config, &hierarchy);
    write_dataset_csv(&dataset, output)?;
    println!(
        "Wrote {} rows ({} positive) to: {}",
        dataset.len(),
        dataset.positives(),
        output.display()
    );
    Ok(())
}

fn fit_command(
    config_path: &Path,
    seed: Option<u64>,
    rows: Option<usize>,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let (config, hierarchy) = load_run(config_path, seed, rows)?;
    let dataset = generate(&config, &hierarchy);

    println!("Fitting full and site-only layouts...");
    let fitter = IrlsFitter::new(config.fit);
    let report = FitReport::compute(&fitter, &dataset, &hierarchy)?;
    println!(
        "Max |reconciled - site-only| weight gap: {:.3e}",
        report.max_reconciliation_gap()
    );

    report.save(output)?;
    println!("Fit report saved to: {}", output.display());
    Ok(())
}
