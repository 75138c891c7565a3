use hierlogit::config::{SimulationConfig, read_dataset_csv};
use hierlogit::fit::FitReport;
use std::process::Command;

use tempfile::tempdir;

#[test]
fn cli_writes_config_dataset_and_report() {
    let tmp = tempdir().expect("temporary directory");
    let config_path = tmp.path().join("run.toml");
    let exe = env!("CARGO_BIN_EXE_hierlogit");

    let status = Command::new(exe)
        .args(["init-config", config_path.to_str().expect("path str")])
        .status()
        .expect("run hierlogit init-config");
    assert!(status.success(), "init-config exited with status {status:?}");
    assert_eq!(
        SimulationConfig::load(&config_path).expect("load config"),
        SimulationConfig::default()
    );

    let csv_path = tmp.path().join("data.csv");
    let status = Command::new(exe)
        .args([
            "simulate",
            "--config",
            config_path.to_str().expect("path str"),
            "--rows",
            "500",
            "--seed",
            "3",
            "--parallel",
            "--output",
            csv_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run hierlogit simulate");
    assert!(status.success(), "simulate exited with status {status:?}");
    let data = read_dataset_csv(&csv_path).expect("read dataset");
    assert_eq!(data.len(), 500);

    let report_path = tmp.path().join("report.toml");
    let status = Command::new(exe)
        .args([
            "fit",
            "--config",
            config_path.to_str().expect("path str"),
            "--rows",
            "20000",
            "--output",
            report_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run hierlogit fit");
    assert!(status.success(), "fit exited with status {status:?}");
    let report = FitReport::load(&report_path).expect("load report");
    assert_eq!(report.n_rows, 20000);
    assert_eq!(report.full_weights.len(), 15);
    assert_eq!(report.reduced_site_weights.len(), 12);
}

#[test]
fn cli_rejects_an_invalid_configuration() {
    let tmp = tempdir().expect("temporary directory");
    let config_path = tmp.path().join("bad.toml");
    let mut config = SimulationConfig::default();
    config.hierarchy.cluster_probabilities = vec![0.5, 0.5, 0.5];
    config.save(&config_path).expect("save config");

    let output = Command::new(env!("CARGO_BIN_EXE_hierlogit"))
        .current_dir(tmp.path())
        .args(["simulate", "--config", config_path.to_str().expect("path str")])
        .output()
        .expect("run hierlogit simulate");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cluster_probabilities"), "stderr: {stderr}");
    assert!(!tmp.path().join("dataset.csv").exists());
}
