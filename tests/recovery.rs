use approx::assert_abs_diff_eq;
use hierlogit::config::SimulationConfig;
use hierlogit::encode::{Layout, encode_full, encode_reduced};
use hierlogit::fit::{FitReport, IrlsFitter, LogisticFitter, fit_layout};
use hierlogit::hierarchy::{Hierarchy, HierarchySpec};
use hierlogit::logit::{logit_to_rate, rate_to_logit, reconcile};
use hierlogit::simulate::{
    generate_dataset, generate_dataset_seeded, par_generate_dataset, seeded_rng,
    site_response_rate,
};
use hierlogit::stats::{EmpiricalRates, cluster_response_rate};
use ndarray::{Array1, s};

fn worked_example() -> Hierarchy {
    SimulationConfig::default().hierarchy().unwrap()
}

#[test]
fn reconciling_the_generating_weights_gives_each_site_its_log_odds() {
    let h = worked_example();
    let site = reconcile(h.full_weights().view(), &h).unwrap();
    assert_eq!(site.len(), 12);

    let base = [
        rate_to_logit(0.2).unwrap(),
        rate_to_logit(0.6).unwrap(),
        rate_to_logit(0.1).unwrap(),
    ];
    // Cluster 0 site 2 (the third site) carries +2, cluster 2 site 1 carries -5.
    assert_abs_diff_eq!(site[2], base[0] + 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(site[6 + 3 + 1], base[2] - 5.0, epsilon = 1e-12);
    for flat in 0..12 {
        if flat == 2 || flat == 10 {
            continue;
        }
        let (cluster, _) = h.locate(flat).unwrap();
        assert_abs_diff_eq!(site[flat], base[cluster], epsilon = 1e-12);
    }
}

#[test]
fn any_full_weight_vector_predicts_like_its_reconciliation() {
    let h = worked_example();
    let full = Array1::from_shape_fn(h.full_width(), |i| (i as f64 * 0.37).sin() * 3.0);
    let site = reconcile(full.view(), &h).unwrap();

    for cluster in 0..h.n_clusters() {
        for s in 0..h.site_count(cluster).unwrap() {
            let full_eta = encode_full(cluster, s, &h).unwrap().dot(&full);
            let site_eta = encode_reduced(cluster, s, &h).unwrap().dot(&site);
            assert_abs_diff_eq!(full_eta, site_eta, epsilon = 1e-12);
        }
    }
}

#[test]
fn full_encoding_layout_of_the_worked_example() {
    let h = worked_example();
    let full = encode_full(2, 1, &h).unwrap();
    let mut expected = Array1::<f64>::zeros(15);
    expected[2] = 1.0;
    expected[3 + 6 + 3 + 1] = 1.0;
    assert_eq!(full, expected);
    assert_eq!(encode_reduced(2, 1, &h).unwrap(), expected.slice(s![3..]));
}

#[test]
fn zero_offset_sites_respond_at_the_baseline() {
    let h = worked_example();
    for cluster in 0..3 {
        let baseline = h.baseline_rate(cluster).unwrap();
        let rate = site_response_rate(cluster, 0, &h).unwrap();
        assert_abs_diff_eq!(rate, baseline, epsilon = 1e-12);
        assert_abs_diff_eq!(
            logit_to_rate(h.baseline_logit(cluster).unwrap()),
            baseline,
            epsilon = 1e-12
        );
    }
}

#[test]
fn seeded_generation_is_reproducible() {
    let h = worked_example();
    let a = generate_dataset(&h, 1000, &mut seeded_rng(42));
    let b = generate_dataset(&h, 1000, &mut seeded_rng(42));
    let c = generate_dataset(&h, 1000, &mut seeded_rng(43));
    assert_eq!(a, b);
    assert_ne!(a.labels(), c.labels());

    assert_eq!(
        generate_dataset_seeded(&h, 3000, 42),
        par_generate_dataset(&h, 3000, 42)
    );
}

#[test]
fn high_rate_site_shows_its_rate_in_the_labels() {
    let h = Hierarchy::from_spec(&HierarchySpec {
        cluster_probabilities: vec![0.4, 0.6],
        baseline_rates: vec![0.9, 0.2],
        site_probabilities: vec![vec![0.7, 0.3], vec![0.5, 0.5]],
        site_offsets: vec![vec![0.0, -1.0], vec![0.0, 1.0]],
    })
    .unwrap();
    let data = par_generate_dataset(&h, 100_000, 7);
    let empirical = EmpiricalRates::from_dataset(&data, &h).unwrap();
    let flat = h.flat_index(0, 0).unwrap();
    assert!(empirical.site_rows[flat] > 25_000);
    assert_abs_diff_eq!(
        empirical.site_frequencies()[flat].unwrap(),
        0.9,
        epsilon = 0.02
    );
}

#[test]
fn cluster_rate_mixes_site_rates() {
    let offset = rate_to_logit(0.6).unwrap() - rate_to_logit(0.2).unwrap();
    let h = Hierarchy::new(
        vec![0.5, 0.5],
        vec![0.2, 0.2],
        vec![vec![0.5, 0.5], vec![0.1, 0.9]],
        vec![vec![0.0, 0.0], vec![0.0, offset]],
    )
    .unwrap();
    assert_abs_diff_eq!(cluster_response_rate(0, &h).unwrap(), 0.2, epsilon = 1e-12);
    assert_abs_diff_eq!(cluster_response_rate(1, &h).unwrap(), 0.56, epsilon = 1e-12);
}

#[test]
fn worked_example_recovers_well_populated_sites() {
    let h = worked_example();
    let data = par_generate_dataset(&h, 100_000, 42);
    let fitter = IrlsFitter::default();
    let report = FitReport::compute(&fitter, &data, &h).unwrap();

    let true_rates = h.site_rates();
    let fitted_rates = report.reduced_site_weights.mapv(logit_to_rate);
    let reconciled_rates = report.reconciled_site_weights.mapv(logit_to_rate);
    for flat in 0..h.n_sites() {
        assert_abs_diff_eq!(fitted_rates[flat], true_rates[flat], epsilon = 0.03);
        assert_abs_diff_eq!(reconciled_rates[flat], fitted_rates[flat], epsilon = 1e-3);
    }
}

#[test]
fn fitting_a_layout_uses_the_matching_design_width() {
    let h = worked_example();
    let data = generate_dataset_seeded(&h, 5000, 9);
    let fitter = IrlsFitter::default();
    let full = fit_layout(&fitter, &data, &h, Layout::Full).unwrap();
    let reduced = fit_layout(&fitter, &data, &h, Layout::Reduced).unwrap();
    assert_eq!(full.len(), 15);
    assert_eq!(reduced.len(), 12);

    // Direct use of the adapter on the derived design matrix gives the same weights.
    let direct = fitter
        .fit(data.reduced_design(&h).unwrap().view(), data.labels().view())
        .unwrap();
    assert_eq!(direct, reduced);
}
