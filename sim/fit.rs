//! # Fitting Adapter
//!
//! The boundary between the simulation core and logistic-regression estimation. A
//! [`LogisticFitter`] receives a design matrix with no intercept column and a parallel 0/1
//! label vector, and returns one weight per design column. Any maximum-likelihood solver
//! honoring that contract can be substituted; its failures reach the caller unmodified.
//!
//! [`IrlsFitter`] is the bundled solver: iteratively reweighted least squares for the
//! logit link with a small ridge penalty and step halving. The ridge keeps the full
//! layout (whose cluster columns are sums of site columns) and perfectly separated sites
//! well-posed.

use crate::encode::Layout;
use crate::hierarchy::{Hierarchy, IndexError};
use crate::logit::{LogitError, reconcile};
use crate::simulate::Dataset;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis, Zip};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Estimates logistic-link weights for a design matrix without an intercept.
pub trait LogisticFitter {
    type Error: std::error::Error + 'static;

    /// `x` is `[n_rows, width]`, `y` holds `n_rows` labels in {0, 1}. The result has
    /// exactly `width` entries.
    fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>, Self::Error>;
}

/// Settings for [`IrlsFitter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub max_iterations: usize,
    /// Stop once the relative change in penalized deviance falls below this.
    pub convergence_tolerance: f64,
    /// L2 penalty on every weight.
    pub ridge: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-8,
            ridge: 1e-4,
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("The design matrix is empty ({rows} rows, {cols} columns).")]
    EmptyDesign { rows: usize, cols: usize },

    #[error("The design matrix has {rows} rows but {labels} labels were supplied.")]
    DimensionMismatch { rows: usize, labels: usize },

    #[error("Label {index} is {value}; logistic fitting requires labels of exactly 0 or 1.")]
    NonBinaryLabel { index: usize, value: f64 },

    #[error("Invalid fit setting: {0}")]
    InvalidConfig(String),

    #[error("A linear system solve failed. The weighted normal equations may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),

    #[error("Non-finite coefficients appeared at IRLS iteration {iteration}.")]
    NonFiniteCoefficients { iteration: usize },

    #[error(
        "IRLS did not converge within {max_iterations} iterations. Last relative deviance change was {last_change:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },
}

/// Ridge-penalized IRLS for the logit link.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrlsFitter {
    pub config: FitConfig,
}

impl IrlsFitter {
    pub fn new(config: FitConfig) -> Self {
        Self { config }
    }

    fn validate(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), FitError> {
        let FitConfig {
            max_iterations,
            convergence_tolerance,
            ridge,
        } = self.config;
        if max_iterations == 0 {
            return Err(FitError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(convergence_tolerance.is_finite() && convergence_tolerance > 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "convergence_tolerance must be positive and finite, got {convergence_tolerance}"
            )));
        }
        if !(ridge.is_finite() && ridge >= 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "ridge must be non-negative and finite, got {ridge}"
            )));
        }
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(FitError::EmptyDesign {
                rows: x.nrows(),
                cols: x.ncols(),
            });
        }
        if x.nrows() != y.len() {
            return Err(FitError::DimensionMismatch {
                rows: x.nrows(),
                labels: y.len(),
            });
        }
        if let Some((index, &value)) = y
            .iter()
            .enumerate()
            .find(|(_, v)| **v != 0.0 && **v != 1.0)
        {
            return Err(FitError::NonBinaryLabel { index, value });
        }
        Ok(())
    }
}

impl LogisticFitter for IrlsFitter {
    type Error = FitError;

    fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Array1<f64>, FitError> {
        self.validate(x, y)?;
        let FitConfig {
            max_iterations,
            convergence_tolerance,
            ridge,
        } = self.config;
        let p = x.ncols();

        let mut beta = Array1::<f64>::zeros(p);
        let mut eta = Array1::<f64>::zeros(x.nrows());
        let (mu, mut weights, mut z) = update_glm_vectors(y, &eta);
        let mut penalized_deviance = calculate_deviance(y, &mu) + ridge * beta.dot(&beta);
        let mut last_change = f64::INFINITY;

        for iter in 1..=max_iterations {
            // Weighted normal equations: (X'WX + ridge I) beta = X'Wz
            let xw = &x * &weights.view().insert_axis(Axis(1));
            let mut xtwx = xw.t().dot(&x);
            for j in 0..p {
                xtwx[[j, j]] += ridge;
            }
            let xtwz = xw.t().dot(&z);
            let mut beta_trial = xtwx.solve_into(xtwz)?;
            if !beta_trial.iter().all(|v| v.is_finite()) {
                log::error!("Non-finite beta values at iteration {iter}: {beta_trial:?}");
                return Err(FitError::NonFiniteCoefficients { iteration: iter });
            }

            let mut eta_trial = x.dot(&beta_trial);
            let (mut mu_trial, _, _) = update_glm_vectors(y, &eta_trial);
            let mut penalized_trial =
                calculate_deviance(y, &mu_trial) + ridge * beta_trial.dot(&beta_trial);

            let mut step_halving_count = 0;
            while !(penalized_trial.is_finite() && penalized_trial <= penalized_deviance)
                && step_halving_count < MAX_STEP_HALVINGS
            {
                beta_trial = &beta + 0.5 * (&beta_trial - &beta);
                eta_trial = x.dot(&beta_trial);
                mu_trial = update_glm_vectors(y, &eta_trial).0;
                penalized_trial =
                    calculate_deviance(y, &mu_trial) + ridge * beta_trial.dot(&beta_trial);
                step_halving_count += 1;
            }
            if step_halving_count > 0 {
                log::debug!("IRLS iteration {iter}: {step_halving_count} step halvings");
            }
            if !(penalized_trial.is_finite() && penalized_trial <= penalized_deviance) {
                // No step along the Newton direction improves the objective: the current
                // coefficients are optimal to working precision.
                log::warn!(
                    "IRLS step halving failed at iteration {iter}; keeping coefficients with penalized deviance {penalized_deviance:.8e}"
                );
                return Ok(beta);
            }

            last_change =
                (penalized_deviance - penalized_trial).abs() / (penalized_trial.abs() + 0.1);
            log::debug!(
                "IRLS iteration {iter}: penalized deviance {penalized_deviance:.8e} -> {penalized_trial:.8e} (relative change {last_change:.3e})"
            );

            beta = beta_trial;
            eta = eta_trial;
            penalized_deviance = penalized_trial;
            (_, weights, z) = update_glm_vectors(y, &eta);

            if last_change < convergence_tolerance {
                log::info!(
                    "IRLS converged after {iter} iterations ({} rows, {p} columns, penalized deviance {penalized_deviance:.6}).",
                    x.nrows()
                );
                return Ok(beta);
            }
        }

        log::warn!("IRLS failed to converge after {max_iterations} iterations.");
        Err(FitError::DidNotConverge {
            max_iterations,
            last_change,
        })
    }
}

const MAX_STEP_HALVINGS: usize = 30;

/// Fitted mean, IRLS weights and working response for the logit link.
pub fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    let eta_clamped = eta.mapv(|e| e.clamp(-700.0, 700.0));
    let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
    mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));
    let z = &eta_clamped + &((&y - &mu) / &weights);
    (mu, weights, z)
}

/// Binomial deviance of labels `y` against fitted probabilities `mu`.
pub fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>) -> f64 {
    const EPS: f64 = 1e-8;
    let total = Zip::from(y).and(mu).fold(0.0, |acc, &yi, &mui| {
        let mui = mui.clamp(EPS, 1.0 - EPS);
        let term = if yi > 0.5 { -mui.ln() } else { -(1.0 - mui).ln() };
        acc + term
    });
    2.0 * total
}

/// Failure while fitting one layout of a dataset.
#[derive(Error, Debug)]
pub enum RecoveryError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Logit(#[from] LogitError),

    /// The adapter's own failure, unchanged.
    #[error(transparent)]
    Adapter(E),

    #[error("The fitting adapter returned {found} weights for a design of width {expected}.")]
    WidthMismatch { found: usize, expected: usize },
}

/// Encodes `dataset` in `layout`, runs `fitter`, and checks the returned width.
pub fn fit_layout<F: LogisticFitter>(
    fitter: &F,
    dataset: &Dataset,
    hierarchy: &Hierarchy,
    layout: Layout,
) -> Result<Array1<f64>, RecoveryError<F::Error>> {
    let x = dataset.design(hierarchy, layout)?;
    let y = dataset.labels();
    let weights = fitter
        .fit(x.view(), y.view())
        .map_err(RecoveryError::Adapter)?;
    if weights.len() != x.ncols() {
        return Err(RecoveryError::WidthMismatch {
            found: weights.len(),
            expected: x.ncols(),
        });
    }
    log::info!(
        "Fitted {:?} layout: {} weights from {} rows.",
        layout,
        weights.len(),
        dataset.len()
    );
    Ok(weights)
}

/// Ground truth next to both fitted parameterizations of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub n_rows: usize,
    pub true_full_weights: Array1<f64>,
    pub true_site_weights: Array1<f64>,
    pub full_weights: Array1<f64>,
    /// `full_weights` collapsed to one weight per site.
    pub reconciled_site_weights: Array1<f64>,
    pub reduced_site_weights: Array1<f64>,
}

impl FitReport {
    /// Fits both layouts of `dataset` and reconciles the full fit.
    pub fn compute<F: LogisticFitter>(
        fitter: &F,
        dataset: &Dataset,
        hierarchy: &Hierarchy,
    ) -> Result<Self, RecoveryError<F::Error>> {
        let full_weights = fit_layout(fitter, dataset, hierarchy, Layout::Full)?;
        let reduced_site_weights = fit_layout(fitter, dataset, hierarchy, Layout::Reduced)?;
        let reconciled_site_weights = reconcile(full_weights.view(), hierarchy)?;
        Ok(Self {
            n_rows: dataset.len(),
            true_full_weights: hierarchy.full_weights(),
            true_site_weights: hierarchy.site_weights(),
            full_weights,
            reconciled_site_weights,
            reduced_site_weights,
        })
    }

    /// Largest per-site disagreement between the reconciled full fit and the reduced fit.
    pub fn max_reconciliation_gap(&self) -> f64 {
        max_abs_difference(&self.reconciled_site_weights, &self.reduced_site_weights)
    }

    /// Largest per-site error of the reduced fit against the generating logits.
    pub fn max_recovery_error(&self) -> f64 {
        max_abs_difference(&self.reduced_site_weights, &self.true_site_weights)
    }
}

fn max_abs_difference(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    Zip::from(a)
        .and(b)
        .fold(0.0_f64, |acc, &x, &y| acc.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchySpec;
    use crate::logit::{logit_to_rate, rate_to_logit};
    use crate::simulate::{Observation, generate_dataset_seeded};
    use crate::stats::EmpiricalRates;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn moderate_hierarchy() -> Hierarchy {
        Hierarchy::from_spec(&HierarchySpec {
            cluster_probabilities: vec![0.3, 0.3, 0.4],
            baseline_rates: vec![0.2, 0.6, 0.35],
            site_probabilities: vec![vec![0.25; 4], vec![0.5, 0.5], vec![0.2, 0.3, 0.5]],
            site_offsets: vec![
                vec![0.0, 1.5, 0.0, -0.5],
                vec![0.0, -1.0],
                vec![0.5, 0.0, 0.0],
            ],
        })
        .unwrap()
    }

    #[test]
    fn single_column_fit_recovers_the_label_log_odds() {
        let n = 1000;
        let x = Array2::<f64>::ones((n, 1));
        let y = Array1::from_shape_fn(n, |i| if i % 10 < 3 { 1.0 } else { 0.0 });
        let beta = IrlsFitter::default().fit(x.view(), y.view()).unwrap();
        assert_eq!(beta.len(), 1);
        assert_abs_diff_eq!(beta[0], rate_to_logit(0.3).unwrap(), epsilon = 1e-3);
    }

    #[test]
    fn reduced_fit_matches_empirical_site_logits() {
        let h = moderate_hierarchy();
        let data = generate_dataset_seeded(&h, 20_000, 12);
        let fitted = fit_layout(&IrlsFitter::default(), &data, &h, Layout::Reduced).unwrap();
        let empirical = EmpiricalRates::from_dataset(&data, &h).unwrap();
        for (flat, freq) in empirical.site_frequencies().into_iter().enumerate() {
            let freq = freq.unwrap();
            assert_abs_diff_eq!(logit_to_rate(fitted[flat]), freq, epsilon = 1e-3);
        }
    }

    #[test]
    fn reconciled_full_fit_agrees_with_reduced_fit() {
        let h = moderate_hierarchy();
        let data = generate_dataset_seeded(&h, 20_000, 5);
        let report = FitReport::compute(&IrlsFitter::default(), &data, &h).unwrap();

        assert_eq!(report.full_weights.len(), h.full_width());
        assert_eq!(report.reduced_site_weights.len(), h.n_sites());
        assert!(
            report.max_reconciliation_gap() < 1e-2,
            "gap {}",
            report.max_reconciliation_gap()
        );
        assert!(
            report.max_recovery_error() < 0.35,
            "error {}",
            report.max_recovery_error()
        );
    }

    #[test]
    fn invalid_inputs_are_reported() {
        let fitter = IrlsFitter::default();
        let x = Array2::<f64>::ones((3, 2));

        let err = fitter.fit(x.view(), array![0.0, 1.0].view()).unwrap_err();
        assert!(matches!(
            err,
            FitError::DimensionMismatch { rows: 3, labels: 2 }
        ));

        let err = fitter.fit(x.view(), array![0.0, 0.5, 1.0].view()).unwrap_err();
        assert!(matches!(err, FitError::NonBinaryLabel { index: 1, .. }));

        let empty = Array2::<f64>::zeros((0, 2));
        let err = fitter.fit(empty.view(), Array1::<f64>::zeros(0).view()).unwrap_err();
        assert!(matches!(err, FitError::EmptyDesign { .. }));

        let bad = IrlsFitter::new(FitConfig {
            ridge: -1.0,
            ..FitConfig::default()
        });
        let err = bad.fit(x.view(), array![0.0, 1.0, 1.0].view()).unwrap_err();
        assert!(matches!(err, FitError::InvalidConfig(_)));
    }

    #[test]
    fn deviance_of_perfect_predictions_is_near_zero() {
        let y = array![0.0, 1.0, 1.0];
        let good = array![1e-9, 1.0 - 1e-9, 1.0 - 1e-9];
        let bad = array![0.5, 0.5, 0.5];
        assert!(calculate_deviance(y.view(), &good) < 1e-6);
        assert_abs_diff_eq!(
            calculate_deviance(y.view(), &bad),
            6.0 * (2.0f64).ln(),
            epsilon = 1e-12
        );
    }

    struct WrongWidth;

    impl LogisticFitter for WrongWidth {
        type Error = FitError;

        fn fit(&self, _x: ArrayView2<f64>, _y: ArrayView1<f64>) -> Result<Array1<f64>, FitError> {
            Ok(Array1::zeros(1))
        }
    }

    #[derive(Debug, Error)]
    #[error("solver exploded: {0}")]
    struct Exploded(&'static str);

    struct AlwaysFails;

    impl LogisticFitter for AlwaysFails {
        type Error = Exploded;

        fn fit(&self, _x: ArrayView2<f64>, _y: ArrayView1<f64>) -> Result<Array1<f64>, Exploded> {
            Err(Exploded("ill-conditioned"))
        }
    }

    #[test]
    fn adapter_contract_is_enforced_and_failures_pass_through() {
        let h = moderate_hierarchy();
        let data = Dataset::new(vec![Observation {
            cluster: 0,
            site: 1,
            label: 1,
        }]);

        let err = fit_layout(&WrongWidth, &data, &h, Layout::Full).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::WidthMismatch {
                found: 1,
                expected: 12
            }
        ));

        let err = fit_layout(&AlwaysFails, &data, &h, Layout::Reduced).unwrap_err();
        assert_eq!(err.to_string(), "solver exploded: ill-conditioned");
        assert!(matches!(err, RecoveryError::Adapter(Exploded("ill-conditioned"))));
    }
}
