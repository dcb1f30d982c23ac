//! Fit quality metrics and the validity filter.
//!
//! Diagnostics are advisory: they help a caller choose between candidates but never pick one.

use serde::Serialize;

use crate::fit::{Estimate, FitIssue, FittedCalibration, StageCalibration};
use crate::math::two_sided_p;
use crate::model::ModelForm;

/// Allowance for the fractional trace of a smoother when checking degrees of freedom
const DF_TOLERANCE: f64 = 1e-9;

/// One coefficient with its significance
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Term {
    pub name: String,
    pub estimate: f64,
    pub std_error: Option<f64>,
    pub t_value: Option<f64>,
    pub p_value: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Rows used for the fit
    pub n: usize,
    /// `n` minus the (effective) number of parameters
    pub df_residual: f64,
    /// √(SSR / df)
    pub residual_sd: Option<f64>,
    /// Coefficient of determination, uncentered when the form has no intercept
    pub r_squared: Option<f64>,
    pub adj_r_squared: Option<f64>,
    /// Gaussian Akaike information criterion
    pub aic: Option<f64>,
    /// Per-coefficient estimates, empty for the smoothing form
    pub terms: Vec<Term>,
}

impl Diagnostics {
    pub(crate) fn empty(n: usize) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }
}

/// Compute diagnostics for `fit` from the responses it was fitted to and its in-sample
/// predictions, together with the reason the fit is unusable, if any.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn assess(
    fit: &FittedCalibration,
    y: &[f64],
    predictions: &[f64],
    effective_parameters: f64,
) -> (Diagnostics, Option<FitIssue>) {
    let form = &fit.spec().form;
    let n = y.len();
    let nf = n as f64;

    let mut issue = None;
    if predictions.iter().any(|p| !p.is_finite()) {
        issue = Some(FitIssue::NonFinite);
    }

    let ssr = y
        .iter()
        .zip(predictions)
        .map(|(y, p)| (y - p).powi(2))
        .sum::<f64>();
    let df_residual = nf - effective_parameters;
    if df_residual < 1. - DF_TOLERANCE {
        issue = issue.or(Some(FitIssue::NoResidualDf));
    }

    let residual_sd = (df_residual > 0. && ssr.is_finite()).then(|| (ssr / df_residual).sqrt());

    let r_squared = match form {
        ModelForm::Constant => Some(0.),
        _ => {
            let sst = if form.has_intercept() {
                let mean = y.iter().sum::<f64>() / nf;
                y.iter().map(|y| (y - mean).powi(2)).sum::<f64>()
            } else {
                y.iter().map(|y| y.powi(2)).sum::<f64>()
            };
            (sst > 0. && ssr.is_finite()).then(|| 1. - ssr / sst)
        }
    };
    let adj_r_squared = r_squared
        .filter(|_| df_residual >= 1. - DF_TOLERANCE)
        .map(|r2| {
            let intercept = if form.has_intercept() { 1. } else { 0. };
            1. - (1. - r2) * (nf - intercept) / df_residual
        });

    let aic = (ssr > 0. && ssr.is_finite()).then(|| {
        nf.mul_add(
            (2. * std::f64::consts::PI).ln() + (ssr / nf).ln() + 1.,
            2. * (effective_parameters + 1.),
        )
    });

    let terms = match fit.estimate() {
        Some(Estimate::LeastSquares {
            coefficients,
            xtx_inv,
        }) => form
            .term_names()
            .into_iter()
            .zip(coefficients)
            .enumerate()
            .map(|(ii, (name, &estimate))| {
                let std_error = residual_sd.map(|sd| sd * xtx_inv[[ii, ii]].sqrt());
                let t_value = std_error.filter(|se| *se > 0.).map(|se| estimate / se);
                let p_value = t_value.and_then(|t| two_sided_p(t, df_residual));
                Term {
                    name,
                    estimate,
                    std_error,
                    t_value,
                    p_value,
                }
            })
            .collect(),
        _ => vec![],
    };

    if fit.coefficients().is_some_and(|c| c.iter().any(|v| !v.is_finite())) {
        issue = Some(FitIssue::NonFinite);
    }

    (
        Diagnostics {
            n,
            df_residual,
            residual_sd,
            r_squared,
            adj_r_squared,
            aic,
            terms,
        },
        issue,
    )
}

/// Drop invalid fits from a candidate set, leaving the rest untouched
#[must_use]
pub fn filter_valid(fits: &[FittedCalibration]) -> Vec<&FittedCalibration> {
    fits.iter().filter(|fit| fit.is_valid()).collect()
}

impl StageCalibration {
    /// The valid fits a caller may select from
    #[must_use]
    pub fn candidates(&self) -> Vec<&FittedCalibration> {
        filter_valid(self.fits())
    }

    /// One summary record per fit, invalid ones included, for reporting
    #[must_use]
    pub fn summary(&self) -> Vec<FitSummary> {
        self.fits().iter().map(FitSummary::from).collect()
    }
}

/// Flat record of a fit for downstream reporting
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FitSummary {
    pub stage: String,
    pub label: String,
    pub formula: String,
    pub group: Option<String>,
    pub valid: bool,
    pub issue: Option<String>,
    #[serde(flatten)]
    pub diagnostics: Diagnostics,
}

impl From<&FittedCalibration> for FitSummary {
    fn from(fit: &FittedCalibration) -> Self {
        Self {
            stage: fit.stage().to_owned(),
            label: fit.label().to_owned(),
            formula: fit.spec().formula(),
            group: fit.group().map(str::to_owned),
            valid: fit.is_valid(),
            issue: fit.issue().map(|issue| issue.to_string()),
            diagnostics: fit.diagnostics().clone(),
        }
    }
}
