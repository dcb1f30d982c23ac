//! Fit every candidate model of a stage to the calibration subset of the peak table.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Inverse, LeastSquaresSvd};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::diagnostics::{assess, Diagnostics};
use crate::loess::Loess;
use crate::math::{design_matrix, vandermonde};
use crate::model::{CalibrationModelSpec, ModelForm};
use crate::outlier::OUTLIER_COLUMN;
use crate::table::{Column, ColumnOwner, PeakTable};
use crate::{Error, Result};

/// Why a fit cannot be used
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum FitIssue {
    /// Fewer usable rows than free parameters
    InsufficientRows { rows: usize, parameters: usize },
    /// The design matrix is not of full column rank
    Singular { rank: usize, parameters: usize },
    /// A coefficient or fitted value is not finite
    NonFinite,
    /// No residual degrees of freedom remain
    NoResidualDf,
    /// The local regression could not be evaluated
    SmoothingFailed,
}

impl fmt::Display for FitIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientRows { rows, parameters } => {
                write!(f, "{rows} usable rows for {parameters} parameters")
            }
            Self::Singular { rank, parameters } => {
                write!(f, "design matrix has rank {rank} for {parameters} parameters")
            }
            Self::NonFinite => write!(f, "non-finite coefficients"),
            Self::NoResidualDf => write!(f, "no residual degrees of freedom"),
            Self::SmoothingFailed => write!(f, "local regression failed"),
        }
    }
}

/// Which rows of the table feed a stage's fits
///
/// A row is used when its grouping-key value is listed in `groups` (or `groups` is empty),
/// every column in `require` is true, and, if `exclude_outliers` is set, it is not flagged by
/// the outlier marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseInCalibration {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default = "exclude_outliers_default")]
    pub exclude_outliers: bool,
}

const fn exclude_outliers_default() -> bool {
    true
}

impl Default for UseInCalibration {
    fn default() -> Self {
        Self {
            groups: vec![],
            require: vec![],
            exclude_outliers: true,
        }
    }
}

impl UseInCalibration {
    #[must_use]
    pub fn groups(groups: &[&str]) -> Self {
        Self {
            groups: groups.iter().map(|&g| g.to_owned()).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn requiring(mut self, column: &str) -> Self {
        self.require.push(column.to_owned());
        self
    }

    #[must_use]
    pub const fn keep_outliers(mut self) -> Self {
        self.exclude_outliers = false;
        self
    }

    /// Evaluate the predicate for every row
    ///
    /// Missing flags count as false. A table that was never outlier-marked has no outliers.
    ///
    /// # Errors
    /// [`Error::MissingColumn`] if the grouping key or a required flag column is absent.
    pub fn evaluate(&self, table: &PeakTable, stage: &str) -> Result<Vec<bool>> {
        let mut mask = vec![true; table.num_rows()];

        if !self.groups.is_empty() {
            let groups = table.groups(stage)?;
            for (used, group) in mask.iter_mut().zip(groups) {
                *used &= group.map_or(false, |group| self.groups.contains(&group));
            }
        }

        for column in &self.require {
            let flags = match table.column(column) {
                Some(Column::Flag(flags)) => flags,
                Some(_) => {
                    return Err(Error::ColumnType {
                        column: column.clone(),
                        expected: "flag",
                    })
                }
                None => return Err(Error::missing_column(stage, column)),
            };
            for (used, flag) in mask.iter_mut().zip(flags) {
                *used &= flag.unwrap_or(false);
            }
        }

        if self.exclude_outliers {
            if let Some(outliers) = table.flag(OUTLIER_COLUMN) {
                for (used, outlier) in mask.iter_mut().zip(outliers) {
                    *used &= !outlier.unwrap_or(false);
                }
            }
        }
        Ok(mask)
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Estimate {
    /// Least squares coefficients with the unscaled covariance `(XᵀX)⁻¹`
    LeastSquares {
        coefficients: Array1<f64>,
        xtx_inv: Array2<f64>,
    },
    Smoothed(Loess),
}

/// One fitted (model spec, group) pair. Immutable once built.
#[derive(Clone, Debug)]
pub struct FittedCalibration {
    stage: String,
    spec: CalibrationModelSpec,
    group: Option<String>,
    estimate: Option<Estimate>,
    diagnostics: Diagnostics,
    issue: Option<FitIssue>,
    fit_rows: Vec<usize>,
    residuals: Vec<f64>,
}

impl FittedCalibration {
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.spec.label
    }

    #[must_use]
    pub const fn spec(&self) -> &CalibrationModelSpec {
        &self.spec
    }

    /// Value of the model's `group_by` column, `None` for a global fit
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.issue.is_none()
    }

    #[must_use]
    pub const fn issue(&self) -> Option<FitIssue> {
        self.issue
    }

    #[must_use]
    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Table rows the model was fitted to
    #[must_use]
    pub fn fit_rows(&self) -> &[usize] {
        &self.fit_rows
    }

    /// In-sample residuals, in the order of [`Self::fit_rows`]
    #[must_use]
    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    /// Coefficients of a least squares fit, in the order of the form's term names
    #[must_use]
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        match &self.estimate {
            Some(Estimate::LeastSquares { coefficients, .. }) => Some(coefficients),
            _ => None,
        }
    }

    /// Coefficient covariance `σ² (XᵀX)⁻¹`
    #[must_use]
    pub fn covariance(&self) -> Option<Array2<f64>> {
        let sigma = self.diagnostics.residual_sd?;
        match &self.estimate {
            Some(Estimate::LeastSquares { xtx_inv, .. }) => Some(xtx_inv * sigma.powi(2)),
            _ => None,
        }
    }

    pub(crate) const fn estimate(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    /// Evaluate the fitted model at predictor values ordered as the form's predictors
    #[must_use]
    pub fn predict(&self, x: &[f64]) -> Option<f64> {
        if x.iter().any(|v| !v.is_finite()) {
            return None;
        }
        match self.estimate.as_ref()? {
            Estimate::LeastSquares { coefficients, .. } => {
                let row = self.spec.form.design_row(x)?;
                Some(row.iter().zip(coefficients).map(|(a, b)| a * b).sum())
            }
            Estimate::Smoothed(loess) => loess.predict(x[0]),
        }
    }
}

/// Every fit of one stage, sorted by label then group so the result does not depend on the
/// order in which fits completed.
#[derive(Clone, Debug)]
pub struct StageCalibration {
    stage: String,
    fits: Vec<FittedCalibration>,
    use_in_calibration: Vec<bool>,
}

impl StageCalibration {
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// All fits, valid or not
    #[must_use]
    pub fn fits(&self) -> &[FittedCalibration] {
        &self.fits
    }

    /// The rows the stage's predicate admitted
    #[must_use]
    pub fn use_in_calibration(&self) -> &[bool] {
        &self.use_in_calibration
    }

    /// The column recording which rows fed this stage
    #[must_use]
    pub fn use_column(&self) -> String {
        format!("{}_in_calib", self.stage)
    }

    /// Write the `<stage>_in_calib` flag column
    ///
    /// # Errors
    /// Fails if the column name is owned by somebody else.
    pub fn record(&self, table: &mut PeakTable) -> Result<()> {
        let flags = self.use_in_calibration.iter().map(|&u| Some(u)).collect();
        table.insert(
            ColumnOwner::Stage(self.stage.clone()),
            &self.use_column(),
            Column::Flag(flags),
        )
    }

    /// All fits sharing `label`, one per group
    ///
    /// # Errors
    /// [`Error::UnknownCalibration`] if there is no such label, [`Error::InvalidCalibration`]
    /// if any of its group fits is invalid.
    pub fn select(&self, label: &str) -> Result<Vec<&FittedCalibration>> {
        let fits = self
            .fits
            .iter()
            .filter(|fit| fit.label() == label)
            .collect::<Vec<_>>();
        if fits.is_empty() {
            return Err(Error::UnknownCalibration {
                stage: self.stage.clone(),
                label: label.to_owned(),
            });
        }
        if let Some(invalid) = fits.iter().find(|fit| !fit.is_valid()) {
            return Err(Error::InvalidCalibration {
                stage: self.stage.clone(),
                label: label.to_owned(),
                group: invalid.group().unwrap_or("all").to_owned(),
                issue: invalid.issue.unwrap_or(FitIssue::NonFinite),
            });
        }
        Ok(fits)
    }
}

/// Fit every spec of `stage` on the rows admitted by `use_in_calibration`.
///
/// Specs with a `group_by` column get one fit per group value present among the used rows,
/// other specs are fitted once. Degenerate fits are kept and marked invalid.
///
/// # Errors
/// Structural problems abort the stage: duplicated labels, missing or mistyped columns.
pub fn fit_stage(
    table: &PeakTable,
    stage: &str,
    specs: &[CalibrationModelSpec],
    use_in_calibration: &UseInCalibration,
    config: &Config,
) -> Result<StageCalibration> {
    let mut labels = HashSet::new();
    for spec in specs {
        if !labels.insert(spec.label.as_str()) {
            return Err(Error::DuplicateLabel {
                stage: stage.to_owned(),
                label: spec.label.clone(),
            });
        }
        table.require_numeric(stage, &spec.response)?;
        for predictor in spec.form.predictors() {
            table.require_numeric(stage, predictor)?;
        }
        if let Some(group_by) = &spec.group_by {
            table.require_keys(stage, group_by)?;
        }
    }

    let mask = use_in_calibration.evaluate(table, stage)?;
    let num_used = mask.iter().filter(|&&used| used).count();
    info!(
        "stage `{stage}`: fitting {} candidate models on {num_used} of {} rows",
        specs.len(),
        table.num_rows()
    );

    let mut jobs = vec![];
    for spec in specs {
        match &spec.group_by {
            Some(group_by) => {
                let keys = table.require_keys(stage, group_by)?;
                let groups = keys
                    .iter()
                    .zip(&mask)
                    .filter(|(_, &used)| used)
                    .filter_map(|(key, _)| key.clone())
                    .collect::<BTreeSet<_>>();
                if groups.is_empty() {
                    warn!(
                        "stage `{stage}`: `{}` has no used rows with a `{group_by}` value",
                        spec.label
                    );
                }
                jobs.extend(groups.into_iter().map(|group| (spec, Some(group))));
            }
            None => jobs.push((spec, None)),
        }
    }

    let run = |(spec, group): (&CalibrationModelSpec, Option<String>)| {
        fit_one(table, stage, spec, group, &mask, config)
    };
    let mut fits = if config.parallel {
        jobs.into_par_iter().map(run).collect::<Result<Vec<_>>>()?
    } else {
        jobs.into_iter().map(run).collect::<Result<Vec<_>>>()?
    };
    fits.sort_by(|a, b| (a.label(), a.group()).cmp(&(b.label(), b.group())));

    Ok(StageCalibration {
        stage: stage.to_owned(),
        fits,
        use_in_calibration: mask,
    })
}

/// Rows of `mask` inside `group` with a finite response and predictors
fn usable_rows(
    table: &PeakTable,
    stage: &str,
    spec: &CalibrationModelSpec,
    group: Option<&str>,
    mask: &[bool],
) -> Result<(Vec<usize>, Vec<Vec<f64>>, Vec<f64>)> {
    let response = table.require_numeric(stage, &spec.response)?;
    let predictors = spec
        .form
        .predictors()
        .into_iter()
        .map(|name| table.require_numeric(stage, name))
        .collect::<Result<Vec<_>>>()?;
    let keys = match (&spec.group_by, group) {
        (Some(group_by), Some(_)) => Some(table.require_keys(stage, group_by)?),
        _ => None,
    };

    let mut rows = vec![];
    let mut xs = vec![];
    let mut ys = vec![];
    for (row, &used) in mask.iter().enumerate() {
        if !used {
            continue;
        }
        if let Some(keys) = &keys {
            if keys[row].as_deref() != group {
                continue;
            }
        }
        let Some(y) = response[row].filter(|y| y.is_finite()) else {
            continue;
        };
        let x = predictors
            .iter()
            .map(|column| column[row].filter(|x| x.is_finite()))
            .collect::<Option<Vec<_>>>();
        if let Some(x) = x {
            rows.push(row);
            xs.push(x);
            ys.push(y);
        }
    }
    Ok((rows, xs, ys))
}

fn fit_one(
    table: &PeakTable,
    stage: &str,
    spec: &CalibrationModelSpec,
    group: Option<String>,
    mask: &[bool],
    config: &Config,
) -> Result<FittedCalibration> {
    let (fit_rows, xs, ys) = usable_rows(table, stage, spec, group.as_deref(), mask)?;
    let parameters = spec.form.num_parameters();

    let mut fitted = FittedCalibration {
        stage: stage.to_owned(),
        spec: spec.clone(),
        group,
        estimate: None,
        diagnostics: Diagnostics::empty(fit_rows.len()),
        issue: None,
        fit_rows,
        residuals: vec![],
    };

    if ys.len() < parameters {
        fitted.issue = Some(FitIssue::InsufficientRows {
            rows: ys.len(),
            parameters,
        });
        warn!(
            "stage `{stage}`: `{}` ({}) is invalid: {}",
            spec.label,
            fitted.group().unwrap_or("all"),
            fitted.issue.unwrap_or(FitIssue::NonFinite)
        );
        return Ok(fitted);
    }

    let estimate = match &spec.form {
        ModelForm::Smoothed { span, .. } => {
            let x = xs.iter().map(|x| x[0]).collect();
            Loess::fit(x, ys.clone(), span.unwrap_or(config.loess_span)).map(Estimate::Smoothed)
        }
        form => least_squares(form, &xs, &ys, config.rank_tolerance)?,
    };
    let estimate = match estimate {
        Ok(estimate) => estimate,
        Err(issue) => {
            fitted.issue = Some(issue);
            warn!(
                "stage `{stage}`: `{}` ({}) is invalid: {issue}",
                spec.label,
                fitted.group().unwrap_or("all")
            );
            return Ok(fitted);
        }
    };

    fitted.estimate = Some(estimate);

    let (predictions, effective_parameters) = match fitted.estimate() {
        Some(Estimate::Smoothed(loess)) => (loess.fitted().to_vec(), loess.trace()),
        _ => (
            xs.iter()
                .map(|x| fitted.predict(x).unwrap_or(f64::NAN))
                .collect::<Vec<_>>(),
            f64::from(u32::try_from(parameters).unwrap_or(u32::MAX)),
        ),
    };
    fitted.residuals = ys.iter().zip(&predictions).map(|(y, p)| y - p).collect();

    let (diagnostics, issue) = assess(&fitted, &ys, &predictions, effective_parameters);
    fitted.diagnostics = diagnostics;
    fitted.issue = issue;

    match issue {
        Some(issue) => warn!(
            "stage `{stage}`: `{}` ({}) is invalid: {issue}",
            spec.label,
            fitted.group().unwrap_or("all")
        ),
        None => debug!(
            "stage `{stage}`: `{}` ({}) fitted on {} rows, residual sd {:?}",
            spec.formula(),
            fitted.group().unwrap_or("all"),
            ys.len(),
            fitted.diagnostics.residual_sd
        ),
    }
    Ok(fitted)
}

/// Ordinary least squares through an SVD solve.
///
/// Rank deficiency is judged on singular values relative to the largest one. Numerical
/// failures inside LAPACK mark the fit invalid rather than aborting the stage.
fn least_squares(
    form: &ModelForm,
    xs: &[Vec<f64>],
    ys: &[f64],
    rank_tolerance: f64,
) -> Result<std::result::Result<Estimate, FitIssue>> {
    let parameters = form.num_parameters();
    let design = match form {
        ModelForm::Polynomial { degree, .. } => {
            let x = xs.iter().map(|x| x[0]).collect::<Vec<_>>();
            vandermonde(&x, *degree, true)?
        }
        _ => {
            let rows = xs
                .iter()
                .filter_map(|x| form.design_row(x))
                .collect::<Vec<_>>();
            design_matrix(&rows, parameters)?
        }
    };
    let response = Array1::from(ys.to_vec());

    let solution = match design.least_squares(&response) {
        Ok(solution) => solution,
        Err(e) => {
            debug!("least squares solve failed: {e}");
            return Ok(Err(FitIssue::Singular {
                rank: 0,
                parameters,
            }));
        }
    };

    let largest = solution
        .singular_values
        .iter()
        .fold(0f64, |acc, &s| acc.max(s));
    let rank = solution
        .singular_values
        .iter()
        .filter(|&&s| s > rank_tolerance * largest)
        .count();
    if rank < parameters || largest == 0. {
        return Ok(Err(FitIssue::Singular { rank, parameters }));
    }

    let coefficients = solution.solution;
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Ok(Err(FitIssue::NonFinite));
    }

    let Ok(xtx_inv) = design.t().dot(&design).inv() else {
        return Ok(Err(FitIssue::Singular { rank, parameters }));
    };

    Ok(Ok(Estimate::LeastSquares {
        coefficients,
        xtx_inv,
    }))
}
