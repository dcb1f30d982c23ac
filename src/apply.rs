//! Apply a selected calibration to every row of the table.
//!
//! The applier predicts its target for all rows, standards and samples alike. When the target
//! is the model's response the fitted expression is evaluated directly. When the target is a
//! predictor of a linear model (the usual `measured ~ true` calibration) the fitted relation is
//! solved for that predictor instead.

use std::collections::HashMap;

use log::{debug, info, warn};
use ndarray::{Array, Array1, Array2, Axis};
use ndarray_linalg::{Cholesky, Eigh, UPLO};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_isaac::Isaac64Rng;
use serde::{Deserialize, Serialize};

use crate::fit::{Estimate, FittedCalibration, StageCalibration};
use crate::math::sample_sd;
use crate::model::ModelForm;
use crate::table::{Column, ColumnOwner, PeakTable};
use crate::{Error, Result};

/// Error propagation strategy for predictions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Propagation {
    /// Just compute the central value, ignoring error
    None,
    /// First-order propagation of the coefficient covariance, `√(gᵀ Σ g)`
    DeltaMethod,
    /// Draw `samples` coefficient vectors from N(β, Σ) and take the SD of the predictions
    MonteCarlo { samples: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Column to predict, the model's response when `None`
    pub target: Option<String>,
    pub propagation: Propagation,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            target: None,
            propagation: Propagation::None,
        }
    }
}

impl ApplyOptions {
    #[must_use]
    pub fn predict(target: &str) -> Self {
        Self {
            target: Some(target.to_owned()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_error(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }
}

/// The columns one application of a calibration appended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppliedCalibration {
    pub stage: String,
    pub label: String,
    pub target: String,
    pub prediction: String,
    pub deviation: Option<String>,
    pub standard_error: Option<String>,
}

impl AppliedCalibration {
    /// Every column declared by this application
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(self.prediction.as_str())
            .chain(self.deviation.as_deref())
            .chain(self.standard_error.as_deref())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    /// Evaluate the model for its response
    Forward,
    /// Solve for the predictor at this position of the design row
    Inverse { design_index: usize, predictor: usize },
}

/// A matrix `F` with `F Fᵀ = Σ`.
///
/// This is the Cholesky factor when `Σ` is positive definite. A covariance that is only
/// semi-definite, as after an exact fit, falls back to `V √Λ` from its eigendecomposition with
/// negative eigenvalues clamped to zero.
fn covariance_factor(covariance: &Array2<f64>) -> Option<Array2<f64>> {
    if let Ok(lower) = covariance.cholesky(UPLO::Lower) {
        return Some(lower);
    }
    let (values, vectors) = covariance.eigh(UPLO::Lower).ok()?;
    let roots = values.mapv(|v| v.max(0.).sqrt());
    Some(vectors * &roots.insert_axis(Axis(0)))
}

/// Everything needed to evaluate one group's fit row by row
struct Evaluator<'a> {
    fit: &'a FittedCalibration,
    /// Coefficient draws, one row per sample
    draws: Option<Array2<f64>>,
}

impl<'a> Evaluator<'a> {
    fn new(fit: &'a FittedCalibration, propagation: Propagation, seed: u64) -> Self {
        let draws = match (propagation, fit.coefficients(), fit.covariance()) {
            (Propagation::MonteCarlo { samples }, Some(coefficients), Some(covariance))
                if samples > 1 =>
            {
                let factor = covariance_factor(&covariance);
                if factor.is_none() {
                    warn!(
                        "`{}` ({}): coefficient covariance cannot be factored, no standard errors",
                        fit.label(),
                        fit.group().unwrap_or("all")
                    );
                }
                factor.map(|factor| {
                    let mut rng = Isaac64Rng::seed_from_u64(seed);
                    let z: Array2<f64> = Array::random_using(
                        (samples, coefficients.len()),
                        StandardNormal,
                        &mut rng,
                    );
                    z.dot(&factor.t()) + coefficients.view().insert_axis(Axis(0))
                })
            }
            _ => None,
        };
        Self { fit, draws }
    }

    /// Prediction and its standard error. `x` is ordered as the form's predictors; for an
    /// inverse prediction `y` is the observed response and `x[predictor]` is ignored.
    fn evaluate(
        &self,
        direction: Direction,
        x: &[f64],
        y: Option<f64>,
        propagation: Propagation,
    ) -> (Option<f64>, Option<f64>) {
        match direction {
            Direction::Forward => {
                let prediction = self.fit.predict(x);
                let se = prediction.and_then(|_| self.forward_se(x, propagation));
                (prediction, se)
            }
            Direction::Inverse {
                design_index,
                predictor,
            } => {
                let Some(y) = y else {
                    return (None, None);
                };
                let Some(coefficients) = self.fit.coefficients() else {
                    return (None, None);
                };
                let form = &self.fit.spec().form;
                let prediction = solve_for(form, coefficients, design_index, predictor, x, y);
                let se = prediction.and_then(|value| {
                    self.inverse_se(design_index, predictor, x, y, value, propagation)
                });
                (prediction, se)
            }
        }
    }

    fn forward_se(&self, x: &[f64], propagation: Propagation) -> Option<f64> {
        match (propagation, self.fit.estimate()?) {
            (Propagation::None, _) => None,
            (_, Estimate::Smoothed(loess)) => {
                Some(self.fit.diagnostics().residual_sd? * loess.leverage_norm(x[0])?)
            }
            (Propagation::DeltaMethod, Estimate::LeastSquares { .. }) => {
                let row = Array1::from(self.fit.spec().form.design_row(x)?);
                let covariance = self.fit.covariance()?;
                Some(row.dot(&covariance.dot(&row)).max(0.).sqrt())
            }
            (Propagation::MonteCarlo { .. }, Estimate::LeastSquares { .. }) => {
                let row = Array1::from(self.fit.spec().form.design_row(x)?);
                let predictions = self.draws.as_ref()?.dot(&row);
                sample_sd(&predictions.to_vec())
            }
        }
    }

    fn inverse_se(
        &self,
        design_index: usize,
        predictor: usize,
        x: &[f64],
        y: f64,
        value: f64,
        propagation: Propagation,
    ) -> Option<f64> {
        let form = &self.fit.spec().form;
        match propagation {
            Propagation::None => None,
            Propagation::DeltaMethod => {
                // ∂x/∂β = -d(x̂) / β_t
                let coefficients = self.fit.coefficients()?;
                let mut filled = x.to_vec();
                filled[predictor] = value;
                let gradient =
                    Array1::from(form.design_row(&filled)?) / -coefficients[design_index];
                let covariance = self.fit.covariance()?;
                Some(gradient.dot(&covariance.dot(&gradient)).max(0.).sqrt())
            }
            Propagation::MonteCarlo { .. } => {
                let solutions = self
                    .draws
                    .as_ref()?
                    .outer_iter()
                    .filter_map(|draw| {
                        solve_for(form, &draw.to_owned(), design_index, predictor, x, y)
                    })
                    .collect::<Vec<_>>();
                sample_sd(&solutions)
            }
        }
    }
}

/// Solve `y = Σ βₖ dₖ` for the predictor sitting at `design_index` of the design row
fn solve_for(
    form: &ModelForm,
    coefficients: &Array1<f64>,
    design_index: usize,
    predictor: usize,
    x: &[f64],
    y: f64,
) -> Option<f64> {
    let slope = coefficients[design_index];
    if slope == 0. || !y.is_finite() {
        return None;
    }
    let mut known = x.to_vec();
    known[predictor] = 0.;
    if known.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let rest = form
        .design_row(&known)?
        .iter()
        .zip(coefficients)
        .enumerate()
        .filter(|(ii, _)| *ii != design_index)
        .map(|(_, (d, b))| d * b)
        .sum::<f64>();
    let value = (y - rest) / slope;
    value.is_finite().then_some(value)
}

fn direction(stage: &str, fit: &FittedCalibration, target: &str) -> Result<Direction> {
    let spec = fit.spec();
    if target == spec.response {
        return Ok(Direction::Forward);
    }
    let unsupported = || Error::UnsupportedTarget {
        stage: stage.to_owned(),
        label: spec.label.clone(),
        target: target.to_owned(),
    };
    let predictor = spec
        .form
        .predictors()
        .iter()
        .position(|p| *p == target)
        .ok_or_else(unsupported)?;
    match &spec.form {
        ModelForm::Linear { .. } | ModelForm::Multiple { .. } => Ok(Direction::Inverse {
            design_index: predictor + usize::from(spec.form.has_intercept()),
            predictor,
        }),
        _ => Err(unsupported()),
    }
}

/// Predict `options.target` for every row with the fits labelled `label` in `stage`.
///
/// Appends `<target>_pred`, `<target>_dev` (observed minus predicted, where the target column
/// exists) and, when errors are propagated, `<target>_pred_se`, all owned by the stage. Rows
/// with missing inputs, or whose group has no fit, get missing predictions. Applying without
/// propagation over an earlier application of the stage fills its `<target>_pred_se` with
/// missing values.
///
/// # Errors
/// - selection errors if `label` does not exist in the stage or has an invalid group fit
/// - [`Error::UnsupportedTarget`] if the target cannot be predicted by the model
/// - data errors if an input column is absent or an output column belongs to someone else
pub fn apply_calibration(
    table: &mut PeakTable,
    stage: &StageCalibration,
    label: &str,
    options: &ApplyOptions,
) -> Result<AppliedCalibration> {
    let stage_name = stage.stage();
    let fits = stage.select(label)?;
    let spec = fits[0].spec();
    let target = options.target.clone().unwrap_or_else(|| spec.response.clone());
    let direction = direction(stage_name, fits[0], &target)?;

    let observed = match table.column(&target) {
        Some(_) => Some(table.require_numeric(stage_name, &target)?.to_vec()),
        None => None,
    };
    let owner = ColumnOwner::Stage(stage_name.to_owned());
    // an error column left by an earlier application is cleared rather than left stale
    let standard_error = format!("{target}_pred_se");
    let refresh_error = table.owner(&standard_error) == Some(&owner);
    let applied = AppliedCalibration {
        stage: stage_name.to_owned(),
        label: label.to_owned(),
        target: target.clone(),
        prediction: format!("{target}_pred"),
        deviation: observed.as_ref().map(|_| format!("{target}_dev")),
        standard_error: (options.propagation != Propagation::None || refresh_error)
            .then_some(standard_error),
    };

    for column in applied.columns() {
        table.check_writable(&owner, column)?;
    }

    let predictors = spec
        .form
        .predictors()
        .into_iter()
        .map(|name| table.require_numeric(stage_name, name))
        .collect::<Result<Vec<_>>>()?;
    let response = match direction {
        Direction::Forward => None,
        Direction::Inverse { .. } => Some(table.require_numeric(stage_name, &spec.response)?),
    };
    let groups = match &spec.group_by {
        Some(group_by) => Some(table.require_keys(stage_name, group_by)?),
        None => None,
    };

    let mut evaluators = HashMap::new();
    for (ii, fit) in fits.iter().enumerate() {
        let seed = 40 + u64::try_from(ii).unwrap_or(0);
        evaluators.insert(
            fit.group().map(str::to_owned),
            Evaluator::new(fit, options.propagation, seed),
        );
    }

    let num_rows = table.num_rows();
    let mut predictions = Vec::with_capacity(num_rows);
    let mut errors = Vec::with_capacity(num_rows);
    for row in 0..num_rows {
        let group = groups.as_ref().and_then(|groups| groups[row].clone());
        let Some(evaluator) = evaluators.get(&group) else {
            predictions.push(None);
            errors.push(None);
            continue;
        };

        // the solved-for predictor is not needed as an input
        let x = predictors
            .iter()
            .enumerate()
            .map(|(ii, column)| match direction {
                Direction::Inverse { predictor, .. } if predictor == ii => Some(0.),
                _ => column[row],
            })
            .collect::<Option<Vec<_>>>();
        let Some(x) = x else {
            predictions.push(None);
            errors.push(None);
            continue;
        };
        let y = response.and_then(|response| response[row]);
        let (prediction, se) = evaluator.evaluate(direction, &x, y, options.propagation);
        predictions.push(prediction);
        errors.push(se);
    }

    let deviations = observed.map(|observed| {
        observed
            .iter()
            .zip(&predictions)
            .map(|(observed, predicted)| Some((*observed)? - (*predicted)?))
            .collect::<Vec<_>>()
    });

    let num_predicted = predictions.iter().filter(|p| p.is_some()).count();
    table.insert(owner.clone(), &applied.prediction, Column::Numeric(predictions))?;
    if let (Some(name), Some(deviations)) = (&applied.deviation, deviations) {
        table.insert(owner.clone(), name, Column::Numeric(deviations))?;
    }
    if let Some(name) = &applied.standard_error {
        table.insert(owner, name, Column::Numeric(errors))?;
    }

    debug!("stage `{stage_name}`: appended {:?}", applied.columns());
    info!(
        "stage `{stage_name}`: `{label}` predicted `{target}` for {num_predicted} of {num_rows} rows"
    );
    Ok(applied)
}
