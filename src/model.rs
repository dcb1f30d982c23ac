//! Candidate regression forms.
//!
//! Each form knows its predictor columns, its number of free parameters and how to turn a
//! row's predictor values into a design row, so validity and degrees-of-freedom checks never
//! depend on inspecting a fitted object.

use std::fmt;

use serde::{Deserialize, Serialize};

const fn default_intercept() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ModelForm {
    /// Intercept only, the group mean of the response
    Constant,
    /// Straight line, optionally forced through the origin
    Linear {
        predictor: String,
        #[serde(default = "default_intercept")]
        intercept: bool,
    },
    /// Polynomial with intercept up to `degree`
    Polynomial { predictor: String, degree: usize },
    /// Linear in several predictors, with intercept
    Multiple { predictors: Vec<String> },
    /// Local linear regression with tricube weights over a `span` fraction of the points
    Smoothed {
        predictor: String,
        #[serde(default)]
        span: Option<f64>,
    },
}

impl ModelForm {
    #[must_use]
    pub fn predictors(&self) -> Vec<&str> {
        match self {
            Self::Constant => vec![],
            Self::Linear { predictor, .. }
            | Self::Polynomial { predictor, .. }
            | Self::Smoothed { predictor, .. } => vec![predictor.as_str()],
            Self::Multiple { predictors } => predictors.iter().map(String::as_str).collect(),
        }
    }

    /// Free parameters of the form. A local linear smoother needs two points per local fit.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        match self {
            Self::Constant => 1,
            Self::Linear { intercept, .. } => 1 + usize::from(*intercept),
            Self::Polynomial { degree, .. } => degree + 1,
            Self::Multiple { predictors } => predictors.len() + 1,
            Self::Smoothed { .. } => 2,
        }
    }

    #[must_use]
    pub const fn has_intercept(&self) -> bool {
        !matches!(
            self,
            Self::Linear {
                intercept: false,
                ..
            }
        )
    }

    /// Names of the fitted coefficients, in design-row order
    #[must_use]
    pub fn term_names(&self) -> Vec<String> {
        let intercept = "(Intercept)".to_owned();
        match self {
            Self::Constant => vec![intercept],
            Self::Linear {
                predictor,
                intercept: true,
            } => vec![intercept, predictor.clone()],
            Self::Linear { predictor, .. } => vec![predictor.clone()],
            Self::Polynomial { predictor, degree } => std::iter::once(intercept)
                .chain((1..=*degree).map(|power| {
                    if power == 1 {
                        predictor.clone()
                    } else {
                        format!("{predictor}^{power}")
                    }
                }))
                .collect(),
            Self::Multiple { predictors } => std::iter::once(intercept)
                .chain(predictors.iter().cloned())
                .collect(),
            Self::Smoothed { .. } => vec![],
        }
    }

    /// Design row for the predictor values of one peak, in the order of [`Self::predictors`]
    ///
    /// `None` for the smoothing form, which is not linear in a fixed parameter vector.
    #[must_use]
    pub fn design_row(&self, x: &[f64]) -> Option<Vec<f64>> {
        match self {
            Self::Constant => Some(vec![1.]),
            Self::Linear { intercept, .. } => {
                let mut row = if *intercept { vec![1.] } else { vec![] };
                row.push(x[0]);
                Some(row)
            }
            Self::Polynomial { degree, .. } => Some(
                (0..=*degree)
                    .map(|power| x[0].powi(i32::try_from(power).unwrap_or(i32::MAX)))
                    .collect(),
            ),
            Self::Multiple { .. } => Some(std::iter::once(1.).chain(x.iter().copied()).collect()),
            Self::Smoothed { .. } => None,
        }
    }
}

impl fmt::Display for ModelForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant => write!(f, "1"),
            Self::Linear {
                predictor,
                intercept: true,
            } => write!(f, "{predictor}"),
            Self::Linear { predictor, .. } => write!(f, "{predictor} - 1"),
            Self::Polynomial { predictor, degree } => write!(f, "poly({predictor}, {degree})"),
            Self::Multiple { predictors } => write!(f, "{}", predictors.join(" + ")),
            Self::Smoothed {
                predictor,
                span: Some(span),
            } => write!(f, "loess({predictor}, span = {span})"),
            Self::Smoothed { predictor, .. } => write!(f, "loess({predictor})"),
        }
    }
}

/// A named candidate model for one calibration stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModelSpec {
    /// Free-form label, unique within a stage
    pub label: String,
    /// Column the model explains
    pub response: String,
    #[serde(flatten)]
    pub form: ModelForm,
    /// Fit separate coefficients for every value of this column
    #[serde(default)]
    pub group_by: Option<String>,
}

impl CalibrationModelSpec {
    #[must_use]
    pub fn new(label: &str, response: &str, form: ModelForm) -> Self {
        Self {
            label: label.to_owned(),
            response: response.to_owned(),
            form,
            group_by: None,
        }
    }

    #[must_use]
    pub fn grouped_by(mut self, column: &str) -> Self {
        self.group_by = Some(column.to_owned());
        self
    }

    /// The model written as a formula, e.g. `d13C ~ true_d13C`
    #[must_use]
    pub fn formula(&self) -> String {
        format!("{} ~ {}", self.response, self.form)
    }

    /// Every column the model reads
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(self.response.as_str())
            .chain(self.form.predictors())
            .chain(self.group_by.as_deref())
            .collect()
    }
}
