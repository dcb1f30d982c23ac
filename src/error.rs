use thiserror::Error;

use crate::fit::FitIssue;

/// Failures that abort a stage.
///
/// Degenerate fits are not errors, they are recorded on the fit as a [`FitIssue`]. Missing
/// values are carried as `None` in the table and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("stage `{stage}`: column `{column}` not found")]
    MissingColumn { stage: String, column: String },

    #[error("column `{column}` is not a {expected} column")]
    ColumnType {
        column: String,
        expected: &'static str,
    },

    #[error("column `{column}` has {found} rows but the table has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("column `{column}` belongs to `{owner}` and cannot be written by `{writer}`")]
    ColumnOwned {
        column: String,
        owner: String,
        writer: String,
    },

    #[error("column `{column}` is an identity or grouping column and cannot be replaced")]
    ProtectedColumn { column: String },

    #[error("column `{column}`, row {row}: `{value}` is not a number")]
    ParseNumber {
        column: String,
        row: usize,
        value: String,
    },

    #[error("standards table has more than one entry for `{key}`")]
    DuplicateStandard { key: String },

    #[error("stage `{stage}`: more than one candidate model labelled `{label}`")]
    DuplicateLabel { stage: String, label: String },

    #[error("stage `{stage}` has not been fitted")]
    UnknownStage { stage: String },

    #[error("stage `{stage}`: no calibration labelled `{label}`")]
    UnknownCalibration { stage: String, label: String },

    #[error("stage `{stage}`: calibration `{label}` is invalid for group `{group}`: {issue}")]
    InvalidCalibration {
        stage: String,
        label: String,
        group: String,
        issue: FitIssue,
    },

    #[error("stage `{stage}`: `{target}` is neither the response nor a predictor of `{label}`")]
    UnsupportedTarget {
        stage: String,
        label: String,
        target: String,
    },

    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn missing_column(stage: &str, column: &str) -> Self {
        Self::MissingColumn {
            stage: stage.to_owned(),
            column: column.to_owned(),
        }
    }
}
