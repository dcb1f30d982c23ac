#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub mod apply;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fit;
pub(crate) mod loess;
pub mod math;
pub mod model;
pub mod outlier;
pub mod pipeline;
pub mod range;
pub mod standards;
pub mod table;

pub use apply::{apply_calibration, ApplyOptions, Propagation};
pub use config::Config;
pub use diagnostics::{filter_valid, FitSummary};
pub use error::Error;
pub use fit::{fit_stage, FitIssue, FittedCalibration, StageCalibration, UseInCalibration};
pub use model::{CalibrationModelSpec, ModelForm};
pub use outlier::{mark_outliers, OutlierRule};
pub use pipeline::Pipeline;
pub use range::{evaluate_range, CalibrationRange};
pub use standards::{match_standards, StandardsTable};
pub use table::{Column, ColumnOwner, PeakTable};

pub type Result<T> = ::std::result::Result<T, Error>;
