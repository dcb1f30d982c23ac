use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::apply::Propagation;
use crate::fit::UseInCalibration;
use crate::model::CalibrationModelSpec;
use crate::outlier::OutlierRule;
use crate::Result;

/// Engine-wide settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Neighbourhood fraction for smoothing specs that do not set their own
    pub loess_span: f64,
    /// How prediction errors are propagated when a stage asks for them
    pub propagation: Propagation,
    /// Fit the (spec, group) pairs of a stage on the rayon thread pool
    pub parallel: bool,
    /// Singular values below this fraction of the largest count as rank deficient
    pub rank_tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loess_span: 0.75,
            propagation: Propagation::DeltaMethod,
            parallel: true,
            rank_tolerance: 1e-10,
        }
    }
}

impl Config {
    /// Read a configuration from a TOML file, absent keys take their defaults
    ///
    /// # Errors
    /// Fails if the file cannot be read or is not valid TOML for this structure.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// A calibration stage declared up front
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub name: String,
    /// Outlier passes run right before this stage is fitted, typically on an earlier stage's
    /// deviation column
    #[serde(default)]
    pub outliers: Vec<OutlierRule>,
    #[serde(default)]
    pub use_in_calibration: UseInCalibration,
    pub models: Vec<CalibrationModelSpec>,
    /// Label of the model to apply; without it the stage stops after fitting
    #[serde(default)]
    pub select: Option<String>,
    /// Column to predict, defaults to the selected model's response
    #[serde(default)]
    pub target: Option<String>,
    /// Columns to range-check besides the model's predictors
    #[serde(default)]
    pub range: Vec<String>,
}

/// A whole calibration chain: engine settings, initial outlier passes and ordered stages
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelinePlan {
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub outliers: Vec<OutlierRule>,
    #[serde(default)]
    pub stages: Vec<StagePlan>,
}

impl PipelinePlan {
    /// Read a plan from a TOML file
    ///
    /// # Errors
    /// Fails if the file cannot be read or does not describe a plan.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::{Config, PipelinePlan};
    use crate::apply::Propagation;
    use crate::model::ModelForm;
    use crate::outlier::OutlierRule;
    use crate::Result;

    #[test]
    fn missing_keys_take_defaults() -> Result<()> {
        let config: Config = toml::from_str("parallel = false")?;
        assert!(!config.parallel);
        approx::assert_relative_eq!(config.loess_span, 0.75);
        assert_eq!(config.propagation, Propagation::DeltaMethod);
        Ok(())
    }

    #[test]
    fn config_is_read_from_disk() -> Result<()> {
        let dir = TempDir::new("config_is_read_from_disk")?;
        let path = dir.path().join("isocal.toml");
        std::fs::write(
            &path,
            "loess_span = 0.5\n[propagation]\nmethod = \"monte_carlo\"\nsamples = 250\n",
        )?;
        let config = Config::from_file(&path)?;
        assert_eq!(config.propagation, Propagation::MonteCarlo { samples: 250 });
        approx::assert_relative_eq!(config.loess_span, 0.5);
        Ok(())
    }

    #[test]
    fn plans_describe_outlier_passes_and_stages() -> Result<()> {
        let dir = TempDir::new("plans_describe_outlier_passes_and_stages")?;
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            r#"
            [[outliers]]
            rule = "deviation"
            column = "d13C"
            k = 3.0

            [[stages]]
            name = "drift"
            select = "lin"
            use_in_calibration = { groups = ["drift"] }

            [[stages.models]]
            label = "mean"
            response = "d13C"
            form = "constant"

            [[stages.models]]
            label = "lin"
            response = "d13C"
            form = "linear"
            predictor = "time"
            "#,
        )?;
        let plan = PipelinePlan::from_file(&path)?;
        assert_eq!(plan.outliers, vec![OutlierRule::deviation("d13C", 3.)]);
        let stage = &plan.stages[0];
        assert_eq!(stage.select.as_deref(), Some("lin"));
        assert!(stage.use_in_calibration.exclude_outliers);
        assert!(stage.outliers.is_empty());
        assert_eq!(
            stage.models[1].form,
            ModelForm::Linear {
                predictor: "time".into(),
                intercept: true
            }
        );
        Ok(())
    }
}
