//! Stages of a calibration chain sharing one table.
//!
//! Each stage reads whatever earlier stages appended and writes only its own columns. Refitting
//! a stage refreshes those columns in place and leaves every later stage untouched.

use log::info;

use crate::apply::{apply_calibration, AppliedCalibration, ApplyOptions};
use crate::config::{Config, PipelinePlan, StagePlan};
use crate::fit::{fit_stage, FittedCalibration, StageCalibration, UseInCalibration};
use crate::model::CalibrationModelSpec;
use crate::outlier::{mark_outliers, OutlierRule};
use crate::range::{evaluate_range, CalibrationRange};
use crate::standards::{match_standards, StandardsTable};
use crate::table::PeakTable;
use crate::{Error, Result};

#[derive(Debug)]
pub struct Pipeline {
    table: PeakTable,
    config: Config,
    stages: Vec<StageCalibration>,
}

impl Pipeline {
    #[must_use]
    pub const fn new(table: PeakTable, config: Config) -> Self {
        Self {
            table,
            config,
            stages: Vec::new(),
        }
    }

    /// Build a pipeline over `table` and run every outlier pass and stage of `plan` in order
    ///
    /// # Errors
    /// The first structural or selection error aborts the run.
    pub fn from_plan(table: PeakTable, plan: &PipelinePlan) -> Result<Self> {
        let mut pipeline = Self::new(table, plan.config.clone());
        pipeline.run(plan)?;
        Ok(pipeline)
    }

    /// Run the outlier passes and stages of `plan` on this pipeline, keeping its own settings
    ///
    /// # Errors
    /// The first structural or selection error aborts the run.
    pub fn run(&mut self, plan: &PipelinePlan) -> Result<()> {
        for rule in &plan.outliers {
            self.mark_outliers(rule)?;
        }
        for stage in &plan.stages {
            self.run_stage(stage)?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn table(&self) -> &PeakTable {
        &self.table
    }

    #[must_use]
    pub fn into_table(self) -> PeakTable {
        self.table
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Fitted stages in the order they were first fitted
    #[must_use]
    pub fn stages(&self) -> &[StageCalibration] {
        &self.stages
    }

    /// # Errors
    /// [`Error::UnknownStage`] if no stage of that name has been fitted.
    pub fn stage(&self, name: &str) -> Result<&StageCalibration> {
        self.position(name).map(|ii| &self.stages[ii])
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|stage| stage.stage() == name)
            .ok_or_else(|| Error::UnknownStage {
                stage: name.to_owned(),
            })
    }

    /// # Errors
    /// See [`match_standards`].
    pub fn match_standards(&mut self, standards: &StandardsTable, join_key: &str) -> Result<usize> {
        match_standards(&mut self.table, standards, join_key)
    }

    /// Run one outlier pass, grouped on the table's grouping key
    ///
    /// # Errors
    /// See [`mark_outliers`].
    pub fn mark_outliers(&mut self, rule: &OutlierRule) -> Result<usize> {
        let group_key = self.table.group_key().to_owned();
        mark_outliers(&mut self.table, &group_key, rule)
    }

    /// Fit the candidate models of stage `name` and record which rows fed them.
    ///
    /// A stage fitted again replaces its earlier fits.
    ///
    /// # Errors
    /// See [`fit_stage`].
    pub fn fit_stage(
        &mut self,
        name: &str,
        specs: &[CalibrationModelSpec],
        use_in_calibration: &UseInCalibration,
    ) -> Result<&StageCalibration> {
        let stage = fit_stage(&self.table, name, specs, use_in_calibration, &self.config)?;
        stage.record(&mut self.table)?;

        let ii = match self.position(name) {
            Ok(ii) => {
                info!("stage `{name}` refitted");
                self.stages[ii] = stage;
                ii
            }
            Err(_) => {
                self.stages.push(stage);
                self.stages.len() - 1
            }
        };
        Ok(&self.stages[ii])
    }

    /// The fits of calibration `label` in stage `stage`, one per group
    ///
    /// # Errors
    /// [`Error::UnknownStage`], [`Error::UnknownCalibration`] or [`Error::InvalidCalibration`].
    pub fn select(&self, stage: &str, label: &str) -> Result<Vec<&FittedCalibration>> {
        self.stage(stage)?.select(label)
    }

    /// # Errors
    /// [`Error::UnknownStage`], otherwise see [`apply_calibration`].
    pub fn apply(
        &mut self,
        stage: &str,
        label: &str,
        options: &ApplyOptions,
    ) -> Result<AppliedCalibration> {
        let ii = self.position(stage)?;
        apply_calibration(&mut self.table, &self.stages[ii], label, options)
    }

    /// # Errors
    /// [`Error::UnknownStage`], otherwise see [`evaluate_range`].
    pub fn evaluate_range(
        &mut self,
        stage: &str,
        label: &str,
        extra: &[&str],
    ) -> Result<Vec<CalibrationRange>> {
        let ii = self.position(stage)?;
        evaluate_range(&mut self.table, &self.stages[ii], label, extra)
    }

    /// Run one declared stage: its outlier passes, the fit and, when a model is selected, the
    /// application and range check.
    ///
    /// # Errors
    /// The first error of any step.
    pub fn run_stage(&mut self, plan: &StagePlan) -> Result<Option<AppliedCalibration>> {
        for rule in &plan.outliers {
            self.mark_outliers(rule)?;
        }
        self.fit_stage(&plan.name, &plan.models, &plan.use_in_calibration)?;

        let Some(label) = &plan.select else {
            info!("stage `{}` fitted, no calibration selected", plan.name);
            return Ok(None);
        };
        let options = ApplyOptions {
            target: plan.target.clone(),
            propagation: self.config.propagation,
        };
        let applied = self.apply(&plan.name, label, &options)?;
        let extra = plan.range.iter().map(String::as_str).collect::<Vec<_>>();
        self.evaluate_range(&plan.name, label, &extra)?;
        Ok(Some(applied))
    }
}
