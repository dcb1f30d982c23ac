//! Applicability range of a calibration.
//!
//! The range of a column is `[min, max]` over the rows a fit actually used. Every row of the
//! table, used or not, is then tagged in or out of that range so extrapolation to samples
//! outside the standards' envelope is visible.

use itertools::{Itertools, MinMaxResult};
use log::{info, warn};
use serde::Serialize;

use crate::fit::StageCalibration;
use crate::table::{Column, ColumnOwner, PeakTable};
use crate::Result;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationRange {
    pub stage: String,
    pub label: String,
    pub group: Option<String>,
    pub column: String,
    pub min: f64,
    pub max: f64,
}

impl CalibrationRange {
    /// Closed interval membership
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// `[min, max]` of the non-missing `values` at `rows`
#[must_use]
pub fn predictor_interval(values: &[Option<f64>], rows: &[usize]) -> Option<(f64, f64)> {
    match rows
        .iter()
        .filter_map(|&row| values[row])
        .filter(|v| v.is_finite())
        .minmax_by(f64::total_cmp)
    {
        MinMaxResult::NoElements => None,
        MinMaxResult::OneElement(v) => Some((v, v)),
        MinMaxResult::MinMax(min, max) => Some((min, max)),
    }
}

/// Compute the range of the selected calibration's predictors, plus any `extra` columns, and
/// flag every row.
///
/// Appends `<stage>_<column>_in_range` for each column and `<stage>_in_range` for all of them
/// together. A row with a missing value, or whose group has no fit, gets a missing flag.
///
/// # Errors
/// Selection errors for an unknown or invalid label, data errors for absent columns.
pub fn evaluate_range(
    table: &mut PeakTable,
    stage: &StageCalibration,
    label: &str,
    extra: &[&str],
) -> Result<Vec<CalibrationRange>> {
    let stage_name = stage.stage();
    let fits = stage.select(label)?;
    let spec = fits[0].spec();

    let columns = spec
        .form
        .predictors()
        .into_iter()
        .chain(extra.iter().copied())
        .unique()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if columns.is_empty() {
        warn!("stage `{stage_name}`: `{label}` has no predictors to range-check");
        return Ok(vec![]);
    }

    let groups = match &spec.group_by {
        Some(group_by) => Some(table.require_keys(stage_name, group_by)?),
        None => None,
    };

    let mut ranges = vec![];
    let mut flags = vec![];
    for column in &columns {
        let values = table.require_numeric(stage_name, column)?;
        let column_ranges = fits
            .iter()
            .filter_map(|fit| {
                predictor_interval(values, fit.fit_rows()).map(|(min, max)| CalibrationRange {
                    stage: stage_name.to_owned(),
                    label: label.to_owned(),
                    group: fit.group().map(str::to_owned),
                    column: column.clone(),
                    min,
                    max,
                })
            })
            .collect::<Vec<_>>();

        let column_flags = values
            .iter()
            .enumerate()
            .map(|(row, value)| {
                let group = groups.as_ref().and_then(|groups| groups[row].as_deref());
                let range = column_ranges
                    .iter()
                    .find(|range| range.group.as_deref() == group)?;
                value.map(|value| range.contains(value))
            })
            .collect::<Vec<_>>();

        ranges.extend(column_ranges);
        flags.push(column_flags);
    }

    let owner = ColumnOwner::Stage(stage_name.to_owned());
    let combined_name = format!("{stage_name}_in_range");
    let names = columns
        .iter()
        .map(|column| format!("{stage_name}_{column}_in_range"))
        .collect::<Vec<_>>();
    for name in names.iter().chain(std::iter::once(&combined_name)) {
        table.check_writable(&owner, name)?;
    }

    let combined = (0..table.num_rows())
        .map(|row| {
            flags
                .iter()
                .map(|column_flags| column_flags[row])
                .collect::<Option<Vec<_>>>()
                .map(|all| all.into_iter().all(|in_range| in_range))
        })
        .collect::<Vec<_>>();

    let num_outside = combined.iter().filter(|flag| **flag == Some(false)).count();
    for (name, column_flags) in names.iter().zip(flags) {
        table.insert(owner.clone(), name, Column::Flag(column_flags))?;
    }
    table.insert(owner, &combined_name, Column::Flag(combined))?;

    info!(
        "stage `{stage_name}`: {num_outside} rows outside the range of `{label}` on {columns:?}"
    );
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{evaluate_range, predictor_interval};
    use crate::config::Config;
    use crate::fit::{fit_stage, UseInCalibration};
    use crate::model::{CalibrationModelSpec, ModelForm};
    use crate::table::PeakTable;
    use crate::Result;

    fn amplitude_table() -> PeakTable {
        let amp = [Some(1000.), Some(3000.), Some(2000.), Some(500.), Some(6000.), None];
        let d13c = [Some(-30.), Some(-29.8), Some(-29.9), Some(-29.7), Some(-28.), Some(-29.)];
        let kind = ["std", "std", "std", "sample", "sample", "sample"];
        PeakTable::new(&["id"], "type")
            .with_text("id", (0..6).map(|i| Some(format!("p{i}"))).collect())
            .and_then(|t| t.with_text("type", kind.iter().map(|k| Some((*k).into())).collect()))
            .and_then(|t| t.with_numeric("amp44", amp.to_vec()))
            .and_then(|t| t.with_numeric("d13C", d13c.to_vec()))
            .expect("fixture columns are consistent")
    }

    #[test]
    fn every_row_is_tagged_against_the_fitting_envelope() -> Result<()> {
        let mut table = amplitude_table();
        let spec = CalibrationModelSpec::new(
            "lin",
            "d13C",
            ModelForm::Linear {
                predictor: "amp44".into(),
                intercept: true,
            },
        );
        let stage = fit_stage(
            &table,
            "lin",
            &[spec],
            &UseInCalibration::groups(&["std"]),
            &Config::default(),
        )?;
        let ranges = evaluate_range(&mut table, &stage, "lin", &[])?;

        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].min, ranges[0].max), (1000., 3000.));
        let flags = table.flag("lin_amp44_in_range").unwrap();
        assert_eq!(
            flags,
            &[Some(true), Some(true), Some(true), Some(false), Some(false), None]
        );
        assert_eq!(table.flag("lin_in_range").unwrap(), flags);
        Ok(())
    }

    #[test]
    fn extra_columns_are_checked_alongside_predictors() -> Result<()> {
        let mut table = amplitude_table();
        let spec = CalibrationModelSpec::new("mean", "d13C", ModelForm::Constant);
        let stage = fit_stage(
            &table,
            "drift",
            &[spec],
            &UseInCalibration::groups(&["std"]),
            &Config::default(),
        )?;
        let ranges = evaluate_range(&mut table, &stage, "mean", &["amp44", "amp44"])?;
        assert_eq!(ranges.len(), 1);
        assert!(table.contains("drift_amp44_in_range"));
        Ok(())
    }

    #[test]
    fn boundaries_are_inside_the_range() {
        let values = [Some(1.), Some(2.), Some(3.)];
        assert_eq!(predictor_interval(&values, &[0, 2]), Some((1., 3.)));
        assert_eq!(predictor_interval(&values, &[1]), Some((2., 2.)));
        assert_eq!(predictor_interval(&[None], &[0]), None);
    }

    proptest! {
        #[test]
        fn widening_the_fitting_subset_never_shrinks_the_range(
            values in proptest::collection::vec(proptest::option::of(-1e3f64..1e3), 1..50),
            split in 0usize..50,
        ) {
            let all = (0..values.len()).collect::<Vec<_>>();
            let subset = &all[..split.min(values.len())];
            if let Some((min, max)) = predictor_interval(&values, subset) {
                let (wide_min, wide_max) = predictor_interval(&values, &all).unwrap();
                prop_assert!(wide_min <= min);
                prop_assert!(wide_max >= max);
            }
        }
    }
}
