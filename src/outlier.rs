//! Flag rows that must not feed a calibration fit.
//!
//! Flags accumulate in a single [`OUTLIER_COLUMN`]: every pass ORs its verdict into the
//! existing flags, so a row once flagged stays flagged whichever rule flagged it.

use std::collections::{BTreeSet, HashMap};

use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::math::{mean, sample_sd};
use crate::table::{Column, ColumnOwner, PeakTable};
use crate::Result;

pub const OUTLIER_COLUMN: &str = "is_outlier";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum OutlierRule {
    /// `|x - mean(x)| > k · sd(x)`, statistics taken per value of the grouping key
    Deviation { column: String, k: f64 },
    /// Rows whose `column` value is listed
    Explicit {
        column: String,
        values: BTreeSet<String>,
    },
}

impl OutlierRule {
    #[must_use]
    pub fn deviation(column: &str, k: f64) -> Self {
        Self::Deviation {
            column: column.to_owned(),
            k,
        }
    }

    #[must_use]
    pub fn explicit(column: &str, values: &[&str]) -> Self {
        Self::Explicit {
            column: column.to_owned(),
            values: values.iter().map(|&v| v.to_owned()).collect(),
        }
    }

    fn evaluate(&self, table: &PeakTable, group_key: &str) -> Result<Vec<bool>> {
        match self {
            Self::Deviation { column, k } => {
                let values = table.require_numeric("outliers", column)?;
                let groups = table.require_keys("outliers", group_key)?;

                // every non-missing value of the group, flagged or not
                let by_group = groups
                    .iter()
                    .zip(values)
                    .filter_map(|(group, value)| {
                        value.filter(|v| v.is_finite()).map(|v| (group.clone(), v))
                    })
                    .into_group_map();
                let statistics = by_group
                    .into_iter()
                    .filter_map(|(group, values)| {
                        Some((group, (mean(&values)?, sample_sd(&values)?)))
                    })
                    .collect::<HashMap<_, _>>();

                Ok(groups
                    .iter()
                    .zip(values)
                    .map(|(group, value)| match (value, statistics.get(group)) {
                        (Some(value), Some((mean, sd))) => (value - mean).abs() > k * sd,
                        _ => false,
                    })
                    .collect())
            }
            Self::Explicit { column, values } => Ok(table
                .require_keys("outliers", column)?
                .into_iter()
                .map(|key| key.map_or(false, |key| values.contains(&key)))
                .collect()),
        }
    }
}

/// Mark rows matching `rule` as outliers, keeping every earlier mark.
///
/// Returns the number of rows flagged after this pass.
///
/// # Errors
/// [`crate::Error::MissingColumn`] if the rule's column or the grouping key is absent.
pub fn mark_outliers(table: &mut PeakTable, group_key: &str, rule: &OutlierRule) -> Result<usize> {
    let verdict = rule.evaluate(table, group_key)?;
    let flags = match table.flag(OUTLIER_COLUMN) {
        Some(previous) => previous
            .iter()
            .zip(&verdict)
            .map(|(previous, &now)| Some(previous.unwrap_or(false) || now))
            .collect::<Vec<_>>(),
        None => verdict.iter().map(|&now| Some(now)).collect(),
    };

    let num_flagged = flags.iter().filter(|flag| **flag == Some(true)).count();
    table.insert(ColumnOwner::Outliers, OUTLIER_COLUMN, Column::Flag(flags))?;
    info!(
        "{} rows flagged by {rule:?}, {num_flagged} outliers in total",
        verdict.iter().filter(|&&v| v).count()
    );
    Ok(num_flagged)
}
