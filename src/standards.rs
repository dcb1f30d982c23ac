//! Join known reference values onto the peaks they describe.

use std::collections::HashMap;

use log::{debug, info};

use crate::table::{parse_cell, Column, ColumnOwner, PeakTable};
use crate::{Error, Result};

/// Known true quantities keyed by an identity value, for example the compound name
#[derive(Clone, Debug)]
pub struct StandardsTable {
    key: String,
    value_columns: Vec<String>,
    rows: HashMap<String, Vec<Option<f64>>>,
}

impl StandardsTable {
    #[must_use]
    pub fn new(key: &str, value_columns: &[&str]) -> Self {
        Self {
            key: key.to_owned(),
            value_columns: value_columns.iter().map(|&c| c.to_owned()).collect(),
            rows: HashMap::new(),
        }
    }

    /// Register the true values of one standard, in the order of `value_columns`
    ///
    /// # Errors
    /// [`Error::DuplicateStandard`] if `key` is already present, [`Error::LengthMismatch`] if the
    /// number of values does not match the declared columns.
    pub fn with_standard(mut self, key: &str, values: Vec<Option<f64>>) -> Result<Self> {
        if values.len() != self.value_columns.len() {
            return Err(Error::LengthMismatch {
                column: key.to_owned(),
                expected: self.value_columns.len(),
                found: values.len(),
            });
        }
        if self.rows.insert(key.to_owned(), values).is_some() {
            return Err(Error::DuplicateStandard {
                key: key.to_owned(),
            });
        }
        Ok(self)
    }

    /// Read standards from delimited text: the `key` column plus every other column as numbers
    ///
    /// Empty cells, `NA` and `NaN` are missing values.
    ///
    /// # Errors
    /// Fails on malformed input, a value that is not a number, a missing key column or
    /// duplicated keys.
    pub fn from_csv<R: std::io::Read>(reader: R, key: &str) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let key_index = headers
            .iter()
            .position(|header| header == key)
            .ok_or_else(|| Error::missing_column("standards", key))?;
        let value_columns = headers
            .iter()
            .enumerate()
            .filter(|(ii, _)| *ii != key_index)
            .map(|(_, header)| header)
            .collect::<Vec<_>>();

        let mut standards = Self::new(key, &value_columns);
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let values = record
                .iter()
                .enumerate()
                .filter(|(ii, _)| *ii != key_index)
                .map(|(ii, cell)| parse_cell(&headers[ii], row + 1, cell))
                .collect::<Result<_>>()?;
            standards = standards.with_standard(&record[key_index], values)?;
        }
        Ok(standards)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn value_columns(&self) -> &[String] {
        &self.value_columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Append the standards' true-value columns to every row whose `join_key` matches.
///
/// Unmatched rows, typically samples, stay in the table with missing true values. Returns the
/// number of matched rows.
///
/// # Errors
/// [`Error::MissingColumn`] if `join_key` is absent from the peak table or is not the key of
/// the standards table. A value column that clashes with a column owned by somebody else fails
/// before anything is joined.
pub fn match_standards(
    table: &mut PeakTable,
    standards: &StandardsTable,
    join_key: &str,
) -> Result<usize> {
    if standards.key != join_key {
        return Err(Error::missing_column("standards", join_key));
    }
    let keys = table.require_keys("standards", join_key)?;
    for name in standards
        .value_columns
        .iter()
        .map(String::as_str)
        .chain(std::iter::once("is_std_peak"))
    {
        table.check_writable(&ColumnOwner::Standards, name)?;
    }

    let matched = keys
        .iter()
        .map(|key| key.as_ref().and_then(|key| standards.rows.get(key)))
        .collect::<Vec<_>>();

    for (ii, name) in standards.value_columns.iter().enumerate() {
        let values = matched
            .iter()
            .map(|row| row.and_then(|values| values[ii]))
            .collect();
        table.insert(ColumnOwner::Standards, name, Column::Numeric(values))?;
        debug!("joined standards column `{name}`");
    }

    let is_standard = matched.iter().map(|row| Some(row.is_some())).collect();
    table.insert(ColumnOwner::Standards, "is_std_peak", Column::Flag(is_standard))?;

    let num_matched = matched.iter().filter(|row| row.is_some()).count();
    info!(
        "matched {num_matched} of {} peaks to {} standards on `{join_key}`",
        table.num_rows(),
        standards.len()
    );
    Ok(num_matched)
}
