//! The peak table: one row per detected peak, columns appended stage by stage.
//!
//! Every column carries the [`ColumnOwner`] that created it. An owner may refresh a column it
//! created, but a column created by somebody else is never overwritten, and identity and
//! grouping columns are never replaced at all. This keeps every stage's output traceable after
//! later stages have run.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;

use log::debug;

use crate::{Error, Result};

/// Who appended a column to the table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnOwner {
    /// Columns present when the table was built.
    Input,
    /// True values joined from a standards table.
    Standards,
    /// The cumulative outlier flag.
    Outliers,
    /// Columns produced by a named calibration stage.
    Stage(String),
}

impl fmt::Display for ColumnOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Standards => write!(f, "standards"),
            Self::Outliers => write!(f, "outliers"),
            Self::Stage(stage) => write!(f, "stage {stage}"),
        }
    }
}

/// A typed column. Missing cells are `None`.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Flag(Vec<Option<bool>>),
}

impl Column {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Text(values) => values.len(),
            Self::Flag(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render a cell as a join key, numbers are rendered without trailing zeros.
    pub(crate) fn key_at(&self, row: usize) -> Option<String> {
        match self {
            Self::Numeric(values) => values[row].map(|v| v.to_string()),
            Self::Text(values) => values[row].clone(),
            Self::Flag(values) => values[row].map(|v| v.to_string()),
        }
    }
}

/// Parse one numeric cell of delimited input, `row` counting data records from 1.
///
/// Empty cells, `NA` and `NaN` are missing. Anything else must parse as a number.
pub(crate) fn parse_cell(column: &str, row: usize, cell: &str) -> Result<Option<f64>> {
    match cell {
        "" | "NA" | "NaN" => Ok(None),
        value => value
            .parse::<f64>()
            .map(Some)
            .map_err(|_| Error::ParseNumber {
                column: column.to_owned(),
                row,
                value: value.to_owned(),
            }),
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    name: String,
    owner: ColumnOwner,
    column: Column,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PeakTable {
    /// Columns identifying a peak, for example the analysis id and the peak number
    identity: Vec<String>,
    /// Categorical column separating samples, standards, blanks...
    group_key: String,
    num_rows: usize,
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl PeakTable {
    #[must_use]
    pub fn new(identity: &[&str], group_key: &str) -> Self {
        Self {
            identity: identity.iter().map(|&name| name.to_owned()).collect(),
            group_key: group_key.to_owned(),
            num_rows: 0,
            entries: vec![],
            index: HashMap::new(),
        }
    }

    /// Add an input text column
    ///
    /// # Errors
    /// Fails if the column already exists or the length does not match the table.
    pub fn with_text(mut self, name: &str, values: Vec<Option<String>>) -> Result<Self> {
        self.insert(ColumnOwner::Input, name, Column::Text(values))?;
        Ok(self)
    }

    /// Add an input numeric column
    ///
    /// # Errors
    /// Fails if the column already exists or the length does not match the table.
    pub fn with_numeric(mut self, name: &str, values: Vec<Option<f64>>) -> Result<Self> {
        self.insert(ColumnOwner::Input, name, Column::Numeric(values))?;
        Ok(self)
    }

    /// Read a table from delimited text with a header row.
    ///
    /// Columns named in `numeric` are parsed as floating point numbers, everything else is kept
    /// as text. Empty cells, `NA` and `NaN` are read as missing.
    ///
    /// # Errors
    /// Fails on malformed input, on a numeric cell that is neither missing nor a number, or if
    /// the identity or grouping columns are absent.
    pub fn from_csv<R: io::Read>(
        reader: R,
        identity: &[&str],
        group_key: &str,
        numeric: &[&str],
    ) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();

        for required in identity.iter().chain(std::iter::once(&group_key)) {
            if !headers.iter().any(|header| header == *required) {
                return Err(Error::missing_column("load", required));
            }
        }

        let mut cells: Vec<Vec<Option<String>>> = vec![vec![]; headers.len()];
        for record in rdr.records() {
            let record = record?;
            for (ii, cell) in record.iter().enumerate().take(headers.len()) {
                let cell = match cell {
                    "" | "NA" | "NaN" => None,
                    value => Some(value.to_owned()),
                };
                cells[ii].push(cell);
            }
        }

        let mut table = Self::new(identity, group_key);
        for (header, values) in headers.iter().zip(cells) {
            let column = if numeric.contains(&header) {
                Column::Numeric(
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(row, cell)| {
                            cell.map_or(Ok(None), |value| parse_cell(header, row + 1, &value))
                        })
                        .collect::<Result<_>>()?,
                )
            } else {
                Column::Text(values)
            };
            table.insert(ColumnOwner::Input, header, column)?;
        }
        debug!(
            "read {} rows and {} columns",
            table.num_rows(),
            table.entries.len()
        );
        Ok(table)
    }

    #[must_use]
    pub const fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[must_use]
    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    #[must_use]
    pub fn identity(&self) -> &[String] {
        &self.identity
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&ii| &self.entries[ii].column)
    }

    #[must_use]
    pub fn owner(&self, name: &str) -> Option<&ColumnOwner> {
        self.index.get(name).map(|&ii| &self.entries[ii].owner)
    }

    /// Names of every column created by `owner`
    #[must_use]
    pub fn owned_by(&self, owner: &ColumnOwner) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|entry| &entry.owner == owner)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        match self.column(name) {
            Some(Column::Numeric(values)) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn text(&self, name: &str) -> Option<&[Option<String>]> {
        match self.column(name) {
            Some(Column::Text(values)) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn flag(&self, name: &str) -> Option<&[Option<bool>]> {
        match self.column(name) {
            Some(Column::Flag(values)) => Some(values),
            _ => None,
        }
    }

    /// Numeric column lookup that reports which stage needed it
    ///
    /// # Errors
    /// [`Error::MissingColumn`] if absent, [`Error::ColumnType`] if not numeric.
    pub fn require_numeric(&self, stage: &str, name: &str) -> Result<&[Option<f64>]> {
        match self.column(name) {
            Some(Column::Numeric(values)) => Ok(values),
            Some(_) => Err(Error::ColumnType {
                column: name.to_owned(),
                expected: "numeric",
            }),
            None => Err(Error::missing_column(stage, name)),
        }
    }

    /// Key lookup for joins and grouping, accepts text or numeric columns
    ///
    /// # Errors
    /// [`Error::MissingColumn`] if absent.
    pub fn require_keys(&self, stage: &str, name: &str) -> Result<Vec<Option<String>>> {
        let column = self
            .column(name)
            .ok_or_else(|| Error::missing_column(stage, name))?;
        Ok((0..self.num_rows).map(|row| column.key_at(row)).collect())
    }

    /// Group labels of every row
    ///
    /// # Errors
    /// [`Error::MissingColumn`] if the grouping column was never added.
    pub fn groups(&self, stage: &str) -> Result<Vec<Option<String>>> {
        self.require_keys(stage, &self.group_key)
    }

    fn is_protected(&self, name: &str) -> bool {
        name == self.group_key || self.identity.iter().any(|id| id == name)
    }

    /// Whether `owner` may create or refresh column `name`
    ///
    /// # Errors
    /// - [`Error::ProtectedColumn`] for identity, grouping or input columns
    /// - [`Error::ColumnOwned`] for another owner's column
    pub fn check_writable(&self, owner: &ColumnOwner, name: &str) -> Result<()> {
        match self.index.get(name) {
            Some(&ii) => {
                let existing = &self.entries[ii].owner;
                if *existing == ColumnOwner::Input || self.is_protected(name) {
                    return Err(Error::ProtectedColumn {
                        column: name.to_owned(),
                    });
                }
                if existing != owner {
                    return Err(Error::ColumnOwned {
                        column: name.to_owned(),
                        owner: existing.to_string(),
                        writer: owner.to_string(),
                    });
                }
                Ok(())
            }
            None if *owner != ColumnOwner::Input && self.is_protected(name) => {
                Err(Error::ProtectedColumn {
                    column: name.to_owned(),
                })
            }
            None => Ok(()),
        }
    }

    /// Append a column, or refresh one previously appended by the same owner.
    ///
    /// # Errors
    /// - [`Error::LengthMismatch`] if the column length differs from the table
    /// - [`Error::ProtectedColumn`] when replacing identity, grouping or input columns
    /// - [`Error::ColumnOwned`] when replacing another owner's column
    pub fn insert(&mut self, owner: ColumnOwner, name: &str, column: Column) -> Result<()> {
        if self.entries.is_empty() {
            self.num_rows = column.len();
        } else if column.len() != self.num_rows {
            return Err(Error::LengthMismatch {
                column: name.to_owned(),
                expected: self.num_rows,
                found: column.len(),
            });
        }

        self.check_writable(&owner, name)?;
        if let Some(&ii) = self.index.get(name) {
            self.entries[ii].column = column;
            return Ok(());
        }

        self.index.insert(name.to_owned(), self.entries.len());
        self.entries.push(Entry {
            name: name.to_owned(),
            owner,
            column,
        });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Column, ColumnOwner, PeakTable};
    use crate::{Error, Result};

    /// Six peaks over two analyses: four standards and two samples
    pub(crate) fn small_table() -> PeakTable {
        let text = |values: &[&str]| values.iter().map(|v| Some((*v).to_owned())).collect();
        PeakTable::new(&["analysis", "peak_nr"], "type")
            .with_text("analysis", text(&["a1", "a1", "a1", "a2", "a2", "a2"]))
            .and_then(|t| {
                t.with_numeric(
                    "peak_nr",
                    vec![Some(1.), Some(2.), Some(3.), Some(1.), Some(2.), Some(3.)],
                )
            })
            .and_then(|t| {
                t.with_text(
                    "type",
                    text(&["standard", "standard", "sample", "standard", "standard", "sample"]),
                )
            })
            .and_then(|t| {
                t.with_text("compound", text(&["C16", "C18", "x", "C16", "C18", "y"]))
            })
            .and_then(|t| {
                t.with_numeric(
                    "d13C",
                    vec![Some(-30.1), Some(-25.0), Some(-28.0), Some(-30.3), Some(-24.8), None],
                )
            })
            .and_then(|t| {
                t.with_numeric(
                    "amp44",
                    vec![
                        Some(2000.),
                        Some(4000.),
                        Some(3000.),
                        Some(2500.),
                        Some(5000.),
                        Some(9000.),
                    ],
                )
            })
            .expect("fixture columns are consistent")
    }

    #[test]
    fn columns_are_appended_with_owner() -> Result<()> {
        let mut table = small_table();
        table.insert(
            ColumnOwner::Stage("drift".into()),
            "d13C_pred",
            Column::Numeric(vec![None; 6]),
        )?;
        assert_eq!(
            table.owner("d13C_pred"),
            Some(&ColumnOwner::Stage("drift".into()))
        );
        assert!(table.owned_by(&ColumnOwner::Input).contains("d13C"));
        Ok(())
    }

    #[test]
    fn owners_refresh_their_own_columns_only() -> Result<()> {
        let mut table = small_table();
        let drift = ColumnOwner::Stage("drift".into());
        table.insert(drift.clone(), "x", Column::Numeric(vec![Some(1.); 6]))?;
        table.insert(drift, "x", Column::Numeric(vec![Some(2.); 6]))?;
        assert_eq!(table.numeric("x").unwrap()[0], Some(2.));

        let clash = table.insert(
            ColumnOwner::Stage("linearity".into()),
            "x",
            Column::Numeric(vec![None; 6]),
        );
        assert!(matches!(clash, Err(Error::ColumnOwned { .. })));
        Ok(())
    }

    #[test]
    fn identity_and_input_columns_are_protected() {
        let mut table = small_table();
        for name in ["type", "analysis", "d13C"] {
            let result = table.insert(
                ColumnOwner::Stage("drift".into()),
                name,
                Column::Numeric(vec![None; 6]),
            );
            assert!(matches!(result, Err(Error::ProtectedColumn { .. })));
        }
    }

    #[test]
    fn columns_must_match_table_length() {
        let mut table = small_table();
        let result = table.insert(ColumnOwner::Standards, "short", Column::Flag(vec![None; 2]));
        assert!(matches!(
            result,
            Err(Error::LengthMismatch {
                expected: 6,
                found: 2,
                ..
            })
        ));
    }

    #[test]
    fn csv_input_is_typed_and_missing_cells_are_none() -> Result<()> {
        let data = "analysis,type,d13C,comment\n\
                    a1,standard,-30.1,ok\n\
                    a2,sample,NA,\n";
        let table = PeakTable::from_csv(data.as_bytes(), &["analysis"], "type", &["d13C"])?;
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.numeric("d13C").unwrap(), &[Some(-30.1), None]);
        assert_eq!(table.text("comment").unwrap()[1], None);
        Ok(())
    }

    #[test]
    fn csv_without_group_key_is_rejected() {
        let data = "analysis,d13C\na1,-30.1\n";
        let result = PeakTable::from_csv(data.as_bytes(), &["analysis"], "type", &["d13C"]);
        assert!(matches!(result, Err(Error::MissingColumn { .. })));
    }

    #[test]
    fn unparsable_numbers_are_errors_not_missing_values() {
        let data = "analysis,type,d13C\na1,standard,-30.1\na2,sample,n/a\n";
        match PeakTable::from_csv(data.as_bytes(), &["analysis"], "type", &["d13C"]) {
            Err(Error::ParseNumber { column, row, value }) => {
                assert_eq!(column, "d13C");
                assert_eq!(row, 2);
                assert_eq!(value, "n/a");
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }
}
