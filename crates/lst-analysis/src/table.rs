use anyhow::{Context, Result};
use csv::{ReaderBuilder, Writer};
use std::fs::File;
use std::path::Path;

/// One table row as `(column, value)` pairs in column order.
pub type Row = Vec<(String, String)>;

/// Append-only table whose columns are the union of every row's keys in the
/// order they were first seen. Cells a row does not define are written empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with a fixed header, written even when no row is ever pushed.
    pub fn with_columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Row) {
        for (column, _) in &row {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: StatsTable) {
        for row in other.rows {
            self.push_row(row);
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        self.rows
            .get(row)?
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    /// Reads a headed CSV file; every record becomes a row.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let headers: Vec<String> = rdr
            .headers()
            .with_context(|| format!("failed to read header of {}", path.display()))?
            .iter()
            .map(|h| h.to_string())
            .collect();
        let mut table = StatsTable::new();
        for result in rdr.records() {
            let record = result.with_context(|| format!("malformed record in {}", path.display()))?;
            let row: Row = headers
                .iter()
                .cloned()
                .zip(record.iter().map(|v| v.to_string()))
                .collect();
            table.push_row(row);
        }
        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer =
            Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;
        if self.columns.is_empty() {
            writer.flush()?;
            return Ok(());
        }
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            let record: Vec<&str> = self
                .columns
                .iter()
                .map(|c| {
                    row.iter()
                        .find(|(k, _)| k == c)
                        .map(|(_, v)| v.as_str())
                        .unwrap_or("")
                })
                .collect();
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub fn cell(column: &str, value: impl Into<String>) -> (String, String) {
    (column.to_string(), value.into())
}
