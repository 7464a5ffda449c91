use std::collections::HashMap;
use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// Cell spellings read as missing, matching the usual dataframe defaults.
const MISSING_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Excel,
}

impl FileType {
    /// `.csv` decodes as CSV; every other name is treated as a workbook.
    pub fn from_file_name(name: &str) -> Self {
        if name.to_lowercase().ends_with(".csv") {
            FileType::Csv
        } else {
            FileType::Excel
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric { name: String, values: Vec<Option<f64>> },
    /// Present in the file but not usable for analysis.
    Excluded { name: String },
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Column::Numeric { name: name.into(), values }
    }

    pub fn excluded(name: impl Into<String>) -> Self {
        Column::Excluded { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Column::Numeric { name, .. } | Column::Excluded { name } => name,
        }
    }

    pub fn values(&self) -> Option<&[Option<f64>]> {
        match self {
            Column::Numeric { values, .. } => Some(values),
            Column::Excluded { .. } => None,
        }
    }
}

/// Rectangular table of named columns, rows aligned by position.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericTable {
    columns: Vec<Column>,
    n_rows: usize,
}

impl NumericTable {
    pub fn new(n_rows: usize, columns: Vec<Column>) -> Result<Self> {
        for column in &columns {
            if let Some(values) = column.values() {
                if values.len() != n_rows {
                    return Err(FilterError::Data(format!(
                        "column '{}' has {} rows, expected {}",
                        column.name(),
                        values.len(),
                        n_rows
                    )));
                }
            }
        }
        Ok(NumericTable { columns, n_rows })
    }

    /// Build a fully populated numeric table.
    pub fn from_columns<S: Into<String>>(columns: Vec<(S, Vec<f64>)>) -> Result<Self> {
        let n_rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let columns = columns
            .into_iter()
            .map(|(name, values)| Column::numeric(name, values.into_iter().map(Some).collect()))
            .collect();
        Self::new(n_rows, columns)
    }

    pub fn decode(bytes: &[u8], file_type: FileType) -> Result<Self> {
        match file_type {
            FileType::Csv => Self::from_csv(bytes),
            FileType::Excel => Self::from_excel(bytes),
        }
    }

    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut cells: Vec<Vec<Cell>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record = record?;
            for (idx, column) in cells.iter_mut().enumerate() {
                column.push(Cell::parse(record.get(idx).unwrap_or("")));
            }
        }
        Ok(Self::from_cells(headers, cells))
    }

    pub fn from_excel(bytes: &[u8]) -> Result<Self> {
        let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes.to_vec()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| FilterError::Decode("workbook has no worksheets".into()))??;

        let mut rows = range.rows();
        let headers: Vec<String> = match rows.next() {
            Some(header_row) => header_row.iter().map(|cell| cell.to_string()).collect(),
            None => return Err(FilterError::Data("worksheet is empty".into())),
        };
        let mut cells: Vec<Vec<Cell>> = vec![Vec::new(); headers.len()];
        for row in rows {
            for (idx, column) in cells.iter_mut().enumerate() {
                column.push(row.get(idx).map(Cell::from_excel).unwrap_or(Cell::Missing));
            }
        }
        Ok(Self::from_cells(headers, cells))
    }

    fn from_cells(headers: Vec<String>, cells: Vec<Vec<Cell>>) -> Self {
        let n_rows = cells.first().map(Vec::len).unwrap_or(0);
        let names = dedupe_headers(headers);
        let columns = names
            .into_iter()
            .zip(cells)
            .map(|(name, column)| {
                if column.iter().any(|c| matches!(c, Cell::Text)) {
                    Column::excluded(name)
                } else {
                    let values = column
                        .into_iter()
                        .map(|c| match c {
                            Cell::Number(v) => Some(v),
                            _ => None,
                        })
                        .collect();
                    Column::numeric(name, values)
                }
            })
            .collect();
        NumericTable { columns, n_rows }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name() == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn numeric_column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.values().is_some())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Every numeric column, restricted to rows complete across all of them.
    pub fn analysis_matrix(&self) -> Result<(Vec<String>, Array2<f64>)> {
        let names = self.numeric_column_names();
        if names.is_empty() {
            return Err(FilterError::Data("No numeric columns found in the dataset".into()));
        }
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let matrix = self.complete_rows(&refs)?;
        if matrix.nrows() == 0 {
            return Err(FilterError::Data("No valid data rows after preprocessing".into()));
        }
        Ok((names, matrix))
    }

    /// Matrix of the named columns in the given order, dropping rows with a
    /// missing value in any of them.
    pub fn complete_rows(&self, names: &[&str]) -> Result<Array2<f64>> {
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let column = self
                .column(name)
                .ok_or_else(|| FilterError::Data(format!("column '{}' not found", name)))?;
            let values = column
                .values()
                .ok_or_else(|| FilterError::Data(format!("column '{}' is not numeric", name)))?;
            selected.push(values);
        }

        let keep: Vec<usize> = (0..self.n_rows)
            .filter(|&row| selected.iter().all(|values| values[row].is_some()))
            .collect();

        let mut matrix = Array2::zeros((keep.len(), selected.len()));
        for (out_row, &row) in keep.iter().enumerate() {
            for (col, values) in selected.iter().enumerate() {
                matrix[[out_row, col]] = values[row].unwrap_or_default();
            }
        }
        Ok(matrix)
    }
}

#[derive(Debug, Clone, Copy)]
enum Cell {
    Missing,
    Number(f64),
    Text,
}

impl Cell {
    fn parse(raw: &str) -> Self {
        if MISSING_TOKENS.contains(&raw) {
            return Cell::Missing;
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Cell::Number(v),
            Ok(_) => Cell::Missing,
            Err(_) => Cell::Text,
        }
    }

    fn from_excel(data: &Data) -> Self {
        match data {
            Data::Float(v) if v.is_finite() => Cell::Number(*v),
            Data::Float(_) => Cell::Missing,
            Data::Int(v) => Cell::Number(*v as f64),
            Data::Empty | Data::Error(_) => Cell::Missing,
            Data::String(s) if MISSING_TOKENS.contains(&s.trim()) => Cell::Missing,
            _ => Cell::Text,
        }
    }
}

/// Blank headers become `Unnamed: i`; repeats get a `.n` suffix.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .into_iter()
        .enumerate()
        .map(|(idx, header)| {
            let base = if header.trim().is_empty() {
                format!("Unnamed: {}", idx)
            } else {
                header
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let name = if *count == 0 {
                base
            } else {
                format!("{}.{}", base, count)
            };
            *count += 1;
            name
        })
        .collect()
}
