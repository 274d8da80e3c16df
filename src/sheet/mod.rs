//! Spreadsheet I/O: workbook reading/writing and the row grid model.
//!
//! The parser and the result assembler operate on a plain cell grid
//! (`Vec<Vec<String>>`) indexed by absolute sheet position, so that row
//! filtering can happen in exactly one place (the parser) and the assembler
//! can write results back by absolute source index.

mod assemble;
mod parse;

pub use assemble::assemble;
pub use parse::{ParsedRow, ParsedSheet, parse_rows, validate_rows};

use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;

use crate::error::{Result, VolleyError};

/// Worksheet name used for input and output workbooks.
pub const SHEET_NAME: &str = "batch_data";

/// Name of the single column the assembler appends.
pub const RESULT_COLUMN: &str = "execution_result";

/// Cell grid addressed by absolute sheet position: `grid[row][col]`.
pub type Grid = Vec<Vec<String>>;

/// Read an XLSX workbook into a cell grid.
///
/// Prefers the `batch_data` worksheet and falls back to the first sheet.
/// Leading empty rows/columns are preserved so grid indices are absolute.
pub fn read_grid(bytes: &[u8]) -> Result<Grid> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|e| VolleyError::Workbook(format!("cannot open workbook: {e}")))?;

    let sheet_name = if workbook.sheet_names().iter().any(|n| n == SHEET_NAME) {
        SHEET_NAME.to_string()
    } else {
        workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| VolleyError::Workbook("workbook has no sheets".to_string()))?
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| VolleyError::Workbook(format!("cannot read sheet '{sheet_name}': {e}")))?;

    let (start_row, start_col) = match range.start() {
        Some(start) => start,
        None => return Ok(Grid::new()),
    };

    let mut grid: Grid = (0..start_row).map(|_| Vec::new()).collect();
    for cells in range.rows() {
        let mut row: Vec<String> = vec![String::new(); start_col as usize];
        row.extend(cells.iter().map(cell_text));
        grid.push(row);
    }
    Ok(grid)
}

/// Write a cell grid as an XLSX workbook with a single `batch_data` sheet.
pub fn write_grid(grid: &Grid) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(SHEET_NAME)
        .map_err(|e| VolleyError::Workbook(e.to_string()))?;

    for (r, row) in grid.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            if !cell.is_empty() {
                worksheet
                    .write_string(r as u32, c as u16, cell)
                    .map_err(|e| VolleyError::Workbook(e.to_string()))?;
            }
        }
    }

    workbook
        .save_to_buffer()
        .map_err(|e| VolleyError::Workbook(e.to_string()))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => float_text(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Spreadsheet cells store whole numbers as floats; render `3.0` as `"3"`.
fn float_text(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

#[cfg(test)]
pub(crate) fn grid_from(rows: &[&[&str]]) -> Grid {
    rows.iter()
        .map(|row| row.iter().map(|s| s.to_string()).collect())
        .collect()
}

/// Trailing empty cells are not round-trip stable through the XLSX
/// container, so grid comparisons normalize them away.
#[cfg(test)]
pub(crate) fn normalized(grid: &Grid) -> Grid {
    let mut out: Grid = grid
        .iter()
        .map(|row| {
            let mut row = row.clone();
            while row.last().is_some_and(|c| c.is_empty()) {
                row.pop();
            }
            row
        })
        .collect();
    while out.last().is_some_and(|r| r.is_empty()) {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_round_trips_through_xlsx() {
        let grid = grid_from(&[
            &["search_term", "depth"],
            &["the term to search", "how deep to go"],
            &["iPhone", "1"],
            &["huawei", "2"],
            &["", "3"],
            &["oppo", ""],
        ]);

        let bytes = write_grid(&grid).unwrap();
        let read = read_grid(&bytes).unwrap();
        assert_eq!(normalized(&read), normalized(&grid));
    }

    #[test]
    fn float_cells_render_without_trailing_zero() {
        assert_eq!(float_text(3.0), "3");
        assert_eq!(float_text(-7.0), "-7");
        assert_eq!(float_text(2.5), "2.5");
    }

    #[test]
    fn missing_sheet_name_falls_back_to_first_sheet() {
        // write_grid always names the sheet `batch_data`, so build one with a
        // different name through the writer directly.
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let ws = workbook.add_worksheet();
        ws.set_name("other").unwrap();
        ws.write_string(0, 0, "header").unwrap();
        ws.write_string(1, 0, "value").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let grid = read_grid(&bytes).unwrap();
        assert_eq!(grid[0][0], "header");
        assert_eq!(grid[1][0], "value");
    }

    #[test]
    fn unreadable_bytes_are_a_workbook_error() {
        let err = read_grid(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, VolleyError::Workbook(_)));
    }
}
