//! Result assembly.
//!
//! The assembler never re-applies row filtering: it takes the original sheet
//! bytes plus `(source_row_index, text)` pairs and writes each text at its
//! absolute row, in one appended `execution_result` column. Header,
//! description and example rows pass through untouched.

use crate::error::{Result, VolleyError};

use super::{Grid, RESULT_COLUMN, read_grid, write_grid};

/// Produce the output workbook: the original sheet plus one appended
/// `execution_result` column.
///
/// `results` may arrive in any order and may be incomplete; rows without an
/// entry get a blank result cell.
pub fn assemble(original: &[u8], results: &[(u32, String)]) -> Result<Vec<u8>> {
    let mut grid = read_grid(original)?;
    if grid.is_empty() {
        return Err(VolleyError::Workbook(
            "cannot assemble results into an empty sheet".to_string(),
        ));
    }

    let result_col = grid.iter().map(Vec::len).max().unwrap_or(0);
    set_cell(&mut grid, 0, result_col, RESULT_COLUMN.to_string());

    for (source_row_index, text) in results {
        set_cell(&mut grid, *source_row_index as usize, result_col, text.clone());
    }

    write_grid(&grid)
}

fn set_cell(grid: &mut Grid, row: usize, col: usize, text: String) {
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let cells = &mut grid[row];
    if cells.len() <= col {
        cells.resize_with(col + 1, String::new);
    }
    cells[col] = text;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::{grid_from, normalized};

    fn original_sheet() -> Vec<u8> {
        let grid = grid_from(&[
            &["search_term"],
            &["the term to search"],
            &["iPhone"],
            &["huawei"],
            &["xiaomi"],
            &["oppo"],
        ]);
        write_grid(&grid).unwrap()
    }

    #[test]
    fn results_land_at_their_absolute_source_rows() {
        let original = original_sheet();
        // Deliberately out of source order and incomplete.
        let results = vec![
            (5, "r-oppo".to_string()),
            (3, "r-huawei".to_string()),
        ];

        let assembled = assemble(&original, &results).unwrap();
        let grid = read_grid(&assembled).unwrap();

        assert_eq!(grid[0], vec!["search_term", "execution_result"]);
        assert_eq!(grid[1][0], "the term to search");
        assert_eq!(grid[2][0], "iPhone");
        assert_eq!(grid[3], vec!["huawei", "r-huawei"]);
        assert_eq!(normalized(&vec![grid[4].clone()])[0], vec!["xiaomi"]);
        assert_eq!(grid[5], vec!["oppo", "r-oppo"]);
    }

    #[test]
    fn round_trip_preserves_everything_but_the_result_column() {
        let input = grid_from(&[
            &["a", "b"],
            &["a long prose description", "another long description"],
            &["example", "example"],
            &["1", "x"],
            &["2", "y"],
        ]);
        let original = write_grid(&input).unwrap();

        let results: Vec<(u32, String)> =
            vec![(3, "r3".to_string()), (4, "r4".to_string())];
        let assembled = assemble(&original, &results).unwrap();
        let output = read_grid(&assembled).unwrap();

        // Strip the appended column and compare with the input.
        let result_col = input.iter().map(Vec::len).max().unwrap();
        assert_eq!(output[0][result_col], RESULT_COLUMN);
        let mut stripped: Grid = output
            .iter()
            .map(|row| {
                let mut row = row.clone();
                if row.len() > result_col {
                    row.truncate(result_col);
                }
                row
            })
            .collect();
        stripped = normalized(&stripped);
        assert_eq!(stripped, normalized(&input));

        // And the appended cells are where they should be.
        assert_eq!(output[3][result_col], "r3");
        assert_eq!(output[4][result_col], "r4");
    }

    #[test]
    fn ordering_follows_source_rows_not_completion_order() {
        // Results handed over in reverse completion order still assemble
        // in ascending row order.
        let input = grid_from(&[&["q"], &["r0"], &["r1"], &["r2"]]);
        let original = write_grid(&input).unwrap();
        let results = vec![
            (3, "third".to_string()),
            (1, "first".to_string()),
            (2, "second".to_string()),
        ];

        let grid = read_grid(&assemble(&original, &results).unwrap()).unwrap();
        assert_eq!(grid[1][1], "first");
        assert_eq!(grid[2][1], "second");
        assert_eq!(grid[3][1], "third");
    }

    #[test]
    fn empty_sheet_is_rejected() {
        let empty = write_grid(&Grid::new()).unwrap();
        let err = assemble(&empty, &[]).unwrap_err();
        assert!(matches!(err, VolleyError::Workbook(_)));
    }
}
