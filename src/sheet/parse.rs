//! Input sheet parsing.
//!
//! Row filtering happens here and **only** here. The parser hands out
//! absolute source row indices; downstream code (task creation, result
//! assembly) must never re-filter or re-index rows.

use serde_json::Value;

use crate::binding::{ParameterSchema, ParameterType, RowError};
use crate::error::{Result, VolleyError};
use crate::task::InputMap;

use super::Grid;

/// Cell values recognized as example-row markers, lowercased.
const EXAMPLE_MARKERS: [&str; 5] = ["iphone", "example", "示例", "sample", "test"];

/// Prefixes used by the template generator to annotate example rows.
const EXAMPLE_PREFIXES: [&str; 2] = ["example:", "示例"];

/// One data row extracted from the input sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 0-based position of this row in the unmodified sheet
    pub source_row_index: u32,
    pub inputs: InputMap,
}

/// Parser output: the header and the data rows in sheet order.
#[derive(Debug, Clone)]
pub struct ParsedSheet {
    pub header: Vec<String>,
    pub rows: Vec<ParsedRow>,
}

/// Parse the grid of an input sheet into data rows.
///
/// Row categories, in absolute order: row 0 is the header; row 1 is skipped
/// as a description row when every non-empty cell reads as prose and the row
/// does not positively type-match the schema; row 2 is skipped as an example
/// row when its cells carry example markers; fully empty rows are skipped
/// everywhere. Everything else is a data row.
pub fn parse_rows(grid: &Grid, schema: &ParameterSchema) -> Result<ParsedSheet> {
    let header_row = grid
        .first()
        .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
        .ok_or_else(|| VolleyError::Workbook("missing header row".to_string()))?;

    let header: Vec<String> = header_row.iter().map(|c| c.trim().to_string()).collect();
    let columns: Vec<(usize, &str)> = header
        .iter()
        .enumerate()
        .filter(|(_, name)| !name.is_empty())
        .map(|(col, name)| (col, name.as_str()))
        .collect();

    let mut rows = Vec::new();
    for (index, cells) in grid.iter().enumerate().skip(1) {
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        if index == 1 && is_description_row(cells, &columns, schema) {
            continue;
        }
        if index == 2 && is_example_row(cells) {
            continue;
        }

        let mut inputs = InputMap::new();
        for (col, name) in &columns {
            let cell = cells.get(*col).map(|c| c.trim()).unwrap_or("");
            if cell.is_empty() {
                continue;
            }
            inputs.insert((*name).to_string(), typed_value(name, cell, schema));
        }
        rows.push(ParsedRow {
            source_row_index: index as u32,
            inputs,
        });
    }

    Ok(ParsedSheet { header, rows })
}

/// Validate parsed rows against the binding schema.
///
/// Returns one error per offending (row, field) pair; an empty vector means
/// the sheet is accepted.
pub fn validate_rows(parsed: &ParsedSheet, schema: &ParameterSchema) -> Vec<RowError> {
    let mut errors = Vec::new();
    for row in &parsed.rows {
        for param in &schema.parameters {
            match row.inputs.get(&param.name) {
                None => {
                    if param.required {
                        errors.push(RowError {
                            source_row_index: row.source_row_index,
                            field: param.name.clone(),
                            message: format!("required parameter '{}' is missing", param.name),
                        });
                    }
                }
                Some(value) => {
                    let text = value_text(value);
                    if let Some(message) = param.check_cell(&text) {
                        errors.push(RowError {
                            source_row_index: row.source_row_index,
                            field: param.name.clone(),
                            message,
                        });
                    }
                }
            }
        }
    }
    errors
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce a cell to the parameter's declared type where that is lossless;
/// anything that doesn't coerce stays a string for the validator to flag.
fn typed_value(name: &str, cell: &str, schema: &ParameterSchema) -> Value {
    if let Some(param) = schema.parameter(name) {
        if param.kind == ParameterType::Number {
            if let Ok(int) = cell.parse::<i64>() {
                return Value::from(int);
            }
            if let Ok(float) = cell.parse::<f64>() {
                if let Some(number) = serde_json::Number::from_f64(float) {
                    return Value::Number(number);
                }
            }
        }
    }
    Value::String(cell.to_string())
}

fn is_prose(cell: &str) -> bool {
    cell.chars().count() > 12 || cell.chars().any(char::is_whitespace)
}

/// A row "parses as a data tuple" only when the schema can positively
/// discriminate it: all required parameters are present and valid, and at
/// least one typed parameter (number, or select with declared options)
/// accepts its cell. Without a discriminating parameter the prose heuristic
/// alone decides, so a description row over a string-only schema still
/// skips.
fn matches_schema_as_data(
    cells: &[String],
    columns: &[(usize, &str)],
    schema: &ParameterSchema,
) -> bool {
    let cell_for = |param_name: &str| -> &str {
        columns
            .iter()
            .find(|(_, name)| *name == param_name)
            .and_then(|(col, _)| cells.get(*col))
            .map(|c| c.trim())
            .unwrap_or("")
    };

    let mut discriminated = false;
    for param in &schema.parameters {
        let cell = cell_for(&param.name);
        if param.required && cell.is_empty() {
            return false;
        }
        if !cell.is_empty() && param.check_cell(cell).is_some() {
            return false;
        }
        let discriminating = param.kind == ParameterType::Number
            || (param.kind == ParameterType::Select && !param.options.is_empty());
        if discriminating && !cell.is_empty() {
            discriminated = true;
        }
    }
    discriminated
}

fn is_description_row(
    cells: &[String],
    columns: &[(usize, &str)],
    schema: &ParameterSchema,
) -> bool {
    let non_empty: Vec<&str> = cells
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if non_empty.is_empty() {
        return false;
    }
    non_empty.iter().all(|c| is_prose(c)) && !matches_schema_as_data(cells, columns, schema)
}

fn is_example_row(cells: &[String]) -> bool {
    let non_empty: Vec<String> = cells
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    if non_empty.is_empty() {
        return false;
    }
    if non_empty
        .iter()
        .any(|c| EXAMPLE_MARKERS.contains(&c.as_str()))
    {
        return true;
    }
    EXAMPLE_PREFIXES
        .iter()
        .any(|prefix| non_empty[0].starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::ParameterSpec;
    use crate::sheet::grid_from;

    fn string_schema(names: &[&str]) -> ParameterSchema {
        ParameterSchema {
            parameters: names
                .iter()
                .map(|name| ParameterSpec {
                    name: name.to_string(),
                    kind: ParameterType::String,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn alignment_under_description_and_example_rows() {
        let grid = grid_from(&[
            &["search_term"],
            &["the term to search"],
            &["iPhone"],
            &["huawei"],
            &["xiaomi"],
            &["oppo"],
        ]);
        let parsed = parse_rows(&grid, &string_schema(&["search_term"])).unwrap();

        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![3, 4, 5]);
        assert_eq!(parsed.rows[0].inputs["search_term"], "huawei");
        assert_eq!(parsed.rows[2].inputs["search_term"], "oppo");
    }

    #[test]
    fn fully_empty_rows_are_skipped_everywhere() {
        let grid = grid_from(&[
            &["q"],
            &["a prose description of q"],
            &["sample"],
            &["one"],
            &["", ""],
            &["two"],
        ]);
        let parsed = parse_rows(&grid, &string_schema(&["q"])).unwrap();
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![3, 5]);
    }

    #[test]
    fn short_row_one_is_data_not_description() {
        let grid = grid_from(&[&["q"], &["huawei"], &["xiaomi"]]);
        let parsed = parse_rows(&grid, &string_schema(&["q"])).unwrap();
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        // "huawei" is neither prose nor an example marker; row 2 "xiaomi"
        // matches no marker either.
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn typed_schema_rescues_prose_looking_data_rows() {
        let schema = ParameterSchema {
            parameters: vec![
                ParameterSpec {
                    name: "q".to_string(),
                    kind: ParameterType::String,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                },
                ParameterSpec {
                    name: "depth".to_string(),
                    kind: ParameterType::Number,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                },
            ],
        };

        // Row 1 has prose in both cells and no valid number: description.
        let grid = grid_from(&[
            &["q", "depth"],
            &["what to search for", "how many levels"],
            &["a very long search phrase", "3"],
        ]);
        let parsed = parse_rows(&grid, &schema).unwrap();
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![2]);

        // A prose-looking row whose number column is valid is data.
        let grid = grid_from(&[
            &["q", "depth"],
            &["a rather long search phrase", "2"],
            &["next", "3"],
        ]);
        let parsed = parse_rows(&grid, &schema).unwrap();
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(parsed.rows[0].inputs["depth"], 2);
    }

    #[test]
    fn example_markers_only_apply_to_row_two() {
        let grid = grid_from(&[
            &["q"],
            &["a description of the column"],
            &["example"],
            &["test"],
        ]);
        let parsed = parse_rows(&grid, &string_schema(&["q"])).unwrap();
        // Row 2 "example" is skipped; row 3 "test" is data despite matching
        // a marker, because the marker rule applies only at row 2.
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![3]);
    }

    #[test]
    fn annotated_example_rows_are_skipped() {
        let grid = grid_from(&[
            &["q"],
            &["what to search for, in words"],
            &["example: phones"],
            &["huawei"],
        ]);
        let parsed = parse_rows(&grid, &string_schema(&["q"])).unwrap();
        let indices: Vec<u32> = parsed.rows.iter().map(|r| r.source_row_index).collect();
        assert_eq!(indices, vec![3]);
    }

    #[test]
    fn missing_header_is_rejected() {
        let err = parse_rows(&Grid::new(), &string_schema(&["q"])).unwrap_err();
        assert!(matches!(err, VolleyError::Workbook(_)));

        let err = parse_rows(&grid_from(&[&["", ""]]), &string_schema(&["q"])).unwrap_err();
        assert!(matches!(err, VolleyError::Workbook(_)));
    }

    #[test]
    fn validation_reports_row_and_field() {
        let schema = ParameterSchema {
            parameters: vec![
                ParameterSpec {
                    name: "q".to_string(),
                    kind: ParameterType::String,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                },
                ParameterSpec {
                    name: "depth".to_string(),
                    kind: ParameterType::Number,
                    required: true,
                    description: None,
                    default: None,
                    options: Vec::new(),
                },
            ],
        };

        let grid = grid_from(&[
            &["q", "depth"],
            &["ok", "1"],
            &["ok", "not-a-number"],
            &["", "2"],
        ]);
        let parsed = parse_rows(&grid, &schema).unwrap();
        let errors = validate_rows(&parsed, &schema);

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].source_row_index, 2);
        assert_eq!(errors[0].field, "depth");
        assert_eq!(errors[1].source_row_index, 3);
        assert_eq!(errors[1].field, "q");
    }

    #[test]
    fn inputs_preserve_header_order() {
        let schema = string_schema(&["b", "a", "c"]);
        let grid = grid_from(&[&["b", "a", "c"], &["1", "2", "3"]]);
        let parsed = parse_rows(&grid, &schema).unwrap();
        let keys: Vec<&String> = parsed.rows[0].inputs.keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }
}
