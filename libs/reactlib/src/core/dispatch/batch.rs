// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Row/column marshalling for batch-mode bindings.
//!
//! Batched raw inputs arrive as per-input row lists. They are zipped
//! row-wise through preprocessing, invoked once as column-wise lists, and
//! the outputs are un-zipped row-wise through postprocessing.

use crate::core::error::{EngineError, Result};
use crate::core::value::{OutputValue, Value};

/// Validate batched raw inputs and return the shared row count.
pub fn validate_batch(inputs: &[Value], max_batch_size: usize) -> Result<usize> {
    let mut row_count: Option<usize> = None;
    if inputs.is_empty() {
        return Err(EngineError::Config(
            "Batch dispatch requires at least one input list".into(),
        ));
    }
    for (index, input) in inputs.iter().enumerate() {
        let rows = input.as_array().ok_or_else(|| {
            EngineError::Config(format!("Batch input {} is not a list", index))
        })?;
        match row_count {
            None => row_count = Some(rows.len()),
            Some(expected) if expected != rows.len() => {
                return Err(EngineError::Config(format!(
                    "Batch input lists disagree on length: {} vs {}",
                    expected,
                    rows.len()
                )))
            }
            Some(_) => {}
        }
    }
    let row_count = row_count.unwrap_or(0);
    if row_count > max_batch_size {
        return Err(EngineError::Config(format!(
            "Batch of {} rows exceeds max_batch_size {}",
            row_count, max_batch_size
        )));
    }
    Ok(row_count)
}

/// Zip per-input row lists into per-row input vectors.
pub fn rows(inputs: &[Value], row_count: usize) -> Vec<Vec<Value>> {
    (0..row_count)
        .map(|row| {
            inputs
                .iter()
                .map(|input| {
                    input
                        .as_array()
                        .and_then(|items| items.get(row).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect()
        })
        .collect()
}

/// Transpose per-row vectors back into per-input column lists for the
/// single batched invocation.
pub fn columns(rows: &[Vec<Value>], input_count: usize) -> Vec<Value> {
    (0..input_count)
        .map(|column| {
            Value::Array(
                rows.iter()
                    .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect()
}

/// Un-zip a batched callable's column-wise output slots into per-row output
/// vectors. A `Skip` column skips that output for every row.
pub fn unzip_outputs(
    outputs: &[OutputValue],
    row_count: usize,
) -> Result<Vec<Vec<OutputValue>>> {
    let mut per_row: Vec<Vec<OutputValue>> = vec![Vec::with_capacity(outputs.len()); row_count];
    for (index, output) in outputs.iter().enumerate() {
        match output {
            OutputValue::Skip => {
                for row in &mut per_row {
                    row.push(OutputValue::Skip);
                }
            }
            OutputValue::Value(Value::Array(items)) if items.len() == row_count => {
                for (row, item) in per_row.iter_mut().zip(items) {
                    row.push(OutputValue::Value(item.clone()));
                }
            }
            OutputValue::Value(Value::Array(items)) => {
                return Err(EngineError::Config(format!(
                    "Batch output {} has {} rows, expected {}",
                    index,
                    items.len(),
                    row_count
                )))
            }
            _ => {
                return Err(EngineError::Config(format!(
                    "Batch output {} is not a list",
                    index
                )))
            }
        }
    }
    Ok(per_row)
}

/// Re-assemble per-row postprocessed wire values into column lists.
pub fn rezip_wire(rows: &[Vec<Value>], output_count: usize) -> Vec<Value> {
    (0..output_count)
        .map(|column| {
            Value::Array(
                rows.iter()
                    .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_batch_accepts_equal_lengths() {
        let inputs = vec![json!([1, 2, 3]), json!(["a", "b", "c"])];
        assert_eq!(validate_batch(&inputs, 4).unwrap(), 3);
    }

    #[test]
    fn test_validate_batch_rejects_oversize() {
        let inputs = vec![json!([1, 2, 3, 4, 5])];
        assert!(matches!(
            validate_batch(&inputs, 4),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_validate_batch_rejects_mismatched_lengths() {
        let inputs = vec![json!([1, 2]), json!([1, 2, 3])];
        assert!(matches!(
            validate_batch(&inputs, 4),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_rows_and_columns_round_trip_order() {
        let inputs = vec![json!([1, 2]), json!(["a", "b"])];
        let zipped = rows(&inputs, 2);
        assert_eq!(zipped, vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]]);

        let unzipped = columns(&zipped, 2);
        assert_eq!(unzipped, inputs);
    }

    #[test]
    fn test_unzip_outputs_row_wise() {
        let outputs = vec![
            OutputValue::Value(json!([10, 20])),
            OutputValue::Skip,
        ];
        let per_row = unzip_outputs(&outputs, 2).unwrap();
        assert_eq!(per_row.len(), 2);
        assert_eq!(per_row[0][0], OutputValue::Value(json!(10)));
        assert!(per_row[1][1].is_skip());
    }

    #[test]
    fn test_unzip_outputs_rejects_wrong_row_count() {
        let outputs = vec![OutputValue::Value(json!([1]))];
        assert!(matches!(
            unzip_outputs(&outputs, 2),
            Err(EngineError::Config(_))
        ));
    }
}
