//! Data loading and column-level rewrites on polars frames

use polars::prelude::*;
use serde_json::Value;
use std::path::Path;

/// Load a single parquet file
pub fn load_parquet(path: &Path) -> anyhow::Result<DataFrame> {
    let df = LazyFrame::scan_parquet(path, Default::default())?.collect()?;
    Ok(df)
}

/// Load a single CSV file
pub fn load_csv(path: &Path) -> anyhow::Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

/// Load a frame from a parquet or CSV file, picked by extension
pub fn load_frame(path: &Path) -> anyhow::Result<DataFrame> {
    if !path.exists() {
        anyhow::bail!("Data file does not exist: {:?}", path);
    }

    let df = match path.extension().and_then(|s| s.to_str()) {
        Some("parquet") => load_parquet(path)?,
        Some("csv") => load_csv(path)?,
        other => anyhow::bail!("Unsupported data file extension: {:?}", other),
    };

    tracing::info!(
        "Loaded {:?}: {} rows x {} columns",
        path,
        df.height(),
        df.width()
    );
    Ok(df)
}

// ============================================
// CELL ACCESS
// ============================================

/// Convert a polars cell into JSON. Nulls and NaN become `Value::Null`.
pub fn any_to_json(value: AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int32(v) => Value::from(v),
        AnyValue::Int64(v) => Value::from(v),
        AnyValue::UInt32(v) => Value::from(v),
        AnyValue::UInt64(v) => Value::from(v),
        AnyValue::Float32(v) => float_json(v as f64),
        AnyValue::Float64(v) => float_json(v),
        other => Value::String(other.to_string()),
    }
}

fn float_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Read one cell as JSON
pub fn cell(df: &DataFrame, column: &str, row: usize) -> PolarsResult<Value> {
    Ok(any_to_json(df.column(column)?.get(row)?))
}

/// Render a JSON scalar the way it should appear in a text column
pub fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Column values as optional strings, casting whatever the dtype is
pub fn string_values(df: &DataFrame, name: &str) -> PolarsResult<Vec<Option<String>>> {
    let col = df.column(name)?.cast(&DataType::String)?;
    let values = col
        .str()?
        .into_iter()
        .map(|s| s.map(|s| s.to_string()))
        .collect();
    Ok(values)
}

/// Original row positions recorded by [`with_row_ids`]
pub fn row_ids(df: &DataFrame, name: &str) -> PolarsResult<Vec<i64>> {
    let col = df.column(name)?.cast(&DataType::Int64)?;
    Ok(col.i64()?.into_iter().map(|v| v.unwrap_or(-1)).collect())
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

// ============================================
// COLUMN REWRITES
// ============================================

/// Tag every row with its position in the input frame
pub fn with_row_ids(df: &DataFrame, name: &str) -> PolarsResult<DataFrame> {
    df.with_row_index(name.into(), None)
}

/// Add (or replace) a column holding `value` on every row
pub fn materialize_constant(df: &mut DataFrame, name: &str, value: &Value) -> PolarsResult<()> {
    let height = df.height();
    let series = match value {
        Value::Bool(b) => Series::new(name.into(), vec![*b; height]),
        Value::Number(n) if n.is_i64() => {
            Series::new(name.into(), vec![n.as_i64().unwrap_or_default(); height])
        }
        Value::Number(n) => Series::new(name.into(), vec![n.as_f64().unwrap_or(f64::NAN); height]),
        other => {
            let text = json_text(other);
            Series::new(name.into(), vec![text; height])
        }
    };
    df.with_column(series)?;
    Ok(())
}

/// Replace nulls in `name` with `value`, in place
pub fn fill_nulls(df: &mut DataFrame, name: &str, value: &Value) -> PolarsResult<()> {
    let col = df.column(name)?;
    let untyped = col.dtype() == &DataType::Null;
    // typed defaults only apply to columns of that type; anything else backfills as text
    let filled = match value {
        Value::Bool(b) if untyped || col.dtype() == &DataType::Boolean => {
            let cast = col.cast(&DataType::Boolean)?;
            let values: Vec<bool> = cast.bool()?.into_iter().map(|v| v.unwrap_or(*b)).collect();
            Series::new(name.into(), values)
        }
        Value::Number(n) if n.is_i64() && (untyped || col.dtype().is_integer()) => {
            let default = n.as_i64().unwrap_or_default();
            let cast = col.cast(&DataType::Int64)?;
            let values: Vec<i64> = cast.i64()?.into_iter().map(|v| v.unwrap_or(default)).collect();
            Series::new(name.into(), values)
        }
        Value::Number(n) if untyped || col.dtype().is_primitive_numeric() => {
            let default = n.as_f64().unwrap_or(f64::NAN);
            let cast = col.cast(&DataType::Float64)?;
            let values: Vec<f64> = cast.f64()?.into_iter().map(|v| v.unwrap_or(default)).collect();
            Series::new(name.into(), values)
        }
        other => {
            let default = json_text(other);
            let cast = col.cast(&DataType::String)?;
            let values: Vec<Option<String>> = cast
                .str()?
                .into_iter()
                .map(|v| v.map(|s| s.to_string()).or_else(|| default.clone()))
                .collect();
            Series::new(name.into(), values)
        }
    };
    df.with_column(filled)?;
    Ok(())
}

/// Trim leading/trailing whitespace in the named text columns
pub fn strip_whitespace(df: &mut DataFrame, names: &[String]) -> PolarsResult<()> {
    for name in names {
        let col = df.column(name)?;
        if col.dtype() != &DataType::String {
            continue;
        }
        let trimmed: Vec<Option<String>> = col
            .str()?
            .into_iter()
            .map(|v| v.map(|s| s.trim().to_string()))
            .collect();
        df.with_column(Series::new(name.as_str().into(), trimmed))?;
    }
    Ok(())
}

/// Render list cells as text so every cell maps onto a scalar attribute
pub fn stringify_complex(df: &mut DataFrame) -> PolarsResult<Vec<String>> {
    let nested: Vec<String> = df
        .get_columns()
        .iter()
        .filter(|c| matches!(c.dtype(), DataType::List(_)))
        .map(|c| c.name().to_string())
        .collect();

    for name in &nested {
        let col = df.column(name)?;
        let mut values: Vec<Option<String>> = Vec::with_capacity(col.len());
        for i in 0..col.len() {
            values.push(match col.get(i)? {
                AnyValue::Null => None,
                other => Some(other.to_string()),
            });
        }
        df.with_column(Series::new(name.as_str().into(), values))?;
    }

    Ok(nested)
}

/// Remote data type for a property whose values come from a column of this dtype
pub fn property_data_type(dtype: &DataType) -> &'static str {
    if dtype.is_primitive_numeric() {
        "number"
    } else if dtype.is_temporal() {
        "dateTime"
    } else {
        "string"
    }
}
