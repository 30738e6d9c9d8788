//! Model populator - builds request trees from dataframe rows
//!
//! Walks a model's declared schema against the mapping plan. Identifier,
//! property and sub-holding-key attributes come from side channels rather
//! than the plan. A nested object whose mapped attributes are all absent
//! populates as `None` instead of an object full of defaults.

use crate::data;
use crate::dates;
use crate::error::CocoonError;
use crate::mapping::{MappingPlan, PlanNode};
use crate::models::{
    schema_of, FieldKind, IdentifierShape, ModelSchema, PropertyShape, PropertyValue, Scalar,
};
use polars::prelude::DataFrame;
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const INSTRUMENT_KEY_PREFIX: &str = "Instrument/";
const DEFAULT_IDENTIFIER_SCOPE: &str = "Instrument/default/";

/// Identifier key in the form the entity's calls expect
pub fn identifier_key(key: &str, full_key_format: bool) -> String {
    if full_key_format {
        if key.starts_with(INSTRUMENT_KEY_PREFIX) {
            key.to_string()
        } else {
            format!("{DEFAULT_IDENTIFIER_SCOPE}{key}")
        }
    } else {
        key.rsplit('/').next().unwrap_or(key).to_string()
    }
}

/// Columns that feed attributes outside the row mapping
#[derive(Debug, Clone, Default)]
pub struct SideChannels {
    /// (identifier key, column)
    pub identifiers: Vec<(String, String)>,
    /// (property key, column)
    pub properties: Vec<(String, String)>,
    /// (property key, column)
    pub sub_holding_keys: Vec<(String, String)>,
}

impl SideChannels {
    pub fn new(identifier_mapping: &BTreeMap<String, String>, full_key_format: bool) -> Self {
        Self {
            identifiers: identifier_mapping
                .iter()
                .map(|(key, column)| (identifier_key(key, full_key_format), column.clone()))
                .collect(),
            properties: Vec::new(),
            sub_holding_keys: Vec::new(),
        }
    }

    /// Every column a side channel reads
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.identifiers
            .iter()
            .chain(&self.properties)
            .chain(&self.sub_holding_keys)
            .map(|(_, column)| column.as_str())
    }

    pub fn row_context<'a>(
        &self,
        frame: &'a DataFrame,
        row: usize,
        row_id: i64,
    ) -> Result<RowContext<'a>, CocoonError> {
        let mut identifiers = BTreeMap::new();
        for (key, column) in &self.identifiers {
            let value = data::cell(frame, column, row)?;
            if let Some(text) = data::json_text(&value) {
                let text = text.trim();
                if !text.is_empty() {
                    identifiers.insert(key.clone(), text.to_string());
                }
            }
        }

        Ok(RowContext {
            frame,
            row,
            row_id,
            identifiers,
            properties: property_values(frame, row, &self.properties)?,
            sub_holding_keys: property_values(frame, row, &self.sub_holding_keys)?,
        })
    }
}

fn property_values(
    frame: &DataFrame,
    row: usize,
    columns: &[(String, String)],
) -> Result<BTreeMap<String, PropertyValue>, CocoonError> {
    let mut out = BTreeMap::new();
    for (key, column) in columns {
        if let Some(value) = PropertyValue::from_json(&data::cell(frame, column, row)?) {
            out.insert(key.clone(), value);
        }
    }
    Ok(out)
}

/// One row plus its precomputed side-channel values
#[derive(Debug)]
pub struct RowContext<'a> {
    pub frame: &'a DataFrame,
    pub row: usize,
    /// Position of the row in the caller's frame
    pub row_id: i64,
    pub identifiers: BTreeMap<String, String>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub sub_holding_keys: BTreeMap<String, PropertyValue>,
}

// ============================================
// PLAN VALIDATION
// ============================================

/// Check that every nested mapping lands on a nested attribute of a known model
pub fn check_plan(schema: &ModelSchema, plan: &MappingPlan) -> Result<(), CocoonError> {
    for field in schema.fields {
        let Some(node) = plan.get(field.name) else {
            continue;
        };
        match (field.kind, node) {
            (FieldKind::Scalar(_), PlanNode::Column(_)) => {}
            (FieldKind::Nested(t) | FieldKind::NestedList(t), PlanNode::Branch(sub)) => {
                let child = schema_of(t).ok_or_else(|| {
                    CocoonError::schema(schema.name, format!("unknown nested model `{t}`"))
                })?;
                check_plan(child, sub)?;
            }
            (FieldKind::Scalar(_), PlanNode::Branch(_)) => {
                return Err(CocoonError::schema(
                    schema.name,
                    format!("`{}` is a value but is mapped as a nested object", field.name),
                ))
            }
            (FieldKind::Nested(_) | FieldKind::NestedList(_), PlanNode::Column(_)) => {
                return Err(CocoonError::schema(
                    schema.name,
                    format!("`{}` is a nested object but is mapped to a column", field.name),
                ))
            }
            (_, _) => {
                return Err(CocoonError::schema(
                    schema.name,
                    format!(
                        "`{}` is filled from identifier/property columns and cannot be mapped",
                        field.name
                    ),
                ))
            }
        }
    }

    for attribute in plan.attributes() {
        if schema.field(attribute).is_none() {
            tracing::debug!("{} has no attribute {}, mapping ignored", schema.name, attribute);
        }
    }

    Ok(())
}

// ============================================
// POPULATION
// ============================================

/// Build the request tree for one row, or `None` if nothing mapped has a value
pub fn populate(
    schema: &ModelSchema,
    plan: &MappingPlan,
    ctx: &RowContext<'_>,
) -> Result<Option<Value>, CocoonError> {
    let mut out = Map::new();
    let mut present = 0usize;

    for field in schema.fields {
        match field.kind {
            FieldKind::Identifiers(shape) => {
                if !ctx.identifiers.is_empty() {
                    out.insert(field.name.to_string(), identifiers_json(&ctx.identifiers, shape));
                }
            }
            FieldKind::Properties(shape) => {
                if !ctx.properties.is_empty() {
                    out.insert(field.name.to_string(), properties_json(&ctx.properties, shape));
                }
            }
            FieldKind::SubHoldingKeys => {
                if !ctx.sub_holding_keys.is_empty() {
                    out.insert(
                        field.name.to_string(),
                        properties_json(&ctx.sub_holding_keys, PropertyShape::Map),
                    );
                }
            }
            FieldKind::Scalar(kind) => {
                let Some(node) = plan.get(field.name) else {
                    continue;
                };
                let PlanNode::Column(column) = node else {
                    return Err(CocoonError::schema(
                        schema.name,
                        format!("`{}` is a value but is mapped as a nested object", field.name),
                    ));
                };
                let value = data::cell(ctx.frame, column, ctx.row)?;
                if value.is_null() {
                    continue;
                }
                out.insert(field.name.to_string(), coerce(kind, value, column, ctx.row_id)?);
                present += 1;
            }
            FieldKind::Nested(type_name) | FieldKind::NestedList(type_name) => {
                let Some(node) = plan.get(field.name) else {
                    continue;
                };
                let PlanNode::Branch(sub_plan) = node else {
                    return Err(CocoonError::schema(
                        schema.name,
                        format!("`{}` is a nested object but is mapped to a column", field.name),
                    ));
                };
                let child = schema_of(type_name).ok_or_else(|| {
                    CocoonError::schema(schema.name, format!("unknown nested model `{type_name}`"))
                })?;
                if let Some(value) = populate(child, sub_plan, ctx)? {
                    let value = match field.kind {
                        FieldKind::NestedList(_) => Value::Array(vec![value]),
                        _ => value,
                    };
                    out.insert(field.name.to_string(), value);
                    present += 1;
                }
            }
        }
    }

    if present == 0 {
        return Ok(None);
    }
    Ok(Some(Value::Object(out)))
}

fn coerce(kind: Scalar, value: Value, column: &str, row_id: i64) -> Result<Value, CocoonError> {
    let bad = |expected: &str, value: &Value| CocoonError::Population {
        row: row_id,
        reason: format!("column `{column}` holds {value}, expected {expected}"),
    };

    match kind {
        Scalar::Text => Ok(Value::String(data::json_text(&value).unwrap_or_default())),
        Scalar::Number => {
            if value.is_number() {
                return Ok(value);
            }
            value
                .as_str()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| bad("a number", &value))
        }
        Scalar::Boolean => {
            if value.is_boolean() {
                return Ok(value);
            }
            let parsed = value
                .as_str()
                .map(|s| s.trim().to_lowercase())
                .and_then(|s| match s.as_str() {
                    "true" | "yes" | "1" => Some(true),
                    "false" | "no" | "0" => Some(false),
                    _ => None,
                });
            parsed.map(Value::Bool).ok_or_else(|| bad("a boolean", &value))
        }
        Scalar::DateTime => {
            let text = data::json_text(&value).unwrap_or_default();
            Ok(Value::String(dates::normalize(&text)))
        }
    }
}

fn identifiers_json(identifiers: &BTreeMap<String, String>, shape: IdentifierShape) -> Value {
    let map: Map<String, Value> = identifiers
        .iter()
        .map(|(key, value)| {
            let value = match shape {
                IdentifierShape::Wrapped => json!({ "value": value }),
                IdentifierShape::Plain => Value::String(value.clone()),
            };
            (key.clone(), value)
        })
        .collect();
    Value::Object(map)
}

fn property_json(key: &str, value: &PropertyValue) -> Value {
    let mut inner = Map::new();
    if let Some(label) = &value.label_value {
        inner.insert("label_value".into(), Value::String(label.clone()));
    }
    if let Some(metric) = &value.metric_value {
        inner.insert("metric_value".into(), json!({ "value": metric.value, "unit": metric.unit }));
    }
    json!({ "key": key, "value": inner })
}

fn properties_json(properties: &BTreeMap<String, PropertyValue>, shape: PropertyShape) -> Value {
    match shape {
        PropertyShape::List => Value::Array(
            properties
                .iter()
                .map(|(key, value)| property_json(key, value))
                .collect(),
        ),
        PropertyShape::Map => Value::Object(
            properties
                .iter()
                .map(|(key, value)| (key.clone(), property_json(key, value)))
                .collect(),
        ),
    }
}

/// Populate every row of a batch, in row order
pub fn populate_rows(
    schema: &ModelSchema,
    plan: &MappingPlan,
    channels: &SideChannels,
    frame: &DataFrame,
    row_id_column: &str,
) -> Result<Vec<(i64, Value)>, CocoonError> {
    let ids = data::row_ids(frame, row_id_column)?;

    (0..frame.height())
        .into_par_iter()
        .map(|row| {
            let ctx = channels.row_context(frame, row, ids[row])?;
            match populate(schema, plan, &ctx)? {
                Some(tree) => Ok((ids[row], tree)),
                None => Err(CocoonError::Population {
                    row: ids[row],
                    reason: format!("no mapped attribute of {} has a value", schema.name),
                }),
            }
        })
        .collect()
}
