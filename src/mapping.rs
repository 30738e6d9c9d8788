//! Mapping resolver - parses column mappings and expands them into a plan
//!
//! A mapping points each attribute path (`tax_lots.cost.amount`) at a column,
//! a `$`-prefixed constant, or a `{column, default}` record.

use crate::data;
use crate::error::CocoonError;
use polars::prelude::DataFrame;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CONSTANT_SENTINEL: char = '$';

/// Prefix for columns the resolver materialises itself
pub const SYNTHETIC_PREFIX: &str = "cocoon:";

/// Where an attribute's value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum MappingTarget {
    Column(String),
    Constant(Value),
    ColumnWithDefault { column: String, default: Value },
}

impl MappingTarget {
    /// Parse one mapping value. `Ok(None)` means the entry was explicitly null.
    pub fn parse(path: &str, value: &Value) -> Result<Option<Self>, CocoonError> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => match s.strip_prefix(CONSTANT_SENTINEL) {
                Some(literal) => Ok(Some(Self::Constant(Value::String(literal.to_string())))),
                None => Ok(Some(Self::Column(s.clone()))),
            },
            Value::Object(record) => Self::parse_record(path, record).map(Some),
            other => Err(CocoonError::mapping(
                path,
                format!("unsupported mapping value {other}"),
            )),
        }
    }

    fn parse_record(path: &str, record: &Map<String, Value>) -> Result<Self, CocoonError> {
        let column = match record.get("column") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(CocoonError::mapping(
                    path,
                    format!("`column` must be a string, got {other}"),
                ))
            }
        };
        let default = record.get("default").filter(|v| !v.is_null()).cloned();

        match (column, default) {
            (Some(column), Some(default)) => Ok(Self::ColumnWithDefault { column, default }),
            (Some(column), None) => Ok(Self::Column(column)),
            (None, Some(default)) => Ok(Self::Constant(default)),
            (None, None) => Err(CocoonError::mapping(
                path,
                "record needs a `column`, a `default`, or both",
            )),
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Column(c) | Self::ColumnWithDefault { column: c, .. } => Some(c),
            Self::Constant(_) => None,
        }
    }
}

fn is_record(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k == "column" || k == "default")
}

/// A parsed mapping, keyed by dotted attribute path
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSpec {
    entries: BTreeMap<String, MappingTarget>,
}

impl MappingSpec {
    /// Parse a required mapping: null targets are errors
    pub fn required(value: &Value) -> Result<Self, CocoonError> {
        Self::parse(value, true)
    }

    /// Parse an optional mapping: null targets are dropped
    pub fn optional(value: &Value) -> Result<Self, CocoonError> {
        Self::parse(value, false)
    }

    fn parse(value: &Value, required: bool) -> Result<Self, CocoonError> {
        let mut spec = Self::default();
        match value {
            Value::Null => {}
            Value::Object(map) => spec.collect("", map, required)?,
            other => {
                return Err(CocoonError::mapping(
                    "<root>",
                    format!("mapping must be an object, got {other}"),
                ))
            }
        }
        Ok(spec)
    }

    fn collect(
        &mut self,
        prefix: &str,
        map: &Map<String, Value>,
        required: bool,
    ) -> Result<(), CocoonError> {
        for (key, value) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };

            if let Value::Object(inner) = value {
                if !is_record(inner) {
                    self.collect(&path, inner, required)?;
                    continue;
                }
            }

            match MappingTarget::parse(&path, value)? {
                Some(target) => {
                    self.entries.insert(path, target);
                }
                None if required => {
                    return Err(CocoonError::mapping(path, "required mapping is null"));
                }
                None => {}
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, path: impl Into<String>, target: MappingTarget) {
        self.entries.insert(path.into(), target);
    }

    pub fn get(&self, path: &str) -> Option<&MappingTarget> {
        self.entries.get(path)
    }

    /// Whether any path starts with this top-level attribute
    pub fn has_attribute(&self, attribute: &str) -> bool {
        self.entries
            .keys()
            .any(|path| path.split('.').next() == Some(attribute))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MappingTarget)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A path resolved to the column that holds its values
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    pub column: String,
    /// The column was materialised from a constant
    pub constant: bool,
}

/// Dotted path -> column to read at population time
pub type ResolvedMapping = BTreeMap<String, ResolvedColumn>;

/// Materialise constants and defaults on the frame and resolve every path to a column
pub fn resolve(df: &mut DataFrame, spec: &MappingSpec) -> Result<ResolvedMapping, CocoonError> {
    let mut resolved = ResolvedMapping::new();

    for (path, target) in spec.iter() {
        let entry = match target {
            MappingTarget::Column(column) => ResolvedColumn {
                column: column.clone(),
                constant: false,
            },
            MappingTarget::Constant(value) => {
                let column = synthetic_column(path);
                data::materialize_constant(df, &column, value)?;
                ResolvedColumn {
                    column,
                    constant: true,
                }
            }
            MappingTarget::ColumnWithDefault { column, default } => {
                if !data::has_column(df, column) {
                    return Err(CocoonError::mapping(
                        path.as_str(),
                        format!("column `{column}` is not in the data"),
                    ));
                }
                data::fill_nulls(df, column, default)?;
                ResolvedColumn {
                    column: column.clone(),
                    constant: false,
                }
            }
        };
        resolved.insert(path.clone(), entry);
    }

    Ok(resolved)
}

/// Deterministic name for a column materialised for `path`
pub fn synthetic_column(path: &str) -> String {
    format!("{SYNTHETIC_PREFIX}{path}")
}

// ============================================
// PLAN TREE
// ============================================

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Column(String),
    Branch(MappingPlan),
}

/// Nested form of a resolved mapping, shaped like the target model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingPlan {
    nodes: BTreeMap<String, PlanNode>,
}

impl MappingPlan {
    /// Expand dotted paths into a tree
    pub fn expand(resolved: &ResolvedMapping) -> Result<Self, CocoonError> {
        let mut plan = Self::default();
        for (path, entry) in resolved {
            plan.insert_path(path, &entry.column)?;
        }
        Ok(plan)
    }

    fn insert_path(&mut self, path: &str, column: &str) -> Result<(), CocoonError> {
        let mut node = self;
        let mut parts = path.split('.').peekable();

        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                if let Some(PlanNode::Branch(_)) = node.nodes.get(part) {
                    return Err(CocoonError::mapping(
                        path,
                        "attribute is mapped both as a value and as a nested object",
                    ));
                }
                node.nodes
                    .insert(part.to_string(), PlanNode::Column(column.to_string()));
                return Ok(());
            }

            let child = node
                .nodes
                .entry(part.to_string())
                .or_insert_with(|| PlanNode::Branch(MappingPlan::default()));
            node = match child {
                PlanNode::Branch(plan) => plan,
                PlanNode::Column(_) => {
                    return Err(CocoonError::mapping(
                        path,
                        "attribute is mapped both as a value and as a nested object",
                    ))
                }
            };
        }

        Err(CocoonError::mapping(path, "empty attribute path"))
    }

    /// Merge `other` into `self`: branches recurse, leaves from `other` win
    pub fn deep_merge(&mut self, other: MappingPlan) -> Result<(), CocoonError> {
        self.merge_at("", other)
    }

    fn merge_at(&mut self, prefix: &str, other: MappingPlan) -> Result<(), CocoonError> {
        for (key, incoming) in other.nodes {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };

            match (self.nodes.get_mut(&key), incoming) {
                (None, incoming) => {
                    self.nodes.insert(key, incoming);
                }
                (Some(PlanNode::Branch(existing)), PlanNode::Branch(incoming)) => {
                    existing.merge_at(&path, incoming)?;
                }
                (Some(PlanNode::Column(existing)), PlanNode::Column(incoming)) => {
                    tracing::warn!(
                        "Mapping for {} overridden: {} -> {}",
                        path,
                        existing,
                        incoming
                    );
                    *existing = incoming;
                }
                _ => {
                    return Err(CocoonError::mapping(
                        path,
                        "attribute is mapped both as a value and as a nested object",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Dot-join the tree back into paths
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, out: &mut BTreeMap<String, String>) {
        for (key, node) in &self.nodes {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match node {
                PlanNode::Column(column) => {
                    out.insert(path, column.clone());
                }
                PlanNode::Branch(plan) => plan.flatten_into(&path, out),
            }
        }
    }

    pub fn get(&self, attribute: &str) -> Option<&PlanNode> {
        self.nodes.get(attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::string_values;
    use polars::prelude::*;
    use serde_json::json;

    #[test]
    fn column_with_default_backfills_in_place() {
        let mut df = df!("instrument_name" => [Some("Apple"), None]).unwrap();
        let spec = MappingSpec::required(&json!({
            "name": {"column": "instrument_name", "default": "<Unknown>"}
        }))
        .unwrap();

        let resolved = resolve(&mut df, &spec).unwrap();

        assert_eq!(resolved["name"].column, "instrument_name");
        assert!(!resolved["name"].constant);
        assert_eq!(
            string_values(&df, "instrument_name").unwrap(),
            vec![Some("Apple".to_string()), Some("<Unknown>".to_string())]
        );
    }

    #[test]
    fn constant_materialises_a_new_column() {
        let mut df = df!("code" => ["A", "B"]).unwrap();
        let spec = MappingSpec::required(&json!({"code": "$FIXED"})).unwrap();

        let resolved = resolve(&mut df, &spec).unwrap();

        let column = &resolved["code"].column;
        assert_eq!(column, &synthetic_column("code"));
        assert_ne!(column, "code");
        assert!(resolved["code"].constant);
        assert_eq!(
            string_values(&df, column).unwrap(),
            vec![Some("FIXED".to_string()); 2]
        );
        // original column untouched
        assert_eq!(
            string_values(&df, "code").unwrap(),
            vec![Some("A".to_string()), Some("B".to_string())]
        );
    }

    #[test]
    fn default_only_record_is_a_constant() {
        let target = MappingTarget::parse("units", &json!({"default": 100})).unwrap();
        assert_eq!(target, Some(MappingTarget::Constant(json!(100))));
    }

    #[test]
    fn empty_record_is_rejected() {
        let err = MappingSpec::required(&json!({"name": {"column": null}})).unwrap_err();
        assert!(matches!(err, CocoonError::Mapping { .. }));
    }

    #[test]
    fn unsupported_value_type_is_rejected() {
        let err = MappingSpec::required(&json!({"units": 5})).unwrap_err();
        assert!(matches!(err, CocoonError::Mapping { ref path, .. } if path == "units"));
    }

    #[test]
    fn optional_nulls_are_dropped_required_nulls_fail() {
        let optional = MappingSpec::optional(&json!({"description": null, "name": "n"})).unwrap();
        assert!(optional.get("description").is_none());
        assert!(optional.get("name").is_some());

        assert!(MappingSpec::required(&json!({"description": null})).is_err());
    }

    #[test]
    fn nested_objects_become_dotted_paths() {
        let spec = MappingSpec::required(&json!({
            "tax_lots": {"cost": {"amount": "cost", "currency": "$GBP"}}
        }))
        .unwrap();
        assert_eq!(
            spec.get("tax_lots.cost.amount"),
            Some(&MappingTarget::Column("cost".into()))
        );
        assert!(spec.has_attribute("tax_lots"));
    }

    #[test]
    fn expand_then_flatten_round_trips() {
        let mut resolved = ResolvedMapping::new();
        for (path, column) in [
            ("name", "n"),
            ("tax_lots.units", "u"),
            ("tax_lots.cost.amount", "c"),
            ("tax_lots.cost.currency", "ccy"),
        ] {
            resolved.insert(
                path.to_string(),
                ResolvedColumn {
                    column: column.to_string(),
                    constant: false,
                },
            );
        }

        let plan = MappingPlan::expand(&resolved).unwrap();
        let flat = plan.flatten();

        let original: BTreeMap<String, String> = resolved
            .into_iter()
            .map(|(k, v)| (k, v.column))
            .collect();
        assert_eq!(flat, original);
    }

    #[test]
    fn leaf_and_branch_on_same_path_conflict() {
        let mut resolved = ResolvedMapping::new();
        for path in ["cost", "cost.amount"] {
            resolved.insert(
                path.to_string(),
                ResolvedColumn {
                    column: "c".into(),
                    constant: false,
                },
            );
        }
        assert!(MappingPlan::expand(&resolved).is_err());
    }

    #[test]
    fn deep_merge_recurses_and_overwrites_leaves() {
        let mut required = MappingPlan::default();
        required.insert_path("cost.amount", "a").unwrap();
        required.insert_path("units", "u").unwrap();

        let mut optional = MappingPlan::default();
        optional.insert_path("cost.currency", "ccy").unwrap();
        optional.insert_path("units", "u2").unwrap();

        required.deep_merge(optional).unwrap();
        let flat = required.flatten();
        assert_eq!(flat["cost.amount"], "a");
        assert_eq!(flat["cost.currency"], "ccy");
        assert_eq!(flat["units"], "u2");
    }
}
