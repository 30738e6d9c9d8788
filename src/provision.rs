//! Property definition auto-provisioning
//!
//! Property and sub-holding-key columns need a definition on the platform
//! before any row can carry them. Missing definitions are created up front,
//! typed from the column's dtype.

use crate::api::PlatformApi;
use crate::data;
use crate::error::CocoonError;
use crate::models::{CreatePropertyDefinitionRequest, ResourceId};
use polars::prelude::DataFrame;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Domain that holds sub-holding-key definitions
pub const SUB_HOLDING_KEY_DOMAIN: &str = "Transaction";

const DATA_TYPE_SCOPE: &str = "system";
const LIFE_TIME: &str = "Perpetual";

/// A column whose values become properties: `"sector"` or `{"source": "Sector ", "target": "sector"}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PropertyColumn {
    Name(String),
    Renamed {
        source: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl PropertyColumn {
    /// Column the values are read from
    pub fn source(&self) -> &str {
        match self {
            PropertyColumn::Name(name) => name,
            PropertyColumn::Renamed { source, .. } => source,
        }
    }

    /// Property code on the platform
    pub fn code(&self) -> String {
        match self {
            PropertyColumn::Renamed {
                target: Some(target),
                ..
            } => sanitize_code(target),
            other => sanitize_code(other.source()),
        }
    }

    pub fn key(&self, domain: &str, scope: &str) -> String {
        format!("{}/{}/{}", domain, scope, self.code())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`
pub fn sanitize_code(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Make sure every column has a property definition in `domain`/`scope`.
///
/// Returns (property key, source column) pairs in input order, one per
/// distinct key.
pub fn ensure_property_definitions(
    api: &dyn PlatformApi,
    domain: &str,
    scope: &str,
    columns: &[PropertyColumn],
    frame: &DataFrame,
) -> Result<Vec<(String, String)>, CocoonError> {
    let mut seen = BTreeSet::new();
    let mut keyed = Vec::new();
    let mut created = 0usize;

    for column in columns {
        let key = column.key(domain, scope);
        if !seen.insert(key.clone()) {
            tracing::warn!("Property {} requested twice, skipping column {}", key, column.source());
            continue;
        }
        let dtype = frame.column(column.source())?.dtype();
        let code = column.code();

        let existing = api
            .get_property_definition(domain, scope, &code)
            .map_err(|source| CocoonError::Provisioning {
                key: key.clone(),
                source,
            })?;

        if existing.is_none() {
            let request = CreatePropertyDefinitionRequest {
                domain: domain.to_string(),
                scope: scope.to_string(),
                code: code.clone(),
                value_required: false,
                display_name: column.source().trim().to_string(),
                data_type_id: ResourceId {
                    scope: DATA_TYPE_SCOPE.to_string(),
                    code: data::property_data_type(dtype).to_string(),
                },
                life_time: LIFE_TIME.to_string(),
            };
            api.create_property_definition(&request)
                .map_err(|source| CocoonError::Provisioning {
                    key: key.clone(),
                    source,
                })?;
            created += 1;
        }

        keyed.push((key, column.source().to_string()));
    }

    tracing::info!(
        "Property definitions in {}/{}: {} checked, {} created",
        domain,
        scope,
        keyed.len(),
        created
    );
    Ok(keyed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BatchError;
    use crate::mock::MockApi;
    use polars::prelude::*;
    use serde_json::json;

    #[test]
    fn property_columns_parse_from_names_or_records() {
        let columns: Vec<PropertyColumn> = serde_json::from_value(json!([
            "sector",
            {"source": "Country of Risk", "target": "country"},
            {"source": "Asset Class"}
        ]))
        .unwrap();

        assert_eq!(columns[0].code(), "sector");
        assert_eq!(columns[1].source(), "Country of Risk");
        assert_eq!(columns[1].code(), "country");
        assert_eq!(columns[2].code(), "Asset_Class");
        assert_eq!(columns[1].key("Instrument", "props"), "Instrument/props/country");
    }

    #[test]
    fn codes_are_sanitized() {
        assert_eq!(sanitize_code(" P/E ratio (%) "), "P_E_ratio____");
        assert_eq!(sanitize_code("already-ok_1"), "already-ok_1");
    }

    #[test]
    fn only_missing_definitions_are_created() {
        let api = MockApi::default();
        api.define("Instrument/props/sector");
        let frame = df!("sector" => ["Tech"], "pe" => [12.5], "listed" => ["2020-01-01"]).unwrap();
        let columns = vec![
            PropertyColumn::Name("sector".into()),
            PropertyColumn::Renamed {
                source: "pe".into(),
                target: Some("P/E".into()),
            },
        ];

        let keyed = ensure_property_definitions(&api, "Instrument", "props", &columns, &frame).unwrap();

        assert_eq!(
            keyed,
            vec![
                ("Instrument/props/sector".to_string(), "sector".to_string()),
                ("Instrument/props/P_E".to_string(), "pe".to_string()),
            ]
        );
        let created = api.created_definitions();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].code, "P_E");
        assert_eq!(created[0].data_type_id.scope, "system");
        assert_eq!(created[0].data_type_id.code, "number");
    }

    #[test]
    fn missing_column_fails_before_any_call() {
        let api = MockApi::default();
        let frame = df!("sector" => ["Tech"]).unwrap();
        let columns = vec![PropertyColumn::Name("country".into())];

        assert!(ensure_property_definitions(&api, "Instrument", "props", &columns, &frame).is_err());
        assert!(api.calls().is_empty());
    }

    #[test]
    fn lookup_failure_is_a_provisioning_error() {
        let api = MockApi {
            definition_error: Some(BatchError::Transport {
                message: "connection reset".into(),
            }),
            ..MockApi::default()
        };
        let frame = df!("sector" => ["Tech"]).unwrap();
        let columns = vec![PropertyColumn::Name("sector".into())];

        let err = ensure_property_definitions(&api, "Instrument", "props", &columns, &frame).unwrap_err();
        assert!(
            matches!(err, CocoonError::Provisioning { ref key, .. } if key == "Instrument/props/sector")
        );
    }
}
