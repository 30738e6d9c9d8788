//! Platform request/response models and their declared attribute schemas
//!
//! Requests deserialize from the snake_case trees the populator builds and
//! serialize to the platform's camelCase wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================
// SCHEMA
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Text,
    Number,
    Boolean,
    DateTime,
}

/// `identifiers: {"Figi": {"value": ..}}` vs `instrument_identifiers: {"Instrument/default/Figi": ..}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierShape {
    Wrapped,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyShape {
    List,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(Scalar),
    Nested(&'static str),
    /// A collection the loader always fills with exactly one element
    NestedList(&'static str),
    Identifiers(IdentifierShape),
    Properties(PropertyShape),
    SubHoldingKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl Field {
    /// Filled from identifier/property/sub-holding-key columns, not the row mapping
    pub fn is_side_channel(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Identifiers(_) | FieldKind::Properties(_) | FieldKind::SubHoldingKeys
        )
    }
}

#[derive(Debug)]
pub struct ModelSchema {
    pub name: &'static str,
    pub fields: &'static [Field],
}

impl ModelSchema {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

const fn req(name: &'static str, kind: FieldKind) -> Field {
    Field {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: FieldKind) -> Field {
    Field {
        name,
        kind,
        required: false,
    }
}

const TEXT: FieldKind = FieldKind::Scalar(Scalar::Text);
const NUMBER: FieldKind = FieldKind::Scalar(Scalar::Number);
const DATETIME: FieldKind = FieldKind::Scalar(Scalar::DateTime);

static SCHEMAS: &[ModelSchema] = &[
    ModelSchema {
        name: "InstrumentDefinition",
        fields: &[
            req("name", TEXT),
            req("identifiers", FieldKind::Identifiers(IdentifierShape::Wrapped)),
            opt("properties", FieldKind::Properties(PropertyShape::List)),
            opt("look_through_portfolio_id", FieldKind::Nested("ResourceId")),
        ],
    },
    ModelSchema {
        name: "UpsertInstrumentPropertyRequest",
        fields: &[
            req("identifier_type", TEXT),
            req("identifier", TEXT),
            opt("properties", FieldKind::Properties(PropertyShape::List)),
        ],
    },
    ModelSchema {
        name: "CreateTransactionPortfolioRequest",
        fields: &[
            req("display_name", TEXT),
            opt("description", TEXT),
            req("code", TEXT),
            opt("created", DATETIME),
            req("base_currency", TEXT),
            opt("corporate_action_source_id", FieldKind::Nested("ResourceId")),
            opt("accounting_method", TEXT),
            opt("properties", FieldKind::Properties(PropertyShape::Map)),
        ],
    },
    ModelSchema {
        name: "CreateReferencePortfolioRequest",
        fields: &[
            req("display_name", TEXT),
            opt("description", TEXT),
            req("code", TEXT),
            opt("created", DATETIME),
            opt("properties", FieldKind::Properties(PropertyShape::Map)),
        ],
    },
    ModelSchema {
        name: "CreatePortfolioGroupRequest",
        fields: &[
            req("code", TEXT),
            req("display_name", TEXT),
            opt("description", TEXT),
            opt("created", DATETIME),
            opt("values", FieldKind::NestedList("ResourceId")),
            opt("properties", FieldKind::Properties(PropertyShape::Map)),
        ],
    },
    ModelSchema {
        name: "TransactionRequest",
        fields: &[
            req("transaction_id", TEXT),
            req("type", TEXT),
            req(
                "instrument_identifiers",
                FieldKind::Identifiers(IdentifierShape::Plain),
            ),
            req("transaction_date", DATETIME),
            req("settlement_date", DATETIME),
            req("units", NUMBER),
            opt("transaction_price", FieldKind::Nested("TransactionPrice")),
            req("total_consideration", FieldKind::Nested("CurrencyAndAmount")),
            opt("exchange_rate", NUMBER),
            opt("transaction_currency", TEXT),
            opt("properties", FieldKind::Properties(PropertyShape::Map)),
            opt("counterparty_id", TEXT),
            opt("source", TEXT),
        ],
    },
    ModelSchema {
        name: "AdjustHoldingRequest",
        fields: &[
            req(
                "instrument_identifiers",
                FieldKind::Identifiers(IdentifierShape::Plain),
            ),
            opt("sub_holding_keys", FieldKind::SubHoldingKeys),
            opt("properties", FieldKind::Properties(PropertyShape::Map)),
            req("tax_lots", FieldKind::NestedList("TargetTaxLotRequest")),
            opt("currency", TEXT),
        ],
    },
    ModelSchema {
        name: "TargetTaxLotRequest",
        fields: &[
            req("units", NUMBER),
            opt("cost", FieldKind::Nested("CurrencyAndAmount")),
            opt("portfolio_cost", NUMBER),
            opt("price", NUMBER),
            opt("purchase_date", DATETIME),
            opt("settlement_date", DATETIME),
        ],
    },
    ModelSchema {
        name: "UpsertQuoteRequest",
        fields: &[
            req("quote_id", FieldKind::Nested("QuoteId")),
            opt("metric_value", FieldKind::Nested("MetricValue")),
            opt("lineage", TEXT),
            opt("scale_factor", NUMBER),
        ],
    },
    ModelSchema {
        name: "QuoteId",
        fields: &[
            req("quote_series_id", FieldKind::Nested("QuoteSeriesId")),
            req("effective_at", DATETIME),
        ],
    },
    ModelSchema {
        name: "QuoteSeriesId",
        fields: &[
            req("provider", TEXT),
            opt("price_source", TEXT),
            req("instrument_id", TEXT),
            req("instrument_id_type", TEXT),
            req("quote_type", TEXT),
            req("field", TEXT),
        ],
    },
    ModelSchema {
        name: "MetricValue",
        fields: &[opt("value", NUMBER), opt("unit", TEXT)],
    },
    ModelSchema {
        name: "CurrencyAndAmount",
        fields: &[opt("amount", NUMBER), opt("currency", TEXT)],
    },
    ModelSchema {
        name: "TransactionPrice",
        fields: &[opt("price", NUMBER), opt("type", TEXT)],
    },
    ModelSchema {
        name: "ResourceId",
        fields: &[req("scope", TEXT), req("code", TEXT)],
    },
];

/// Look up a model's declared attributes by type name
pub fn schema_of(name: &str) -> Option<&'static ModelSchema> {
    SCHEMAS.iter().find(|s| s.name == name)
}

// ============================================
// SHARED VALUE TYPES
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct ResourceId {
    pub scope: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CurrencyAndAmount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct MetricValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct PropertyValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<MetricValue>,
}

impl PropertyValue {
    /// Numbers become metric values, everything else a label
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => Some(Self {
                label_value: None,
                metric_value: Some(MetricValue {
                    value: n.as_f64(),
                    unit: None,
                }),
            }),
            Value::String(s) => Some(Self {
                label_value: Some(s.clone()),
                metric_value: None,
            }),
            other => Some(Self {
                label_value: Some(other.to_string()),
                metric_value: None,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct Property {
    pub key: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct InstrumentIdValue {
    pub value: String,
}

// ============================================
// REQUESTS
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct InstrumentDefinition {
    pub name: String,
    pub identifiers: BTreeMap<String, InstrumentIdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<Property>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub look_through_portfolio_id: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct UpsertInstrumentPropertyRequest {
    pub identifier_type: String,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<Property>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CreateTransactionPortfolioRequest {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    pub base_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corporate_action_source_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounting_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Property>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CreateReferencePortfolioRequest {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Property>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct CreatePortfolioGroupRequest {
    pub code: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ResourceId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Property>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct TransactionPrice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub price_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct TransactionRequest {
    pub transaction_id: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub instrument_identifiers: BTreeMap<String, String>,
    pub transaction_date: String,
    pub settlement_date: String,
    pub units: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_price: Option<TransactionPrice>,
    pub total_consideration: CurrencyAndAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Property>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct TargetTaxLotRequest {
    pub units: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CurrencyAndAmount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct AdjustHoldingRequest {
    pub instrument_identifiers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_holding_keys: Option<BTreeMap<String, Property>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Property>>,
    pub tax_lots: Vec<TargetTaxLotRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct QuoteSeriesId {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_source: Option<String>,
    pub instrument_id: String,
    pub instrument_id_type: String,
    pub quote_type: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct QuoteId {
    pub quote_series_id: QuoteSeriesId,
    pub effective_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct UpsertQuoteRequest {
    pub quote_id: QuoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePropertyDefinitionRequest {
    pub domain: String,
    pub scope: String,
    pub code: String,
    pub value_required: bool,
    pub display_name: String,
    pub data_type_id: ResourceId,
    pub life_time: String,
}

// ============================================
// RESPONSES
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Upsert response that reports per-item failures alongside the successes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResponse {
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub failed: BTreeMap<String, ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    #[serde(default)]
    pub effective_from: Option<String>,
    #[serde(default)]
    pub as_at_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedResponse {
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub href: Option<String>,
}

/// A portfolio, reference portfolio or group as returned on creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEntity {
    pub id: ResourceId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    pub key: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub data_type_id: Option<ResourceId>,
}
