//! Entity policy table - per-entity loading rules, read once from packaged JSON

use crate::error::CocoonError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const DOMAIN_SETTINGS: &str = include_str!("../config/domain_settings.json");

/// Entity types the loader knows how to upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Instrument,
    InstrumentProperty,
    Portfolio,
    ReferencePortfolio,
    PortfolioGroup,
    Transaction,
    Holding,
    Quote,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Instrument,
        EntityType::InstrumentProperty,
        EntityType::Portfolio,
        EntityType::ReferencePortfolio,
        EntityType::PortfolioGroup,
        EntityType::Transaction,
        EntityType::Holding,
        EntityType::Quote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Instrument => "instrument",
            EntityType::InstrumentProperty => "instrument_property",
            EntityType::Portfolio => "portfolio",
            EntityType::ReferencePortfolio => "reference_portfolio",
            EntityType::PortfolioGroup => "portfolio_group",
            EntityType::Transaction => "transaction",
            EntityType::Holding => "holding",
            EntityType::Quote => "quote",
        }
    }

    /// Key used for this entity in load results
    pub fn plural(&self) -> String {
        format!("{}s", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CocoonError;

    /// Accepts any case, `-` or space separators, and a plural `s`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let lookup = |name: &str| EntityType::ALL.into_iter().find(|e| e.as_str() == name);

        lookup(normalized.as_str())
            .or_else(|| normalized.strip_suffix('s').and_then(lookup))
            .ok_or_else(|| CocoonError::UnknownEntityType(s.to_string()))
    }
}

/// Call-time attributes a remote call needs besides the request batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallAttribute {
    Scope,
    Code,
    EffectiveAt,
}

impl CallAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallAttribute::Scope => "scope",
            CallAttribute::Code => "code",
            CallAttribute::EffectiveAt => "effective_at",
        }
    }
}

/// Loading rules for one entity type
#[derive(Debug, Clone, Deserialize)]
pub struct EntityPolicy {
    pub top_level_model: String,
    /// Property domain, or `None` when the entity carries no properties
    pub domain: Option<String>,
    pub batch_allowed: bool,
    pub default_batch_size: usize,
    pub portfolio_specific: bool,
    pub required_call_attributes: Vec<CallAttribute>,
    /// Identifier keys must be `Instrument/default/<Key>` rather than `<Key>`
    pub full_key_format: bool,
}

impl EntityPolicy {
    pub fn requires(&self, attribute: CallAttribute) -> bool {
        self.required_call_attributes.contains(&attribute)
    }

    /// Batch size after applying this policy to a caller-supplied value
    pub fn effective_batch_size(&self, requested: Option<usize>) -> usize {
        if self.batch_allowed {
            requested.unwrap_or(self.default_batch_size)
        } else {
            self.default_batch_size
        }
    }
}

type PolicyTable = HashMap<EntityType, EntityPolicy>;

static POLICIES: OnceLock<Result<PolicyTable, String>> = OnceLock::new();

fn table() -> Result<&'static PolicyTable, CocoonError> {
    POLICIES
        .get_or_init(|| {
            serde_json::from_str::<PolicyTable>(DOMAIN_SETTINGS).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| CocoonError::Policy(e.clone()))
}

/// Policy for an entity type
pub fn policy_for(entity: EntityType) -> Result<&'static EntityPolicy, CocoonError> {
    table()?
        .get(&entity)
        .ok_or_else(|| CocoonError::Policy(format!("no policy for `{entity}`")))
}
