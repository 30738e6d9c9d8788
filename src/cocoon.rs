//! Top-level loader: dataframe in, per-entity `{errors, success}` out
//!
//! Everything up to dispatch fails fast with a [`CocoonError`] before any
//! upload call is made. Once dispatch starts, platform failures are
//! collected per batch and only programming faults abort the load.

use crate::aggregate::{aggregate, LoadOutcome};
use crate::api::{send, PlatformApi, RequestBatch};
use crate::data;
use crate::dispatch::{WorkerPool, DEFAULT_WORKERS};
use crate::enrich::{self, UNKNOWN_NAME};
use crate::error::CocoonError;
use crate::mapping::{self, MappingPlan, MappingSpec, MappingTarget, ResolvedMapping, SYNTHETIC_PREFIX};
use crate::models::{schema_of, FieldKind, ModelSchema};
use crate::partition::{partition, PartitionColumns};
use crate::policy::{policy_for, CallAttribute, EntityPolicy, EntityType};
use crate::populate::{check_plan, populate_rows, SideChannels};
use crate::provision::{ensure_property_definitions, PropertyColumn, SUB_HOLDING_KEY_DOMAIN};
use polars::prelude::DataFrame;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Column holding each row's position in the caller's frame
pub const ROW_ID_COLUMN: &str = "cocoon.row";

/// Result of a load, keyed by pluralised entity type
pub type LoadResult = BTreeMap<String, LoadOutcome>;

/// Optional load parameters
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Identifier key (`Figi` or `Instrument/default/Figi`) -> column
    pub identifier_mapping: BTreeMap<String, String>,
    pub property_columns: Vec<PropertyColumn>,
    /// Scope for property definitions, defaults to the load scope
    pub properties_scope: Option<String>,
    /// Ignored when the entity does not allow batching
    pub batch_size: Option<usize>,
    pub remove_white_space: bool,
    pub instrument_name_enrichment: bool,
    pub sub_holding_keys: Vec<PropertyColumn>,
    /// Adjust holdings instead of setting them
    pub holdings_adjustment_only: bool,
    pub workers: usize,
    /// Per-call limit; `None` waits indefinitely
    pub call_timeout: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            identifier_mapping: BTreeMap::new(),
            property_columns: Vec::new(),
            properties_scope: None,
            batch_size: None,
            remove_white_space: true,
            instrument_name_enrichment: false,
            sub_holding_keys: Vec::new(),
            holdings_adjustment_only: false,
            workers: DEFAULT_WORKERS,
            call_timeout: None,
        }
    }
}

/// Load every row of `data_frame` as `file_type` entities into `scope`
pub fn load_from_data_frame(
    api: Arc<dyn PlatformApi>,
    scope: &str,
    data_frame: DataFrame,
    mapping_required: &Value,
    mapping_optional: &Value,
    file_type: &str,
    options: LoadOptions,
) -> Result<LoadResult, CocoonError> {
    let started = Instant::now();

    // 1. entity type and its policy
    let entity: EntityType = file_type.parse()?;
    let policy = policy_for(entity)?;
    let schema = schema_of(&policy.top_level_model).ok_or_else(|| {
        CocoonError::schema(policy.top_level_model.as_str(), "no schema declared")
    })?;

    // 2. frame shape
    validate_frame(&data_frame)?;

    // 3. defaults
    let batch_size = policy.effective_batch_size(options.batch_size);
    let properties_scope = options
        .properties_scope
        .clone()
        .unwrap_or_else(|| scope.to_string());

    tracing::info!(
        "Loading {} rows as {} into scope {} (batch size {}, {} workers)",
        data_frame.height(),
        entity.plural(),
        scope,
        batch_size,
        options.workers
    );

    // 4. mapping coverage
    let mut required = MappingSpec::required(mapping_required)?;
    let optional = MappingSpec::optional(mapping_optional)?;
    let enrich_names = wants_enrichment(entity, &options);
    validate_coverage(entity, policy, schema, &required, &options, enrich_names)?;

    let mut frame = data::with_row_ids(&data_frame, ROW_ID_COLUMN)?;
    drop(data_frame);

    // 5. name enrichment
    if enrich_names {
        let column = enrich_names_in_place(&api, &mut frame, &required, entity, &options)?;
        if let Some(column) = column {
            required.insert("name", MappingTarget::Column(column));
        }
    }

    // 6. constants and defaults
    let resolved_required = mapping::resolve(&mut frame, &required)?;
    let resolved_optional = mapping::resolve(&mut frame, &optional)?;

    // 7. referenced columns exist, required ones have no nulls
    validate_columns(&frame, &resolved_required, &resolved_optional, &options)?;

    let mut plan = MappingPlan::expand(&resolved_required)?;
    plan.deep_merge(MappingPlan::expand(&resolved_optional)?)?;
    check_plan(schema, &plan)?;

    // 8. cell clean-up
    let stringified = data::stringify_complex(&mut frame)?;
    if !stringified.is_empty() {
        tracing::debug!("Stringified nested columns: {:?}", stringified);
    }
    if options.remove_white_space {
        let referenced = referenced_columns(&resolved_required, &resolved_optional, &options);
        data::strip_whitespace(&mut frame, &referenced)?;
    }

    // 9. property definitions
    let mut channels = SideChannels::new(&options.identifier_mapping, policy.full_key_format);
    if !options.property_columns.is_empty() {
        let domain = policy.domain.as_deref().ok_or_else(|| {
            CocoonError::Validation(format!("{entity} does not carry properties"))
        })?;
        require_field(schema, |k| matches!(k, FieldKind::Properties(_)), "properties")?;
        channels.properties = ensure_property_definitions(
            api.as_ref(),
            domain,
            &properties_scope,
            &options.property_columns,
            &frame,
        )?;
    }
    if !options.sub_holding_keys.is_empty() {
        require_field(schema, |k| k == FieldKind::SubHoldingKeys, "sub-holding keys")?;
        channels.sub_holding_keys = ensure_property_definitions(
            api.as_ref(),
            SUB_HOLDING_KEY_DOMAIN,
            &properties_scope,
            &options.sub_holding_keys,
            &frame,
        )?;
    }

    // 10. partition, populate, dispatch, aggregate
    let columns = PartitionColumns {
        code: policy
            .requires(CallAttribute::Code)
            .then(|| resolved_required.get("code").map(|c| c.column.as_str()))
            .flatten(),
        effective_at: policy
            .requires(CallAttribute::EffectiveAt)
            .then(|| resolved_required.get("effective_at").map(|c| c.column.as_str()))
            .flatten(),
    };
    let partitioned = partition(&frame, policy, batch_size, columns)?;

    let mut groups = Vec::with_capacity(partitioned.groups.len());
    for group in &partitioned.groups {
        let mut calls = Vec::with_capacity(group.len());
        for batch in group {
            let rows = populate_rows(schema, &plan, &channels, &batch.frame, ROW_ID_COLUMN)?;
            calls.push(RequestBatch::build(
                entity,
                rows,
                batch,
                options.holdings_adjustment_only,
            )?);
        }
        groups.push(calls);
    }
    tracing::info!(
        "Built {} batches in {} groups",
        partitioned.batch_count(),
        groups.len()
    );

    let pool = WorkerPool::new(options.workers, options.call_timeout)?;
    let call_scope = scope.to_string();
    let call_api = Arc::clone(&api);
    let outcomes = pool.dispatch_groups(groups, move |batch: RequestBatch| {
        send(call_api.as_ref(), &batch, &call_scope)
    });
    pool.shutdown();
    let outcome = aggregate(outcomes?);

    tracing::info!(
        "Loaded {}: {} batches succeeded, {} rejected, {} items failed inside successful batches ({:.2}s)",
        entity.plural(),
        outcome.success.len(),
        outcome.errors.len(),
        outcome.failed_items(),
        started.elapsed().as_secs_f64()
    );

    // 11. keyed by plural entity name
    let mut result = LoadResult::new();
    result.insert(entity.plural(), outcome);
    Ok(result)
}

fn validate_frame(frame: &DataFrame) -> Result<(), CocoonError> {
    if frame.width() == 0 {
        return Err(CocoonError::Validation("data frame has no columns".into()));
    }
    if let Some(reserved) = frame
        .get_column_names()
        .into_iter()
        .find(|name| name.starts_with(SYNTHETIC_PREFIX) || name.as_str() == ROW_ID_COLUMN)
    {
        return Err(CocoonError::Validation(format!(
            "column `{reserved}` uses a reserved name"
        )));
    }
    Ok(())
}

fn wants_enrichment(entity: EntityType, options: &LoadOptions) -> bool {
    if !options.instrument_name_enrichment {
        return false;
    }
    if entity != EntityType::Instrument {
        tracing::warn!("Name enrichment only applies to instruments, skipping for {}", entity);
        return false;
    }
    true
}

/// Call-time attributes and mandatory model attributes must be mapped
fn validate_coverage(
    entity: EntityType,
    policy: &EntityPolicy,
    schema: &ModelSchema,
    required: &MappingSpec,
    options: &LoadOptions,
    enrich_names: bool,
) -> Result<(), CocoonError> {
    for attribute in &policy.required_call_attributes {
        if *attribute == CallAttribute::Scope {
            continue;
        }
        if !required.has_attribute(attribute.as_str()) {
            return Err(CocoonError::Validation(format!(
                "{entity} loads need `{}` in the required mapping",
                attribute.as_str()
            )));
        }
    }

    for field in schema.fields.iter().filter(|f| f.required) {
        match field.kind {
            FieldKind::Identifiers(_) => {
                if options.identifier_mapping.is_empty() {
                    return Err(CocoonError::Validation(format!(
                        "{entity} loads need an identifier mapping for `{}`",
                        field.name
                    )));
                }
            }
            _ if field.is_side_channel() => {}
            _ if enrich_names && field.name == "name" => {}
            _ => {
                if !required.has_attribute(field.name) {
                    return Err(CocoonError::Validation(format!(
                        "required mapping for {entity} is missing `{}`",
                        field.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn enrich_names_in_place(
    api: &Arc<dyn PlatformApi>,
    frame: &mut DataFrame,
    required: &MappingSpec,
    entity: EntityType,
    options: &LoadOptions,
) -> Result<Option<String>, CocoonError> {
    let (name_column, fallback) = match required.get("name") {
        None => (None, UNKNOWN_NAME.to_string()),
        Some(MappingTarget::Column(column)) => (Some(column.clone()), UNKNOWN_NAME.to_string()),
        Some(MappingTarget::ColumnWithDefault { column, default }) => (
            Some(column.clone()),
            data::json_text(default).unwrap_or_else(|| UNKNOWN_NAME.to_string()),
        ),
        Some(MappingTarget::Constant(_)) => {
            tracing::warn!("{} names are a constant, skipping enrichment", entity);
            return Ok(None);
        }
    };

    if let Some(column) = &name_column {
        if !data::has_column(frame, column) {
            return Err(CocoonError::mapping("name", format!("column `{column}` is not in the data")));
        }
    }

    let identifiers: Vec<(String, String)> = options
        .identifier_mapping
        .iter()
        .map(|(key, column)| (key.clone(), column.clone()))
        .collect();
    for (_, column) in &identifiers {
        if !data::has_column(frame, column) {
            return Err(CocoonError::Validation(format!(
                "identifier column `{column}` is not in the data"
            )));
        }
    }

    let column = enrich::enrich_instrument_names(
        Arc::clone(api),
        frame,
        name_column.as_deref(),
        &identifiers,
        &fallback,
        options.workers,
    )?;
    Ok(Some(column))
}

fn validate_columns(
    frame: &DataFrame,
    required: &ResolvedMapping,
    optional: &ResolvedMapping,
    options: &LoadOptions,
) -> Result<(), CocoonError> {
    for (path, entry) in required.iter().chain(optional.iter()) {
        if !data::has_column(frame, &entry.column) {
            return Err(CocoonError::mapping(
                path.as_str(),
                format!("column `{}` is not in the data", entry.column),
            ));
        }
    }

    for (path, entry) in required.iter().filter(|(_, e)| !e.constant) {
        let nulls = frame.column(&entry.column)?.null_count();
        if nulls > 0 {
            return Err(CocoonError::Validation(format!(
                "required column `{}` (mapped to `{}`) has {} null values",
                entry.column, path, nulls
            )));
        }
    }

    let side_columns = options
        .identifier_mapping
        .values()
        .map(String::as_str)
        .chain(options.property_columns.iter().map(PropertyColumn::source))
        .chain(options.sub_holding_keys.iter().map(PropertyColumn::source));
    for column in side_columns {
        if !data::has_column(frame, column) {
            return Err(CocoonError::Validation(format!(
                "column `{column}` is not in the data"
            )));
        }
    }
    Ok(())
}

/// Every column any mapping reads, in a stable order
fn referenced_columns(
    required: &ResolvedMapping,
    optional: &ResolvedMapping,
    options: &LoadOptions,
) -> Vec<String> {
    let mut columns = BTreeSet::new();
    for entry in required.values().chain(optional.values()) {
        columns.insert(entry.column.clone());
    }
    columns.extend(options.identifier_mapping.values().cloned());
    columns.extend(options.property_columns.iter().map(|c| c.source().to_string()));
    columns.extend(options.sub_holding_keys.iter().map(|c| c.source().to_string()));
    columns.into_iter().collect()
}

fn require_field(
    schema: &ModelSchema,
    matches: impl Fn(FieldKind) -> bool,
    what: &str,
) -> Result<(), CocoonError> {
    if schema.fields.iter().any(|f| matches(f.kind)) {
        Ok(())
    } else {
        Err(CocoonError::schema(schema.name, format!("model has no {what}")))
    }
}
