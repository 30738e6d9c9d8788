//! Instrument name enrichment
//!
//! Rows without a name are looked up on the platform by their first
//! populated identifier. Lookups run on a worker pool of their own, before
//! any batching happens, and are best effort: anything unresolved gets a
//! fallback name.

use crate::api::PlatformApi;
use crate::data;
use crate::dispatch::WorkerPool;
use crate::error::{BatchError, CocoonError};
use crate::mapping::synthetic_column;
use crate::populate::identifier_key;
use polars::prelude::*;
use std::sync::Arc;
use std::time::Duration;

pub const UNKNOWN_NAME: &str = "<Unknown>";
pub const RETRY_ATTEMPTS: usize = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry `call` on transient failures, sleeping `delay` between attempts
pub fn with_retry<T>(
    attempts: usize,
    delay: Duration,
    mut call: impl FnMut() -> Result<T, BatchError>,
) -> Result<T, BatchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match call() {
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::debug!("Attempt {}/{} failed: {}, retrying", attempt, attempts, e);
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Write a complete name column and return its name.
///
/// `identifiers` are (identifier key, column) pairs in lookup preference order.
pub fn enrich_instrument_names(
    api: Arc<dyn PlatformApi>,
    frame: &mut DataFrame,
    name_column: Option<&str>,
    identifiers: &[(String, String)],
    fallback: &str,
    workers: usize,
) -> Result<String, CocoonError> {
    let height = frame.height();
    let mut names: Vec<Option<String>> = match name_column {
        Some(column) => data::string_values(frame, column)?
            .into_iter()
            .map(|v| v.filter(|s| !s.trim().is_empty()))
            .collect(),
        None => vec![None; height],
    };

    let mut identifier_values = Vec::with_capacity(identifiers.len());
    for (key, column) in identifiers {
        identifier_values.push((identifier_key(key, false), data::string_values(frame, column)?));
    }

    let mut rows = Vec::new();
    let mut lookups = Vec::new();
    for (row, name) in names.iter().enumerate() {
        if name.is_some() {
            continue;
        }
        let found = identifier_values.iter().find_map(|(id_type, values)| {
            values[row]
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (id_type.clone(), v.to_string()))
        });
        if let Some(lookup) = found {
            rows.push(row);
            lookups.push(lookup);
        }
    }

    let missing = names.iter().filter(|n| n.is_none()).count();
    let mut resolved = 0usize;

    if !lookups.is_empty() {
        let pool = WorkerPool::new(workers, None)?;
        let outcomes = pool.dispatch_groups(vec![lookups], move |(id_type, id): (String, String)| {
            with_retry(RETRY_ATTEMPTS, RETRY_DELAY, || {
                api.lookup_instrument_name(&id_type, &id)
            })
        })?;
        pool.shutdown();

        for (row, outcome) in rows.into_iter().zip(outcomes) {
            match outcome {
                Ok(Some(name)) => {
                    names[row] = Some(name);
                    resolved += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Name lookup for row {} failed: {}", row, e),
            }
        }
    }

    tracing::info!(
        "Name enrichment: {} rows missing a name, {} resolved, {} set to {}",
        missing,
        resolved,
        missing - resolved,
        fallback
    );

    let column = synthetic_column("name");
    let filled: Vec<String> = names
        .into_iter()
        .map(|n| n.unwrap_or_else(|| fallback.to_string()))
        .collect();
    frame.with_column(Series::new(column.as_str().into(), filled))?;
    Ok(column)
}
