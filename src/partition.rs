//! Batch partitioner - splits a frame into synchronous groups of concurrent batches
//!
//! Groups run one after another; batches inside a group run concurrently.
//! The split depends on the entity policy:
//!
//! * not portfolio-specific: one group of contiguous, size-bounded slices
//! * portfolio-specific with an effective date: one group per date, one
//!   batch per portfolio within it (never split further by size)
//! * portfolio-specific without a date: each portfolio's rows are sliced by
//!   size and group `k` holds the `k`-th slice of every portfolio

use crate::data;
use crate::dates;
use crate::error::CocoonError;
use crate::policy::{CallAttribute, EntityPolicy};
use polars::prelude::*;
use std::collections::HashMap;

/// Rows dispatched in one call, plus the call's correlation context
#[derive(Debug, Clone)]
pub struct Batch {
    pub frame: DataFrame,
    pub code: Option<String>,
    pub effective_at: Option<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }
}

/// Ordered synchronous groups, each a list of batches safe to run concurrently
#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    pub groups: Vec<Vec<Batch>>,
}

impl PartitionPlan {
    pub fn batch_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn row_count(&self) -> usize {
        self.groups.iter().flatten().map(Batch::len).sum()
    }

    fn push_group(&mut self, group: Vec<Batch>) {
        let group: Vec<Batch> = group.into_iter().filter(|b| !b.is_empty()).collect();
        if !group.is_empty() {
            self.groups.push(group);
        }
    }
}

/// Columns holding the call-time correlation values
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionColumns<'a> {
    pub code: Option<&'a str>,
    pub effective_at: Option<&'a str>,
}

pub fn partition(
    frame: &DataFrame,
    policy: &EntityPolicy,
    batch_size: usize,
    columns: PartitionColumns<'_>,
) -> Result<PartitionPlan, CocoonError> {
    if batch_size == 0 {
        return Err(CocoonError::Validation("batch size must be at least 1".into()));
    }

    if !policy.portfolio_specific {
        let mut plan = PartitionPlan::default();
        plan.push_group(
            slices(frame, batch_size)
                .into_iter()
                .map(|frame| Batch {
                    frame,
                    code: None,
                    effective_at: None,
                })
                .collect(),
        );
        return Ok(plan);
    }

    let code_column = columns.code.ok_or_else(|| {
        CocoonError::Validation("portfolio-specific load needs a `code` mapping".into())
    })?;
    let codes = key_values(frame, code_column)?;

    if policy.requires(CallAttribute::EffectiveAt) {
        let date_column = columns.effective_at.ok_or_else(|| {
            CocoonError::Validation("this load needs an `effective_at` mapping".into())
        })?;
        // grouped on the normalised value so one date spelled two ways is one group
        let effective_dates: Vec<String> = key_values(frame, date_column)?
            .iter()
            .map(|raw| dates::normalize(raw))
            .collect();
        by_date_then_portfolio(frame, &codes, &effective_dates)
    } else {
        by_portfolio_in_lockstep(frame, &codes, batch_size)
    }
}

fn by_date_then_portfolio(
    frame: &DataFrame,
    codes: &[String],
    dates: &[String],
) -> Result<PartitionPlan, CocoonError> {
    let all_rows: Vec<IdxSize> = (0..frame.height() as IdxSize).collect();
    let mut plan = PartitionPlan::default();

    for (effective_at, date_rows) in group_rows(&all_rows, dates) {
        let mut group = Vec::new();
        for (code, rows) in group_rows(&date_rows, codes) {
            group.push(Batch {
                frame: take_rows(frame, rows)?,
                code: Some(code),
                effective_at: Some(effective_at.clone()),
            });
        }
        plan.push_group(group);
    }

    Ok(plan)
}

fn by_portfolio_in_lockstep(
    frame: &DataFrame,
    codes: &[String],
    batch_size: usize,
) -> Result<PartitionPlan, CocoonError> {
    let all_rows: Vec<IdxSize> = (0..frame.height() as IdxSize).collect();
    let streams = group_rows(&all_rows, codes);
    let rounds = streams
        .iter()
        .map(|(_, rows)| rows.len().div_ceil(batch_size))
        .max()
        .unwrap_or(0);

    let mut plan = PartitionPlan::default();
    for round in 0..rounds {
        let mut group = Vec::new();
        for (code, rows) in &streams {
            let Some(chunk) = rows.chunks(batch_size).nth(round) else {
                continue;
            };
            group.push(Batch {
                frame: take_rows(frame, chunk.to_vec())?,
                code: Some(code.clone()),
                effective_at: None,
            });
        }
        plan.push_group(group);
    }

    Ok(plan)
}

/// Contiguous slices of at most `batch_size` rows
fn slices(frame: &DataFrame, batch_size: usize) -> Vec<DataFrame> {
    (0..frame.height())
        .step_by(batch_size)
        .map(|offset| {
            let len = batch_size.min(frame.height() - offset);
            frame.slice(offset as i64, len)
        })
        .collect()
}

/// Non-null text values of a grouping column
fn key_values(frame: &DataFrame, column: &str) -> Result<Vec<String>, CocoonError> {
    data::string_values(frame, column)?
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            value.ok_or_else(|| {
                CocoonError::Validation(format!("column `{column}` is null at row {row}"))
            })
        })
        .collect()
}

/// Split `rows` by their key, keys in order of first appearance
fn group_rows(rows: &[IdxSize], keys: &[String]) -> Vec<(String, Vec<IdxSize>)> {
    let mut order: Vec<(String, Vec<IdxSize>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for &row in rows {
        let key = keys[row as usize].as_str();
        match index.get(key) {
            Some(&slot) => order[slot].1.push(row),
            None => {
                index.insert(key, order.len());
                order.push((key.to_string(), vec![row]));
            }
        }
    }

    order
}

fn take_rows(frame: &DataFrame, rows: Vec<IdxSize>) -> PolarsResult<DataFrame> {
    let idx = IdxCa::from_vec("rows".into(), rows);
    frame.take(&idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{policy_for, EntityType};
    use std::collections::HashSet;

    const ROW: &str = "row";

    fn holdings(portfolios: &[&str], dates: &[&str]) -> DataFrame {
        let mut codes = Vec::new();
        let mut days = Vec::new();
        for date in dates {
            for portfolio in portfolios {
                codes.push(portfolio.to_string());
                days.push(date.to_string());
            }
        }
        let units: Vec<f64> = (0..codes.len()).map(|i| i as f64).collect();
        let df = df!("portfolio" => codes, "date" => days, "units" => units).unwrap();
        data::with_row_ids(&df, ROW).unwrap()
    }

    fn all_row_ids(plan: &PartitionPlan) -> Vec<i64> {
        plan.groups
            .iter()
            .flatten()
            .flat_map(|b| data::row_ids(&b.frame, ROW).unwrap())
            .collect()
    }

    fn columns() -> PartitionColumns<'static> {
        PartitionColumns {
            code: Some("portfolio"),
            effective_at: Some("date"),
        }
    }

    #[test]
    fn holdings_group_by_date_then_portfolio() {
        let frame = holdings(&["P1", "P2", "P3"], &["2024-01-01", "2024-01-02"]);
        let policy = policy_for(EntityType::Holding).unwrap();

        let plan = partition(&frame, policy, 2, columns()).unwrap();

        assert_eq!(plan.groups.len(), 2);
        for (group, date) in plan.groups.iter().zip(["2024-01-01", "2024-01-02"]) {
            assert_eq!(group.len(), 3);
            let codes: Vec<_> = group.iter().map(|b| b.code.clone().unwrap()).collect();
            assert_eq!(codes, vec!["P1", "P2", "P3"]);
            for batch in group {
                assert_eq!(
                    batch.effective_at.as_deref(),
                    Some(dates::normalize(date).as_str())
                );
            }
        }
    }

    #[test]
    fn holdings_keep_each_portfolio_date_pair_in_one_batch() {
        let mut frame = holdings(&["P1", "P2"], &["2024-01-01"]);
        // four rows per pair, well above the batch size
        for _ in 0..2 {
            frame = frame.vstack(&frame).unwrap();
        }
        let frame = frame.drop(ROW).unwrap();
        let frame = data::with_row_ids(&frame, ROW).unwrap();
        let policy = policy_for(EntityType::Holding).unwrap();

        let plan = partition(&frame, policy, 1, columns()).unwrap();

        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].len(), 2);
        assert_eq!(plan.groups[0][0].len(), 4);
        assert_eq!(plan.row_count(), frame.height());
    }

    #[test]
    fn unassociated_entities_slice_contiguously() {
        let df = df!("name" => (0..7).map(|i| format!("n{i}")).collect::<Vec<_>>()).unwrap();
        let frame = data::with_row_ids(&df, ROW).unwrap();
        let policy = policy_for(EntityType::Instrument).unwrap();

        let plan = partition(&frame, policy, 3, PartitionColumns::default()).unwrap();

        assert_eq!(plan.groups.len(), 1);
        let sizes: Vec<usize> = plan.groups[0].iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(all_row_ids(&plan), (0..7).collect::<Vec<i64>>());
        assert!(plan.groups[0].iter().all(|b| b.code.is_none()));
    }

    #[test]
    fn transactions_advance_portfolios_in_lockstep() {
        let codes = ["A", "A", "B", "A", "B", "A", "A"];
        let df = df!("portfolio" => codes, "units" => [1, 2, 3, 4, 5, 6, 7]).unwrap();
        let frame = data::with_row_ids(&df, ROW).unwrap();
        let policy = policy_for(EntityType::Transaction).unwrap();

        let plan = partition(
            &frame,
            policy,
            2,
            PartitionColumns {
                code: Some("portfolio"),
                effective_at: None,
            },
        )
        .unwrap();

        // A has 5 rows -> 3 slices, B has 2 rows -> 1 slice
        assert_eq!(plan.groups.len(), 3);
        let shape: Vec<Vec<(String, usize)>> = plan
            .groups
            .iter()
            .map(|g| g.iter().map(|b| (b.code.clone().unwrap(), b.len())).collect())
            .collect();
        assert_eq!(
            shape,
            vec![
                vec![("A".to_string(), 2), ("B".to_string(), 2)],
                vec![("A".to_string(), 2)],
                vec![("A".to_string(), 1)],
            ]
        );
        // within a portfolio, rows keep their order across rounds
        let a_rows: Vec<i64> = plan
            .groups
            .iter()
            .flatten()
            .filter(|b| b.code.as_deref() == Some("A"))
            .flat_map(|b| data::row_ids(&b.frame, ROW).unwrap())
            .collect();
        assert_eq!(a_rows, vec![0, 1, 3, 5, 6]);
    }

    #[test]
    fn every_row_lands_in_exactly_one_batch() {
        let frame = holdings(&["P1", "P2", "P3", "P4"], &["d1", "d2", "d3"]);
        let cases = [
            (EntityType::Holding, columns()),
            (
                EntityType::Transaction,
                PartitionColumns {
                    code: Some("portfolio"),
                    effective_at: None,
                },
            ),
            (EntityType::Quote, PartitionColumns::default()),
        ];

        for (entity, cols) in cases {
            let policy = policy_for(entity).unwrap();
            for batch_size in [1, 2, 5, 100] {
                let plan = partition(&frame, policy, batch_size, cols).unwrap();
                let mut ids = all_row_ids(&plan);
                let unique: HashSet<i64> = ids.iter().copied().collect();
                assert_eq!(unique.len(), ids.len(), "{entity} size {batch_size}");
                ids.sort();
                assert_eq!(ids, (0..12).collect::<Vec<i64>>(), "{entity} size {batch_size}");
            }
        }
    }

    #[test]
    fn no_portfolio_date_pair_spans_groups() {
        let frame = holdings(&["P1", "P2"], &["d1", "d2"]);
        let frame = frame.vstack(&frame).unwrap();
        let policy = policy_for(EntityType::Holding).unwrap();
        let plan = partition(&frame, policy, 1, columns()).unwrap();

        let mut seen: HashMap<(String, String), usize> = HashMap::new();
        for (g, group) in plan.groups.iter().enumerate() {
            for batch in group {
                let key = (batch.code.clone().unwrap(), batch.effective_at.clone().unwrap());
                assert!(seen.insert(key, g).is_none(), "pair split across batches");
            }
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn one_date_spelled_two_ways_is_one_group() {
        let df = df!(
            "portfolio" => ["P1", "P1", "P2"],
            "date" => ["2024-01-01", "01/01/2024", "2024-01-01T00:00:00Z"],
            "units" => [1.0, 2.0, 3.0]
        )
        .unwrap();
        let frame = data::with_row_ids(&df, ROW).unwrap();
        let policy = policy_for(EntityType::Holding).unwrap();

        let plan = partition(&frame, policy, 10, columns()).unwrap();

        assert_eq!(plan.groups.len(), 1);
        let group = &plan.groups[0];
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].code.as_deref(), Some("P1"));
        assert_eq!(group[0].len(), 2);
        assert!(group
            .iter()
            .all(|b| b.effective_at.as_deref() == Some("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn empty_frame_has_no_groups() {
        let df = df!("name" => Vec::<String>::new()).unwrap();
        let frame = data::with_row_ids(&df, ROW).unwrap();
        let policy = policy_for(EntityType::Instrument).unwrap();
        let plan = partition(&frame, policy, 10, PartitionColumns::default()).unwrap();
        assert!(plan.groups.is_empty());
        assert_eq!(plan.batch_count(), 0);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let frame = holdings(&["P1"], &["d1"]);
        let policy = policy_for(EntityType::Quote).unwrap();
        assert!(partition(&frame, policy, 0, PartitionColumns::default()).is_err());
    }
}
