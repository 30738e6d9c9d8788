#![allow(dead_code)]

use cocoon::models::*;
use cocoon::{BatchError, PlatformApi};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Platform double that records every call and rejects on demand
#[derive(Default)]
pub struct RecordingApi {
    calls: Mutex<Vec<String>>,
    definitions: Mutex<BTreeSet<String>>,
    /// (portfolio code, effective_at) pairs whose holdings calls are rejected
    pub reject_holdings: BTreeSet<(String, String)>,
    /// Portfolio codes whose transaction calls are rejected
    pub reject_transactions: BTreeSet<String>,
    /// Figis the instrument upsert reports as failed items
    pub bad_figis: BTreeSet<String>,
}

impl RecordingApi {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn upload_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.contains("property_definition"))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn rejection(detail: &str) -> BatchError {
    BatchError::Rejected {
        status: 400,
        reason: "Bad Request".into(),
        body: serde_json::json!({ "title": detail }),
    }
}

fn created(scope: &str, code: &str) -> CreatedEntity {
    CreatedEntity {
        id: ResourceId {
            scope: scope.into(),
            code: code.into(),
        },
        display_name: None,
        href: None,
    }
}

impl PlatformApi for RecordingApi {
    fn upsert_instruments(
        &self,
        requests: &BTreeMap<String, InstrumentDefinition>,
    ) -> Result<UpsertResponse, BatchError> {
        self.record(format!("upsert_instruments:{}", requests.len()));
        let mut response = UpsertResponse::default();
        for (id, request) in requests {
            let figi = request
                .identifiers
                .get("Figi")
                .map(|v| v.value.clone())
                .unwrap_or_default();
            if self.bad_figis.contains(&figi) {
                response.failed.insert(
                    id.clone(),
                    ErrorDetail {
                        id: Some(id.clone()),
                        error_type: Some("InvalidIdentifier".into()),
                        detail: Some(format!("unknown figi {figi}")),
                    },
                );
            } else {
                response
                    .values
                    .insert(id.clone(), serde_json::to_value(request).unwrap());
            }
        }
        Ok(response)
    }

    fn upsert_instrument_properties(
        &self,
        requests: &[UpsertInstrumentPropertyRequest],
    ) -> Result<UpsertResponse, BatchError> {
        self.record(format!("upsert_instrument_properties:{}", requests.len()));
        Ok(UpsertResponse::default())
    }

    fn create_portfolio(
        &self,
        scope: &str,
        request: &CreateTransactionPortfolioRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.record(format!(
            "create_portfolio:{}:{}",
            request.code, request.base_currency
        ));
        Ok(created(scope, &request.code))
    }

    fn create_reference_portfolio(
        &self,
        scope: &str,
        request: &CreateReferencePortfolioRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.record(format!("create_reference_portfolio:{}", request.code));
        Ok(created(scope, &request.code))
    }

    fn create_portfolio_group(
        &self,
        scope: &str,
        request: &CreatePortfolioGroupRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.record(format!("create_portfolio_group:{}", request.code));
        Ok(created(scope, &request.code))
    }

    fn upsert_transactions(
        &self,
        _scope: &str,
        code: &str,
        requests: &[TransactionRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.record(format!("upsert_transactions:{}:{}", code, requests.len()));
        if self.reject_transactions.contains(code) {
            return Err(rejection(code));
        }
        Ok(VersionedResponse::default())
    }

    fn set_holdings(
        &self,
        _scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.record(format!("set_holdings:{}:{}:{}", code, effective_at, requests.len()));
        if self
            .reject_holdings
            .contains(&(code.to_string(), effective_at.to_string()))
        {
            return Err(rejection(code));
        }
        Ok(VersionedResponse::default())
    }

    fn adjust_holdings(
        &self,
        _scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.record(format!(
            "adjust_holdings:{}:{}:{}",
            code,
            effective_at,
            requests.len()
        ));
        Ok(VersionedResponse::default())
    }

    fn upsert_quotes(
        &self,
        _scope: &str,
        requests: &BTreeMap<String, UpsertQuoteRequest>,
    ) -> Result<UpsertResponse, BatchError> {
        self.record(format!("upsert_quotes:{}", requests.len()));
        let values = requests
            .iter()
            .map(|(id, q)| (id.clone(), serde_json::to_value(q).unwrap()))
            .collect();
        Ok(UpsertResponse {
            values,
            failed: BTreeMap::new(),
        })
    }

    fn get_property_definition(
        &self,
        domain: &str,
        scope: &str,
        code: &str,
    ) -> Result<Option<PropertyDefinition>, BatchError> {
        let key = format!("{domain}/{scope}/{code}");
        self.record(format!("get_property_definition:{key}"));
        let known = self.definitions.lock().unwrap().contains(&key);
        Ok(known.then(|| PropertyDefinition {
            key,
            display_name: None,
            data_type_id: None,
        }))
    }

    fn create_property_definition(
        &self,
        request: &CreatePropertyDefinitionRequest,
    ) -> Result<PropertyDefinition, BatchError> {
        let key = format!("{}/{}/{}", request.domain, request.scope, request.code);
        self.record(format!(
            "create_property_definition:{}:{}",
            key, request.data_type_id.code
        ));
        self.definitions.lock().unwrap().insert(key.clone());
        Ok(PropertyDefinition {
            key,
            display_name: Some(request.display_name.clone()),
            data_type_id: Some(request.data_type_id.clone()),
        })
    }
}
