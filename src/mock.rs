//! In-memory platform for unit tests

use crate::api::PlatformApi;
use crate::error::BatchError;
use crate::models::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct MockApi {
    pub calls: Mutex<Vec<String>>,
    pub definitions: Mutex<BTreeSet<String>>,
    pub created: Mutex<Vec<CreatePropertyDefinitionRequest>>,
    /// identifier value -> instrument name
    pub names: BTreeMap<String, String>,
    /// Lookups that fail with a 503 before lookups start succeeding
    pub lookup_failures: AtomicUsize,
    pub definition_error: Option<BatchError>,
    /// Portfolio codes whose calls are rejected
    pub reject_codes: BTreeSet<String>,
}

impl MockApi {
    pub fn define(&self, key: &str) {
        self.definitions.lock().unwrap().insert(key.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created_definitions(&self) -> Vec<CreatePropertyDefinitionRequest> {
        self.created.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_code(&self, code: &str) -> Result<(), BatchError> {
        if self.reject_codes.contains(code) {
            return Err(BatchError::Rejected {
                status: 400,
                reason: "Bad Request".into(),
                body: serde_json::json!({"title": format!("portfolio {code} rejected")}),
            });
        }
        Ok(())
    }
}

impl PlatformApi for MockApi {
    fn upsert_instruments(
        &self,
        requests: &BTreeMap<String, InstrumentDefinition>,
    ) -> Result<UpsertResponse, BatchError> {
        self.record(format!("upsert_instruments:{}", requests.len()));
        let values = requests
            .iter()
            .map(|(id, r)| (id.clone(), serde_json::json!({"name": r.name})))
            .collect();
        Ok(UpsertResponse {
            values,
            failed: BTreeMap::new(),
        })
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
        self.record(format!("create_portfolio:{}", request.code));
        self.check_code(&request.code)?;
        Ok(CreatedEntity {
            id: ResourceId {
                scope: scope.to_string(),
                code: request.code.clone(),
            },
            display_name: Some(request.display_name.clone()),
            href: None,
        })
    }

    fn create_reference_portfolio(
        &self,
        scope: &str,
        request: &CreateReferencePortfolioRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.record(format!("create_reference_portfolio:{}", request.code));
        Ok(CreatedEntity {
            id: ResourceId {
                scope: scope.to_string(),
                code: request.code.clone(),
            },
            display_name: Some(request.display_name.clone()),
            href: None,
        })
    }

    fn create_portfolio_group(
        &self,
        scope: &str,
        request: &CreatePortfolioGroupRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.record(format!("create_portfolio_group:{}", request.code));
        Ok(CreatedEntity {
            id: ResourceId {
                scope: scope.to_string(),
                code: request.code.clone(),
            },
            display_name: Some(request.display_name.clone()),
            href: None,
        })
    }

    fn upsert_transactions(
        &self,
        _scope: &str,
        code: &str,
        requests: &[TransactionRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.record(format!("upsert_transactions:{}:{}", code, requests.len()));
        self.check_code(code)?;
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
        self.check_code(code)?;
        Ok(VersionedResponse::default())
    }

    fn adjust_holdings(
        &self,
        _scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.record(format!("adjust_holdings:{}:{}:{}", code, effective_at, requests.len()));
        self.check_code(code)?;
        Ok(VersionedResponse::default())
    }

    fn upsert_quotes(
        &self,
        _scope: &str,
        requests: &BTreeMap<String, UpsertQuoteRequest>,
    ) -> Result<UpsertResponse, BatchError> {
        self.record(format!("upsert_quotes:{}", requests.len()));
        Ok(UpsertResponse::default())
    }

    fn get_property_definition(
        &self,
        domain: &str,
        scope: &str,
        code: &str,
    ) -> Result<Option<PropertyDefinition>, BatchError> {
        let key = format!("{domain}/{scope}/{code}");
        self.record(format!("get_property_definition:{key}"));
        if let Some(err) = &self.definition_error {
            return Err(err.clone());
        }
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
        self.record(format!("create_property_definition:{key}"));
        self.created.lock().unwrap().push(request.clone());
        self.define(&key);
        Ok(PropertyDefinition {
            key,
            display_name: Some(request.display_name.clone()),
            data_type_id: Some(request.data_type_id.clone()),
        })
    }

    fn lookup_instrument_name(
        &self,
        identifier_type: &str,
        identifier: &str,
    ) -> Result<Option<String>, BatchError> {
        self.record(format!("lookup_instrument_name:{identifier_type}:{identifier}"));
        let failing = self
            .lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BatchError::Rejected {
                status: 503,
                reason: "Service Unavailable".into(),
                body: serde_json::Value::Null,
            });
        }
        Ok(self.names.get(identifier).cloned())
    }
}
