//! Remote platform API - the call surface the loader needs, and a blocking HTTP client for it

use crate::config::ApiConfig;
use crate::error::{BatchError, CocoonError};
use crate::models::{
    AdjustHoldingRequest, CreatePortfolioGroupRequest, CreatePropertyDefinitionRequest,
    CreateReferencePortfolioRequest, CreateTransactionPortfolioRequest, CreatedEntity,
    InstrumentDefinition, PropertyDefinition, TransactionRequest, UpsertInstrumentPropertyRequest,
    UpsertQuoteRequest, UpsertResponse, VersionedResponse,
};
use crate::partition::Batch;
use crate::policy::EntityType;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// The platform calls the loader makes.
///
/// Implementations block; the dispatcher moves every call onto a worker
/// thread. A call either returns the typed response or a [`BatchError`].
pub trait PlatformApi: Send + Sync {
    /// Upsert instruments keyed by a caller-chosen correlation id
    fn upsert_instruments(
        &self,
        requests: &BTreeMap<String, InstrumentDefinition>,
    ) -> Result<UpsertResponse, BatchError>;

    fn upsert_instrument_properties(
        &self,
        requests: &[UpsertInstrumentPropertyRequest],
    ) -> Result<UpsertResponse, BatchError>;

    fn create_portfolio(
        &self,
        scope: &str,
        request: &CreateTransactionPortfolioRequest,
    ) -> Result<CreatedEntity, BatchError>;

    fn create_reference_portfolio(
        &self,
        scope: &str,
        request: &CreateReferencePortfolioRequest,
    ) -> Result<CreatedEntity, BatchError>;

    fn create_portfolio_group(
        &self,
        scope: &str,
        request: &CreatePortfolioGroupRequest,
    ) -> Result<CreatedEntity, BatchError>;

    fn upsert_transactions(
        &self,
        scope: &str,
        code: &str,
        requests: &[TransactionRequest],
    ) -> Result<VersionedResponse, BatchError>;

    /// Replace the portfolio's holdings at `effective_at`
    fn set_holdings(
        &self,
        scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError>;

    /// Adjust only the listed holdings at `effective_at`
    fn adjust_holdings(
        &self,
        scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError>;

    fn upsert_quotes(
        &self,
        scope: &str,
        requests: &BTreeMap<String, UpsertQuoteRequest>,
    ) -> Result<UpsertResponse, BatchError>;

    /// `Ok(None)` when no definition exists for the key
    fn get_property_definition(
        &self,
        domain: &str,
        scope: &str,
        code: &str,
    ) -> Result<Option<PropertyDefinition>, BatchError>;

    fn create_property_definition(
        &self,
        request: &CreatePropertyDefinitionRequest,
    ) -> Result<PropertyDefinition, BatchError>;

    /// Display name of an existing instrument, if the platform knows it
    fn lookup_instrument_name(
        &self,
        _identifier_type: &str,
        _identifier: &str,
    ) -> Result<Option<String>, BatchError> {
        Ok(None)
    }
}

// ============================================
// REQUEST / RESPONSE VARIANTS
// ============================================

/// One dispatchable call: the typed requests of a batch plus its correlation context
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBatch {
    Instruments(BTreeMap<String, InstrumentDefinition>),
    InstrumentProperties(Vec<UpsertInstrumentPropertyRequest>),
    Portfolio(Box<CreateTransactionPortfolioRequest>),
    ReferencePortfolio(Box<CreateReferencePortfolioRequest>),
    PortfolioGroup(Box<CreatePortfolioGroupRequest>),
    Transactions {
        code: String,
        requests: Vec<TransactionRequest>,
    },
    Holdings {
        code: String,
        effective_at: String,
        adjust_only: bool,
        requests: Vec<AdjustHoldingRequest>,
    },
    Quotes(BTreeMap<String, UpsertQuoteRequest>),
}

impl RequestBatch {
    /// Turn populated request trees (row id, tree) into the entity's typed call
    pub fn build(
        entity: EntityType,
        rows: Vec<(i64, Value)>,
        batch: &Batch,
        adjust_only: bool,
    ) -> Result<Self, CocoonError> {
        let built = match entity {
            EntityType::Instrument => Self::Instruments(keyed(rows)?),
            EntityType::InstrumentProperty => Self::InstrumentProperties(listed(rows)?),
            EntityType::Portfolio => Self::Portfolio(Box::new(single(entity, rows)?)),
            EntityType::ReferencePortfolio => {
                Self::ReferencePortfolio(Box::new(single(entity, rows)?))
            }
            EntityType::PortfolioGroup => Self::PortfolioGroup(Box::new(single(entity, rows)?)),
            EntityType::Transaction => Self::Transactions {
                code: context(entity, "code", &batch.code)?,
                requests: listed(rows)?,
            },
            EntityType::Holding => Self::Holdings {
                code: context(entity, "code", &batch.code)?,
                effective_at: context(entity, "effective_at", &batch.effective_at)?,
                adjust_only,
                requests: listed(rows)?,
            },
            EntityType::Quote => Self::Quotes(keyed(rows)?),
        };
        Ok(built)
    }

    /// Number of requests carried by this call
    pub fn len(&self) -> usize {
        match self {
            Self::Instruments(r) => r.len(),
            Self::InstrumentProperties(r) => r.len(),
            Self::Portfolio(_) | Self::ReferencePortfolio(_) | Self::PortfolioGroup(_) => 1,
            Self::Transactions { requests, .. } => requests.len(),
            Self::Holdings { requests, .. } => requests.len(),
            Self::Quotes(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn typed<T: DeserializeOwned>(row: i64, tree: Value) -> Result<T, CocoonError> {
    serde_json::from_value(tree).map_err(|e| CocoonError::Population {
        row,
        reason: format!("request does not match its model: {e}"),
    })
}

/// Requests keyed by row id, so per-item failures trace back to input rows
fn keyed<T: DeserializeOwned>(rows: Vec<(i64, Value)>) -> Result<BTreeMap<String, T>, CocoonError> {
    rows.into_iter()
        .map(|(row, tree)| Ok((row.to_string(), typed(row, tree)?)))
        .collect()
}

fn listed<T: DeserializeOwned>(rows: Vec<(i64, Value)>) -> Result<Vec<T>, CocoonError> {
    rows.into_iter().map(|(row, tree)| typed(row, tree)).collect()
}

fn single<T: DeserializeOwned>(entity: EntityType, rows: Vec<(i64, Value)>) -> Result<T, CocoonError> {
    let mut rows = rows.into_iter();
    match (rows.next(), rows.next()) {
        (Some((row, tree)), None) => typed(row, tree),
        _ => Err(CocoonError::Validation(format!(
            "{entity} calls create exactly one entity per batch"
        ))),
    }
}

fn context(
    entity: EntityType,
    attribute: &str,
    value: &Option<String>,
) -> Result<String, CocoonError> {
    value.clone().ok_or_else(|| {
        CocoonError::Validation(format!("{entity} batch is missing its `{attribute}`"))
    })
}

/// Successful outcome of one call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResponse {
    Upsert(UpsertResponse),
    Created(CreatedEntity),
    Versioned(VersionedResponse),
}

impl BatchResponse {
    /// Items the platform rejected inside an otherwise successful call
    pub fn failed_count(&self) -> usize {
        match self {
            BatchResponse::Upsert(response) => response.failed.len(),
            BatchResponse::Created(_) | BatchResponse::Versioned(_) => 0,
        }
    }
}

/// Issue the call for one batch
pub fn send(
    api: &dyn PlatformApi,
    batch: &RequestBatch,
    scope: &str,
) -> Result<BatchResponse, BatchError> {
    match batch {
        RequestBatch::Instruments(requests) => {
            api.upsert_instruments(requests).map(BatchResponse::Upsert)
        }
        RequestBatch::InstrumentProperties(requests) => api
            .upsert_instrument_properties(requests)
            .map(BatchResponse::Upsert),
        RequestBatch::Portfolio(request) => api
            .create_portfolio(scope, request)
            .map(BatchResponse::Created),
        RequestBatch::ReferencePortfolio(request) => api
            .create_reference_portfolio(scope, request)
            .map(BatchResponse::Created),
        RequestBatch::PortfolioGroup(request) => api
            .create_portfolio_group(scope, request)
            .map(BatchResponse::Created),
        RequestBatch::Transactions { code, requests } => api
            .upsert_transactions(scope, code, requests)
            .map(BatchResponse::Versioned),
        RequestBatch::Holdings {
            code,
            effective_at,
            adjust_only,
            requests,
        } => {
            let result = if *adjust_only {
                api.adjust_holdings(scope, code, effective_at, requests)
            } else {
                api.set_holdings(scope, code, effective_at, requests)
            };
            result.map(BatchResponse::Versioned)
        }
        RequestBatch::Quotes(requests) => {
            api.upsert_quotes(scope, requests).map(BatchResponse::Upsert)
        }
    }
}

// ============================================
// HTTP CLIENT
// ============================================

#[derive(Debug, Deserialize)]
struct InstrumentSummary {
    #[serde(default)]
    name: Option<String>,
}

/// Blocking JSON client for the platform's REST API
#[derive(Debug, Clone)]
pub struct HttpPlatformClient {
    client: Client,
    base: Url,
    access_token: Option<String>,
    timeout: Duration,
}

impl HttpPlatformClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.api_url)
            .map_err(|e| anyhow::anyhow!("invalid API url {:?}: {}", config.api_url, e))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("API url {:?} cannot carry a path", config.api_url);
        }
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base,
            access_token: config.access_token.clone(),
            timeout: config.timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send and return the status with the raw body
    fn execute_raw(&self, request: RequestBuilder) -> Result<(StatusCode, String), BatchError> {
        let response = self
            .authorized(request)
            .header("accept", "application/json")
            .send()
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().map_err(|e| self.transport_error(e))?;
        Ok((status, text))
    }

    fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BatchError> {
        let (status, text) = self.execute_raw(request)?;
        if !status.is_success() {
            return Err(rejected(status, text));
        }
        parse_body(&text)
    }

    fn transport_error(&self, e: reqwest::Error) -> BatchError {
        if e.is_timeout() {
            BatchError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else {
            BatchError::Transport {
                message: e.to_string(),
            }
        }
    }

    fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<T, BatchError> {
        self.execute(self.client.post(self.url(segments)).json(body))
    }

    /// GET that maps 404 to `None`
    fn get_optional<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Option<T>, BatchError> {
        let (status, text) = self.execute_raw(self.client.get(self.url(segments)))?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(rejected(status, text));
        }
        parse_body(&text).map(Some)
    }
}

fn rejected(status: StatusCode, text: String) -> BatchError {
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
    BatchError::Rejected {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
        body,
    }
}

fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T, BatchError> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text).map_err(|e| BatchError::Transport {
        message: format!("unreadable response body: {e}"),
    })
}

impl PlatformApi for HttpPlatformClient {
    fn upsert_instruments(
        &self,
        requests: &BTreeMap<String, InstrumentDefinition>,
    ) -> Result<UpsertResponse, BatchError> {
        self.post(&["instruments"], requests)
    }

    fn upsert_instrument_properties(
        &self,
        requests: &[UpsertInstrumentPropertyRequest],
    ) -> Result<UpsertResponse, BatchError> {
        self.post(&["instruments", "$upsertproperties"], requests)
    }

    fn create_portfolio(
        &self,
        scope: &str,
        request: &CreateTransactionPortfolioRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.post(&["transactionportfolios", scope], request)
    }

    fn create_reference_portfolio(
        &self,
        scope: &str,
        request: &CreateReferencePortfolioRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.post(&["referenceportfolios", scope], request)
    }

    fn create_portfolio_group(
        &self,
        scope: &str,
        request: &CreatePortfolioGroupRequest,
    ) -> Result<CreatedEntity, BatchError> {
        self.post(&["portfoliogroups", scope], request)
    }

    fn upsert_transactions(
        &self,
        scope: &str,
        code: &str,
        requests: &[TransactionRequest],
    ) -> Result<VersionedResponse, BatchError> {
        self.post(&["transactionportfolios", scope, code, "transactions"], requests)
    }

    fn set_holdings(
        &self,
        scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError> {
        let url = self.url(&["transactionportfolios", scope, code, "holdings"]);
        self.execute(
            self.client
                .put(url)
                .query(&[("effectiveAt", effective_at)])
                .json(requests),
        )
    }

    fn adjust_holdings(
        &self,
        scope: &str,
        code: &str,
        effective_at: &str,
        requests: &[AdjustHoldingRequest],
    ) -> Result<VersionedResponse, BatchError> {
        let url = self.url(&["transactionportfolios", scope, code, "holdings"]);
        self.execute(
            self.client
                .post(url)
                .query(&[("effectiveAt", effective_at)])
                .json(requests),
        )
    }

    fn upsert_quotes(
        &self,
        scope: &str,
        requests: &BTreeMap<String, UpsertQuoteRequest>,
    ) -> Result<UpsertResponse, BatchError> {
        self.post(&["quotes", scope], requests)
    }

    fn get_property_definition(
        &self,
        domain: &str,
        scope: &str,
        code: &str,
    ) -> Result<Option<PropertyDefinition>, BatchError> {
        self.get_optional(&["propertydefinitions", domain, scope, code])
    }

    fn create_property_definition(
        &self,
        request: &CreatePropertyDefinitionRequest,
    ) -> Result<PropertyDefinition, BatchError> {
        self.post(&["propertydefinitions"], request)
    }

    fn lookup_instrument_name(
        &self,
        identifier_type: &str,
        identifier: &str,
    ) -> Result<Option<String>, BatchError> {
        let summary: Option<InstrumentSummary> =
            self.get_optional(&["instruments", identifier_type, identifier])?;
        Ok(summary.and_then(|s| s.name))
    }
}
