//! Batch loader that maps dataframe rows onto platform request models and
//! uploads them concurrently, batch by batch.

pub mod aggregate;
pub mod api;
pub mod cocoon;
pub mod config;
pub mod data;
pub mod dates;
pub mod dispatch;
pub mod enrich;
pub mod error;
pub mod mapping;
pub mod models;
pub mod partition;
pub mod policy;
pub mod populate;
pub mod provision;

#[cfg(test)]
mod mock;

pub use aggregate::LoadOutcome;
pub use api::{BatchResponse, HttpPlatformClient, PlatformApi, RequestBatch};
pub use cocoon::{load_from_data_frame, LoadOptions, LoadResult};
pub use config::ApiConfig;
pub use error::{BatchError, CocoonError};
pub use policy::EntityType;
pub use provision::PropertyColumn;
