//! Storage abstraction for API Scribe.
//!
//! One small repository trait per record family, joined by the [`Store`]
//! super-trait that the ingestion pipeline and the structure builder take.
//! Backends (SQLite, in-memory) implement the three repositories and get
//! [`Store`] for free.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Ordering
//!
//! Sample pages are returned oldest first (`created_at` ascending, then
//! insertion order). The structure builder relies on this to fold samples
//! chronologically.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Api, Parameter, RequestStructure, ResponseStructure, SampleKind, SampleRequest,
    SampleResponse,
};
use crate::schema::Schema;

/// Discovered endpoints.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_api_by_path`](ApiRepository::get_api_by_path) | Look up an Api by host and templated path |
/// | [`create_api`](ApiRepository::create_api) | Insert an Api, or return the existing one |
/// | [`get_apis_page`](ApiRepository::get_apis_page) | Page through all Apis in creation order |
/// | [`update_api_watermark`](ApiRepository::update_api_watermark) | Advance the build watermark |
#[async_trait]
pub trait ApiRepository: Send + Sync {
    async fn get_api_by_path(&self, host: &str, path: &str) -> Result<Option<Api>>;

    /// Insert `api` unless an Api with the same host and path exists.
    ///
    /// Returns the stored row: `api` itself when it was inserted, the
    /// existing row otherwise. Safe to call concurrently for the same key.
    async fn create_api(&self, api: &Api) -> Result<Api>;

    async fn get_api(&self, id: &str) -> Result<Option<Api>>;

    async fn get_apis_page(&self, limit: i64, offset: i64) -> Result<Vec<Api>>;

    async fn count_apis(&self) -> Result<i64>;

    async fn update_api_watermark(&self, id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Append-only request and response samples.
#[async_trait]
pub trait SampleRepository: Send + Sync {
    async fn create_sample_request(&self, sample: &SampleRequest) -> Result<()>;

    async fn create_sample_response(&self, sample: &SampleResponse) -> Result<()>;

    /// Creation time of the newest sample of `kind` for an Api.
    async fn newest_sample_at(&self, api_id: &str, kind: SampleKind)
        -> Result<Option<DateTime<Utc>>>;

    /// Request samples created strictly after `from`, oldest first.
    async fn get_sample_requests_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleRequest>>;

    /// Response samples created strictly after `from`, oldest first.
    async fn get_sample_responses_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleResponse>>;
}

/// Merged per-Api structures. Created once, then updated in place.
#[async_trait]
pub trait StructureRepository: Send + Sync {
    async fn get_request_structure(&self, api_id: &str) -> Result<Option<RequestStructure>>;

    async fn create_request_structure(&self, structure: &RequestStructure) -> Result<()>;

    async fn update_request_structure(
        &self,
        id: &str,
        parameters: &[Parameter],
        body_schema: Option<&Schema>,
    ) -> Result<()>;

    async fn get_response_structure(&self, api_id: &str) -> Result<Option<ResponseStructure>>;

    async fn create_response_structure(&self, structure: &ResponseStructure) -> Result<()>;

    async fn update_response_structure(&self, id: &str, body_schema: Option<&Schema>)
        -> Result<()>;
}

/// Everything the pipeline and the builder need from storage.
pub trait Store: ApiRepository + SampleRepository + StructureRepository {}

impl<T> Store for T where T: ApiRepository + SampleRepository + StructureRepository {}
