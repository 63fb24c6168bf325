//! In-memory [`Store`](super::Store) implementation for testing.
//!
//! Uses `Vec`s behind `std::sync::RwLock`. Insertion order breaks ties
//! between samples with equal creation times, matching the SQLite store.

use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Api, Parameter, RequestStructure, ResponseStructure, SampleKind, SampleRequest,
    SampleResponse,
};
use crate::schema::Schema;

use super::{ApiRepository, SampleRepository, StructureRepository};

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    apis: RwLock<Vec<Api>>,
    requests: RwLock<Vec<SampleRequest>>,
    responses: RwLock<Vec<SampleResponse>>,
    request_structures: RwLock<Vec<RequestStructure>>,
    response_structures: RwLock<Vec<ResponseStructure>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored request samples, across all Apis.
    pub fn sample_request_count(&self) -> usize {
        self.requests.read().unwrap().len()
    }

    /// Number of stored response samples, across all Apis.
    pub fn sample_response_count(&self) -> usize {
        self.responses.read().unwrap().len()
    }
}

fn page<T: Clone>(
    rows: impl Iterator<Item = T>,
    created_at: impl Fn(&T) -> DateTime<Utc>,
    limit: i64,
    offset: i64,
) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    // Stable sort keeps insertion order for equal timestamps.
    rows.sort_by_key(|row| created_at(row));
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

fn after(created_at: DateTime<Utc>, from: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |from| created_at > from)
}

#[async_trait]
impl ApiRepository for InMemoryStore {
    async fn get_api_by_path(&self, host: &str, path: &str) -> Result<Option<Api>> {
        let apis = self.apis.read().unwrap();
        Ok(apis
            .iter()
            .find(|a| a.host == host && a.path == path)
            .cloned())
    }

    async fn create_api(&self, api: &Api) -> Result<Api> {
        let mut apis = self.apis.write().unwrap();
        if let Some(existing) = apis
            .iter()
            .find(|a| a.host == api.host && a.path == api.path)
        {
            return Ok(existing.clone());
        }
        apis.push(api.clone());
        Ok(api.clone())
    }

    async fn get_api(&self, id: &str) -> Result<Option<Api>> {
        let apis = self.apis.read().unwrap();
        Ok(apis.iter().find(|a| a.id == id).cloned())
    }

    async fn get_apis_page(&self, limit: i64, offset: i64) -> Result<Vec<Api>> {
        let apis = self.apis.read().unwrap();
        Ok(page(apis.iter().cloned(), |a| a.created_at, limit, offset))
    }

    async fn count_apis(&self) -> Result<i64> {
        Ok(self.apis.read().unwrap().len() as i64)
    }

    async fn update_api_watermark(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut apis = self.apis.write().unwrap();
        match apis.iter_mut().find(|a| a.id == id) {
            Some(api) => {
                api.last_build_at = Some(at);
                Ok(())
            }
            None => bail!("api not found: {}", id),
        }
    }
}

#[async_trait]
impl SampleRepository for InMemoryStore {
    async fn create_sample_request(&self, sample: &SampleRequest) -> Result<()> {
        self.requests.write().unwrap().push(sample.clone());
        Ok(())
    }

    async fn create_sample_response(&self, sample: &SampleResponse) -> Result<()> {
        self.responses.write().unwrap().push(sample.clone());
        Ok(())
    }

    async fn newest_sample_at(
        &self,
        api_id: &str,
        kind: SampleKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let newest = match kind {
            SampleKind::Request => self
                .requests
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.api_id == api_id)
                .map(|s| s.created_at)
                .max(),
            SampleKind::Response => self
                .responses
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.api_id == api_id)
                .map(|s| s.created_at)
                .max(),
        };
        Ok(newest)
    }

    async fn get_sample_requests_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleRequest>> {
        let requests = self.requests.read().unwrap();
        let rows = requests
            .iter()
            .filter(|s| s.api_id == api_id && after(s.created_at, from))
            .cloned();
        Ok(page(rows, |s| s.created_at, limit, offset))
    }

    async fn get_sample_responses_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleResponse>> {
        let responses = self.responses.read().unwrap();
        let rows = responses
            .iter()
            .filter(|s| s.api_id == api_id && after(s.created_at, from))
            .cloned();
        Ok(page(rows, |s| s.created_at, limit, offset))
    }
}

#[async_trait]
impl StructureRepository for InMemoryStore {
    async fn get_request_structure(&self, api_id: &str) -> Result<Option<RequestStructure>> {
        let structures = self.request_structures.read().unwrap();
        Ok(structures.iter().find(|s| s.api_id == api_id).cloned())
    }

    async fn create_request_structure(&self, structure: &RequestStructure) -> Result<()> {
        let mut structures = self.request_structures.write().unwrap();
        if structures.iter().any(|s| s.api_id == structure.api_id) {
            bail!("request structure already exists for api {}", structure.api_id);
        }
        structures.push(structure.clone());
        Ok(())
    }

    async fn update_request_structure(
        &self,
        id: &str,
        parameters: &[Parameter],
        body_schema: Option<&Schema>,
    ) -> Result<()> {
        let mut structures = self.request_structures.write().unwrap();
        match structures.iter_mut().find(|s| s.id == id) {
            Some(structure) => {
                structure.parameters = parameters.to_vec();
                structure.body_schema = body_schema.cloned();
                structure.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("request structure not found: {}", id),
        }
    }

    async fn get_response_structure(&self, api_id: &str) -> Result<Option<ResponseStructure>> {
        let structures = self.response_structures.read().unwrap();
        Ok(structures.iter().find(|s| s.api_id == api_id).cloned())
    }

    async fn create_response_structure(&self, structure: &ResponseStructure) -> Result<()> {
        let mut structures = self.response_structures.write().unwrap();
        if structures.iter().any(|s| s.api_id == structure.api_id) {
            bail!("response structure already exists for api {}", structure.api_id);
        }
        structures.push(structure.clone());
        Ok(())
    }

    async fn update_response_structure(
        &self,
        id: &str,
        body_schema: Option<&Schema>,
    ) -> Result<()> {
        let mut structures = self.response_structures.write().unwrap();
        match structures.iter_mut().find(|s| s.id == id) {
            Some(structure) => {
                structure.body_schema = body_schema.cloned();
                structure.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("response structure not found: {}", id),
        }
    }
}
