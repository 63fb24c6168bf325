//! Structure builder.
//!
//! Folds new samples into each Api's request and response structures.
//! Apis are paged in creation order and built concurrently, one task per
//! Api, bounded by `[build] concurrency`.
//!
//! Each Api carries a watermark (`last_build_at`). A side whose newest
//! sample is not after the watermark is skipped. Otherwise the stored
//! structure seeds the merge and every sample created after the watermark
//! is folded in, oldest first. After a successful build the watermark
//! moves to the instant the build of that Api started, so samples that
//! land while it runs are picked up next time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use api_scribe_core::models::{
    Api, Parameter, ParameterType, RequestStructure, ResponseStructure, SampleKind,
};
use api_scribe_core::schema::{merge_body, synthesize_body, Schema};
use api_scribe_core::store::Store;

use crate::config::{BuildConfig, Config};
use crate::db;
use crate::pool::WorkerPool;
use crate::sqlite_store::SqliteStore;

/// Summary of one build run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub apis_seen: u64,
    pub apis_built: u64,
    pub apis_skipped: u64,
    pub apis_failed: u64,
    /// First per-Api error, if any Api failed.
    pub first_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    seen: AtomicU64,
    built: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// No sample newer than the watermark on either side.
    Skipped,
    Built { request: bool, response: bool },
}

#[derive(Clone)]
pub struct StructureBuilder {
    store: Arc<dyn Store>,
    config: BuildConfig,
}

impl StructureBuilder {
    pub fn new(store: Arc<dyn Store>, config: BuildConfig) -> Self {
        Self { store, config }
    }

    /// Build every known Api.
    ///
    /// A failing Api does not stop the others; the first failure is
    /// returned in [`BuildReport::first_error`]. Failing to page the Api
    /// list aborts the run.
    pub async fn run(&self) -> Result<BuildReport> {
        let counters = Arc::new(Counters::default());
        let page_size = self.config.api_page_size.max(1);
        let mut pool = WorkerPool::new("build", self.config.concurrency);
        let mut offset = 0i64;

        loop {
            let page = self
                .store
                .get_apis_page(page_size, offset)
                .await
                .with_context(|| format!("Failed to load apis at offset {}", offset))?;
            let fetched = page.len() as i64;

            for api in page {
                counters.seen.fetch_add(1, Ordering::Relaxed);
                let this = self.clone();
                let counters = counters.clone();
                pool.submit(async move {
                    match this.build_one(&api).await {
                        Ok(BuildOutcome::Skipped) => {
                            counters.skipped.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Ok(BuildOutcome::Built { .. }) => {
                            counters.built.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Err(err) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            error!(api_id = %api.id, path = %api.path, err = %format!("{:#}", err), "failed to build api");
                            Err(err.context(format!("api {} {}", api.id, api.path)))
                        }
                    }
                })
                .await?;
            }

            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        let first_error = pool.wait().await.err().map(|e| format!("{:#}", e));
        Ok(BuildReport {
            apis_seen: counters.seen.load(Ordering::Relaxed),
            apis_built: counters.built.load(Ordering::Relaxed),
            apis_skipped: counters.skipped.load(Ordering::Relaxed),
            apis_failed: counters.failed.load(Ordering::Relaxed),
            first_error,
        })
    }

    /// Fold the samples of one Api that are newer than its watermark.
    pub async fn build_one(&self, api: &Api) -> Result<BuildOutcome> {
        let started_at = Utc::now();

        let newest_request = self
            .store
            .newest_sample_at(&api.id, SampleKind::Request)
            .await?;
        let newest_response = self
            .store
            .newest_sample_at(&api.id, SampleKind::Response)
            .await?;
        if newest_request.is_none() && newest_response.is_none() {
            debug!(api_id = %api.id, "no samples, skipping");
            return Ok(BuildOutcome::Skipped);
        }

        let request = is_fresh(newest_request, api.last_build_at);
        let response = is_fresh(newest_response, api.last_build_at);
        if !request && !response {
            debug!(api_id = %api.id, "no samples since last build, skipping");
            return Ok(BuildOutcome::Skipped);
        }

        if request {
            self.build_request(api)
                .await
                .context("request structure")?;
        }
        if response {
            self.build_response(api)
                .await
                .context("response structure")?;
        }

        self.store
            .update_api_watermark(&api.id, started_at)
            .await?;
        debug!(api_id = %api.id, request, response, "built api");
        Ok(BuildOutcome::Built { request, response })
    }

    async fn build_request(&self, api: &Api) -> Result<()> {
        let existing = self.store.get_request_structure(&api.id).await?;
        let mut body = existing.as_ref().and_then(|s| s.body_schema.clone());
        let mut parameters: BTreeMap<String, Parameter> = existing
            .as_ref()
            .map(|s| {
                s.parameters
                    .iter()
                    .map(|p| (p.name.clone(), p.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let page_size = self.config.sample_page_size.max(1);
        let mut offset = 0i64;
        loop {
            let page = self
                .store
                .get_sample_requests_page(&api.id, api.last_build_at, page_size, offset)
                .await?;
            let fetched = page.len() as i64;
            for sample in page {
                fold_body(&mut body, &sample.body, &sample.id);
                for parameter in sample.parameters {
                    union_parameter(&mut parameters, parameter);
                }
            }
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        let parameters: Vec<Parameter> = parameters.into_values().collect();
        match existing {
            Some(structure) => {
                self.store
                    .update_request_structure(&structure.id, &parameters, body.as_ref())
                    .await
            }
            None => {
                self.store
                    .create_request_structure(&RequestStructure::new(&api.id, parameters, body))
                    .await
            }
        }
    }

    async fn build_response(&self, api: &Api) -> Result<()> {
        let existing = self.store.get_response_structure(&api.id).await?;
        let mut body = existing.as_ref().and_then(|s| s.body_schema.clone());

        let page_size = self.config.sample_page_size.max(1);
        let mut offset = 0i64;
        loop {
            let page = self
                .store
                .get_sample_responses_page(&api.id, api.last_build_at, page_size, offset)
                .await?;
            let fetched = page.len() as i64;
            for sample in page {
                fold_body(&mut body, &sample.body, &sample.id);
            }
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        match existing {
            Some(structure) => {
                self.store
                    .update_response_structure(&structure.id, body.as_ref())
                    .await
            }
            None => {
                self.store
                    .create_response_structure(&ResponseStructure::new(&api.id, body))
                    .await
            }
        }
    }
}

fn is_fresh(newest: Option<DateTime<Utc>>, watermark: Option<DateTime<Utc>>) -> bool {
    match (newest, watermark) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(newest), Some(watermark)) => newest > watermark,
    }
}

fn fold_body(current: &mut Option<Schema>, body: &str, sample_id: &str) {
    match synthesize_body(body) {
        Ok(Some(next)) => *current = Some(merge_body(current.take(), next)),
        Ok(None) => {}
        Err(err) => debug!(sample_id = %sample_id, err = %err, "skipping sample body"),
    }
}

/// Merge one observed parameter into the by-name set. Conflicting types
/// widen to [`ParameterType::Any`].
fn union_parameter(parameters: &mut BTreeMap<String, Parameter>, mut incoming: Parameter) {
    incoming.value = None;
    match parameters.get_mut(&incoming.name) {
        Some(known) => {
            if known.param_type != incoming.param_type {
                known.param_type = ParameterType::Any;
            }
            known.required = known.required || incoming.required;
        }
        None => {
            parameters.insert(incoming.name.clone(), incoming);
        }
    }
}

/// `scribe build`: run one structure-build pass and print a summary.
pub async fn run_build(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));

    info!(concurrency = config.build.concurrency, "starting structure build");
    let builder = StructureBuilder::new(store, config.build.clone());
    let result = builder.run().await;
    pool.close().await;
    let report = result?;

    println!("build");
    println!("  apis: {}", report.apis_seen);
    println!("  built: {}", report.apis_built);
    println!("  skipped: {}", report.apis_skipped);
    println!("  failed: {}", report.apis_failed);

    if let Some(err) = report.first_error {
        bail!("build finished with errors: {}", err);
    }
    println!("ok");
    Ok(())
}
