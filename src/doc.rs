//! OpenAPI document retrieval for `scribe doc`.
//!
//! Loads one Api with its merged request and response structures and
//! renders them as an OpenAPI 3.0 document.

use anyhow::{bail, Result};
use api_scribe_core::openapi::build_document;
use api_scribe_core::store::{ApiRepository, StructureRepository};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Assemble the OpenAPI document for `api_id`.
pub async fn get_document(config: &Config, api_id: &str) -> Result<serde_json::Value> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let api = match store.get_api(api_id).await? {
        Some(api) => api,
        None => {
            pool.close().await;
            bail!("api not found: {}", api_id);
        }
    };
    let request = store.get_request_structure(api_id).await?;
    let response = store.get_response_structure(api_id).await?;
    pool.close().await;

    Ok(build_document(&api, request.as_ref(), response.as_ref()))
}

/// CLI entry: print the document as pretty JSON.
pub async fn print_document(config: &Config, api_id: &str) -> Result<()> {
    let document = get_document(config, api_id).await?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
