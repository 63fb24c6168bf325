//! Discovered API listing for `scribe apis`.

use anyhow::Result;
use api_scribe_core::store::ApiRepository;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Print one page of discovered Apis, oldest first.
pub async fn list_apis(config: &Config, limit: i64, offset: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let total = store.count_apis().await?;
    let apis = store.get_apis_page(limit.max(1), offset.max(0)).await?;
    pool.close().await;

    if apis.is_empty() {
        println!("No APIs discovered yet ({} total).", total);
        return Ok(());
    }

    println!(
        "{:<36}  {:<7}  {:<28}  {:<20}  PATH",
        "ID", "METHOD", "HOST", "LAST BUILD"
    );
    for api in &apis {
        let last_build = api
            .last_build_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<36}  {:<7}  {:<28}  {:<20}  {}",
            api.id, api.method, api.host, last_build, api.path
        );
    }
    println!();
    println!(
        "showing {}-{} of {}",
        offset.max(0) + 1,
        offset.max(0) + apis.len() as i64,
        total
    );

    Ok(())
}
