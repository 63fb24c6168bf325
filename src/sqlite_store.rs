//! SQLite-backed [`Store`](api_scribe_core::store::Store) implementation.
//!
//! Timestamps are stored as integer microseconds since the epoch so that
//! sample ordering and watermark comparisons are exact. Parameter lists
//! and schema trees are stored as JSON text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use api_scribe_core::models::{
    Api, Parameter, RequestStructure, ResponseStructure, SampleKind, SampleRequest,
    SampleResponse,
};
use api_scribe_core::schema::Schema;
use api_scribe_core::store::{ApiRepository, SampleRepository, StructureRepository};

/// SQLite implementation of the repository traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", micros))
}

fn schema_to_json(schema: Option<&Schema>) -> Result<Option<String>> {
    schema
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode body schema")
}

fn schema_from_json(raw: Option<String>) -> Result<Option<Schema>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Failed to decode body schema")
}

fn api_from_row(row: &SqliteRow) -> Result<Api> {
    let last_build_at: Option<i64> = row.get("last_build_at");
    Ok(Api {
        id: row.get("id"),
        host: row.get("host"),
        method: row.get("method"),
        path: row.get("path"),
        description: row.get("description"),
        last_build_at: last_build_at.map(from_micros).transpose()?,
        created_at: from_micros(row.get("created_at"))?,
    })
}

const API_COLUMNS: &str = "id, host, method, path, description, last_build_at, created_at";

#[async_trait]
impl ApiRepository for SqliteStore {
    async fn get_api_by_path(&self, host: &str, path: &str) -> Result<Option<Api>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM apis WHERE host = ? AND path = ?",
            API_COLUMNS
        ))
        .bind(host)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(api_from_row).transpose()
    }

    async fn create_api(&self, api: &Api) -> Result<Api> {
        sqlx::query(
            r#"
            INSERT INTO apis (id, host, method, path, description, last_build_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(host, path) DO NOTHING
            "#,
        )
        .bind(&api.id)
        .bind(&api.host)
        .bind(&api.method)
        .bind(&api.path)
        .bind(&api.description)
        .bind(api.last_build_at.map(to_micros))
        .bind(to_micros(api.created_at))
        .execute(&self.pool)
        .await?;

        self.get_api_by_path(&api.host, &api.path)
            .await?
            .ok_or_else(|| anyhow!("api {} {} vanished after insert", api.host, api.path))
    }

    async fn get_api(&self, id: &str) -> Result<Option<Api>> {
        let row = sqlx::query(&format!("SELECT {} FROM apis WHERE id = ?", API_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(api_from_row).transpose()
    }

    async fn get_apis_page(&self, limit: i64, offset: i64) -> Result<Vec<Api>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM apis ORDER BY created_at ASC, rowid ASC LIMIT ? OFFSET ?",
            API_COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(api_from_row).collect()
    }

    async fn count_apis(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apis")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn update_api_watermark(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE apis SET last_build_at = ? WHERE id = ?")
            .bind(to_micros(at))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("api not found: {}", id));
        }
        Ok(())
    }
}

#[async_trait]
impl SampleRepository for SqliteStore {
    async fn create_sample_request(&self, sample: &SampleRequest) -> Result<()> {
        let parameters_json = serde_json::to_string(&sample.parameters)?;
        sqlx::query(
            "INSERT INTO sample_requests (id, api_id, parameters_json, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&sample.id)
        .bind(&sample.api_id)
        .bind(&parameters_json)
        .bind(&sample.body)
        .bind(to_micros(sample.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_sample_response(&self, sample: &SampleResponse) -> Result<()> {
        sqlx::query(
            "INSERT INTO sample_responses (id, api_id, status_code, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&sample.id)
        .bind(&sample.api_id)
        .bind(sample.status_code)
        .bind(&sample.body)
        .bind(to_micros(sample.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn newest_sample_at(
        &self,
        api_id: &str,
        kind: SampleKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = match kind {
            SampleKind::Request => "SELECT MAX(created_at) FROM sample_requests WHERE api_id = ?",
            SampleKind::Response => "SELECT MAX(created_at) FROM sample_responses WHERE api_id = ?",
        };
        let newest: Option<i64> = sqlx::query_scalar(sql)
            .bind(api_id)
            .fetch_one(&self.pool)
            .await?;

        newest.map(from_micros).transpose()
    }

    async fn get_sample_requests_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, api_id, parameters_json, body, created_at
            FROM sample_requests
            WHERE api_id = ? AND created_at > ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(api_id)
        .bind(from.map_or(i64::MIN, to_micros))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let parameters_json: String = row.get("parameters_json");
                let parameters: Vec<Parameter> = serde_json::from_str(&parameters_json)
                    .context("Failed to decode sample parameters")?;
                Ok(SampleRequest {
                    id: row.get("id"),
                    api_id: row.get("api_id"),
                    parameters,
                    body: row.get("body"),
                    created_at: from_micros(row.get("created_at"))?,
                })
            })
            .collect()
    }

    async fn get_sample_responses_page(
        &self,
        api_id: &str,
        from: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SampleResponse>> {
        let rows = sqlx::query(
            r#"
            SELECT id, api_id, status_code, body, created_at
            FROM sample_responses
            WHERE api_id = ? AND created_at > ?
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(api_id)
        .bind(from.map_or(i64::MIN, to_micros))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SampleResponse {
                    id: row.get("id"),
                    api_id: row.get("api_id"),
                    status_code: row.get("status_code"),
                    body: row.get("body"),
                    created_at: from_micros(row.get("created_at"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StructureRepository for SqliteStore {
    async fn get_request_structure(&self, api_id: &str) -> Result<Option<RequestStructure>> {
        let row = sqlx::query(
            "SELECT id, api_id, parameters_json, body_schema_json, created_at, updated_at FROM request_structures WHERE api_id = ?",
        )
        .bind(api_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let parameters_json: String = row.get("parameters_json");
        Ok(Some(RequestStructure {
            id: row.get("id"),
            api_id: row.get("api_id"),
            parameters: serde_json::from_str(&parameters_json)
                .context("Failed to decode structure parameters")?,
            body_schema: schema_from_json(row.get("body_schema_json"))?,
            created_at: from_micros(row.get("created_at"))?,
            updated_at: from_micros(row.get("updated_at"))?,
        }))
    }

    async fn create_request_structure(&self, structure: &RequestStructure) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_structures (id, api_id, parameters_json, body_schema_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&structure.id)
        .bind(&structure.api_id)
        .bind(serde_json::to_string(&structure.parameters)?)
        .bind(schema_to_json(structure.body_schema.as_ref())?)
        .bind(to_micros(structure.created_at))
        .bind(to_micros(structure.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_request_structure(
        &self,
        id: &str,
        parameters: &[Parameter],
        body_schema: Option<&Schema>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE request_structures SET parameters_json = ?, body_schema_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(parameters)?)
        .bind(schema_to_json(body_schema)?)
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("request structure not found: {}", id));
        }
        Ok(())
    }

    async fn get_response_structure(&self, api_id: &str) -> Result<Option<ResponseStructure>> {
        let row = sqlx::query(
            "SELECT id, api_id, body_schema_json, created_at, updated_at FROM response_structures WHERE api_id = ?",
        )
        .bind(api_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ResponseStructure {
            id: row.get("id"),
            api_id: row.get("api_id"),
            body_schema: schema_from_json(row.get("body_schema_json"))?,
            created_at: from_micros(row.get("created_at"))?,
            updated_at: from_micros(row.get("updated_at"))?,
        }))
    }

    async fn create_response_structure(&self, structure: &ResponseStructure) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO response_structures (id, api_id, body_schema_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&structure.id)
        .bind(&structure.api_id)
        .bind(schema_to_json(structure.body_schema.as_ref())?)
        .bind(to_micros(structure.created_at))
        .bind(to_micros(structure.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_response_structure(
        &self,
        id: &str,
        body_schema: Option<&Schema>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE response_structures SET body_schema_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(schema_to_json(body_schema)?)
        .bind(to_micros(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("response structure not found: {}", id));
        }
        Ok(())
    }
}
