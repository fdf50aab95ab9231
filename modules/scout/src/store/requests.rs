//! Audit trail of outbound requests (content source + language model).
//! Writes are best-effort: a failed audit insert must never abort the
//! operation being audited.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use scout_common::Result;

#[async_trait]
pub trait RequestsLog: Send + Sync {
    async fn save(
        &self,
        request_type: &str,
        request: serde_json::Value,
        response: serde_json::Value,
    ) -> Result<()>;
}

pub struct PgRequestsStorage {
    pool: PgPool,
}

impl PgRequestsStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        service: &str,
        request_type: &str,
        request: serde_json::Value,
        response: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit.requests (service, request_type, request, response)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(service)
        .bind(request_type)
        .bind(request)
        .bind(response)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Binds a requests storage to one service name, so callers only supply the
/// request type.
pub struct ServiceRequestsLog {
    storage: Arc<PgRequestsStorage>,
    service: String,
}

impl ServiceRequestsLog {
    pub fn new(storage: Arc<PgRequestsStorage>, service: impl Into<String>) -> Self {
        Self {
            storage,
            service: service.into(),
        }
    }
}

#[async_trait]
impl RequestsLog for ServiceRequestsLog {
    async fn save(
        &self,
        request_type: &str,
        request: serde_json::Value,
        response: serde_json::Value,
    ) -> Result<()> {
        self.storage
            .save(&self.service, request_type, request, response)
            .await
    }
}

/// Discards everything. For tests and for running without an audit trail.
pub struct NoopRequestsLog;

#[async_trait]
impl RequestsLog for NoopRequestsLog {
    async fn save(
        &self,
        _request_type: &str,
        _request: serde_json::Value,
        _response: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }
}
