//! The persistence capability set.
//!
//! Handlers hold an `Arc<dyn Store>` so the SQLite backend can be swapped
//! without touching business logic. Implementations must be safe for
//! concurrent use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{AgentRecord, ApiKey, EnrollmentToken};

/// Storage errors. The two token variants double as the client-facing
/// rejection messages for enrollment.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("enrollment token already used")]
    TokenUsed,

    #[error("enrollment token expired")]
    TokenExpired,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // Enrolled agents.
    async fn create_agent(&self, agent: &AgentRecord) -> Result<(), StoreError>;
    async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn get_agent_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError>;
    async fn update_agent_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
    async fn delete_agent(&self, id: &str) -> Result<(), StoreError>;

    // Enrollment tokens.
    async fn create_enrollment_token(&self, token: &EnrollmentToken) -> Result<(), StoreError>;

    /// Atomically consume the token matching `code_hash`, marking it used
    /// by `agent_id`. Returns `Ok(None)` when no such token exists;
    /// concurrent consumers of the same code never both succeed.
    async fn consume_enrollment_token(
        &self,
        code_hash: &str,
        agent_id: &str,
    ) -> Result<Option<EnrollmentToken>, StoreError>;

    /// Consume the token *and* insert the agent record in one transaction,
    /// so a failed insert cannot strand a spent token.
    async fn enroll_agent(
        &self,
        code_hash: &str,
        agent: &AgentRecord,
    ) -> Result<Option<EnrollmentToken>, StoreError>;

    async fn list_enrollment_tokens(&self) -> Result<Vec<EnrollmentToken>, StoreError>;
    async fn delete_enrollment_token(&self, id: &str) -> Result<(), StoreError>;

    // API keys.
    async fn create_api_key(&self, key: &ApiKey) -> Result<(), StoreError>;

    /// Look up a key by hash. A hit also bumps `last_used`, best-effort.
    async fn verify_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn list_api_keys(&self) -> Result<Vec<ApiKey>, StoreError>;
    async fn delete_api_key(&self, id: &str) -> Result<(), StoreError>;
}
