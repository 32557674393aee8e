//! SQLite-backed `Store` implementation.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;
use vantage_crypto::token::now_utc;

use super::models::{to_rfc3339, AgentRecord, ApiKey, EnrollmentToken};
use super::store::{Store, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), "database opened");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .foreign_keys(true);

        // A single connection: each pooled connection would otherwise get
        // its own private in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("database migrations complete");
        Ok(())
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("invalid stored timestamp {value:?}: {e}")))
}

fn parse_ts_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord, StoreError> {
    Ok(AgentRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        hostname: row.try_get("hostname")?,
        os: row.try_get("os")?,
        arch: row.try_get("arch")?,
        credential_hash: row.try_get("credential_hash")?,
        enrolled_at: parse_ts(&row.try_get::<String, _>("enrolled_at")?)?,
        last_seen: parse_ts(&row.try_get::<String, _>("last_seen")?)?,
    })
}

fn token_from_row(row: &SqliteRow) -> Result<EnrollmentToken, StoreError> {
    Ok(EnrollmentToken {
        id: row.try_get("id")?,
        code_hash: row.try_get("code_hash")?,
        token_type: row.try_get("type")?,
        label: row.try_get("label")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
        used_at: parse_ts_opt(row.try_get("used_at")?)?,
        used_by: row.try_get("used_by")?,
    })
}

fn api_key_from_row(row: &SqliteRow) -> Result<ApiKey, StoreError> {
    Ok(ApiKey {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        key_hash: row.try_get("key_hash")?,
        prefix: row.try_get("prefix")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        last_used: parse_ts_opt(row.try_get("last_used")?)?,
    })
}

/// Select-check-update token consumption inside an open transaction.
/// The guarded UPDATE closes the race between two consumers holding the
/// same snapshot: only one can flip `used_at` from NULL.
async fn consume_token_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    code_hash: &str,
    agent_id: &str,
) -> Result<Option<EnrollmentToken>, StoreError> {
    let row = sqlx::query("SELECT * FROM enrollment_tokens WHERE code_hash = ?")
        .bind(code_hash)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut token = token_from_row(&row)?;

    if token.used_at.is_some() {
        return Err(StoreError::TokenUsed);
    }
    let now = now_utc();
    if token.expires_at < now {
        return Err(StoreError::TokenExpired);
    }

    let result = sqlx::query(
        "UPDATE enrollment_tokens SET used_at = ?, used_by = ? WHERE id = ? AND used_at IS NULL",
    )
    .bind(to_rfc3339(now))
    .bind(agent_id)
    .bind(&token.id)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::TokenUsed);
    }

    token.used_at = Some(now);
    token.used_by = Some(agent_id.to_string());
    Ok(Some(token))
}

async fn insert_agent_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    agent: &AgentRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO agents (id, name, hostname, os, arch, credential_hash, enrolled_at, last_seen)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(&agent.hostname)
    .bind(&agent.os)
    .bind(&agent.arch)
    .bind(&agent.credential_hash)
    .bind(to_rfc3339(agent.enrolled_at))
    .bind(to_rfc3339(agent.last_seen))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        insert_agent_tx(&mut tx, agent).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| agent_from_row(&row))
            .transpose()
    }

    async fn get_agent_by_credential(
        &self,
        credential_hash: &str,
    ) -> Result<Option<AgentRecord>, StoreError> {
        sqlx::query("SELECT * FROM agents WHERE credential_hash = ?")
            .bind(credential_hash)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| agent_from_row(&row))
            .transpose()
    }

    async fn update_agent_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ?")
            .bind(to_rfc3339(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        sqlx::query("SELECT * FROM agents ORDER BY enrolled_at DESC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(agent_from_row)
            .collect()
    }

    async fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_enrollment_token(&self, token: &EnrollmentToken) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO enrollment_tokens (id, code_hash, type, label, created_at, expires_at, used_at, used_by)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&token.id)
        .bind(&token.code_hash)
        .bind(&token.token_type)
        .bind(&token.label)
        .bind(to_rfc3339(token.created_at))
        .bind(to_rfc3339(token.expires_at))
        .bind(token.used_at.map(to_rfc3339))
        .bind(&token.used_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_enrollment_token(
        &self,
        code_hash: &str,
        agent_id: &str,
    ) -> Result<Option<EnrollmentToken>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let token = consume_token_tx(&mut tx, code_hash, agent_id).await?;
        if token.is_some() {
            tx.commit().await?;
        }
        Ok(token)
    }

    async fn enroll_agent(
        &self,
        code_hash: &str,
        agent: &AgentRecord,
    ) -> Result<Option<EnrollmentToken>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(token) = consume_token_tx(&mut tx, code_hash, &agent.id).await? else {
            return Ok(None);
        };
        insert_agent_tx(&mut tx, agent).await?;
        tx.commit().await?;
        Ok(Some(token))
    }

    async fn list_enrollment_tokens(&self) -> Result<Vec<EnrollmentToken>, StoreError> {
        sqlx::query("SELECT * FROM enrollment_tokens ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(token_from_row)
            .collect()
    }

    async fn delete_enrollment_token(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM enrollment_tokens WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_keys (id, name, key_hash, prefix, created_at, last_used)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(&key.prefix)
        .bind(to_rfc3339(key.created_at))
        .bind(key.last_used.map(to_rfc3339))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn verify_api_key(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut key = api_key_from_row(&row)?;

        // Best-effort usage timestamp; a failed write must not block auth.
        let now = now_utc();
        if sqlx::query("UPDATE api_keys SET last_used = ? WHERE id = ?")
            .bind(to_rfc3339(now))
            .bind(&key.id)
            .execute(&self.pool)
            .await
            .is_ok()
        {
            key.last_used = Some(now);
        }

        Ok(Some(key))
    }

    async fn list_api_keys(&self) -> Result<Vec<ApiKey>, StoreError> {
        sqlx::query("SELECT * FROM api_keys ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(api_key_from_row)
            .collect()
    }

    async fn delete_api_key(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vantage_crypto::token::{generate_api_key, generate_enrollment, TokenType};

    fn sample_agent(id: &str, credential_hash: &str) -> AgentRecord {
        let now = now_utc();
        AgentRecord {
            id: id.into(),
            name: "workstation".into(),
            hostname: "host-1".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            credential_hash: credential_hash.into(),
            enrolled_at: now,
            last_seen: now,
        }
    }

    fn sample_token(code_hash: &str, expires_at: DateTime<Utc>) -> EnrollmentToken {
        EnrollmentToken {
            id: format!("tok-{}", &code_hash[..6.min(code_hash.len())]),
            code_hash: code_hash.into(),
            token_type: "attended".into(),
            label: String::new(),
            created_at: now_utc(),
            expires_at,
            used_at: None,
            used_by: None,
        }
    }

    #[tokio::test]
    async fn agent_crud_roundtrip() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let agent = sample_agent("a1", "hash-1");

        store.create_agent(&agent).await.unwrap();
        let fetched = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(fetched, agent);

        let by_cred = store
            .get_agent_by_credential("hash-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_cred.id, "a1");

        assert_eq!(store.list_agents().await.unwrap().len(), 1);

        store.delete_agent("a1").await.unwrap();
        assert!(store.get_agent("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_credential_hash_is_rejected() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        store.create_agent(&sample_agent("a1", "same")).await.unwrap();
        let err = store.create_agent(&sample_agent("a2", "same")).await;
        assert!(matches!(err, Err(StoreError::Query(_))));
    }

    #[tokio::test]
    async fn timestamps_roundtrip_rfc3339_utc_seconds() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let agent = sample_agent("a1", "h1");
        store.create_agent(&agent).await.unwrap();

        let seen = DateTime::parse_from_rfc3339("2026-02-01T08:09:10Z")
            .unwrap()
            .with_timezone(&Utc);
        store.update_agent_seen("a1", seen).await.unwrap();

        let fetched = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(fetched.last_seen, seen);
        assert_eq!(fetched.enrolled_at, agent.enrolled_at);
    }

    #[tokio::test]
    async fn consume_unknown_code_returns_none() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let result = store
            .consume_enrollment_token("no-such-hash", "a1")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn consume_marks_token_used() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-a", now_utc() + Duration::minutes(15));
        store.create_enrollment_token(&token).await.unwrap();

        let consumed = store
            .consume_enrollment_token("hash-a", "agent-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.used_by.as_deref(), Some("agent-9"));
        assert!(consumed.used_at.is_some());

        let listed = &store.list_enrollment_tokens().await.unwrap()[0];
        assert_eq!(listed.used_by.as_deref(), Some("agent-9"));
        assert!(listed.used_at.is_some());
    }

    #[tokio::test]
    async fn consume_twice_fails_with_token_used() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-b", now_utc() + Duration::minutes(15));
        store.create_enrollment_token(&token).await.unwrap();

        store
            .consume_enrollment_token("hash-b", "first")
            .await
            .unwrap()
            .unwrap();
        let err = store.consume_enrollment_token("hash-b", "second").await;
        assert!(matches!(err, Err(StoreError::TokenUsed)));
    }

    #[tokio::test]
    async fn consume_expired_fails_with_token_expired() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-c", now_utc() - Duration::minutes(1));
        store.create_enrollment_token(&token).await.unwrap();

        let err = store.consume_enrollment_token("hash-c", "late").await;
        assert!(matches!(err, Err(StoreError::TokenExpired)));

        // An expired token is not consumed.
        let listed = &store.list_enrollment_tokens().await.unwrap()[0];
        assert!(listed.used_at.is_none());
    }

    #[tokio::test]
    async fn concurrent_consumers_exactly_one_succeeds() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-race", now_utc() + Duration::minutes(15));
        store.create_enrollment_token(&token).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .consume_enrollment_token("hash-race", &format!("agent-{i}"))
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Some(_)) => successes += 1,
                Ok(None) => panic!("token vanished"),
                Err(StoreError::TokenUsed) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn enroll_agent_consumes_and_inserts_atomically() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-e", now_utc() + Duration::minutes(15));
        store.create_enrollment_token(&token).await.unwrap();

        let agent = sample_agent("new-agent", "cred-hash");
        let consumed = store
            .enroll_agent("hash-e", &agent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.used_by.as_deref(), Some("new-agent"));
        assert!(store.get_agent("new-agent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_agent_insert_leaves_token_unconsumed() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let token = sample_token("hash-f", now_utc() + Duration::minutes(15));
        store.create_enrollment_token(&token).await.unwrap();

        // Occupy the agent id so the insert inside enroll_agent fails.
        store
            .create_agent(&sample_agent("dup-id", "other-hash"))
            .await
            .unwrap();

        let err = store
            .enroll_agent("hash-f", &sample_agent("dup-id", "cred"))
            .await;
        assert!(matches!(err, Err(StoreError::Query(_))));

        // The transaction rolled back: the token is still consumable.
        let consumed = store
            .consume_enrollment_token("hash-f", "retry")
            .await
            .unwrap();
        assert!(consumed.is_some());
    }

    #[tokio::test]
    async fn minted_grant_persists_and_lists() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let grant = generate_enrollment(TokenType::Unattended, "fleet");
        let token = EnrollmentToken {
            id: grant.id.clone(),
            code_hash: grant.code_hash.clone(),
            token_type: grant.token_type.as_str().into(),
            label: grant.label.clone(),
            created_at: grant.created_at,
            expires_at: grant.expires_at,
            used_at: None,
            used_by: None,
        };
        store.create_enrollment_token(&token).await.unwrap();

        let listed = store.list_enrollment_tokens().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], token);

        store.delete_enrollment_token(&grant.id).await.unwrap();
        assert!(store.list_enrollment_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn verify_api_key_bumps_last_used() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let grant = generate_api_key("admin");
        let key = ApiKey {
            id: grant.id.clone(),
            name: grant.name.clone(),
            key_hash: grant.key_hash.clone(),
            prefix: grant.prefix.clone(),
            created_at: grant.created_at,
            last_used: None,
        };
        store.create_api_key(&key).await.unwrap();

        let verified = store
            .verify_api_key(&grant.key_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(verified.name, "admin");
        assert!(verified.last_used.is_some());

        let listed = &store.list_api_keys().await.unwrap()[0];
        assert!(listed.last_used.is_some());

        assert!(store.verify_api_key("wrong-hash").await.unwrap().is_none());
    }
}
