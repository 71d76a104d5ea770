//! the SQL-backed upload registry: one `uploads` row per upload,
//! migrated forward with a linear, numbered migration list, driving `sqlx`
//! directly instead of going through an ORM.

use async_trait::async_trait;
use sqlx::{postgres::PgPool, sqlite::SqlitePool, Row};
use tracing::{debug_span, Instrument};

use crate::error::{try_, AppError};

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub uploader_ip: String,
    pub jwt_account: String,
    pub jwt_issuer: String,
    pub sha256sum: Option<Vec<u8>>,
    pub deleted: bool,
}

impl UploadRecord {
    /// The effective expiration used by the sweep: `expires_at` when set,
    /// else `created_at + anonymousTTL` (anonymous) or `+ identifiedTTL`.
    pub fn effective_expiration(&self, anonymous_ttl: i64, identified_ttl: i64) -> i64 {
        if let Some(exp) = self.expires_at {
            return exp;
        }
        let ttl = if self.jwt_account.is_empty() { anonymous_ttl } else { identified_ttl };
        self.created_at + ttl
    }
}

#[async_trait]
pub trait UploadRegistry: Send + Sync + std::fmt::Debug + 'static {
    async fn insert(&self, id: &str, created_at: i64, uploader_ip: &str, account: &str, issuer: &str) -> Result<(), AppError>;

    async fn set_finalized(&self, id: &str, sha256: &[u8], expires_at: i64) -> Result<(), AppError>;

    async fn mark_deleted(&self, id: &str) -> Result<(), AppError>;

    async fn lookup(&self, id: &str) -> Result<UploadRecord, AppError>;

    async fn duplicate_count(&self, hash: &[u8], exclude_id: &str) -> Result<i64, AppError>;

    /// Non-deleted ids whose effective expiration has passed `now`.
    async fn select_expired(&self, now: i64, anonymous_ttl: i64, identified_ttl: i64) -> Result<Vec<String>, AppError>;

    /// Physically deletes tombstoned rows whose expiration + grace has
    /// elapsed. Returns the number of rows purged.
    async fn purge_tombstoned(&self, now: i64, grace_seconds: i64, anonymous_ttl: i64, identified_ttl: i64) -> Result<u64, AppError>;
}

#[derive(Debug)]
pub enum Registry {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl Registry {
    pub async fn connect_sqlite(dsn: &str) -> Result<Self, AppError> {
        let pool = SqlitePool::connect(dsn).await?;
        run_sqlite_migrations(&pool).await?;
        Ok(Registry::Sqlite(pool))
    }

    pub async fn connect_postgres(dsn: &str) -> Result<Self, AppError> {
        let pool = PgPool::connect(dsn).await?;
        run_postgres_migrations(&pool).await?;
        Ok(Registry::Postgres(pool))
    }
}

/// (id, sqlite DDL, postgres DDL) applied in ascending id order. Additive
/// only — columns are never dropped, so both dialects stay schema-compatible
/// across versions.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        r#"CREATE TABLE uploads (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            uploader_ip TEXT NOT NULL DEFAULT '',
            sha256sum BLOB,
            deleted INTEGER NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE uploads (
            id TEXT PRIMARY KEY,
            created_at BIGINT NOT NULL,
            uploader_ip TEXT NOT NULL DEFAULT '',
            sha256sum BYTEA,
            deleted SMALLINT NOT NULL DEFAULT 0
        )"#,
    ),
    (
        2,
        "ALTER TABLE uploads ADD COLUMN expires_at INTEGER",
        "ALTER TABLE uploads ADD COLUMN expires_at BIGINT",
    ),
    (
        3,
        "ALTER TABLE uploads ADD COLUMN jwt_account TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE uploads ADD COLUMN jwt_account TEXT NOT NULL DEFAULT ''",
    ),
    (
        4,
        "ALTER TABLE uploads ADD COLUMN jwt_issuer TEXT NOT NULL DEFAULT ''",
        "ALTER TABLE uploads ADD COLUMN jwt_issuer TEXT NOT NULL DEFAULT ''",
    ),
    (
        5,
        "CREATE INDEX idx_uploads_sha256sum ON uploads(sha256sum)",
        "CREATE INDEX idx_uploads_sha256sum ON uploads(sha256sum)",
    ),
];

async fn run_sqlite_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (id INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)")
        .execute(pool)
        .instrument(debug_span!("db_create_migrations_table"))
        .await?;

    for (id, sql, _) in MIGRATIONS {
        let applied: Option<i64> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (id, applied_at) VALUES (?, strftime('%s','now'))")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(migration = id, "applied schema migration");
    }
    Ok(())
}

async fn run_postgres_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS _migrations (id BIGINT PRIMARY KEY, applied_at BIGINT NOT NULL)")
        .execute(pool)
        .instrument(debug_span!("db_create_migrations_table"))
        .await?;

    for (id, _, sql) in MIGRATIONS {
        let applied: Option<i64> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (id, applied_at) VALUES ($1, extract(epoch from now())::bigint)")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(migration = id, "applied schema migration");
    }
    Ok(())
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UploadRecord, AppError> {
    Ok(UploadRecord {
        id: try_!(row.try_get("id")),
        created_at: try_!(row.try_get("created_at")),
        expires_at: try_!(row.try_get("expires_at")),
        uploader_ip: try_!(row.try_get("uploader_ip")),
        jwt_account: try_!(row.try_get("jwt_account")),
        jwt_issuer: try_!(row.try_get("jwt_issuer")),
        sha256sum: try_!(row.try_get("sha256sum")),
        deleted: {
            let raw: i64 = try_!(row.try_get("deleted"));
            raw != 0
        },
    })
}

fn pg_row_to_record(row: &sqlx::postgres::PgRow) -> Result<UploadRecord, AppError> {
    Ok(UploadRecord {
        id: try_!(row.try_get("id")),
        created_at: try_!(row.try_get("created_at")),
        expires_at: try_!(row.try_get("expires_at")),
        uploader_ip: try_!(row.try_get("uploader_ip")),
        jwt_account: try_!(row.try_get("jwt_account")),
        jwt_issuer: try_!(row.try_get("jwt_issuer")),
        sha256sum: try_!(row.try_get("sha256sum")),
        deleted: {
            let raw: i16 = try_!(row.try_get("deleted"));
            raw != 0
        },
    })
}

#[async_trait]
impl UploadRegistry for Registry {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn insert(&self, id: &str, created_at: i64, uploader_ip: &str, account: &str, issuer: &str) -> Result<(), AppError> {
        match self {
            Registry::Sqlite(pool) => {
                let res = sqlx::query(
                    "INSERT INTO uploads (id, created_at, uploader_ip, jwt_account, jwt_issuer, deleted) VALUES (?, ?, ?, ?, ?, 0)",
                )
                .bind(id)
                .bind(created_at)
                .bind(uploader_ip)
                .bind(account)
                .bind(issuer)
                .execute(pool)
                .await;
                match res {
                    Ok(_) => Ok(()),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                        Err(AppError::Conflict(format!("upload id {id} already exists")))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Registry::Postgres(pool) => {
                let res = sqlx::query(
                    "INSERT INTO uploads (id, created_at, uploader_ip, jwt_account, jwt_issuer, deleted) VALUES ($1, $2, $3, $4, $5, 0)",
                )
                .bind(id)
                .bind(created_at)
                .bind(uploader_ip)
                .bind(account)
                .bind(issuer)
                .execute(pool)
                .await;
                match res {
                    Ok(_) => Ok(()),
                    Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                        Err(AppError::Conflict(format!("upload id {id} already exists")))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_finalized(&self, id: &str, sha256: &[u8], expires_at: i64) -> Result<(), AppError> {
        let existing = self.lookup(id).await?;
        if let Some(existing_hash) = &existing.sha256sum {
            if existing_hash.as_slice() != sha256 {
                return Err(AppError::Corrupt(format!("upload {id} already finalized with a different hash")));
            }
            return Ok(());
        }

        let affected = match self {
            Registry::Sqlite(pool) => {
                sqlx::query("UPDATE uploads SET sha256sum = ?, expires_at = ? WHERE id = ? AND sha256sum IS NULL")
                    .bind(sha256)
                    .bind(expires_at)
                    .bind(id)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            Registry::Postgres(pool) => {
                sqlx::query("UPDATE uploads SET sha256sum = $1, expires_at = $2 WHERE id = $3 AND sha256sum IS NULL")
                    .bind(sha256)
                    .bind(expires_at)
                    .bind(id)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };

        if affected != 1 {
            return Err(AppError::Corrupt(format!("expected 1 affected row finalizing {id}, got {affected}")));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn mark_deleted(&self, id: &str) -> Result<(), AppError> {
        // idempotent: a second call finds the row already deleted=1 and
        // affects zero rows, which is success, not Corrupt.
        match self {
            Registry::Sqlite(pool) => {
                sqlx::query("UPDATE uploads SET deleted = 1 WHERE id = ? AND deleted = 0")
                    .bind(id)
                    .execute(pool)
                    .await?;
            }
            Registry::Postgres(pool) => {
                sqlx::query("UPDATE uploads SET deleted = 1 WHERE id = $1 AND deleted = 0")
                    .bind(id)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn lookup(&self, id: &str) -> Result<UploadRecord, AppError> {
        match self {
            Registry::Sqlite(pool) => {
                let row = sqlx::query("SELECT * FROM uploads WHERE id = ?").bind(id).fetch_optional(pool).await?;
                let Some(row) = row else { return Err(AppError::NotFound) };
                row_to_record(&row)
            }
            Registry::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM uploads WHERE id = $1").bind(id).fetch_optional(pool).await?;
                let Some(row) = row else { return Err(AppError::NotFound) };
                pg_row_to_record(&row)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn duplicate_count(&self, hash: &[u8], exclude_id: &str) -> Result<i64, AppError> {
        let count: i64 = match self {
            Registry::Sqlite(pool) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM uploads WHERE sha256sum = ? AND id != ? AND deleted = 0")
                    .bind(hash)
                    .bind(exclude_id)
                    .fetch_one(pool)
                    .await?
            }
            Registry::Postgres(pool) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM uploads WHERE sha256sum = $1 AND id != $2 AND deleted = 0")
                    .bind(hash)
                    .bind(exclude_id)
                    .fetch_one(pool)
                    .await?
            }
        };
        Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn select_expired(&self, now: i64, anonymous_ttl: i64, identified_ttl: i64) -> Result<Vec<String>, AppError> {
        let ids: Vec<String> = match self {
            Registry::Sqlite(pool) => {
                sqlx::query_scalar(
                    r#"SELECT id FROM uploads
                       WHERE deleted = 0
                       AND COALESCE(
                           expires_at,
                           created_at + CASE WHEN jwt_account = '' THEN ? ELSE ? END
                       ) <= ?"#,
                )
                .bind(anonymous_ttl)
                .bind(identified_ttl)
                .bind(now)
                .fetch_all(pool)
                .await?
            }
            Registry::Postgres(pool) => {
                sqlx::query_scalar(
                    r#"SELECT id FROM uploads
                       WHERE deleted = 0
                       AND COALESCE(
                           expires_at,
                           created_at + CASE WHEN jwt_account = '' THEN $1 ELSE $2 END
                       ) <= $3"#,
                )
                .bind(anonymous_ttl)
                .bind(identified_ttl)
                .bind(now)
                .fetch_all(pool)
                .await?
            }
        };
        Ok(ids)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn purge_tombstoned(&self, now: i64, grace_seconds: i64, anonymous_ttl: i64, identified_ttl: i64) -> Result<u64, AppError> {
        let affected = match self {
            Registry::Sqlite(pool) => {
                sqlx::query(
                    r#"DELETE FROM uploads
                       WHERE deleted = 1
                       AND COALESCE(
                           expires_at,
                           created_at + CASE WHEN jwt_account = '' THEN ? ELSE ? END
                       ) + ? <= ?"#,
                )
                .bind(anonymous_ttl)
                .bind(identified_ttl)
                .bind(grace_seconds)
                .bind(now)
                .execute(pool)
                .await?
                .rows_affected()
            }
            Registry::Postgres(pool) => {
                sqlx::query(
                    r#"DELETE FROM uploads
                       WHERE deleted = 1
                       AND COALESCE(
                           expires_at,
                           created_at + CASE WHEN jwt_account = '' THEN $1 ELSE $2 END
                       ) + $3 <= $4"#,
                )
                .bind(anonymous_ttl)
                .bind(identified_ttl)
                .bind(grace_seconds)
                .bind(now)
                .execute(pool)
                .await?
                .rows_affected()
            }
        };
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_sqlite() -> Registry {
        Registry::connect_sqlite("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_lookup_round_trips() {
        let reg = new_sqlite().await;
        reg.insert("abc123", 1000, "203.0.113.5", "", "").await.unwrap();
        let rec = reg.lookup("abc123").await.unwrap();
        assert_eq!(rec.id, "abc123");
        assert_eq!(rec.created_at, 1000);
        assert!(rec.sha256sum.is_none());
        assert!(!rec.deleted);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let reg = new_sqlite().await;
        reg.insert("dup", 1000, "", "", "").await.unwrap();
        let err = reg.insert("dup", 1000, "", "", "").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn finalize_sets_hash_once_and_is_stable_on_retry() {
        let reg = new_sqlite().await;
        reg.insert("f1", 1000, "", "", "").await.unwrap();
        reg.set_finalized("f1", b"hashhashhashhashhashhashhashhash", 2000).await.unwrap();
        // idempotent retry with the same hash succeeds
        reg.set_finalized("f1", b"hashhashhashhashhashhashhashhash", 2000).await.unwrap();
        let rec = reg.lookup("f1").await.unwrap();
        assert_eq!(rec.sha256sum.unwrap(), b"hashhashhashhashhashhashhashhash");
    }

    #[tokio::test]
    async fn finalize_with_conflicting_hash_is_corrupt() {
        let reg = new_sqlite().await;
        reg.insert("f2", 1000, "", "", "").await.unwrap();
        reg.set_finalized("f2", b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 2000).await.unwrap();
        let err = reg.set_finalized("f2", b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 2000).await.unwrap_err();
        assert!(matches!(err, AppError::Corrupt(_)));
    }

    #[tokio::test]
    async fn mark_deleted_is_idempotent() {
        let reg = new_sqlite().await;
        reg.insert("d1", 1000, "", "", "").await.unwrap();
        reg.mark_deleted("d1").await.unwrap();
        reg.mark_deleted("d1").await.unwrap();
        let rec = reg.lookup("d1").await.unwrap();
        assert!(rec.deleted);
    }

    #[tokio::test]
    async fn duplicate_count_excludes_self_and_deleted() {
        let reg = new_sqlite().await;
        let hash = b"cccccccccccccccccccccccccccccccc";
        reg.insert("a", 1000, "", "", "").await.unwrap();
        reg.insert("b", 1000, "", "", "").await.unwrap();
        reg.insert("c", 1000, "", "", "").await.unwrap();
        reg.set_finalized("a", hash, 2000).await.unwrap();
        reg.set_finalized("b", hash, 2000).await.unwrap();
        reg.set_finalized("c", hash, 2000).await.unwrap();
        reg.mark_deleted("c").await.unwrap();

        assert_eq!(reg.duplicate_count(hash, "a").await.unwrap(), 1);
        assert_eq!(reg.duplicate_count(hash, "b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn select_expired_honors_account_specific_ttl() {
        let reg = new_sqlite().await;
        let now = 1_000_000i64;
        reg.insert("anon", now - 100, "", "", "").await.unwrap();
        reg.insert("acct", now - 100, "", "alice", "issuer").await.unwrap();

        // anonymous ttl shorter than elapsed time, identified ttl longer
        let expired = reg.select_expired(now, 50, 10_000).await.unwrap();
        assert!(expired.contains(&"anon".to_string()));
        assert!(!expired.contains(&"acct".to_string()));
    }

    #[tokio::test]
    async fn purge_tombstoned_removes_only_after_grace() {
        let reg = new_sqlite().await;
        let now = 1_000_000i64;
        reg.insert("gone", now - 1000, "", "", "").await.unwrap();
        reg.mark_deleted("gone").await.unwrap();

        // grace period not yet elapsed
        let purged = reg.purge_tombstoned(now, 10_000, 1, 1).await.unwrap();
        assert_eq!(purged, 0);

        let purged = reg.purge_tombstoned(now, 1, 1, 1).await.unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(reg.lookup("gone").await.unwrap_err(), AppError::NotFound));
    }
}
