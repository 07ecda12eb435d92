use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

use super::error::{RepositoryError, RepositoryResult};
use super::replica_repository::{BoxFuture, ReplicaRepository, ReplicaSnapshot};
use crate::sync::{Cookie, MutationRecord, PatchOperation};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries; existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS replica_rows (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS replica_meta (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        cookie           TEXT    NOT NULL DEFAULT '',
        last_mutation_id INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS pending_mutations (
        id        INTEGER PRIMARY KEY,
        mutation  TEXT    NOT NULL,
        timestamp INTEGER NOT NULL
    );",
)];

/// SQLite-backed replica storage.
///
/// Uses WAL journal mode so snapshot loads can run alongside background
/// writes. `SqlitePool` is internally reference-counted and cheap to clone.
pub struct ReplicaSqliteRepository {
    pool: SqlitePool,
}

impl ReplicaSqliteRepository {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn new() -> RepositoryResult<Self> {
        Self::open(Self::default_path()?).await
    }

    pub async fn open(db_path: PathBuf) -> RepositoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite replica database");

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call,
                // so split on ';' and execute each statement individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn default_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("ripplechat").join("replica.db"))
    }
}

impl Clone for ReplicaSqliteRepository {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl ReplicaRepository for ReplicaSqliteRepository {
    fn load(&self) -> BoxFuture<'static, RepositoryResult<ReplicaSnapshot>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mut rows = BTreeMap::new();
            for row in sqlx::query("SELECT key, value FROM replica_rows")
                .fetch_all(&pool)
                .await?
            {
                let key: String = row.get("key");
                let value: String = row.get("value");
                match serde_json::from_str(&value) {
                    Ok(value) => {
                        rows.insert(key, value);
                    }
                    Err(error) => {
                        // Skip the row rather than refusing to start; the
                        // next pull restores it from the authority.
                        warn!(%key, %error, "Skipping undecodable replica row");
                    }
                }
            }

            let meta = sqlx::query("SELECT cookie, last_mutation_id FROM replica_meta WHERE id = 1")
                .fetch_optional(&pool)
                .await?;
            let cookie = meta
                .as_ref()
                .map(|row| row.get::<String, _>("cookie"))
                .and_then(|raw| serde_json::from_str::<Cookie>(&raw).ok());
            let last_mutation_id = meta
                .as_ref()
                .map(|row| row.get::<i64, _>("last_mutation_id") as u64)
                .unwrap_or(0);

            let mut pending = Vec::new();
            for row in
                sqlx::query("SELECT id, mutation, timestamp FROM pending_mutations ORDER BY id ASC")
                    .fetch_all(&pool)
                    .await?
            {
                let id: i64 = row.get("id");
                let mutation: String = row.get("mutation");
                let timestamp: i64 = row.get("timestamp");
                match serde_json::from_str(&mutation) {
                    Ok(mutation) => pending.push(MutationRecord {
                        id: id as u64,
                        mutation,
                        timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp)
                            .unwrap_or_else(Utc::now),
                    }),
                    Err(error) => {
                        warn!(id, %error, "Dropping undecodable pending mutation");
                    }
                }
            }

            Ok(ReplicaSnapshot {
                rows,
                cookie,
                pending,
                last_mutation_id,
            })
        })
    }

    fn save_pending(&self, record: MutationRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let mutation = serde_json::to_string(&record.mutation)?;
            let mut tx = pool.begin().await?;
            sqlx::query(
                "INSERT OR REPLACE INTO pending_mutations (id, mutation, timestamp)
                 VALUES (?, ?, ?)",
            )
            .bind(record.id as i64)
            .bind(mutation)
            .bind(record.timestamp.timestamp_millis())
            .execute(&mut *tx)
            .await?;
            // The sequence watermark outlives the record itself: it must
            // still be there after the record is confirmed and pruned.
            sqlx::query(
                "INSERT INTO replica_meta (id, last_mutation_id) VALUES (1, ?)
                 ON CONFLICT(id) DO UPDATE
                 SET last_mutation_id = MAX(last_mutation_id, excluded.last_mutation_id)",
            )
            .bind(record.id as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn remove_pending_up_to(&self, applied_up_to: u64) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query("DELETE FROM pending_mutations WHERE id <= ?")
                .bind(applied_up_to as i64)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn apply_patch(
        &self,
        ops: Vec<PatchOperation>,
        cookie: Cookie,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let cookie = serde_json::to_string(&cookie)?;
            let mut tx = pool.begin().await?;

            for op in &ops {
                match op {
                    PatchOperation::Clear => {
                        sqlx::query("DELETE FROM replica_rows")
                            .execute(&mut *tx)
                            .await?;
                    }
                    PatchOperation::Delete { key } => {
                        sqlx::query("DELETE FROM replica_rows WHERE key = ?")
                            .bind(key)
                            .execute(&mut *tx)
                            .await?;
                    }
                    PatchOperation::Put { key, value } => {
                        sqlx::query(
                            "INSERT OR REPLACE INTO replica_rows (key, value) VALUES (?, ?)",
                        )
                        .bind(key)
                        .bind(serde_json::to_string(value)?)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }

            // Upsert rather than replace so the row's sequence watermark is
            // not wiped along with the old cookie.
            sqlx::query(
                "INSERT INTO replica_meta (id, cookie) VALUES (1, ?)
                 ON CONFLICT(id) DO UPDATE SET cookie = excluded.cookie",
            )
            .bind(cookie)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::models::Chat;
    use crate::sync::Mutation;

    async fn open_temp() -> (TempDir, ReplicaSqliteRepository) {
        let dir = TempDir::new().unwrap();
        let repo = ReplicaSqliteRepository::open(dir.path().join("replica.db"))
            .await
            .unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn fresh_database_loads_an_empty_snapshot() {
        let (_dir, repo) = open_temp().await;
        let snapshot = repo.load().await.unwrap();
        assert!(snapshot.rows.is_empty());
        assert!(snapshot.cookie.is_none());
        assert!(snapshot.pending.is_empty());
    }

    #[tokio::test]
    async fn patch_and_cookie_survive_a_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");

        let repo = ReplicaSqliteRepository::open(path.clone()).await.unwrap();
        repo.apply_patch(
            vec![
                PatchOperation::Put {
                    key: "chat/c1".into(),
                    value: json!({"id": "c1"}),
                },
                PatchOperation::Put {
                    key: "chat/c2".into(),
                    value: json!({"id": "c2"}),
                },
                PatchOperation::Delete {
                    key: "chat/c2".into(),
                },
            ],
            Cookie {
                order: 7,
                cvr_id: "cvr-1".into(),
            },
        )
        .await
        .unwrap();
        drop(repo);

        let repo = ReplicaSqliteRepository::open(path).await.unwrap();
        let snapshot = repo.load().await.unwrap();
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows["chat/c1"], json!({"id": "c1"}));
        assert_eq!(snapshot.cookie.unwrap().order, 7);
    }

    #[tokio::test]
    async fn clear_wipes_previous_rows() {
        let (_dir, repo) = open_temp().await;
        let cookie = |order| Cookie {
            order,
            cvr_id: "cvr".into(),
        };

        repo.apply_patch(
            vec![PatchOperation::Put {
                key: "chat/old".into(),
                value: json!({}),
            }],
            cookie(1),
        )
        .await
        .unwrap();
        repo.apply_patch(
            vec![
                PatchOperation::Clear,
                PatchOperation::Put {
                    key: "chat/new".into(),
                    value: json!({}),
                },
            ],
            cookie(2),
        )
        .await
        .unwrap();

        let snapshot = repo.load().await.unwrap();
        assert_eq!(snapshot.rows.len(), 1);
        assert!(snapshot.rows.contains_key("chat/new"));
        assert_eq!(snapshot.cookie.unwrap().order, 2);
    }

    #[tokio::test]
    async fn pending_mutations_round_trip_in_order() {
        let (_dir, repo) = open_temp().await;
        for id in [2u64, 1, 3] {
            repo.save_pending(MutationRecord {
                id,
                mutation: Mutation::CreateChat(Chat::new(
                    format!("c{id}"),
                    "u1".into(),
                    None,
                    Utc::now(),
                )),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        }

        let snapshot = repo.load().await.unwrap();
        let ids: Vec<u64> = snapshot.pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sequence_watermark_survives_pruning_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");

        let repo = ReplicaSqliteRepository::open(path.clone()).await.unwrap();
        for id in 1u64..=3 {
            repo.save_pending(MutationRecord {
                id,
                mutation: Mutation::DeleteChat(crate::sync::DeleteArgs {
                    id: format!("c{id}"),
                }),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        }
        repo.remove_pending_up_to(3).await.unwrap();
        repo.apply_patch(
            vec![PatchOperation::Clear],
            Cookie {
                order: 1,
                cvr_id: "cvr".into(),
            },
        )
        .await
        .unwrap();
        drop(repo);

        let repo = ReplicaSqliteRepository::open(path).await.unwrap();
        let snapshot = repo.load().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.last_mutation_id, 3);
        assert_eq!(snapshot.cookie.unwrap().order, 1);
    }

    #[tokio::test]
    async fn remove_pending_drops_only_confirmed() {
        let (_dir, repo) = open_temp().await;
        for id in 1u64..=3 {
            repo.save_pending(MutationRecord {
                id,
                mutation: Mutation::DeleteChat(crate::sync::DeleteArgs {
                    id: format!("c{id}"),
                }),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        }

        repo.remove_pending_up_to(2).await.unwrap();

        let snapshot = repo.load().await.unwrap();
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].id, 3);
    }
}
