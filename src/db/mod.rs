//! 元数据存储 - 每个路径最后一次确认的同步记录
//!
//! 存储位于被监控目录的 `.sync/replica.db`。版本号只由检测器（单一消费者）推进，
//! [`MetadataStore::advance_version`] 与 [`MetadataStore::begin`] 都要求 `&mut self`，
//! 单写者约束由所有权保证，存储内部不加锁。

pub mod models;
pub use models::*;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
pub use sqlx::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// 元数据库文件名
pub const DB_FILE: &str = "replica.db";

/// 本地副本在 replicas 表中的行号
const LOCAL_REPLICA: i64 = 0;

const SELECT_RECORD: &str = r#"
    SELECT path, size, mode, tombstone, tick, modified_at,
           created_replica, created_version, modified_replica, modified_version
    FROM items WHERE path = ?"#;

const UPSERT_RECORD: &str = r#"
    INSERT INTO items (path, size, mode, tombstone, tick, modified_at,
                       created_replica, created_version, modified_replica, modified_version)
    VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(path) DO UPDATE SET
        size = excluded.size,
        mode = excluded.mode,
        tombstone = 0,
        tick = excluded.tick,
        modified_at = excluded.modified_at,
        created_replica = excluded.created_replica,
        created_version = excluded.created_version,
        modified_replica = excluded.modified_replica,
        modified_version = excluded.modified_version"#;

const MARK_DELETED: &str = "UPDATE items SET tombstone = 1, tick = ? WHERE path = ?";

const SWEEP_STALE: &str = r#"
    UPDATE items SET tombstone = 1, tick = ?
    WHERE tombstone = 0 AND tick < ?
    RETURNING path"#;

const ADVANCE_VERSION: &str =
    "UPDATE replicas SET version = version + 1 WHERE id = ? RETURNING id, version";

/// 元数据存储错误
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// 打开失败，对整个进程是致命错误
    #[error("无法打开元数据存储 {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    fn open(path: &Path, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Open {
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

/// 元数据存储
pub struct MetadataStore {
    pool: SqlitePool,
    replica_id: Uuid,
    version: SyncVersion,
}

impl MetadataStore {
    /// 打开（必要时创建）被监控目录下的元数据存储
    pub async fn open(root: &Path) -> Result<Self, StoreError> {
        let state_dir = crate::config::state_dir(root);
        let db_path = state_dir.join(DB_FILE);

        std::fs::create_dir_all(&state_dir).map_err(|e| StoreError::open(&db_path, e))?;

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::open(&db_path, e))?;

        // 运行数据库迁移
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::open(&db_path, e))?;

        // 副本标识只在第一次打开时生成
        sqlx::query("INSERT OR IGNORE INTO replicas (id, replica_id, version) VALUES (?, ?, 0)")
            .bind(LOCAL_REPLICA)
            .bind(Uuid::new_v4().to_string())
            .execute(&pool)
            .await
            .map_err(|e| StoreError::open(&db_path, e))?;

        let row = sqlx::query_as::<_, ReplicaRow>(
            "SELECT id, replica_id, version FROM replicas WHERE id = ?",
        )
        .bind(LOCAL_REPLICA)
        .fetch_one(&pool)
        .await
        .map_err(|e| StoreError::open(&db_path, e))?;

        let replica_id = Uuid::parse_str(&row.replica_id).map_err(|e| StoreError::open(&db_path, e))?;
        let version = SyncVersion {
            replica: row.id,
            version: row.version,
        };

        info!(
            "元数据存储已打开: {} (副本 {}, 版本 {})",
            db_path.display(),
            replica_id,
            version.version
        );

        Ok(Self {
            pool,
            replica_id,
            version,
        })
    }

    /// 副本标识
    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    /// 当前版本（只读）
    pub fn current_version(&self) -> SyncVersion {
        self.version
    }

    /// 推进版本号并返回新版本，只能由检测器调用
    pub async fn advance_version(&mut self) -> Result<SyncVersion, StoreError> {
        let mut tx = self.begin().await?;
        let version = tx.advance_version().await?;
        tx.commit().await?;
        Ok(version)
    }

    /// 获取路径的记录，从未见过时返回 None
    pub async fn get(&self, path: &str) -> Result<Option<Record>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_record(&mut conn, path).await?)
    }

    /// 写入记录（按路径插入或替换），同时清除删除标记
    pub async fn put(&self, path: &str, record: &Record) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_record(&mut conn, path, record).await?;
        Ok(())
    }

    /// 标记路径已删除，保留签名和版本用于审计
    pub async fn mark_deleted(&self, path: &str, at_tick: i64) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        mark_record_deleted(&mut conn, path, at_tick).await?;
        Ok(())
    }

    /// 标记并返回 `tick < before_tick` 且未删除的路径
    ///
    /// 标记和查询是同一条语句，返回的流被轮询时所有匹配行已经被标记为删除（tick 设为 `before_tick`）。
    pub fn sweep_stale(&mut self, before_tick: i64) -> BoxStream<'_, Result<String, StoreError>> {
        sqlx::query_scalar::<_, String>(SWEEP_STALE)
            .bind(before_tick)
            .bind(before_tick)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    /// 所有未删除的路径
    pub async fn live_paths(&self) -> Result<Vec<String>, StoreError> {
        let paths = sqlx::query_scalar::<_, String>(
            "SELECT path FROM items WHERE tombstone = 0 ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    /// 开始一个显式事务；事务未提交就被丢弃时回滚，内存中的版本号也不变
    pub async fn begin(&mut self) -> Result<StoreTransaction<'_>, StoreError> {
        let pending = self.version;
        let tx = self.pool.begin().await?;
        Ok(StoreTransaction {
            tx,
            version: &mut self.version,
            pending,
        })
    }

    /// 关闭连接池
    pub async fn close(self) {
        debug!("关闭元数据存储连接池...");
        self.pool.close().await;
    }
}

/// 元数据存储事务
pub struct StoreTransaction<'a> {
    tx: Transaction<'static, Sqlite>,
    version: &'a mut SyncVersion,
    pending: SyncVersion,
}

impl StoreTransaction<'_> {
    /// 事务内推进版本号
    pub async fn advance_version(&mut self) -> Result<SyncVersion, StoreError> {
        let (replica, version): (i64, i64) = sqlx::query_as(ADVANCE_VERSION)
            .bind(LOCAL_REPLICA)
            .fetch_one(&mut *self.tx)
            .await?;
        self.pending = SyncVersion { replica, version };
        Ok(self.pending)
    }

    pub async fn get(&mut self, path: &str) -> Result<Option<Record>, StoreError> {
        Ok(fetch_record(&mut self.tx, path).await?)
    }

    pub async fn put(&mut self, path: &str, record: &Record) -> Result<(), StoreError> {
        upsert_record(&mut self.tx, path, record).await?;
        Ok(())
    }

    pub async fn mark_deleted(&mut self, path: &str, at_tick: i64) -> Result<(), StoreError> {
        mark_record_deleted(&mut self.tx, path, at_tick).await?;
        Ok(())
    }

    /// 提交事务并发布新的版本号
    pub async fn commit(self) -> Result<(), StoreError> {
        let StoreTransaction {
            tx,
            version,
            pending,
        } = self;
        tx.commit().await?;
        *version = pending;
        Ok(())
    }
}

async fn fetch_record(conn: &mut SqliteConnection, path: &str) -> Result<Option<Record>, sqlx::Error> {
    let row = sqlx::query_as::<_, RecordRow>(SELECT_RECORD)
        .bind(path)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Record::from))
}

async fn upsert_record(conn: &mut SqliteConnection, path: &str, record: &Record) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_RECORD)
        .bind(path)
        .bind(record.signature.size as i64)
        .bind(record.signature.mode as i64)
        .bind(record.last_seen_tick)
        .bind(record.signature.modified_nanos())
        .bind(record.created.replica)
        .bind(record.created.version)
        .bind(record.modified.replica)
        .bind(record.modified.version)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn mark_record_deleted(conn: &mut SqliteConnection, path: &str, at_tick: i64) -> Result<(), sqlx::Error> {
    sqlx::query(MARK_DELETED)
        .bind(at_tick)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
