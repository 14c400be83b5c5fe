use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::io;

/// 文件签名：用元数据近似判断内容是否变化（不计算内容哈希）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    /// 修改时间（UTC）
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// 权限位
    pub mode: u32,
}

impl FileSignature {
    /// 从文件元数据生成签名
    pub fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Self {
            modified,
            size: metadata.len(),
            mode: mode_bits(metadata),
        })
    }

    /// 修改时间（Unix 纳秒），超出 i64 范围时取边界值
    pub fn modified_nanos(&self) -> i64 {
        self.modified.timestamp_nanos_opt().unwrap_or_else(|| {
            if self.modified.timestamp() < 0 {
                i64::MIN
            } else {
                i64::MAX
            }
        })
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

/// 同步版本：副本标识 + 单调递增的版本号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncVersion {
    pub replica: i64,
    pub version: i64,
}

/// 某个路径的同步记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub signature: FileSignature,
    pub created: SyncVersion,
    pub modified: SyncVersion,
    /// 最后一次确认时的版本号
    pub last_seen_tick: i64,
    /// 已删除标记（记录保留，不物理删除）
    pub tombstone: bool,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    pub path: String,
    pub size: i64,
    pub mode: i64,
    pub tombstone: bool,
    pub tick: i64,
    pub modified_at: i64,
    pub created_replica: i64,
    pub created_version: i64,
    pub modified_replica: i64,
    pub modified_version: i64,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            signature: FileSignature {
                modified: DateTime::from_timestamp_nanos(row.modified_at),
                size: row.size as u64,
                mode: row.mode as u32,
            },
            created: SyncVersion {
                replica: row.created_replica,
                version: row.created_version,
            },
            modified: SyncVersion {
                replica: row.modified_replica,
                version: row.modified_version,
            },
            last_seen_tick: row.tick,
            tombstone: row.tombstone,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReplicaRow {
    pub id: i64,
    pub replica_id: String,
    pub version: i64,
}
