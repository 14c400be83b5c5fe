//! 变更检测 - 信号通道的唯一消费者，也是元数据存储的唯一写者
//!
//! 监控和扫描产生的原始信号在这里与元数据存储对比：签名未变化的信号被丢弃，
//! 确认的变化推进版本号、写入记录，然后转发给传播器。

use crate::core::filter::PathFilter;
use crate::db::{FileSignature, MetadataStore, Record, StoreError, SyncVersion};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 信号来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOrigin {
    /// 系统文件监控
    Watcher,
    /// 全量扫描发现文件
    Scan,
    /// 全量扫描结束后推断的删除
    AfterScan,
}

/// 原始变化信号（可能重复、可能过时）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// 绝对路径
    pub path: PathBuf,
    pub is_deletion: bool,
    pub origin: SignalOrigin,
}

impl Signal {
    pub fn present(path: impl Into<PathBuf>, origin: SignalOrigin) -> Self {
        Self {
            path: path.into(),
            is_deletion: false,
            origin,
        }
    }

    pub fn deleted(path: impl Into<PathBuf>, origin: SignalOrigin) -> Self {
        Self {
            path: path.into(),
            is_deletion: true,
            origin,
        }
    }
}

/// 确认的变化类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// 确认的变化事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// 相对路径键（远程对象名）
    pub key: String,
    /// 本地绝对路径
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub version: SyncVersion,
}

/// 变更检测器
pub struct Detector {
    store: MetadataStore,
    filter: Arc<PathFilter>,
}

impl Detector {
    pub fn new(store: MetadataStore, filter: Arc<PathFilter>) -> Self {
        Self { store, filter }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// 消费信号直到所有生产者关闭，返回自身以便取回存储
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<Signal>,
        events: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Self {
        info!("变更检测已启动");
        while let Some(signal) = signals.recv().await {
            if let Some(event) = self.process(signal).await {
                if events.send(event).is_err() {
                    warn!("传播器已退出，停止变更检测");
                    break;
                }
            }
        }
        info!("变更检测已停止");
        self
    }

    /// 处理单个信号，确认的变化返回事件
    pub async fn process(&mut self, signal: Signal) -> Option<ChangeEvent> {
        let Some(key) = self.filter.key_for(&signal.path) else {
            debug!("忽略路径: {} ({:?})", signal.path.display(), signal.origin);
            return None;
        };
        debug!(
            "收到信号: {} 删除={} 来源={:?}",
            key, signal.is_deletion, signal.origin
        );

        if signal.is_deletion {
            Some(self.confirm_deletion(key, signal.path).await)
        } else {
            self.confirm_presence(key, signal.path).await
        }
    }

    /// 删除信号无条件转发（远程删除本身是幂等的）
    async fn confirm_deletion(&mut self, key: String, path: PathBuf) -> ChangeEvent {
        let version = match self.record_deletion(&key).await {
            Ok(version) => version,
            Err(e) => {
                error!("记录删除失败（仍继续同步删除）: {} - {}", key, e);
                self.store.current_version()
            }
        };

        info!("确认删除: {} (版本 {})", key, version.version);
        ChangeEvent {
            key,
            path,
            kind: ChangeKind::Deleted,
            version,
        }
    }

    async fn record_deletion(&mut self, key: &str) -> Result<SyncVersion, StoreError> {
        let mut tx = self.store.begin().await?;
        let version = tx.advance_version().await?;
        tx.mark_deleted(key, version.version).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn confirm_presence(&mut self, key: String, path: PathBuf) -> Option<ChangeEvent> {
        // 信号和 stat 之间文件可能已消失，交给后续扫描或删除信号处理
        let signature = match current_signature(&path).await {
            Some(signature) => signature,
            None => return None,
        };

        match self.record_presence(&key, signature).await {
            Ok(Some((kind, version))) => {
                info!(
                    "确认{}: {} ({} 字节, 版本 {})",
                    if kind == ChangeKind::Created { "新建" } else { "修改" },
                    key,
                    signature.size,
                    version.version
                );
                Some(ChangeEvent {
                    key,
                    path,
                    kind,
                    version,
                })
            }
            Ok(None) => {
                debug!("签名未变化，跳过: {}", key);
                None
            }
            Err(e) => {
                error!("更新元数据失败（仍继续上传）: {} - {}", key, e);
                Some(ChangeEvent {
                    key,
                    path,
                    kind: ChangeKind::Updated,
                    version: self.store.current_version(),
                })
            }
        }
    }

    /// 签名有变化时推进版本并写入记录；已删除的记录视为不存在
    async fn record_presence(
        &mut self,
        key: &str,
        signature: FileSignature,
    ) -> Result<Option<(ChangeKind, SyncVersion)>, StoreError> {
        let mut tx = self.store.begin().await?;
        let existing = tx.get(key).await?.filter(|r| !r.tombstone);

        if existing.as_ref().is_some_and(|r| r.signature == signature) {
            return Ok(None);
        }

        let version = tx.advance_version().await?;
        let (kind, created) = match existing {
            Some(record) => (ChangeKind::Updated, record.created),
            None => (ChangeKind::Created, version),
        };

        let record = Record {
            signature,
            created,
            modified: version,
            last_seen_tick: version.version,
            tombstone: false,
        };
        tx.put(key, &record).await?;
        tx.commit().await?;

        Ok(Some((kind, version)))
    }
}

/// 读取当前签名；不存在、不是普通文件或无法读取时返回 None
async fn current_signature(path: &Path) -> Option<FileSignature> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!("无法读取文件信息，丢弃信号: {} ({})", path.display(), e);
            return None;
        }
    };

    if !metadata.is_file() {
        return None;
    }

    match FileSignature::from_metadata(&metadata) {
        Ok(signature) => Some(signature),
        Err(e) => {
            debug!("无法读取修改时间，丢弃信号: {} ({})", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};

    async fn detector_for(root: &Path) -> Detector {
        let store = MetadataStore::open(root).await.unwrap();
        let filter = Arc::new(PathFilter::new(root, &[]).unwrap());
        Detector::new(store, filter)
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[tokio::test]
    async fn test_first_presence_creates_record() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"0123456789").unwrap();

        let mut detector = detector_for(root.path()).await;
        let event = detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();

        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.key, "a.txt");
        assert_eq!(event.version.version, 1);

        let record = detector.store().get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.signature.size, 10);
        assert_eq!(record.created.version, 1);
        assert_eq!(record.modified.version, 1);
        assert_eq!(record.last_seen_tick, 1);
        assert!(!record.tombstone);
    }

    #[tokio::test]
    async fn test_unchanged_signal_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        let mut detector = detector_for(root.path()).await;
        assert!(detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .is_some());
        assert!(detector
            .process(Signal::present(&path, SignalOrigin::Watcher))
            .await
            .is_none());
        assert!(detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .is_none());
        assert_eq!(detector.store().current_version().version, 1);
    }

    #[tokio::test]
    async fn test_size_change_with_same_mtime_is_update() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"0123456789").unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&path, mtime);

        let mut detector = detector_for(root.path()).await;
        detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();

        fs::write(&path, b"01234567890123456789").unwrap();
        set_mtime(&path, mtime);

        let event = detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.version.version, 2);

        let record = detector.store().get("a.txt").await.unwrap().unwrap();
        assert_eq!(record.signature.size, 20);
        assert_eq!(record.created.version, 1);
        assert_eq!(record.modified.version, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mode_change_is_update() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("run.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut detector = detector_for(root.path()).await;
        detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();

        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        let event = detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert!(detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_deletion_marks_tombstone() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"0123456789").unwrap();

        let mut detector = detector_for(root.path()).await;
        detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();

        fs::remove_file(&path).unwrap();
        let event = detector
            .process(Signal::deleted(&path, SignalOrigin::AfterScan))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert_eq!(event.version.version, 2);

        let record = detector.store().get("a.txt").await.unwrap().unwrap();
        assert!(record.tombstone);
        assert_eq!(record.last_seen_tick, 2);
        assert_eq!(record.modified.version, 1);
    }

    #[tokio::test]
    async fn test_deletion_of_unknown_path_is_forwarded() {
        let root = tempfile::tempdir().unwrap();
        let mut detector = detector_for(root.path()).await;

        let event = detector
            .process(Signal::deleted(root.path().join("never.txt"), SignalOrigin::Watcher))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert_eq!(event.key, "never.txt");
        assert!(detector.store().get("never.txt").await.unwrap().is_none());
    }

    /// 通过另一个连接删掉 items 表，让后续读写全部失败
    async fn break_items_table(root: &Path) {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::{ConnectOptions, Connection};

        let db_path = crate::config::state_dir(root).join(crate::db::DB_FILE);
        let mut conn = SqliteConnectOptions::new()
            .filename(&db_path)
            .connect()
            .await
            .unwrap();
        sqlx::query("DROP TABLE items").execute(&mut conn).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_presence_forwarded_when_store_fails() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"hello").unwrap();

        let mut detector = detector_for(root.path()).await;
        break_items_table(root.path()).await;

        let event = detector
            .process(Signal::present(&path, SignalOrigin::Watcher))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.key, "a.txt");
        assert_eq!(event.version.version, 0);
        assert_eq!(detector.store().current_version().version, 0);
    }

    #[tokio::test]
    async fn test_deletion_forwarded_when_store_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut detector = detector_for(root.path()).await;
        break_items_table(root.path()).await;

        let event = detector
            .process(Signal::deleted(root.path().join("a.txt"), SignalOrigin::AfterScan))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Deleted);
        assert_eq!(event.version.version, 0);
        // 失败的事务回滚，版本号不前进
        assert_eq!(detector.store().current_version().version, 0);
    }

    #[tokio::test]
    async fn test_recreate_after_tombstone() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("a.txt");
        fs::write(&path, b"first").unwrap();

        let mut detector = detector_for(root.path()).await;
        detector
            .process(Signal::present(&path, SignalOrigin::Scan))
            .await
            .unwrap();
        detector
            .process(Signal::deleted(&path, SignalOrigin::Watcher))
            .await
            .unwrap();

        // 签名相同也要恢复（已删除的记录视为不存在）
        let event = detector
            .process(Signal::present(&path, SignalOrigin::Watcher))
            .await
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.version.version, 3);

        let record = detector.store().get("a.txt").await.unwrap().unwrap();
        assert!(!record.tombstone);
        assert_eq!(record.created.version, 3);
        assert_eq!(record.modified.version, 3);
    }

    #[tokio::test]
    async fn test_vanished_file_is_dropped() {
        let root = tempfile::tempdir().unwrap();
        let mut detector = detector_for(root.path()).await;

        let event = detector
            .process(Signal::present(root.path().join("gone.txt"), SignalOrigin::Watcher))
            .await;
        assert!(event.is_none());
        assert_eq!(detector.store().current_version().version, 0);
    }

    #[tokio::test]
    async fn test_directories_and_state_dir_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();

        let mut detector = detector_for(root.path()).await;
        assert!(detector
            .process(Signal::present(root.path().join("sub"), SignalOrigin::Watcher))
            .await
            .is_none());
        assert!(detector
            .process(Signal::present(
                root.path().join(".sync").join("replica.db"),
                SignalOrigin::Watcher
            ))
            .await
            .is_none());
        assert_eq!(detector.store().current_version().version, 0);
    }

    #[tokio::test]
    async fn test_run_forwards_events_in_order() {
        let root = tempfile::tempdir().unwrap();
        let a = root.path().join("a.txt");
        let b = root.path().join("b.txt");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let detector = detector_for(root.path()).await;
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(detector.run(signal_rx, event_tx));

        signal_tx.send(Signal::present(&a, SignalOrigin::Scan)).await.unwrap();
        signal_tx.send(Signal::present(&a, SignalOrigin::Watcher)).await.unwrap();
        signal_tx.send(Signal::present(&b, SignalOrigin::Scan)).await.unwrap();
        drop(signal_tx);

        let detector = handle.await.unwrap();
        let keys: Vec<String> = std::iter::from_fn(|| event_rx.try_recv().ok())
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(detector.store().current_version().version, 2);
    }
}
