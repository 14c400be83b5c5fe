//! 镜像引擎 - 组装信号源、变更检测和变更传播
//!
//! 信号源（系统监控、全量扫描）写入有界信号通道；检测器是唯一消费者，
//! 确认的变化经无界事件通道交给传播器。

use crate::config::MirrorConfig;
use crate::core::detector::Detector;
use crate::core::filter::PathFilter;
use crate::core::propagator::Propagator;
use crate::core::scanner::Scanner;
use crate::core::watcher::FsWatcher;
use crate::db::MetadataStore;
use crate::storage::ObjectStore;
use anyhow::{bail, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

/// 镜像引擎
pub struct MirrorEngine {
    root: PathBuf,
    config: MirrorConfig,
    store: MetadataStore,
    storage: Arc<dyn ObjectStore>,
}

impl MirrorEngine {
    pub fn new(
        root: PathBuf,
        config: MirrorConfig,
        store: MetadataStore,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            root,
            config,
            store,
            storage,
        }
    }

    /// 运行直到 `shutdown` 完成，然后立即中止所有任务
    ///
    /// 尚未处理的信号和事件直接丢弃，下次启动时由全量扫描补齐。
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            root,
            config,
            store,
            storage,
        } = self;

        let filter = Arc::new(PathFilter::new(&root, &config.exclude_patterns)?);
        let (signal_tx, signal_rx) = mpsc::channel(config.signal_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut scanner = Scanner::new(filter.clone(), config.scan_interval());
        if config.reconcile_on_start {
            match store.live_paths().await {
                Ok(keys) => {
                    info!("启动对账: 元数据库中有 {} 个文件", keys.len());
                    scanner = scanner.with_tracked(keys.iter().map(|key| root.join(key)));
                }
                Err(e) => warn!("读取已知文件失败，跳过启动对账: {}", e),
            }
        }

        info!(
            "开始镜像: {} -> {} (副本 {})",
            root.display(),
            storage.name(),
            store.replica_id()
        );

        let mut detector = tokio::spawn(
            Detector::new(store, filter.clone())
                .run(signal_rx, event_tx)
                .instrument(info_span!("detector")),
        );
        let mut propagator = tokio::spawn(
            Propagator::new(storage)
                .run(event_rx)
                .instrument(info_span!("propagator")),
        );
        let scanner = tokio::spawn(
            scanner
                .run(signal_tx.clone())
                .instrument(info_span!("scanner")),
        );

        // 监控失败不影响同步，全量扫描仍能发现所有变化
        let _watcher = if config.watch {
            match info_span!("watcher").in_scope(|| FsWatcher::spawn(filter, signal_tx.clone())) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("文件监控启动失败，仅依赖定时扫描: {}", e);
                    None
                }
            }
        } else {
            info!("文件监控已关闭，仅依赖定时扫描");
            None
        };

        let result = tokio::select! {
            _ = shutdown => Ok(()),
            res = &mut detector => {
                error!("变更检测意外退出: {:?}", res.err());
                Err(())
            }
            res = &mut propagator => {
                error!("变更传播意外退出: {:?}", res.err());
                Err(())
            }
        };

        let pending = signal_tx.max_capacity() - signal_tx.capacity();
        if pending > 0 {
            warn!("收到停止信号，丢弃 {} 个未处理信号", pending);
        } else {
            info!("收到停止信号，正在退出");
        }

        scanner.abort();
        detector.abort();
        propagator.abort();

        if result.is_err() {
            bail!("同步任务异常退出");
        }
        Ok(())
    }
}
