//! 系统文件监控 - 只用于降低变化到检测之间的延迟
//!
//! 事件可能被合并或丢失，正确性由全量扫描保证。

use crate::core::detector::{Signal, SignalOrigin};
use crate::core::filter::PathFilter;
use anyhow::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Span};

/// 监控句柄，丢弃即停止监控
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// 递归监控被监控目录，把事件转换为信号写入信号通道
    ///
    /// 回调运行在监控线程上，通道满时阻塞该线程。
    pub fn spawn(filter: Arc<PathFilter>, signals: mpsc::Sender<Signal>) -> Result<Self> {
        let span = Span::current();
        let root = filter.root().to_path_buf();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _guard = span.enter();
            match result {
                Ok(event) => {
                    for signal in signals_from_event(&event) {
                        if filter.is_ignored(&signal.path) {
                            continue;
                        }
                        debug!("系统通知: {:?} -> {}", event.kind, signal.path.display());
                        if signals.blocking_send(signal).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("文件监控错误: {}", e),
            }
        })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!("文件监控已启动: {}", root.display());

        Ok(Self { _watcher: watcher })
    }
}

/// 把一个系统事件转换为信号；重命名拆成旧路径删除 + 新路径出现
pub fn signals_from_event(event: &Event) -> Vec<Signal> {
    let paths = event.paths.iter().filter(|p| is_named(p));

    match event.kind {
        EventKind::Remove(_) => paths
            .map(|p| Signal::deleted(p.clone(), SignalOrigin::Watcher))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => paths
            .map(|p| Signal::deleted(p.clone(), SignalOrigin::Watcher))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => paths
            .enumerate()
            .map(|(i, p)| {
                if i == 0 {
                    Signal::deleted(p.clone(), SignalOrigin::Watcher)
                } else {
                    Signal::present(p.clone(), SignalOrigin::Watcher)
                }
            })
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => paths
            .map(|p| Signal::present(p.clone(), SignalOrigin::Watcher))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn is_named(path: &Path) -> bool {
    !matches!(path.to_str(), Some("" | "." | ".."))
}
