use crate::core::detector::{Signal, SignalOrigin};
use crate::core::filter::PathFilter;
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 单轮扫描结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// 发出存在信号的文件数
    pub files: usize,
    /// 推断出的删除数
    pub deletions: usize,
    /// 无法访问的条目数（其下已跟踪的文件会被推断为删除）
    pub errors: usize,
}

/// 全量扫描器
///
/// 每轮遍历被监控目录，为每个普通文件发出存在信号；上一轮见过、本轮没见到的路径发出删除信号。
/// 各轮严格串行，下一轮在上一轮完成后再等待一个间隔。
pub struct Scanner {
    filter: Arc<PathFilter>,
    interval: Duration,
    /// 上一轮扫描见到的文件
    tracked: HashSet<PathBuf>,
}

impl Scanner {
    pub fn new(filter: Arc<PathFilter>, interval: Duration) -> Self {
        Self {
            filter,
            interval,
            tracked: HashSet::new(),
        }
    }

    /// 用已知存在的文件作为上一轮结果（启动时对账）
    pub fn with_tracked(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.tracked.extend(paths);
        self
    }

    pub fn tracked(&self) -> &HashSet<PathBuf> {
        &self.tracked
    }

    /// 循环扫描，直到信号通道关闭
    pub async fn run(mut self, signals: mpsc::Sender<Signal>) {
        loop {
            match self.scan_once(&signals).await {
                Ok(summary) if summary.errors > 0 => warn!(
                    "扫描完成: {} 个文件, {} 个删除, {} 个条目无法访问",
                    summary.files, summary.deletions, summary.errors
                ),
                Ok(summary) => info!(
                    "扫描完成: {} 个文件, {} 个删除",
                    summary.files, summary.deletions
                ),
                Err(e) => {
                    if signals.is_closed() {
                        info!("信号通道已关闭，停止扫描");
                        return;
                    }
                    warn!("扫描失败: {}", e);
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// 执行一轮扫描
    pub async fn scan_once(&mut self, signals: &mpsc::Sender<Signal>) -> Result<PassSummary> {
        debug!("开始扫描: {}", self.filter.root().display());

        let filter = self.filter.clone();
        // 使用 spawn_blocking 避免阻塞 async runtime
        let (files, errors) = tokio::task::spawn_blocking(move || {
            let mut errors = 0;
            let files: Vec<PathBuf> = WalkDir::new(filter.root())
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !filter.is_ignored(entry.path()))
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("跳过无法访问的条目: {}", e);
                        errors += 1;
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect();
            (files, errors)
        })
        .await?;

        let mut summary = PassSummary {
            errors,
            ..PassSummary::default()
        };
        for path in &files {
            signals
                .send(Signal::present(path.clone(), SignalOrigin::Scan))
                .await
                .map_err(|_| anyhow!("信号通道已关闭"))?;
            summary.files += 1;
        }

        let current: HashSet<PathBuf> = files.into_iter().collect();
        let missing: Vec<PathBuf> = self.tracked.difference(&current).cloned().collect();
        for path in missing {
            debug!("上一轮存在、本轮缺失: {}", path.display());
            signals
                .send(Signal::deleted(path, SignalOrigin::AfterScan))
                .await
                .map_err(|_| anyhow!("信号通道已关闭"))?;
            summary.deletions += 1;
        }

        self.tracked = current;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn scanner_for(root: &Path) -> Scanner {
        let filter = Arc::new(PathFilter::new(root, &["*.tmp".to_string()]).unwrap());
        Scanner::new(filter, Duration::from_secs(60))
    }

    fn drain(rx: &mut mpsc::Receiver<Signal>) -> Vec<Signal> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_scan_signals_regular_files_only() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("docs/deep")).unwrap();
        fs::create_dir_all(root.path().join(".sync")).unwrap();
        fs::write(root.path().join("a.txt"), b"a").unwrap();
        fs::write(root.path().join("docs/deep/b.txt"), b"b").unwrap();
        fs::write(root.path().join("docs/skip.tmp"), b"x").unwrap();
        fs::write(root.path().join(".sync/replica.db"), b"x").unwrap();

        let mut scanner = scanner_for(root.path());
        let (tx, mut rx) = mpsc::channel(16);
        let summary = scanner.scan_once(&tx).await.unwrap();

        assert_eq!(summary, PassSummary { files: 2, deletions: 0, errors: 0 });
        let mut paths: Vec<PathBuf> = drain(&mut rx)
            .into_iter()
            .inspect(|s| assert!(!s.is_deletion && s.origin == SignalOrigin::Scan))
            .map(|s| s.path)
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![root.path().join("a.txt"), root.path().join("docs/deep/b.txt")]
        );
    }

    #[tokio::test]
    async fn test_missing_files_become_deletions() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), b"a").unwrap();
        fs::write(root.path().join("b.txt"), b"b").unwrap();

        let mut scanner = scanner_for(root.path());
        let (tx, mut rx) = mpsc::channel(16);
        scanner.scan_once(&tx).await.unwrap();
        drain(&mut rx);

        fs::remove_file(root.path().join("b.txt")).unwrap();
        let summary = scanner.scan_once(&tx).await.unwrap();
        assert_eq!(summary, PassSummary { files: 1, deletions: 1, errors: 0 });

        let signals = drain(&mut rx);
        assert_eq!(
            signals.last(),
            Some(&Signal::deleted(root.path().join("b.txt"), SignalOrigin::AfterScan))
        );

        // 删除只推断一次
        let summary = scanner.scan_once(&tx).await.unwrap();
        assert_eq!(summary.deletions, 0);
        assert_eq!(scanner.tracked().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_paths_are_reconciled_on_first_pass() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("kept.txt"), b"k").unwrap();

        let mut scanner = scanner_for(root.path()).with_tracked(vec![
            root.path().join("kept.txt"),
            root.path().join("removed-offline.txt"),
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let summary = scanner.scan_once(&tx).await.unwrap();

        assert_eq!(summary, PassSummary { files: 1, deletions: 1, errors: 0 });
        let deletions: Vec<Signal> = drain(&mut rx).into_iter().filter(|s| s.is_deletion).collect();
        assert_eq!(
            deletions,
            vec![Signal::deleted(
                root.path().join("removed-offline.txt"),
                SignalOrigin::AfterScan
            )]
        );
    }

    #[tokio::test]
    async fn test_closed_channel_aborts_pass() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), b"a").unwrap();

        let mut scanner = scanner_for(root.path());
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        assert!(scanner.scan_once(&tx).await.is_err());
        // 中止的扫描不替换上一轮结果
        assert!(scanner.tracked().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_is_counted() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let locked = root.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("a.txt"), b"a").unwrap();
        fs::write(root.path().join("b.txt"), b"b").unwrap();

        let mut scanner = scanner_for(root.path());
        let (tx, mut rx) = mpsc::channel(16);
        scanner.scan_once(&tx).await.unwrap();
        drain(&mut rx);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // root 用户不受权限位限制
        let readable = fs::read_dir(&locked).is_ok();
        let summary = scanner.scan_once(&tx).await.unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if readable {
            assert_eq!(summary, PassSummary { files: 2, deletions: 0, errors: 0 });
        } else {
            assert_eq!(summary, PassSummary { files: 1, deletions: 1, errors: 1 });
        }
    }
}
