//! 应用配置模块
//!
//! 配置保存在被监控目录下的保留状态目录（`.sync/config.json`）中，
//! 按功能分节：`mirror` 为同步参数，`log` 为日志参数（见 [`crate::logging`]）。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 保留状态目录名（元数据库、配置、日志都放在这里，扫描时整体跳过）
pub const STATE_DIR: &str = ".sync";

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 获取被监控目录对应的状态目录
pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

/// 镜像同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// 全量扫描间隔（秒）
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// 信号通道容量（满时生产者阻塞）
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
    /// 是否启用系统文件监控
    #[serde(default = "default_true")]
    pub watch: bool,
    /// 排除规则（glob patterns，相对被监控目录）
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// 启动时用元数据库中的存活记录作为上一轮扫描结果
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_signal_capacity() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            signal_capacity: default_signal_capacity(),
            watch: true,
            exclude_patterns: Vec::new(),
            reconcile_on_start: true,
        }
    }
}

impl MirrorConfig {
    /// 从配置文件加载镜像配置，文件或字段缺失时使用默认值
    pub fn load(state_dir: &Path) -> Self {
        let config_file = state_dir.join(CONFIG_FILE);
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&content) {
                    if let Some(mirror_config) = config.get("mirror") {
                        match serde_json::from_value::<MirrorConfig>(mirror_config.clone()) {
                            Ok(mirror) => return mirror,
                            Err(e) => tracing::warn!("镜像配置无效，使用默认值: {}", e),
                        }
                    }
                }
            }
        }
        Self::default()
    }

    /// 扫描间隔（至少 1 秒）
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }
}
