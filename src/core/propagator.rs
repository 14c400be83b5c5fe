//! 变更传播 - 按到达顺序把确认的变化写入对象存储
//!
//! 单任务串行执行，一次只传输一个文件。失败只记录日志并丢弃事件，不重试。

use crate::core::detector::{ChangeEvent, ChangeKind};
use crate::storage::ObjectStore;
use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

/// 单个事件的传播结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Uploaded { bytes: u64 },
    Deleted,
}

/// 变更传播器
pub struct Propagator {
    storage: Arc<dyn ObjectStore>,
}

impl Propagator {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    /// 消费事件直到检测器关闭通道
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
        info!("变更传播已启动: {}", self.storage.name());
        while let Some(event) = events.recv().await {
            if let Err(e) = self.apply(&event).await {
                error!("同步失败，已丢弃: {} - {:#}", event.key, e);
            }
        }
        info!("变更传播已停止");
    }

    /// 把单个事件写入对象存储
    pub async fn apply(&self, event: &ChangeEvent) -> Result<Outcome> {
        match event.kind {
            ChangeKind::Deleted => {
                self.storage
                    .delete(&event.key)
                    .await
                    .with_context(|| format!("删除远程对象失败: {}", event.key))?;
                info!("已删除远程对象: {}", event.key);
                Ok(Outcome::Deleted)
            }
            ChangeKind::Created | ChangeKind::Updated => {
                let file = tokio::fs::File::open(&event.path)
                    .await
                    .with_context(|| format!("无法打开源文件: {}", event.path.display()))?;
                let stream = ReaderStream::new(file).map_err(anyhow::Error::from).boxed();

                let bytes = self
                    .storage
                    .put(&event.key, stream)
                    .await
                    .with_context(|| format!("上传失败: {}", event.key))?;
                info!("已上传: {} ({} 字节)", event.key, bytes);
                Ok(Outcome::Uploaded { bytes })
            }
        }
    }
}
