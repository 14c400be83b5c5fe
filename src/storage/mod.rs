pub mod local;
pub mod memory;
pub mod registry;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use local::LocalStorage;
pub use memory::{MemoryStorage, StorageOp};
pub use registry::{RegistryError, StorageRegistry, StoreFactory};
pub use remote::RemoteStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 上传用的字节流
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// 对象存储抽象接口
///
/// 键是相对被监控目录的路径，使用 `/` 分隔。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 流式写入整个对象，覆盖已有对象，返回写入的字节数
    ///
    /// 只有流完整读完并提交后对象才可见。
    async fn put(&self, key: &str, stream: ByteStream) -> Result<u64>;

    /// 删除对象，对象不存在时也返回成功
    async fn delete(&self, key: &str) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}
