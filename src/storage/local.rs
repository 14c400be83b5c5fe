use super::{ByteStream, ObjectStore};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// 本地目录存储（file://）
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        let name = format!("file://{}", path.display());
        Ok(Self {
            base_path: path.to_path_buf(),
            name,
        })
    }

    fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let mut full_path = self.base_path.clone();
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                bail!("非法的对象键: {}", key);
            }
            full_path.push(segment);
        }

        if full_path == self.base_path {
            bail!("对象键为空");
        }
        Ok(full_path)
    }

    /// 同目录下的临时文件，写完后原子重命名
    fn temp_path(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()))
    }

    async fn write_file(path: &Path, stream: &mut ByteStream) -> Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn put(&self, key: &str, mut stream: ByteStream) -> Result<u64> {
        let full_path = self.resolve_path(key)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path(&full_path);
        match Self::write_file(&temp_path, &mut stream).await {
            Ok(written) => {
                fs::rename(&temp_path, &full_path).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.resolve_path(key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
