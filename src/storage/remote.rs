use super::{ByteStream, ObjectStore, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Builder, Operator};
use std::time::Duration;

/// 基于 OpenDAL 的远程对象存储（S3 / GCS / Azure Blob / WebDAV）
pub struct RemoteStorage {
    operator: Operator,
    name: String,
}

impl RemoteStorage {
    /// 从任意 OpenDAL 服务构建，统一加超时层
    pub fn with_builder<B: Builder>(builder: B, name: String) -> opendal::Result<Self> {
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        Ok(Self { operator, name })
    }

    /// S3 兼容存储，凭证从环境变量读取
    pub fn s3(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        endpoint: Option<&str>,
    ) -> opendal::Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default().bucket(bucket);
        if let Some(region) = region {
            builder = builder.region(region);
        }
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        if let Some(p) = prefix {
            builder = builder.root(p);
        }

        Self::with_builder(builder, display_name("s3", bucket, prefix))
    }

    pub fn gcs(bucket: &str, prefix: Option<&str>) -> opendal::Result<Self> {
        use opendal::services::Gcs;

        let mut builder = Gcs::default().bucket(bucket);
        if let Some(p) = prefix {
            builder = builder.root(p);
        }

        Self::with_builder(builder, display_name("gs", bucket, prefix))
    }

    pub fn azblob(
        container: &str,
        prefix: Option<&str>,
        endpoint: &str,
        account: Option<(&str, &str)>,
    ) -> opendal::Result<Self> {
        use opendal::services::Azblob;

        let mut builder = Azblob::default().container(container).endpoint(endpoint);
        if let Some((name, key)) = account {
            builder = builder.account_name(name).account_key(key);
        }
        if let Some(p) = prefix {
            builder = builder.root(p);
        }

        Self::with_builder(builder, display_name("azblob", container, prefix))
    }

    pub fn webdav(
        endpoint: &str,
        username: Option<&str>,
        password: Option<&str>,
        root: Option<&str>,
    ) -> opendal::Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default().endpoint(endpoint);
        if let Some(u) = username {
            builder = builder.username(u);
        }
        if let Some(p) = password {
            builder = builder.password(p);
        }
        if let Some(r) = root {
            builder = builder.root(r);
        }

        let name = format!(
            "{}{}",
            endpoint.trim_end_matches('/'),
            root.map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );
        Self::with_builder(builder, name)
    }
}

fn display_name(scheme: &str, bucket: &str, prefix: Option<&str>) -> String {
    format!(
        "{}://{}{}",
        scheme,
        bucket,
        prefix
            .map(|p| format!("/{}", p.trim_start_matches('/')))
            .unwrap_or_default()
    )
}

#[async_trait]
impl ObjectStore for RemoteStorage {
    async fn put(&self, key: &str, mut stream: ByteStream) -> Result<u64> {
        let mut writer = self.operator.writer(key).await?;
        let mut written = 0u64;

        loop {
            let chunk = match stream.try_next().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    // 中止分块上传，不留下半个对象
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            written += chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }

        writer.close().await?;
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // OpenDAL 对不存在的对象返回成功
        self.operator.delete(key).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
