//! 按 URL scheme 构建对象存储

use super::{LocalStorage, MemoryStorage, ObjectStore, RemoteStorage};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// 存储构造函数
pub type StoreFactory = fn(&Url) -> Result<Arc<dyn ObjectStore>, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("无效的存储地址 {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("不支持的存储类型: {0}")]
    UnsupportedScheme(String),
    #[error("存储地址缺少{what}: {url}")]
    MissingPart { url: String, what: &'static str },
    #[error(transparent)]
    Backend(#[from] opendal::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// scheme -> 构造函数
pub struct StorageRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 注册所有内置存储
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", open_file);
        registry.register("mem", open_memory);
        registry.register("s3", open_s3);
        registry.register("gs", open_gcs);
        registry.register("azblob", open_azblob);
        registry.register("webdav", open_webdav);
        registry.register("webdavs", open_webdav);
        registry
    }

    /// 注册（或覆盖）一个 scheme
    pub fn register(&mut self, scheme: &str, factory: StoreFactory) {
        self.factories.insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn open(&self, address: &str) -> Result<Arc<dyn ObjectStore>, RegistryError> {
        let url = Url::parse(address).map_err(|source| RegistryError::InvalidUrl {
            url: address.to_string(),
            source,
        })?;

        let factory = self
            .factories
            .get(url.scheme())
            .ok_or_else(|| RegistryError::UnsupportedScheme(url.scheme().to_string()))?;
        factory(&url)
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn host<'a>(url: &'a Url, what: &'static str) -> Result<&'a str, RegistryError> {
    url.host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RegistryError::MissingPart {
            url: url.to_string(),
            what,
        })
}

/// URL 路径作为对象前缀，空路径返回 None
fn prefix(url: &Url) -> Option<&str> {
    Some(url.path().trim_matches('/')).filter(|p| !p.is_empty())
}

fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn open_file(url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    let path = url.to_file_path().map_err(|_| RegistryError::MissingPart {
        url: url.to_string(),
        what: "本地绝对路径",
    })?;
    Ok(Arc::new(LocalStorage::new(&path)?))
}

fn open_memory(_url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    Ok(Arc::new(MemoryStorage::new()))
}

fn open_s3(url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    let bucket = host(url, "存储桶")?;
    let region = query(url, "region");
    let endpoint = query(url, "endpoint");
    let storage = RemoteStorage::s3(bucket, prefix(url), region.as_deref(), endpoint.as_deref())?;
    Ok(Arc::new(storage))
}

fn open_gcs(url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    let bucket = host(url, "存储桶")?;
    Ok(Arc::new(RemoteStorage::gcs(bucket, prefix(url))?))
}

fn open_azblob(url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    let container = host(url, "容器")?;
    let account = query(url, "account");
    let endpoint = match (query(url, "endpoint"), account.as_deref()) {
        (Some(ep), _) => ep,
        (None, Some(name)) => format!("https://{}.blob.core.windows.net", name),
        (None, None) => {
            return Err(RegistryError::MissingPart {
                url: url.to_string(),
                what: "endpoint 或 account",
            })
        }
    };

    let key = url.password().map(decode);
    let credentials = match (account.as_deref(), key.as_deref()) {
        (Some(name), Some(key)) => Some((name, key)),
        _ => None,
    };

    let storage = RemoteStorage::azblob(container, prefix(url), &endpoint, credentials)?;
    Ok(Arc::new(storage))
}

fn open_webdav(url: &Url) -> Result<Arc<dyn ObjectStore>, RegistryError> {
    let host = host(url, "主机")?;
    let protocol = if url.scheme() == "webdavs" { "https" } else { "http" };
    let endpoint = match url.port() {
        Some(port) => format!("{}://{}:{}", protocol, host, port),
        None => format!("{}://{}", protocol, host),
    };

    let username = Some(url.username())
        .filter(|u| !u.is_empty())
        .map(decode);
    let password = url.password().map(decode);

    let storage = RemoteStorage::webdav(
        &endpoint,
        username.as_deref(),
        password.as_deref(),
        prefix(url),
    )?;
    Ok(Arc::new(storage))
}
