use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, ObjectStore, PutPayload};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, error};

/// A reference-counted reference to a [StorageProvider].
pub type StorageProviderRef = Arc<StorageProvider>;

#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl Debug for StorageProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("the provided URL is not a valid object store")]
    InvalidUrl,

    #[error("could not instantiate storage from path: {0}")]
    PathError(String),

    #[error("object store error: {0:?}")]
    ObjectStore(#[from] object_store::Error),
}

// https://s3.us-west-2.amazonaws.com/DOC-EXAMPLE-BUCKET1/puppy.jpg
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
// S3://mybucket/puppy.jpg
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
// s3::https://my-endpoint.com:1234/mybucket/puppy.jpg
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

// file:///my/path/directory
const FILE_URI: &str = r"^file://(?P<path>.*)$";
// file:/my/path/directory
const FILE_URL: &str = r"^file:(?P<path>.*)$";
// /my/path/directory
const FILE_PATH: &str = r"^/(?P<path>.*)$";

// memory://my/key
const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

#[derive(Debug, Clone, Hash, PartialEq, Eq, Copy)]
enum Backend {
    S3,
    Local,
    Memory,
}

fn matchers() -> &'static Vec<(Backend, Vec<Regex>)> {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        vec![
            (
                Backend::S3,
                vec![
                    Regex::new(S3_PATH).unwrap(),
                    Regex::new(S3_ENDPOINT_URL).unwrap(),
                    Regex::new(S3_URL).unwrap(),
                ],
            ),
            (Backend::Memory, vec![Regex::new(MEMORY_URL).unwrap()]),
            (
                Backend::Local,
                vec![
                    Regex::new(FILE_URI).unwrap(),
                    Regex::new(FILE_URL).unwrap(),
                    Regex::new(FILE_PATH).unwrap(),
                ],
            ),
        ]
    })
}

#[macro_export]
macro_rules! retry {
    ($e:expr, $max_retries:expr, $base:expr, $max_delay:expr, |$err_var:ident| $error_handler:expr) => {{
        use rand::Rng;
        use std::time::Duration;
        let mut retries: u32 = 0;
        loop {
            match $e {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if retries < $max_retries {
                        retries += 1;
                        {
                            let $err_var = &e;
                            $error_handler;
                        }
                        let tmp: Duration = $max_delay.min($base * (2u32.pow(retries)));
                        let jitter = (tmp.as_micros() as u64 / 2).max(1);
                        let backoff = tmp / 2
                            + Duration::from_micros(rand::thread_rng().gen_range(0..jitter));

                        tokio::time::sleep(backoff).await;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

macro_rules! storage_retry {
    ($e: expr) => {
        retry!(
            $e,
            10,
            Duration::from_millis(100),
            Duration::from_secs(10),
            |e| error!("Error: {}. Retrying...", e)
        )
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    endpoint: Option<String>,
    region: Option<String>,
    bucket: String,
    key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (k, v) in matchers() {
            if let Some(matches) = v.iter().filter_map(|r| r.captures(url)).next() {
                return match k {
                    Backend::S3 => Self::parse_s3(matches),
                    Backend::Local => Self::parse_local(matches),
                    Backend::Memory => Ok(Self::parse_memory(matches)),
                };
            }
        }

        Err(StorageError::InvalidUrl)
    }

    fn parse_s3(matches: Captures) -> Result<Self, StorageError> {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .ok_or(StorageError::InvalidUrl)?;

        let region = last([
            std::env::var("AWS_DEFAULT_REGION").ok(),
            matches.name("region").map(|m| m.as_str().to_string()),
        ]);

        let endpoint = last([
            std::env::var("AWS_ENDPOINT").ok(),
            matches
                .name("endpoint")
                .map(|endpoint| -> Result<String, StorageError> {
                    let port = if let Some(port) = matches.name("port") {
                        u16::from_str(port.as_str()).map_err(|_| {
                            StorageError::PathError(format!("invalid port: {}", port.as_str()))
                        })?
                    } else {
                        443
                    };

                    let protocol = matches
                        .name("protocol")
                        .map(|p| p.as_str())
                        .unwrap_or("https");

                    Ok(format!("{}://{}:{}", protocol, endpoint.as_str(), port))
                })
                .transpose()?,
        ]);

        let key = matches.name("key").map(|m| m.as_str().into());

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_local(matches: Captures) -> Result<Self, StorageError> {
        let path = matches
            .name("path")
            .map(|m| m.as_str())
            .ok_or(StorageError::InvalidUrl)?;

        let path = if !path.starts_with('/') {
            PathBuf::from(format!("/{}", path))
        } else {
            PathBuf::from(path)
        };

        let path = path
            .to_str()
            .ok_or_else(|| StorageError::PathError(format!("{:?} is not valid utf-8", path)))?
            .to_string();

        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    fn parse_memory(matches: Captures) -> Self {
        let key = matches
            .name("key")
            .map(|m| m.as_str())
            .filter(|k| !k.is_empty())
            .map(|k| k.into());
        BackendConfig::Memory(MemoryConfig { key })
    }

    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) => None,
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }
}

fn last<I: Sized, const COUNT: usize>(opts: [Option<I>; COUNT]) -> Option<I> {
    opts.into_iter().flatten().last()
}

impl StorageProvider {
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        let config: BackendConfig = BackendConfig::parse_url(url)?;

        match config {
            BackendConfig::S3(config) => Self::construct_s3(config),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    /// A fresh, empty in-memory store. Every call returns an independent store.
    pub fn in_memory() -> Self {
        Self::construct_memory(MemoryConfig { key: None })
    }

    fn construct_s3(config: S3Config) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let mut canonical_url = match (&config.region, &config.endpoint) {
            (_, Some(endpoint)) => {
                format!("s3::{}/{}", endpoint, config.bucket)
            }
            (Some(region), _) => {
                format!("https://s3.{}.amazonaws.com/{}", region, config.bucket)
            }
            _ => {
                format!("https://s3.amazonaws.com/{}", config.bucket)
            }
        };
        if let Some(key) = &config.key {
            canonical_url = format!("{}/{}", canonical_url, key);
        }

        let object_store = Arc::new(builder.build().map_err(Into::<StorageError>::into)?);

        Ok(Self {
            config: BackendConfig::S3(config),
            object_store,
            canonical_url,
        })
    }

    async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path).await.map_err(|e| {
            StorageError::PathError(format!(
                "failed to create directory {}: {:?}",
                config.path, e
            ))
        })?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(&config.path).map_err(Into::<StorageError>::into)?,
        );

        let canonical_url = format!("file://{}", config.path);
        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            canonical_url,
        })
    }

    fn construct_memory(config: MemoryConfig) -> Self {
        let canonical_url = match &config.key {
            Some(key) => format!("memory://{}", key),
            None => "memory://".to_string(),
        };
        Self {
            config: BackendConfig::Memory(config),
            object_store: Arc::new(InMemory::new()),
            canonical_url,
        }
    }

    /// Lists every object under `prefix`, relative to this provider's key.
    pub async fn list(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        let prefix = parse_key(prefix)?;
        let qualified = self.qualify_path(&prefix).into_owned();
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let metas: Vec<_> = self
            .object_store
            .list(Some(&qualified))
            .try_collect()
            .await?;

        Ok(metas
            .into_iter()
            .map(|meta| meta.location.parts().skip(key_part_count).collect())
            .collect())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = parse_key(path)?;
        let bytes = self
            .object_store
            .get(&self.qualify_path(&path))
            .await
            .map_err(Into::<StorageError>::into)?
            .bytes()
            .await?;

        Ok(bytes)
    }

    pub async fn get_if_present(&self, path: &str) -> Result<Option<Bytes>, StorageError> {
        let path = parse_key(path)?;
        match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(obj) => {
                let bytes = obj.bytes().await?;
                Ok(Some(bytes))
            }
            Err(err) => {
                if let object_store::Error::NotFound { .. } = &err {
                    return Ok(None);
                }
                Err(err.into())
            }
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let path = parse_key(path)?;
        let exists = self.object_store.head(&self.qualify_path(&path)).await;

        match exists {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let bytes = PutPayload::from(Bytes::from(bytes));
        let path = parse_key(path)?;
        let path = self.qualify_path(&path);
        storage_retry!(self.object_store.put(&path, bytes.clone()).await)?;

        Ok(())
    }

    /// Moves `from` to `to`, overwriting `to` if it exists.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from, to) = (parse_key(from)?, parse_key(to)?);
        let (from, to) = (self.qualify_path(&from), self.qualify_path(&to));
        debug!("renaming {} to {}", from, to);
        self.object_store.rename(&from, &to).await?;
        Ok(())
    }

    fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    pub async fn delete_if_present(&self, path: &str) -> Result<(), StorageError> {
        let path = parse_key(path)?;
        let path = self.qualify_path(&path);
        match self.object_store.delete(&path).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Full URL of the object stored under `path`.
    pub fn canonical_url_for(&self, path: &str) -> String {
        format!("{}/{}", self.canonical_url, path)
    }
}

/// Keys are already escaped (`p=a%2Fb`) and are stored exactly as given.
fn parse_key(path: &str) -> Result<Path, StorageError> {
    Path::parse(path).map_err(|e| StorageError::PathError(format!("invalid key {}: {}", path, e)))
}
