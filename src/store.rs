//! Object store clients the dimension build reads from and publishes to.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

/// The three calls the pipeline needs from a bucket-addressed store.
///
/// `put` must replace any existing object at `key` and make the new content
/// visible only once it is complete.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys under `prefix`, sorted ascending.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            force_path_style: false,
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Builds a client from the default AWS credential chain.
    pub async fn new(config: S3Config) -> Result<Self, StoreError> {
        if config.region.is_empty() {
            return Err(StoreError::Configuration("region cannot be empty".into()));
        }

        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let output = request.send().await.map_err(StoreError::from_sdk)?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match err {
                SdkError::ServiceError(service_err) if service_err.err().is_no_such_key() => {
                    StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                }
                other => StoreError::from_sdk(other),
            })?;

        let data = output.body.collect().await.map_err(StoreError::from_sdk)?;
        Ok(data.into_bytes())
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(StoreError::from_sdk)?;
        Ok(())
    }
}

/// Buckets as directories under a local root, keys as relative paths.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        let mut components = Path::new(bucket).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(bucket)),
            _ => Err(StoreError::Configuration(format!(
                "invalid bucket name '{bucket}'"
            ))),
        }
    }

    /// Path of `key` inside the bucket directory. Keys may not be absolute or
    /// contain anything but plain path segments.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let base = self.bucket_path(bucket)?;
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Configuration(format!("invalid key '{key}'")));
        }
        Ok(base.join(relative))
    }
}

fn collect_keys(dir: &Path, base: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(&path, base, keys)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.bucket_path(bucket)?;
        let prefix = prefix.to_string();
        let mut keys = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut keys = Vec::new();
            if base.is_dir() {
                collect_keys(&base, &base, &mut keys)?;
            }
            Ok(keys)
        })
        .await??;

        keys.retain(|key| key.starts_with(&prefix) && !key.ends_with(".tmp"));
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Readers never see a half-written file: write aside, then rename over.
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>) {
        self.lock()
            .insert((bucket.to_string(), key.to_string()), bytes.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Bytes>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        self.object(bucket, key).ok_or_else(|| StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> Result<(), StoreError> {
        self.insert(bucket, key, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn memory_store_lists_by_bucket_and_prefix() -> TestResult {
        let store = MemoryStore::new();
        store.insert("b", "fact_rental/2.parquet", &b"2"[..]);
        store.insert("b", "fact_rental/1.parquet", &b"1"[..]);
        store.insert("b", "dim_date/x.parquet", &b"x"[..]);
        store.insert("other", "fact_rental/3.parquet", &b"3"[..]);

        let keys = store.list("b", "fact_rental/").await?;
        assert_eq!(keys, vec!["fact_rental/1.parquet", "fact_rental/2.parquet"]);
        assert_eq!(store.get("b", "fact_rental/1.parquet").await?, Bytes::from("1"));
        assert!(matches!(
            store.get("b", "missing").await,
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn fs_store_put_replaces_and_lists_nested_keys() -> TestResult {
        let tmp = tempfile::TempDir::new()?;
        let store = FsStore::new(tmp.path());

        store.put("b", "dim_date/out.parquet", Bytes::from("old")).await?;
        store.put("b", "dim_date/out.parquet", Bytes::from("new")).await?;
        store.put("b", "fact_rental/2005/05.parquet", Bytes::from("f")).await?;

        assert_eq!(store.get("b", "dim_date/out.parquet").await?, Bytes::from("new"));
        assert_eq!(
            store.list("b", "").await?,
            vec!["dim_date/out.parquet", "fact_rental/2005/05.parquet"]
        );
        assert_eq!(
            store.list("b", "fact_rental/").await?,
            vec!["fact_rental/2005/05.parquet"]
        );
        assert!(store.list("nobucket", "").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_keys() -> TestResult {
        let root = tempfile::TempDir::new()?;
        let outside = tempfile::TempDir::new()?;
        let store = FsStore::new(root.path());

        assert!(matches!(
            store.get("b", "../etc/passwd").await,
            Err(StoreError::Configuration(_))
        ));

        let absolute = outside.path().join("escaped.parquet");
        let absolute = absolute.to_string_lossy();
        assert!(matches!(
            store.put("b", &absolute, Bytes::from("x")).await,
            Err(StoreError::Configuration(_))
        ));
        assert!(!outside.path().join("escaped.parquet").exists());

        for bucket in ["", "..", ".", "a/b", "/abs"] {
            assert!(
                matches!(store.list(bucket, "").await, Err(StoreError::Configuration(_))),
                "bucket {bucket:?} was accepted"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn missing_objects_are_reported_without_a_scheme() {
        let store = MemoryStore::new();
        let err = store.get("b", "fact_rental/x.parquet").await.unwrap_err();
        assert_eq!(err.to_string(), "object not found: b/fact_rental/x.parquet");
    }

    #[tokio::test]
    async fn failed_background_tasks_are_not_sdk_errors() {
        let handle = tokio::task::spawn_blocking(|| -> std::io::Result<Vec<String>> {
            panic!("listing thread died")
        });
        let join_err = handle.await.unwrap_err();
        let err = StoreError::from(join_err);
        assert!(matches!(err, StoreError::Join(_)));
        assert!(err.to_string().starts_with("background task failed"));
    }
}
