//! Storage backend abstraction for small coordination objects.
//!
//! Lock records and retry markers are tiny JSON objects whose correctness
//! rests entirely on conditional writes:
//! - `DoesNotExist` gives atomic create-if-absent
//! - `MatchesVersion` gives compare-and-swap over an opaque version token
//!
//! The version token is opaque so that backends can carry their own notion
//! of object version (`ETag`, generation number, version ID).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded; carries the new version token.
    Success {
        /// Version token after the write.
        version: String,
    },
    /// The precondition did not hold. Not an error.
    PreconditionFailed,
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path.
    pub path: String,
    /// Version token usable with [`WritePrecondition::MatchesVersion`].
    pub version: String,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object storage used for coordination state.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an object together with its version token.
    ///
    /// Returns `None` if the object does not exist.
    async fn get(&self, path: &str) -> Result<Option<(Bytes, String)>>;

    /// Writes with an optional precondition.
    ///
    /// Precondition failure is reported as [`WriteResult::PreconditionFailed`].
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object. Succeeds if the object does not exist.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Returns object metadata, or `None` if the object does not exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Lists objects under a directory prefix, matching whole path segments.
    ///
    /// Returned paths are relative to the backend root, in no particular order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty()
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// In-memory storage backend for tests and single-process deployments.
///
/// Versions are monotonically increasing integers rendered as strings.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
}

fn poisoned() -> Error {
    Error::Internal {
        message: "storage lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Option<(Bytes, String)>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .get(path)
            .map(|o| (o.data.clone(), o.version.to_string())))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist if current.is_some() => {
                return Ok(WriteResult::PreconditionFailed);
            }
            WritePrecondition::MatchesVersion(expected) => {
                let matches = current.is_some_and(|o| o.version.to_string() == expected);
                if !matches {
                    return Ok(WriteResult::PreconditionFailed);
                }
            }
            _ => {}
        }

        let version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|o| ObjectMeta {
            path: path.to_string(),
            version: o.version.to_string(),
            last_modified: Some(o.last_modified),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(path, _)| is_under(path, prefix))
            .map(|(path, o)| ObjectMeta {
                path: path.clone(),
                version: o.version.to_string(),
                last_modified: Some(o.last_modified),
            })
            .collect())
    }
}

/// Storage backend over any [`ObjectStore`] (S3, GCS, local, in-memory).
///
/// Conditional writes map onto `PutMode::Create` and `PutMode::Update`; the
/// version token is the object's `ETag`. S3 buckets need conditional put
/// enabled on the client (`aws_conditional_put=etag`).
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreBackend {
    /// Wraps an object store, rooting all paths under `prefix`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Builds a backend from a URL such as `s3://bucket/locks`.
    ///
    /// Credentials and options are read from the environment by the
    /// underlying store builders.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed or its scheme is unsupported.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = ::url::Url::parse(url)
            .map_err(|e| Error::Configuration(format!("invalid storage URL '{url}': {e}")))?;
        let options: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("AWS_") || k.starts_with("GOOGLE_"))
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let (store, prefix) = object_store::parse_url_opts(&parsed, options)
            .map_err(|e| Error::storage_with_source(format!("open storage '{url}'"), e))?;
        Ok(Self::new(Arc::from(store), prefix.to_string()))
    }

    fn location(&self, path: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{path}", self.prefix))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Option<(Bytes, String)>> {
        let location = self.location(path);
        let result = match self.store.get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(Error::storage_with_source(format!("get {location}"), e)),
        };
        let version = result.meta.e_tag.clone().unwrap_or_default();
        let data = result
            .bytes()
            .await
            .map_err(|e| Error::storage_with_source(format!("read {location}"), e))?;
        Ok(Some((data, version)))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = self.location(path);
        let mode = match precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(e_tag) => PutMode::Update(UpdateVersion {
                e_tag: Some(e_tag),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };
        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };
        match self
            .store
            .put_opts(&location, PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: result.e_tag.unwrap_or_default(),
            }),
            Err(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            ) => Ok(WriteResult::PreconditionFailed),
            Err(e) => Err(Error::storage_with_source(format!("put {location}"), e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = self.location(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::storage_with_source(format!("delete {location}"), e)),
        }
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = self.location(path);
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                version: meta.e_tag.unwrap_or_default(),
                last_modified: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::storage_with_source(format!("head {location}"), e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = self.location(prefix.trim_matches('/'));
        let listed: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| Error::storage_with_source(format!("list {location}"), e))?;

        let root = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        Ok(listed
            .into_iter()
            .filter_map(|meta| {
                let path = meta.location.as_ref().strip_prefix(root.as_str())?.to_string();
                Some(ObjectMeta {
                    path,
                    version: meta.e_tag.unwrap_or_default(),
                    last_modified: Some(meta.last_modified),
                })
            })
            .collect())
    }
}
