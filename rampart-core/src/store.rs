//! Object storage accessed through the vendor CLI.
//!
//! The store only needs three verbs: list a scoped prefix, upload a local
//! artifact, and delete by key. Everything else about the storage service
//! (storage class, tags) is opaque pass-through configuration.

use crate::{
    config,
    exec::{self, Tool},
    operation::{Artifact, Location},
};
use serde::Deserialize;
use std::path::Path;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Exec(#[from] exec::Error),
    #[error("unexpected storage listing output")]
    BadListing(#[source] serde_json::Error),
    #[error("i/o error reading local artifact {0}")]
    LocalIo(String, #[source] std::io::Error),
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists artifacts under the given owner's prefix.
    async fn list(&self, owner: &str) -> Result<Vec<Artifact>, StoreError>;

    /// Uploads a local file to `<prefix>/<owner>/<filename>`.
    async fn put(&self, local: &Path, owner: &str, filename: &str)
        -> Result<Artifact, StoreError>;

    /// Downloads the object with the given key to a local path.
    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreError>;

    /// Removes one object by key. Callers treat failures as skippable.
    async fn delete(&self, artifact: &Artifact) -> Result<(), StoreError>;
}

/// Object store backed by the `aws` CLI (or a compatible drop-in binary).
#[derive(Debug)]
pub struct S3CliStore {
    tool: Tool,
    bucket: String,
    prefix: String,
    storage_class: Option<String>,
}

impl S3CliStore {
    pub fn new(tool: Tool, storage: &config::Storage) -> Self {
        S3CliStore {
            tool,
            bucket: storage.bucket.clone(),
            prefix: storage.prefix.clone(),
            storage_class: storage.storage_class.clone(),
        }
    }

    fn key(&self, owner: &str, filename: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", owner, filename)
        } else {
            format!("{}/{}/{}", self.prefix, owner, filename)
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: Option<String>,
    #[serde(rename = "Size", default)]
    size: u64,
}

fn parse_listing(stdout: &str, owner: &str) -> Result<Vec<Artifact>, StoreError> {
    if stdout.trim().is_empty() {
        // the CLI prints nothing at all for an empty prefix
        return Ok(vec![]);
    }
    let listing: Listing = serde_json::from_str(stdout).map_err(StoreError::BadListing)?;
    let artifacts = listing
        .contents
        .into_iter()
        .map(|object| {
            let created = object.last_modified.as_deref().and_then(|ts| {
                let parsed = OffsetDateTime::parse(ts, &Rfc3339).ok();
                if parsed.is_none() {
                    tracing::warn!(key = %object.key, timestamp = ts, "unparsable object timestamp");
                }
                parsed
            });
            Artifact {
                id: object.key.clone(),
                created,
                size: object.size,
                owner: owner.to_owned(),
                location: Location::Remote(object.key),
            }
        })
        .collect();
    Ok(artifacts)
}

#[async_trait::async_trait]
impl ObjectStore for S3CliStore {
    async fn list(&self, owner: &str) -> Result<Vec<Artifact>, StoreError> {
        let prefix = self.key(owner, "");
        let captured = self
            .tool
            .check_output(
                &[
                    "s3api",
                    "list-objects-v2",
                    "--bucket",
                    self.bucket.as_str(),
                    "--prefix",
                    prefix.as_str(),
                    "--output",
                    "json",
                ],
                &[],
            )
            .await?;
        let mut artifacts = parse_listing(&captured.stdout, owner)?;
        for artifact in &mut artifacts {
            artifact.location = Location::Remote(self.uri(&artifact.id));
        }
        Ok(artifacts)
    }

    async fn put(
        &self,
        local: &Path,
        owner: &str,
        filename: &str,
    ) -> Result<Artifact, StoreError> {
        let key = self.key(owner, filename);
        let uri = self.uri(&key);
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| StoreError::LocalIo(local.display().to_string(), e))?
            .len();
        let local = local.display().to_string();
        let mut args = vec!["s3", "cp", local.as_str(), uri.as_str()];
        if let Some(class) = &self.storage_class {
            args.push("--storage-class");
            args.push(class.as_str());
        }
        self.tool.check_output(&args, &[]).await?;
        tracing::info!(%uri, size, "uploaded artifact");
        Ok(Artifact {
            id: key,
            created: Some(OffsetDateTime::now_utc()),
            size,
            owner: owner.to_owned(),
            location: Location::Remote(uri),
        })
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), StoreError> {
        let uri = self.uri(key);
        let local = local.display().to_string();
        self.tool
            .check_output(&["s3", "cp", uri.as_str(), local.as_str()], &[])
            .await?;
        Ok(())
    }

    async fn delete(&self, artifact: &Artifact) -> Result<(), StoreError> {
        self.tool
            .check_output(
                &[
                    "s3api",
                    "delete-object",
                    "--bucket",
                    self.bucket.as_str(),
                    "--key",
                    artifact.id.as_str(),
                ],
                &[],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        sync::Mutex,
    };

    /// In-memory store for tests; records mutations and can be told to fail.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub objects: Mutex<Vec<Artifact>>,
        pub deleted: Mutex<Vec<String>>,
        pub fail_delete: Mutex<HashSet<String>>,
        pub fail_list: AtomicBool,
        pub puts: AtomicUsize,
    }

    impl MemoryStore {
        pub fn with_objects(objects: Vec<Artifact>) -> Self {
            MemoryStore {
                objects: Mutex::new(objects),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for MemoryStore {
        async fn list(&self, owner: &str) -> Result<Vec<Artifact>, StoreError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(StoreError::BadListing(
                    serde_json::from_str::<serde_json::Value>("").unwrap_err(),
                ));
            }
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.owner == owner)
                .cloned()
                .collect())
        }

        async fn put(
            &self,
            _local: &Path,
            owner: &str,
            filename: &str,
        ) -> Result<Artifact, StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let artifact = Artifact {
                id: format!("{}/{}", owner, filename),
                created: Some(OffsetDateTime::now_utc()),
                size: 1,
                owner: owner.to_owned(),
                location: Location::Remote(format!("mem://{}/{}", owner, filename)),
            };
            self.objects.lock().unwrap().push(artifact.clone());
            Ok(artifact)
        }

        async fn get(&self, _key: &str, _local: &Path) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, artifact: &Artifact) -> Result<(), StoreError> {
            if self.fail_delete.lock().unwrap().contains(&artifact.id) {
                return Err(StoreError::LocalIo(
                    artifact.id.clone(),
                    std::io::Error::new(std::io::ErrorKind::Other, "delete refused"),
                ));
            }
            self.deleted.lock().unwrap().push(artifact.id.clone());
            self.objects.lock().unwrap().retain(|a| a.id != artifact.id);
            Ok(())
        }
    }
}
