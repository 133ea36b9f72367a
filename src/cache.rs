//! Local mirror of remote image content.
//!
//! Remote references resolve to `<cache_root>/<bucket>/<key>`. Downloads are
//! written to a temporary file next to the destination and renamed into
//! place, so a partially transferred object never looks like a cache hit.
//! Concurrent downloads of the same key are allowed to race: both rename
//! onto the same destination and the result converges.
//!
//! Resolved remote files are pinned until [`ContentCache::release`]. A file
//! released for eviction is only removed once no other caller holds it.

use futures::{StreamExt, TryStreamExt};
use object_store::{path::Path as ObjectPath, ObjectStore};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::S3Config;
use crate::errors::PipelineError;
use crate::reference::{has_image_extension, ImageReference};

/// Maps a bucket name to an object store client.
pub trait BucketResolver: Send + Sync {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>, PipelineError>;
}

/// S3-compatible buckets, one client per bucket built on first use.
pub struct S3Buckets {
    settings: S3Config,
    clients: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Buckets {
    pub fn new(settings: S3Config) -> Self {
        Self {
            settings,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl BucketResolver for S3Buckets {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>, PipelineError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|e| PipelineError::remote(name, "", format!("client lock poisoned: {e}")))?;

        if let Some(client) = clients.get(name) {
            return Ok(client.clone());
        }

        let mut builder = object_store::aws::AmazonS3Builder::from_env()
            .with_bucket_name(name)
            .with_region(&self.settings.region)
            .with_allow_http(self.settings.allow_http);
        if let Some(endpoint) = &self.settings.endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        let client: Arc<dyn ObjectStore> = Arc::new(
            builder
                .build()
                .map_err(|e| PipelineError::remote(name, "", e))?,
        );
        clients.insert(name.to_string(), client.clone());
        Ok(client)
    }
}

/// A fixed set of pre-built stores keyed by bucket name.
#[derive(Default)]
pub struct StaticBuckets {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl StaticBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, name: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(name.to_string(), store);
        self
    }
}

impl BucketResolver for StaticBuckets {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>, PipelineError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::remote(name, "", "bucket not found"))
    }
}

/// Outcome of resolving a reference to disk.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub path: PathBuf,
    /// True when this call transferred the object (cache miss).
    pub fetched: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub listed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Pin {
    holders: usize,
    evict: bool,
}

pub struct ContentCache {
    root: PathBuf,
    local_base: PathBuf,
    buckets: Arc<dyn BucketResolver>,
    workers: usize,
    download_timeout: Duration,
    pins: Mutex<HashMap<PathBuf, Pin>>,
}

impl ContentCache {
    pub fn new(
        root: PathBuf,
        local_base: PathBuf,
        buckets: Arc<dyn BucketResolver>,
        workers: usize,
        download_timeout: Duration,
    ) -> Self {
        Self {
            root,
            local_base,
            buckets,
            workers: workers.max(1),
            download_timeout,
            pins: Mutex::new(HashMap::new()),
        }
    }

    fn pins(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Pin>> {
        self.pins.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pin(&self, path: &Path) {
        self.pins().entry(path.to_path_buf()).or_default().holders += 1;
    }

    /// Drop one hold on a resolved file. With `evict` set the file is removed
    /// once the last holder lets go.
    pub fn release(&self, resolved: &Resolved, evict: bool) {
        let mut pins = self.pins();
        let (last, doomed) = match pins.get_mut(&resolved.path) {
            Some(pin) => {
                pin.holders = pin.holders.saturating_sub(1);
                pin.evict |= evict;
                (pin.holders == 0, pin.evict)
            }
            None => (true, evict),
        };

        if last {
            pins.remove(&resolved.path);
        } else if evict {
            log::debug!(
                "[cache] {} still in use, eviction deferred",
                resolved.path.display()
            );
        }

        // removed under the lock so a concurrent resolve never reports a hit
        // for a file about to disappear
        if last && doomed {
            evict_file(&resolved.path);
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Canonical cache location for a bucket/key pair.
    pub fn cache_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PipelineError> {
        let key = key.trim_start_matches('/');
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if bucket.contains('/') || bucket == ".." || escapes {
            return Err(PipelineError::InvalidReference(format!(
                "s3://{bucket}/{key} escapes the cache root"
            )));
        }

        Ok(self.root.join(bucket).join(relative))
    }

    /// Relative local paths are taken from the configured base directory.
    pub fn local_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.local_base.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Inverse of [`ContentCache::cache_path`].
    pub fn reference_for(&self, path: &Path) -> Option<ImageReference> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            });
        let bucket = parts.next()?;
        let key = parts.collect::<Vec<_>>().join("/");
        if key.is_empty() {
            return None;
        }
        Some(ImageReference::remote(bucket, key))
    }

    /// Resolve any reference to a local file path, downloading on a miss.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<Resolved, PipelineError> {
        match reference {
            ImageReference::Local(path) => {
                let path = self.local_path(path);
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => Ok(Resolved {
                        path,
                        fetched: false,
                    }),
                    _ => Err(PipelineError::NotFound(path)),
                }
            }
            ImageReference::Remote { bucket, key } => {
                if key.is_empty() {
                    return Err(PipelineError::InvalidReference(format!(
                        "{reference} has no object key"
                    )));
                }

                let local = self.cache_path(bucket, key)?;
                self.pin(&local);
                if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                    log::debug!("[cache] hit: {}", local.display());
                    return Ok(Resolved {
                        path: local,
                        fetched: false,
                    });
                }

                log::info!("[cache] download: {reference} -> {}", local.display());
                if let Err(e) = self.fetch(bucket, key, &local).await {
                    let unpinned = Resolved {
                        path: local,
                        fetched: false,
                    };
                    self.release(&unpinned, false);
                    return Err(e);
                }
                Ok(Resolved {
                    path: local,
                    fetched: true,
                })
            }
        }
    }

    /// List image objects under `prefix`. A listing failure (e.g. a missing
    /// bucket) is logged and yields an empty listing.
    pub async fn list_remote_folder(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ImageReference>, PipelineError> {
        let store = match self.buckets.bucket(bucket) {
            Ok(store) => store,
            Err(e) => {
                log::error!("[cache] bucket {bucket} unavailable: {e}");
                return Ok(vec![]);
            }
        };

        let prefix = prefix.trim_matches('/');
        let location = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));

        let listing: Result<Vec<_>, _> = store.list(location.as_ref()).try_collect().await;
        let objects = match listing {
            Ok(objects) => objects,
            Err(e) => {
                log::error!("[cache] failed to list s3://{bucket}/{prefix}: {e}");
                return Ok(vec![]);
            }
        };

        let mut refs: Vec<ImageReference> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| has_image_extension(key))
            .map(|key| ImageReference::remote(bucket, key))
            .collect();
        refs.sort();

        Ok(refs)
    }

    /// Mirror every image under `prefix` into the cache (or into `dest`, which
    /// then replaces `<cache_root>/<bucket>/<prefix>`). Already-present files
    /// are skipped; individual failures are logged and counted.
    pub async fn download_folder(
        &self,
        bucket: &str,
        prefix: &str,
        dest: Option<&Path>,
    ) -> Result<DownloadSummary, PipelineError> {
        let prefix = prefix.trim_matches('/');
        let dest_root = match dest {
            Some(dest) => dest.to_path_buf(),
            None => self.cache_path(bucket, prefix)?,
        };
        tokio::fs::create_dir_all(&dest_root).await?;

        let refs = self.list_remote_folder(bucket, prefix).await?;
        log::info!(
            "[cache] found {} image keys in s3://{bucket}/{prefix}",
            refs.len()
        );

        let mut summary = DownloadSummary {
            listed: refs.len(),
            ..Default::default()
        };

        let outcomes: Vec<Result<bool, PipelineError>> = futures::stream::iter(refs)
            .map(|reference| {
                let dest_root = dest_root.clone();
                async move {
                    let ImageReference::Remote { bucket, key } = &reference else {
                        return Ok(false);
                    };
                    let relative = key
                        .strip_prefix(prefix)
                        .unwrap_or(key)
                        .trim_start_matches('/');
                    let out = dest_root.join(relative);

                    if tokio::fs::try_exists(&out).await.unwrap_or(false) {
                        log::debug!("[cache] hit (skip): {}", out.display());
                        return Ok(false);
                    }

                    log::info!("[cache] download: {reference} -> {}", out.display());
                    self.fetch(bucket, key, &out).await.map(|_| true).map_err(|e| {
                        log::warn!("[cache] failed to download {reference}: {e}");
                        e
                    })
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(true) => summary.downloaded += 1,
                Ok(false) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
        }

        log::info!(
            "[cache] folder download complete: {} downloaded, {} cached, {} failed",
            summary.downloaded,
            summary.skipped,
            summary.failed
        );

        Ok(summary)
    }

    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), PipelineError> {
        let store = self.buckets.bucket(bucket)?;
        let location = ObjectPath::from(key);

        let transfer = async {
            let result = store.get(&location).await?;
            result.bytes().await
        };

        let bytes = tokio::time::timeout(self.download_timeout, transfer)
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: "download",
                secs: self.download_timeout.as_secs(),
            })?
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => {
                    PipelineError::remote(bucket, key, "object not found")
                }
                e => PipelineError::remote(bucket, key, e),
            })?;

        let dir = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || persist_atomically(&dir, &dest, &bytes)).await??;

        Ok(())
    }
}

/// Remove a cached file. Missing files are not an error.
fn evict_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(_) => log::debug!("[cache] evicted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[cache] failed to evict {}: {e}", path.display()),
    }
}

/// Write into a temp file in `dir`, then rename onto `dest`. The temp file is
/// removed on any failure.
fn persist_atomically(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), PipelineError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}
