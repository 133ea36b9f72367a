//! Batch indexing: resolve, embed, attach metadata, upsert.

use futures::StreamExt;
use rayon::prelude::*;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ContentCache, Resolved};
use crate::config::TimeoutConfig;
use crate::embedding::{Embedder, EmbeddingError};
use crate::errors::PipelineError;
use crate::metadata::{ImageMetadata, MetadataSource};
use crate::reference::ImageReference;
use crate::scanner::FolderScanner;
use crate::store::{ImageRecord, RecordPayload, VectorStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub indexed: usize,
    pub failures: Vec<ItemFailure>,
}

/// A batch that failed as a whole (embedding or upsert).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    /// Zero-based batch number within the folder run.
    pub batch: usize,
    pub size: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FolderReport {
    pub total: usize,
    pub processed: usize,
    pub indexed: usize,
    pub failures: Vec<ItemFailure>,
    pub failed_batches: Vec<BatchFailure>,
    pub cancelled: bool,
}

pub struct BatchIndexer {
    cache: Arc<ContentCache>,
    metadata: Arc<dyn MetadataSource>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    scanner: Arc<FolderScanner>,
    timeouts: TimeoutConfig,
}

async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PipelineError::Timeout {
            operation,
            secs: limit.as_secs(),
        })?
}

impl BatchIndexer {
    pub fn new(
        cache: Arc<ContentCache>,
        metadata: Arc<dyn MetadataSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        scanner: Arc<FolderScanner>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            cache,
            metadata,
            embedder,
            store,
            scanner,
            timeouts,
        }
    }

    async fn embed_images(&self, paths: Vec<PathBuf>) -> Result<Vec<Vec<f32>>, PipelineError> {
        let expected = paths.len();
        let embedder = self.embedder.clone();
        let vectors = with_timeout("embedding", self.timeouts.embed(), async move {
            let vectors = tokio::task::spawn_blocking(move || embedder.encode_images(&paths)).await??;
            Ok(vectors)
        })
        .await?;

        if vectors.len() != expected {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "{expected} images in, {} vectors out",
                vectors.len()
            ))
            .into());
        }
        Ok(vectors)
    }

    async fn extract_metadata(&self, paths: Vec<PathBuf>) -> Result<Vec<ImageMetadata>, PipelineError> {
        let metadata = self.metadata.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            paths
                .par_iter()
                .map(|path| metadata.extract(path))
                .collect::<Vec<_>>()
        })
        .await?;
        Ok(extracted)
    }

    async fn upsert(&self, records: Vec<ImageRecord>) -> Result<(), PipelineError> {
        let store = self.store.clone();
        with_timeout("vector upsert", self.timeouts.store(), async move {
            store.upsert(records).await.map_err(PipelineError::from)
        })
        .await
    }

    /// Let go of resolved files, evicting the ones this call downloaded.
    fn cleanup(&self, resolved: &[(ImageReference, Resolved)]) {
        for (_, item) in resolved {
            self.cache.release(item, item.fetched);
        }
    }

    /// Index every reference that resolves. Per-reference resolution
    /// failures are reported, not fatal. Embedding and upsert are
    /// all-or-nothing for the batch.
    pub async fn index_batch(&self, refs: &[ImageReference]) -> Result<BatchReport, PipelineError> {
        let outcomes: Vec<(ImageReference, Result<Resolved, PipelineError>)> =
            futures::stream::iter(refs.iter().cloned())
                .map(|reference| async move {
                    let outcome = self.cache.resolve(&reference).await;
                    (reference, outcome)
                })
                .buffered(self.cache.workers())
                .collect()
                .await;

        let mut report = BatchReport::default();
        let mut resolved = Vec::with_capacity(outcomes.len());
        for (reference, outcome) in outcomes {
            match outcome {
                Ok(item) => resolved.push((reference, item)),
                Err(e) => {
                    log::warn!("[index] skipping {reference}: {e}");
                    report.failures.push(ItemFailure {
                        reference: reference.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if resolved.is_empty() {
            return Ok(report);
        }

        let paths: Vec<PathBuf> = resolved.iter().map(|(_, item)| item.path.clone()).collect();

        let embedded = self.embed_images(paths.clone()).await;
        let metadata = if embedded.is_ok() {
            self.extract_metadata(paths).await
        } else {
            Ok(vec![])
        };
        // metadata is read before fetched files are evicted
        self.cleanup(&resolved);

        let vectors = embedded?;
        let metadata = metadata?;

        let records: Vec<ImageRecord> = resolved
            .iter()
            .zip(vectors)
            .zip(metadata)
            .map(|(((reference, _), vector), meta)| ImageRecord {
                id: reference.point_id(),
                vector,
                payload: RecordPayload::new(reference.to_string(), &meta),
            })
            .collect();

        let count = records.len();
        self.upsert(records).await?;
        report.indexed = count;

        log::info!(
            "[index] batch done: {} indexed, {} failed",
            report.indexed,
            report.failures.len()
        );
        Ok(report)
    }

    /// Index one image, returning its point id.
    pub async fn index_single(&self, reference: &ImageReference) -> Result<String, PipelineError> {
        let resolved = self.cache.resolve(reference).await?;
        let item = [(reference.clone(), resolved.clone())];

        let metadata = self.extract_metadata(vec![resolved.path.clone()]).await;
        let embedded = self.embed_images(vec![resolved.path.clone()]).await;
        self.cleanup(&item);

        let meta = metadata?.into_iter().next().unwrap_or_default();
        let vector = embedded?.into_iter().next().ok_or_else(|| {
            PipelineError::from(EmbeddingError::EmbeddingFailed(
                "no embedding returned".to_string(),
            ))
        })?;

        let id = reference.point_id();
        self.upsert(vec![ImageRecord {
            id: id.clone(),
            vector,
            payload: RecordPayload::new(reference.to_string(), &meta),
        }])
        .await?;

        log::info!("[index] indexed {reference} as {id}");
        Ok(id)
    }

    /// Scan `root` and index survivors in sequential batches.
    ///
    /// `cancel` is checked before each batch; `progress` receives
    /// `(processed, total)` after each one. A failed batch is recorded and
    /// the run continues.
    pub async fn index_folder<F>(
        &self,
        root: &ImageReference,
        batch_size: usize,
        cancel: &AtomicBool,
        mut progress: F,
    ) -> Result<FolderReport, PipelineError>
    where
        F: FnMut(usize, usize) + Send,
    {
        log::info!("[index] scanning {root}");
        let refs = self.scanner.scan(root).await?;

        let mut report = FolderReport {
            total: refs.len(),
            ..Default::default()
        };
        if refs.is_empty() {
            log::warn!("[index] no images to index under {root}");
            return Ok(report);
        }

        let batch_size = batch_size.max(1);
        let batches = refs.len().div_ceil(batch_size);
        log::info!("[index] {} images in {batches} batches", refs.len());
        progress(0, report.total);

        for (n, batch) in refs.chunks(batch_size).enumerate() {
            if cancel.load(Ordering::SeqCst) {
                log::info!("[index] cancelled before batch {}/{batches}", n + 1);
                report.cancelled = true;
                break;
            }

            log::info!("[index] batch {}/{batches}: {} images", n + 1, batch.len());
            match self.index_batch(batch).await {
                Ok(batch_report) => {
                    report.indexed += batch_report.indexed;
                    report.failures.extend(batch_report.failures);
                }
                Err(e) => {
                    log::error!("[index] batch {}/{batches} failed: {e}", n + 1);
                    report.failed_batches.push(BatchFailure {
                        batch: n,
                        size: batch.len(),
                        reason: e.to_string(),
                    });
                }
            }

            report.processed += batch.len();
            progress(report.processed, report.total);
        }

        log::info!(
            "[index] folder {root} done: {}/{} indexed, {} failed items, {} failed batches",
            report.indexed,
            report.total,
            report.failures.len(),
            report.failed_batches.len()
        );
        Ok(report)
    }
}
