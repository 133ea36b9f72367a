//! Wiring of the pipeline components from configuration.

use anyhow::Context;
use std::sync::Arc;

use crate::cache::{BucketResolver, ContentCache, S3Buckets};
use crate::config::{Config, StoreBackend};
use crate::dedup::OverlapDeduplicator;
use crate::embedding::{ClipEmbedder, Embedder};
use crate::indexer::BatchIndexer;
use crate::jobs::JobRunner;
use crate::matcher::{HomographyEstimator, HttpMatcher};
use crate::metadata::{ExifMetadata, MetadataSource};
use crate::scanner::FolderScanner;
use crate::search::{DisplayUrls, SearchEngine};
use crate::store::{LocalStore, QdrantStore, VectorStore};

/// Collaborators the pipeline is built around.
pub struct Collaborators {
    pub buckets: Arc<dyn BucketResolver>,
    pub metadata: Arc<dyn MetadataSource>,
    pub embedder: Arc<dyn Embedder>,
    pub matcher: Option<Arc<dyn HomographyEstimator>>,
    pub store: Arc<dyn VectorStore>,
}

impl Collaborators {
    /// Production adapters as configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = ClipEmbedder::new(&config.embedding, config.store.vector_size)
            .context("failed to set up embedding model")?;

        let matcher: Option<Arc<dyn HomographyEstimator>> =
            match (&config.dedup.matcher_url, config.dedup.enabled) {
                (Some(url), true) => Some(Arc::new(
                    HttpMatcher::new(url, config.timeouts.matcher())
                        .context("failed to set up matcher client")?,
                )),
                (None, true) => {
                    log::warn!("dedup enabled but no matcher_url configured; folders are not deduplicated");
                    None
                }
                (_, false) => None,
            };

        let store: Arc<dyn VectorStore> = match config.store.backend {
            StoreBackend::Qdrant => Arc::new(
                QdrantStore::connect(
                    &config.store.qdrant_url,
                    &config.store.collection,
                    config.store.vector_size,
                )
                .context("failed to create qdrant client")?,
            ),
            StoreBackend::Local => Arc::new(LocalStore::open(
                config.store_path(),
                &config.store.collection,
                config.store.vector_size,
            )),
        };

        Ok(Self {
            buckets: Arc::new(S3Buckets::new(config.s3.clone())),
            metadata: Arc::new(ExifMetadata::new()),
            embedder: Arc::new(embedder),
            matcher,
            store,
        })
    }
}

pub struct App {
    pub config: Config,
    pub cache: Arc<ContentCache>,
    pub scanner: Arc<FolderScanner>,
    pub indexer: Arc<BatchIndexer>,
    pub search: Arc<SearchEngine>,
    pub store: Arc<dyn VectorStore>,
    pub jobs: Arc<JobRunner>,
}

impl App {
    pub fn with_collaborators(config: Config, parts: Collaborators) -> Self {
        if parts.embedder.dimensions() != config.store.vector_size {
            log::warn!(
                "embedder produces {} dimensions but store.vector_size is {}",
                parts.embedder.dimensions(),
                config.store.vector_size
            );
        }

        let cache = Arc::new(ContentCache::new(
            config.cache_dir.clone(),
            config.local_base_dir.clone(),
            parts.buckets,
            config.download_workers,
            config.timeouts.download(),
        ));

        let dedup = parts.matcher.map(|matcher| {
            Arc::new(OverlapDeduplicator::new(
                matcher,
                config.dedup.threshold,
                config.dedup.resize,
            ))
        });
        let scanner = Arc::new(FolderScanner::new(cache.clone(), dedup));

        let indexer = Arc::new(BatchIndexer::new(
            cache.clone(),
            parts.metadata,
            parts.embedder.clone(),
            parts.store.clone(),
            scanner.clone(),
            config.timeouts.clone(),
        ));

        let search = Arc::new(SearchEngine::new(
            parts.embedder,
            parts.store.clone(),
            cache.clone(),
            DisplayUrls::new(config.local_base_dir.clone(), &config.public_url_template),
            config.timeouts.embed(),
            config.timeouts.store(),
        ));

        let jobs = Arc::new(JobRunner::new(indexer.clone(), config.job_max_concurrent));

        Self {
            config,
            cache,
            scanner,
            indexer,
            search,
            store: parts.store,
            jobs,
        }
    }

    /// Build from configuration and make sure the collection exists.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let parts = Collaborators::from_config(&config)?;
        let app = Self::with_collaborators(config, parts);
        app.ensure_collection().await?;
        Ok(app)
    }

    pub async fn ensure_collection(&self) -> anyhow::Result<()> {
        let limit = self.config.timeouts.store();
        tokio::time::timeout(limit, self.store.ensure_collection())
            .await
            .with_context(|| format!("collection bootstrap timed out after {limit:?}"))?
            .with_context(|| format!("failed to ensure collection {}", self.config.store.collection))
    }
}
