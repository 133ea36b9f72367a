
use std::path::PathBuf;
use std::sync::Arc;

use crate::app::{App, Collaborators};
use crate::cache::StaticBuckets;
use crate::config::Config;
use crate::store::LocalStore;
use fakes::{FakeEmbedder, FakeMetadata};

pub const DIMS: usize = 16;

/// An App over in-process fakes, rooted in its own temp directory so
/// parallel tests never collide.
pub struct TestApp {
    pub app: App,
    pub embedder: Arc<FakeEmbedder>,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    /// Local image folder, `<tmp>/data`.
    pub fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn cached(&self, bucket: &str, key: &str) -> PathBuf {
        self.dir.path().join("cache").join(bucket).join(key)
    }
}

pub async fn create_app_with(
    embedder: FakeEmbedder,
    metadata: FakeMetadata,
    buckets: StaticBuckets,
) -> TestApp {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = Config::load_with(dir.path()).expect("failed to load config");
    config.cache_dir = dir.path().join("cache");
    config.local_base_dir = dir.path().to_path_buf();
    config.public_url_template = "https://storage.example.net/{bucket}/{key}".to_string();
    config.default_batch_size = 2;

    let embedder = Arc::new(embedder);
    let parts = Collaborators {
        buckets: Arc::new(buckets),
        metadata: Arc::new(metadata),
        embedder: embedder.clone(),
        matcher: None,
        store: Arc::new(LocalStore::in_memory(&config.store.collection, DIMS)),
    };

    let app = App::with_collaborators(config, parts);
    app.ensure_collection()
        .await
        .expect("failed to create collection");

    TestApp { app, embedder, dir }
}

pub async fn create_app() -> TestApp {
    create_app_with(
        FakeEmbedder::new(DIMS),
        FakeMetadata::default(),
        StaticBuckets::new(),
    )
    .await
}
