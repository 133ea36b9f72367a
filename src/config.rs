use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_CACHE_DIR: &str = "./datasets";
const DEFAULT_LOCAL_BASE_DIR: &str = "./";
const DEFAULT_PUBLIC_URL_TEMPLATE: &str = "https://storage.yandexcloud.net/{bucket}/{key}";
const DEFAULT_S3_ENDPOINT: &str = "https://storage.yandexcloud.net";
const DEFAULT_S3_REGION: &str = "ru-central1";
const DEFAULT_QDRANT_URL: &str = "http://qdrant:6334";
const DEFAULT_COLLECTION: &str = "geo_embeddings";
const DEFAULT_VECTOR_SIZE: usize = 512;
const DEFAULT_EMBEDDING_MODEL: &str = "clip-vit-b-32";
/// Overlap percentage above which a frame counts as redundant.
const DEFAULT_DEDUP_THRESHOLD: f64 = 60.0;
const DEFAULT_DEDUP_RESIZE: u32 = 1024;
const DEFAULT_DOWNLOAD_WORKERS: usize = 8;
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_JOB_MAX_CONCURRENT: usize = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_s3_endpoint")]
    pub endpoint: Option<String>,
    #[serde(default = "default_s3_region")]
    pub region: String,
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: default_s3_endpoint(),
            region: default_s3_region(),
            allow_http: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process index persisted to a single file.
    Local,
    Qdrant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_vector_size")]
    pub vector_size: usize,
    /// File used by the local backend, relative to the base directory.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            qdrant_url: default_qdrant_url(),
            collection: default_collection(),
            vector_size: default_vector_size(),
            path: default_store_path(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub text_model: String,
    #[serde(default = "default_embedding_model")]
    pub image_model: String,
    /// Where model weights are downloaded to.
    #[serde(default = "default_model_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            text_model: default_embedding_model(),
            image_model: default_embedding_model(),
            cache_dir: default_model_cache_dir(),
            batch_size: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dedup_threshold")]
    pub threshold: f64,
    #[serde(default = "default_dedup_resize")]
    pub resize: u32,
    /// Homography matcher endpoint. Dedup is skipped when unset.
    #[serde(default)]
    pub matcher_url: Option<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_DEDUP_THRESHOLD,
            resize: DEFAULT_DEDUP_RESIZE,
            matcher_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_download_secs")]
    pub download_secs: u64,
    #[serde(default = "default_embed_secs")]
    pub embed_secs: u64,
    #[serde(default = "default_store_secs")]
    pub store_secs: u64,
    #[serde(default = "default_matcher_secs")]
    pub matcher_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download_secs: default_download_secs(),
            embed_secs: default_embed_secs(),
            store_secs: default_store_secs(),
            matcher_secs: default_matcher_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn embed(&self) -> Duration {
        Duration::from_secs(self.embed_secs)
    }

    pub fn store(&self) -> Duration {
        Duration::from_secs(self.store_secs)
    }

    pub fn matcher(&self) -> Duration {
        Duration::from_secs(self.matcher_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root under which remote objects are mirrored as `<bucket>/<key>`.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Local sources under this prefix are displayed relative to it.
    #[serde(default = "default_local_base_dir")]
    pub local_base_dir: PathBuf,
    #[serde(default = "default_public_url_template")]
    pub public_url_template: String,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_job_max_concurrent")]
    pub job_max_concurrent: usize,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            local_base_dir: default_local_base_dir(),
            public_url_template: default_public_url_template(),
            s3: S3Config::default(),
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            dedup: DedupConfig::default(),
            download_workers: default_download_workers(),
            default_batch_size: default_batch_size(),
            timeouts: TimeoutConfig::default(),
            job_max_concurrent: default_job_max_concurrent(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_local_base_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCAL_BASE_DIR)
}

fn default_public_url_template() -> String {
    DEFAULT_PUBLIC_URL_TEMPLATE.to_string()
}

fn default_s3_endpoint() -> Option<String> {
    Some(DEFAULT_S3_ENDPOINT.to_string())
}

fn default_s3_region() -> String {
    DEFAULT_S3_REGION.to_string()
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Qdrant
}

fn default_qdrant_url() -> String {
    DEFAULT_QDRANT_URL.to_string()
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_vector_size() -> usize {
    DEFAULT_VECTOR_SIZE
}

fn default_store_path() -> PathBuf {
    PathBuf::from("vectors.bin")
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_model_cache_dir() -> PathBuf {
    PathBuf::from("./weights")
}

fn default_dedup_threshold() -> f64 {
    DEFAULT_DEDUP_THRESHOLD
}

fn default_dedup_resize() -> u32 {
    DEFAULT_DEDUP_RESIZE
}

fn default_download_workers() -> usize {
    DEFAULT_DOWNLOAD_WORKERS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_job_max_concurrent() -> usize {
    DEFAULT_JOB_MAX_CONCURRENT
}

fn default_download_secs() -> u64 {
    120
}

fn default_embed_secs() -> u64 {
    600
}

fn default_store_secs() -> u64 {
    60
}

fn default_matcher_secs() -> u64 {
    60
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=100.0).contains(&self.dedup.threshold) {
            bail!(
                "dedup.threshold must be between 0 and 100, got {}",
                self.dedup.threshold
            );
        }

        if self.download_workers == 0 {
            bail!("download_workers must be greater than 0");
        }

        if self.default_batch_size == 0 {
            bail!("default_batch_size must be greater than 0");
        }

        if self.job_max_concurrent == 0 {
            bail!("job_max_concurrent must be greater than 0");
        }

        if self.store.vector_size == 0 {
            bail!("store.vector_size must be greater than 0");
        }

        let t = &self.timeouts;
        if t.download_secs == 0 || t.embed_secs == 0 || t.store_secs == 0 || t.matcher_secs == 0 {
            bail!("timeouts must be greater than 0");
        }

        Ok(())
    }

    /// Environment variables win over the file.
    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("DATASETS_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("QDRANT_URL") {
            self.store.qdrant_url = url;
        }
        if let Some(collection) = var("GEOSEARCH_COLLECTION") {
            self.store.collection = collection;
        }
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            write_atomic(&config_path, defaults.as_bytes())?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        write_atomic(&self.base_path.join(CONFIG_FILE), config_str.as_bytes())
    }

    /// Path of the local store file, resolved against the base directory.
    pub fn store_path(&self) -> PathBuf {
        self.base_path.join(&self.store.path)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.store.vector_size, 512);
        assert_eq!(config.download_workers, 8);
        assert_eq!(config.default_batch_size, 16);
        assert!((config.dedup.threshold - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "download_workers: 3\nstore:\n  backend: local\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.download_workers, 3);
        assert_eq!(config.store.backend, StoreBackend::Local);
        assert_eq!(config.store.collection, "geo_embeddings");
        assert_eq!(config.store_path(), tmp.path().join("vectors.bin"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|name| match name {
            "DATASETS_DIR" => Some("/mnt/cache".to_string()),
            "GEOSEARCH_COLLECTION" => Some("tiles".to_string()),
            _ => None,
        });

        assert_eq!(config.cache_dir, PathBuf::from("/mnt/cache"));
        assert_eq!(config.store.collection, "tiles");
        assert_eq!(config.store.qdrant_url, DEFAULT_QDRANT_URL);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.dedup.threshold = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.download_workers = 0;
        assert!(config.validate().is_err());
    }
}
