//! CLIP embeddings for text queries and images.
//!
//! Text and image encoders share one vector space, so a text query can be
//! scored directly against indexed images.
//! - Both encoders load lazily on first use
//! - Outputs are L2-normalised

use fastembed::{ImageEmbedding, ImageInitOptions, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::EmbeddingConfig;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

pub trait Embedder: Send + Sync {
    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// One vector per path, in input order.
    fn encode_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn dimensions(&self) -> usize;
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// fastembed-backed CLIP encoder pair.
pub struct ClipEmbedder {
    text_model: fastembed::EmbeddingModel,
    image_model: fastembed::ImageEmbeddingModel,
    cache_dir: PathBuf,
    batch_size: Option<usize>,
    dimensions: usize,
    /// `Mutex<Option<_>>` because fastembed's `embed` needs `&mut self`.
    text: Mutex<Option<TextEmbedding>>,
    image: Mutex<Option<ImageEmbedding>>,
}

impl ClipEmbedder {
    pub fn new(config: &EmbeddingConfig, dimensions: usize) -> Result<Self, EmbeddingError> {
        Ok(Self {
            text_model: parse_text_model(&config.text_model)?,
            image_model: parse_image_model(&config.image_model)?,
            cache_dir: config.cache_dir.clone(),
            batch_size: config.batch_size,
            dimensions,
            text: Mutex::new(None),
            image: Mutex::new(None),
        })
    }

    fn models_dir(&self) -> Result<PathBuf, EmbeddingError> {
        let dir = self.cache_dir.join("models");
        std::fs::create_dir_all(&dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;
        Ok(dir)
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        match vectors.iter().find(|v| v.len() != self.dimensions) {
            Some(v) => Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {}-dim vectors, model produced {}",
                self.dimensions,
                v.len()
            ))),
            None => Ok(()),
        }
    }
}

impl Embedder for ClipEmbedder {
    fn encode_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self.text.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            log::info!("loading text model {:?}", self.text_model);
            let options = InitOptions::new(self.text_model.clone())
                .with_cache_dir(self.models_dir()?)
                .with_show_download_progress(true);
            let model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            *guard = Some(model);
        }

        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("text model not loaded".to_string()))?;

        let vectors = model
            .embed(texts.to_vec(), self.batch_size)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let vectors: Vec<Vec<f32>> = vectors.into_iter().map(l2_normalize).collect();
        self.check_dimensions(&vectors)?;
        Ok(vectors)
    }

    fn encode_images(&self, paths: &[PathBuf]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if paths.is_empty() {
            return Ok(vec![]);
        }

        let mut guard = self.image.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        if guard.is_none() {
            log::info!("loading image model {:?}", self.image_model);
            let options = ImageInitOptions::new(self.image_model.clone())
                .with_cache_dir(self.models_dir()?)
                .with_show_download_progress(true);
            let model = ImageEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            *guard = Some(model);
        }

        let model = guard
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("image model not loaded".to_string()))?;

        let vectors = model
            .embed(paths.to_vec(), self.batch_size)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if vectors.len() != paths.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "{} images in, {} vectors out",
                paths.len(),
                vectors.len()
            )));
        }

        let vectors: Vec<Vec<f32>> = vectors.into_iter().map(l2_normalize).collect();
        self.check_dimensions(&vectors)?;
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn parse_text_model(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::EmbeddingModel::ClipVitB32),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown text model: {}. Supported models: clip-vit-b-32",
            name
        ))),
    }
}

fn parse_image_model(name: &str) -> Result<fastembed::ImageEmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
        "resnet50" | "resnet-50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown image model: {}. Supported models: clip-vit-b-32, resnet50",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> EmbeddingConfig {
        EmbeddingConfig {
            cache_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_invalid_model_name() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path());
        cfg.text_model = "not-a-model".to_string();

        let result = ClipEmbedder::new(&cfg, 512);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_empty_input_skips_model_load() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = ClipEmbedder::new(&config(tmp.path()), 512).unwrap();
        assert!(embedder.encode_texts(&[]).unwrap().is_empty());
        assert!(embedder.encode_images(&[]).unwrap().is_empty());
        assert!(!tmp.path().join("models").exists());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_text_and_image_share_space() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = ClipEmbedder::new(&config(tmp.path()), 512).unwrap();

        let vectors = embedder
            .encode_texts(&["a river delta".to_string()])
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 512);

        let norm: f32 = vectors[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
