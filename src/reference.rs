//! Logical image identity.
//!
//! An [`ImageReference`] is either a path on local disk or a bucket/key pair
//! in object storage. Its string form (`s3://<bucket>/<key>` or the path as
//! given) is what gets stored as a record's `source` and what the point id
//! is derived from.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::PipelineError;

pub const S3_SCHEME: &str = "s3://";

/// File extensions (lowercase) that qualify as images.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ImageReference {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl ImageReference {
    pub fn remote(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        ImageReference::Remote {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        ImageReference::Local(path.into())
    }

    /// Stable point id for the vector store.
    ///
    /// UUIDv5 over the serialized reference, so re-indexing the same logical
    /// source overwrites its record instead of adding a second one.
    pub fn point_id(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.to_string().as_bytes()).to_string()
    }
}

impl Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageReference::Local(path) => write!(f, "{}", path.display()),
            ImageReference::Remote { bucket, key } => write!(f, "{S3_SCHEME}{bucket}/{key}"),
        }
    }
}

impl FromStr for ImageReference {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PipelineError::InvalidReference("empty reference".to_string()));
        }

        let Some(rest) = s.strip_prefix(S3_SCHEME) else {
            return Ok(ImageReference::Local(PathBuf::from(s)));
        };

        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(PipelineError::InvalidReference(format!(
                "missing bucket in {s}"
            )));
        }

        Ok(ImageReference::remote(bucket, key))
    }
}

impl TryFrom<String> for ImageReference {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ImageReference> for String {
    fn from(value: ImageReference) -> Self {
        value.to_string()
    }
}

/// Case-insensitive check against [`IMAGE_EXTENSIONS`].
pub fn has_image_extension(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
