//! Recursive discovery of images under a folder reference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::cache::ContentCache;
use crate::dedup::OverlapDeduplicator;
use crate::errors::PipelineError;
use crate::reference::{has_image_extension, ImageReference};

pub struct FolderScanner {
    cache: Arc<ContentCache>,
    dedup: Option<Arc<OverlapDeduplicator>>,
}

impl FolderScanner {
    pub fn new(cache: Arc<ContentCache>, dedup: Option<Arc<OverlapDeduplicator>>) -> Self {
        Self { cache, dedup }
    }

    /// Survivors under `root`, sorted. Remote roots are mirrored into the
    /// cache first and walked there; their survivors map back to remote
    /// references.
    pub async fn scan(&self, root: &ImageReference) -> Result<Vec<ImageReference>, PipelineError> {
        match root {
            ImageReference::Local(path) => {
                let dir = self.cache.local_path(path);
                if !tokio::fs::metadata(&dir)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
                {
                    return Err(PipelineError::NotFound(dir));
                }

                let survivors = self.walk(dir).await?;
                Ok(survivors.into_iter().map(ImageReference::Local).collect())
            }
            ImageReference::Remote { bucket, key } => {
                self.cache.download_folder(bucket, key, None).await?;
                let dir = self.cache.cache_path(bucket, key.trim_matches('/'))?;

                let survivors = self.walk(dir).await?;
                Ok(survivors
                    .into_iter()
                    .filter_map(|path| {
                        let reference = self.cache.reference_for(&path);
                        if reference.is_none() {
                            log::warn!("[scan] {} is outside the cache", path.display());
                        }
                        reference
                    })
                    .collect())
            }
        }
    }

    async fn walk(&self, dir: PathBuf) -> Result<Vec<PathBuf>, PipelineError> {
        let dedup = self.dedup.clone();
        let survivors =
            tokio::task::spawn_blocking(move || walk_and_dedup(&dir, dedup.as_deref())).await?;
        Ok(survivors)
    }
}

/// Qualifying files under `dir`, grouped by parent directory, each group
/// sorted by name.
fn image_directories(dir: &Path) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let mut groups: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[scan] skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_image_extension(entry.path()) {
            continue;
        }

        let parent = entry
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        groups
            .entry(parent)
            .or_default()
            .push(entry.into_path());
    }

    for files in groups.values_mut() {
        files.sort();
    }
    groups
}

fn walk_and_dedup(dir: &Path, dedup: Option<&OverlapDeduplicator>) -> Vec<PathBuf> {
    let mut survivors = Vec::new();

    for (folder, files) in image_directories(dir) {
        match dedup {
            Some(dedup) if files.len() >= 2 => {
                log::info!(
                    "[scan] deduplicating {} ({} images, threshold {}%)",
                    folder.display(),
                    files.len(),
                    dedup.threshold()
                );
                survivors.extend(dedup.filter_folder(&files));
            }
            _ => survivors.extend(files),
        }
    }

    survivors.sort();
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StaticBuckets;
    use crate::tests::fakes::{touch_all, FakeMatcher};
    use object_store::{memory::InMemory, path::Path as ObjectPath, ObjectStore, PutPayload};
    use std::time::Duration;
    use tempfile::TempDir;

    fn cache(root: &Path, buckets: StaticBuckets) -> Arc<ContentCache> {
        Arc::new(ContentCache::new(
            root.join("cache"),
            root.to_path_buf(),
            Arc::new(buckets),
            4,
            Duration::from_secs(5),
        ))
    }

    fn dedup(matcher: FakeMatcher) -> Option<Arc<OverlapDeduplicator>> {
        Some(Arc::new(OverlapDeduplicator::new(Arc::new(matcher), 60.0, 1024)))
    }

    fn names(refs: &[ImageReference], root: &Path) -> Vec<String> {
        refs.iter()
            .map(|r| match r {
                ImageReference::Local(p) => p
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/"),
                other => other.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_missing_local_root() {
        let tmp = TempDir::new().unwrap();
        let scanner = FolderScanner::new(cache(tmp.path(), StaticBuckets::new()), None);

        let result = scanner
            .scan(&ImageReference::local(tmp.path().join("missing")))
            .await;
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_filters_extensions_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        touch_all(
            &root,
            &["b.JPG", "a.png", "notes.txt", "sub/z.tif", "sub/y.bmp", "sub/deeper/x.jpeg"],
        );

        let scanner = FolderScanner::new(cache(tmp.path(), StaticBuckets::new()), None);
        let refs = scanner.scan(&ImageReference::local(&root)).await.unwrap();

        assert_eq!(
            names(&refs, &root),
            vec!["a.png", "b.JPG", "sub/deeper/x.jpeg", "sub/y.bmp", "sub/z.tif"]
        );
    }

    #[tokio::test]
    async fn test_dedup_applies_per_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        touch_all(&root, &["a.jpg", "b.jpg", "c.jpg", "solo/only.jpg", "pair/p.jpg", "pair/q.jpg"]);

        // everything overlaps fully except the first image of each directory
        let scanner = FolderScanner::new(
            cache(tmp.path(), StaticBuckets::new()),
            dedup(FakeMatcher::new(100.0)),
        );
        let refs = scanner.scan(&ImageReference::local(&root)).await.unwrap();

        assert_eq!(names(&refs, &root), vec!["a.jpg", "pair/p.jpg", "solo/only.jpg"]);
    }

    #[tokio::test]
    async fn test_zero_overlap_keeps_all() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        touch_all(&root, &["1.jpg", "2.jpg", "3.jpg"]);

        let scanner = FolderScanner::new(
            cache(tmp.path(), StaticBuckets::new()),
            dedup(FakeMatcher::new(0.0)),
        );
        let refs = scanner.scan(&ImageReference::local(&root)).await.unwrap();
        assert_eq!(refs.len(), 3);
    }

    #[tokio::test]
    async fn test_rescan_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("data");
        touch_all(&root, &["c.jpg", "a.jpg", "b/b.jpg"]);

        let scanner = FolderScanner::new(cache(tmp.path(), StaticBuckets::new()), None);
        let first = scanner.scan(&ImageReference::local(&root)).await.unwrap();
        let second = scanner.scan(&ImageReference::local(&root)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_remote_root_maps_back_to_remote_refs() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(InMemory::new());
        for key in ["flight/1.jpg", "flight/2.jpg", "flight/readme.md", "other/9.jpg"] {
            remote
                .put(&ObjectPath::from(key), PutPayload::from(key.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let cache = cache(tmp.path(), StaticBuckets::new().with_bucket("drone", remote));
        let scanner = FolderScanner::new(cache.clone(), None);
        let refs = scanner
            .scan(&"s3://drone/flight".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(
            refs,
            vec![
                ImageReference::remote("drone", "flight/1.jpg"),
                ImageReference::remote("drone", "flight/2.jpg"),
            ]
        );
        assert!(cache.root().join("drone/flight/1.jpg").exists());
        assert!(!cache.root().join("drone/other").exists());
    }
}
