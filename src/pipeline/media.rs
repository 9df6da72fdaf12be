//! Media fetching: pulls album/post attachments into local storage
//!
//! A post only ever references media that has already been written to
//! `media_dir`. Remote references (`http://`, `https://`) are downloaded with
//! reqwest. Local ones (`file://` or a plain path) are copied in only when a
//! local root is configured and the resolved path lies inside it; otherwise
//! they are rejected as `Unsupported`.

use super::types::{MediaKind, MediaReference};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Http(String),
    Io(String),
    Unsupported(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(err.to_string())
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Http(e) => write!(f, "HTTP error: {}", e),
            FetchError::Io(e) => write!(f, "IO error: {}", e),
            FetchError::Unsupported(e) => write!(f, "Unsupported media reference: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Retrieve the referenced payload, persist it, and return its local URL
    async fn fetch_and_persist(&self, media: &MediaReference) -> Result<String, FetchError>;
}

/// Downloads into `<media_dir>/photos/` and `<media_dir>/videos/`
pub struct HttpMediaFetcher {
    client: reqwest::Client,
    media_dir: PathBuf,
    local_root: Option<PathBuf>,
}

impl HttpMediaFetcher {
    pub fn new(media_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            media_dir: media_dir.into(),
            local_root: None,
        })
    }

    /// Allow copying local files that resolve (after symlinks and `..`) to a
    /// path under `root`
    pub fn with_local_root(mut self, root: impl AsRef<Path>) -> Result<Self, FetchError> {
        self.local_root = Some(std::fs::canonicalize(root)?);
        Ok(self)
    }

    /// Canonical path of an allowed local source, or `Unsupported`
    async fn resolve_local(&self, source: &str) -> Result<PathBuf, FetchError> {
        let Some(root) = &self.local_root else {
            return Err(FetchError::Unsupported(format!(
                "local media disabled: {}",
                source
            )));
        };

        let resolved = tokio::fs::canonicalize(source).await?;
        if !resolved.starts_with(root) {
            return Err(FetchError::Unsupported(format!(
                "{} is outside {}",
                source,
                root.display()
            )));
        }
        Ok(resolved)
    }

    /// Unique destination path, keeping the source extension when it has one
    fn destination(&self, media: &MediaReference) -> PathBuf {
        let extension = file_extension(&media.source_url).unwrap_or(match media.kind {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
        });
        let suffix: u32 = rand::thread_rng().gen();
        let file_name = format!(
            "{}_{:08x}.{}",
            Utc::now().timestamp_millis(),
            suffix,
            extension
        );

        self.media_dir.join(media.kind.dir_name()).join(file_name)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch_and_persist(&self, media: &MediaReference) -> Result<String, FetchError> {
        let url = media.source_url.trim();
        if url.is_empty() {
            return Err(FetchError::Unsupported("empty source_url".to_string()));
        }

        let remote = url.starts_with("http://") || url.starts_with("https://");
        let local_source = if remote {
            None
        } else if url.contains("://") && !url.starts_with("file://") {
            return Err(FetchError::Unsupported(url.to_string()));
        } else {
            let source = url.strip_prefix("file://").unwrap_or(url);
            Some(self.resolve_local(source).await?)
        };

        let dest = self.destination(media);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match local_source {
            Some(source) => {
                tokio::fs::copy(&source, &dest).await?;
            }
            None => self.download(url, &dest).await?,
        }

        log::debug!("📥 Stored {:?} {} → {}", media.kind, url, dest.display());
        Ok(dest.to_string_lossy().to_string())
    }
}

/// Extension of the last path segment, ignoring query string and fragment
fn file_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_extension() {
        assert_eq!(file_extension("https://cdn.example/a/photo.png"), Some("png"));
        assert_eq!(file_extension("https://cdn.example/v.mp4?sig=abc#t=1"), Some("mp4"));
        assert_eq!(file_extension("https://cdn.example/noext"), None);
        assert_eq!(file_extension("https://cdn.example/dir.d/file"), None);
    }

    #[tokio::test]
    async fn test_local_file_copied_into_kind_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let uploads = temp_dir.path().join("uploads");
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        let source = uploads.join("upload.png");
        tokio::fs::write(&source, b"png-bytes").await.unwrap();

        let media_dir = temp_dir.path().join("media");
        let fetcher = HttpMediaFetcher::new(&media_dir, Duration::from_secs(5))
            .unwrap()
            .with_local_root(&uploads)
            .unwrap();

        let stored = fetcher
            .fetch_and_persist(&MediaReference::photo(format!("file://{}", source.display())))
            .await
            .unwrap();

        let stored_path = PathBuf::from(&stored);
        assert!(stored_path.starts_with(media_dir.join("photos")));
        assert_eq!(stored_path.extension().and_then(|e| e.to_str()), Some("png"));
        assert_eq!(tokio::fs::read(&stored_path).await.unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_local_paths_rejected_without_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let media_dir = temp_dir.path().join("media");
        let fetcher = HttpMediaFetcher::new(&media_dir, Duration::from_secs(5)).unwrap();

        for source in ["/etc/passwd", "file:///etc/passwd"] {
            let result = fetcher.fetch_and_persist(&MediaReference::photo(source)).await;
            assert!(
                matches!(result, Err(FetchError::Unsupported(_))),
                "{} should be rejected, got {:?}",
                source,
                result
            );
        }
        assert!(!media_dir.join("photos").exists());
    }

    #[tokio::test]
    async fn test_local_paths_outside_root_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let uploads = temp_dir.path().join("uploads");
        tokio::fs::create_dir_all(&uploads).await.unwrap();
        let secret = temp_dir.path().join("secret.txt");
        tokio::fs::write(&secret, b"keep out").await.unwrap();

        let fetcher = HttpMediaFetcher::new(temp_dir.path().join("media"), Duration::from_secs(5))
            .unwrap()
            .with_local_root(&uploads)
            .unwrap();

        let escapes = [
            secret.display().to_string(),
            format!("{}/../secret.txt", uploads.display()),
            "/etc/passwd".to_string(),
        ];
        for source in escapes {
            let result = fetcher.fetch_and_persist(&MediaReference::photo(source.clone())).await;
            assert!(
                matches!(result, Err(FetchError::Unsupported(_))),
                "{} should be rejected, got {:?}",
                source,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_missing_local_file_is_io_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fetcher = HttpMediaFetcher::new(temp_dir.path(), Duration::from_secs(5))
            .unwrap()
            .with_local_root(temp_dir.path())
            .unwrap();

        let missing = temp_dir.path().join("clip.mp4");
        let result = fetcher
            .fetch_and_persist(&MediaReference::video(missing.display().to_string()))
            .await;
        assert!(matches!(result, Err(FetchError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_scheme_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fetcher = HttpMediaFetcher::new(temp_dir.path(), Duration::from_secs(5)).unwrap();

        let result = fetcher
            .fetch_and_persist(&MediaReference::photo("ftp://host/file.jpg"))
            .await;
        assert!(matches!(result, Err(FetchError::Unsupported(_))));
    }
}
