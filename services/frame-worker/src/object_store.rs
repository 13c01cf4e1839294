use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Errors that can occur while moving objects in and out of the store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Failed to download {key}: {message}")]
    Download { key: String, message: String },

    #[error("Failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Local I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Object store primitives used by the conversion pipeline
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download the object named `key` into `dest`
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError>;

    /// Upload every regular file of `local_dir` as `{key_prefix}/{file name}`.
    /// Returns the keys written.
    async fn upload_directory(
        &self,
        local_dir: &Path,
        key_prefix: &str,
    ) -> Result<Vec<String>, StorageError>;
}

/// S3 implementation of [`ObjectStore`]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    upload_concurrency: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store client
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
            upload_concurrency: config.upload_concurrency.max(1),
        }
    }

    /// Upload a single file
    async fn upload_file(&self, path: &Path, key: &str) -> Result<(), StorageError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type_for(path))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, dest), fields(bucket = %self.bucket))]
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Download {
                        key: key.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let io_err = |source| StorageError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut body = output.body;
        let mut bytes = 0usize;
        while let Some(chunk) = body.try_next().await.map_err(|e| StorageError::Download {
            key: key.to_string(),
            message: e.to_string(),
        })? {
            file.write_all(&chunk).await.map_err(io_err)?;
            bytes += chunk.len();
        }
        file.flush().await.map_err(io_err)?;

        debug!(key = %key, path = %dest.display(), size_bytes = bytes, "Object downloaded");
        Ok(())
    }

    #[instrument(skip(self, local_dir), fields(bucket = %self.bucket))]
    async fn upload_directory(
        &self,
        local_dir: &Path,
        key_prefix: &str,
    ) -> Result<Vec<String>, StorageError> {
        let plan = upload_plan(local_dir, key_prefix).await?;

        let keys = upload_in_order(plan, self.upload_concurrency, |path, key| async move {
            self.upload_file(&path, &key).await
        })
        .await?;

        metrics::counter!("frames.objects.uploaded").increment(keys.len() as u64);

        info!(
            prefix = %key_prefix,
            objects = keys.len(),
            "Directory uploaded"
        );

        Ok(keys)
    }
}

/// Pair every regular file directly inside `local_dir` with its object key,
/// ordered by file name
pub async fn upload_plan(
    local_dir: &Path,
    key_prefix: &str,
) -> Result<Vec<(PathBuf, String)>, StorageError> {
    let io_err = |source| StorageError::Io {
        path: local_dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(local_dir).await.map_err(io_err)?;
    let mut plan = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        if !entry.file_type().await.map_err(io_err)?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let key = object_key(key_prefix, &name);
        plan.push((entry.path(), key));
    }

    plan.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(plan)
}

/// Run `upload` over `plan` with at most `concurrency` requests in flight,
/// returning keys in plan order.
///
/// The first failure ends the upload: requests still in flight are dropped
/// and files after them are never attempted.
pub async fn upload_in_order<F, Fut>(
    plan: Vec<(PathBuf, String)>,
    concurrency: usize,
    upload: F,
) -> Result<Vec<String>, StorageError>
where
    F: Fn(PathBuf, String) -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    stream::iter(plan)
        .map(|(path, key)| {
            let request = upload(path, key.clone());
            async move { request.await.map(|()| key) }
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Keys `upload_plan` would produce, read synchronously for mock stores
#[cfg(test)]
pub(crate) fn planned_keys(local_dir: &Path, key_prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(local_dir)
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().unwrap().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
        .iter()
        .map(|name| object_key(key_prefix, name))
        .collect()
}

/// Object key of a file uploaded under `prefix`
pub fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", prefix, file_name)
    }
}

/// Get content type for an image file
fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::frame_file_name;
    use std::fs;
    use std::sync::{Arc, Mutex};

    const PREFIX: &str = "videos/clip1.mp4";

    fn frame_plan(count: u32) -> Vec<(PathBuf, String)> {
        (0..count)
            .map(|index| {
                let name = frame_file_name(index, "jpg");
                (PathBuf::from(&name), object_key(PREFIX, &name))
            })
            .collect()
    }

    #[test]
    fn test_object_key() {
        assert_eq!(
            object_key("videos/clip1.mp4", "00000.jpg"),
            "videos/clip1.mp4/00000.jpg"
        );
        assert_eq!(object_key("videos/", "00001.jpg"), "videos/00001.jpg");
        assert_eq!(object_key("", "00002.jpg"), "00002.jpg");
    }

    #[tokio::test]
    async fn test_upload_plan_covers_every_file_once() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00002.jpg", "00000.jpg", "00001.jpg"] {
            fs::write(dir.path().join(name), b"frame").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();

        let plan = upload_plan(dir.path(), PREFIX).await.unwrap();
        let keys: Vec<&str> = plan.iter().map(|(_, key)| key.as_str()).collect();

        assert_eq!(
            keys,
            vec![
                "videos/clip1.mp4/00000.jpg",
                "videos/clip1.mp4/00001.jpg",
                "videos/clip1.mp4/00002.jpg",
            ]
        );
        assert_eq!(plan[0].0, dir.path().join("00000.jpg"));
    }

    #[tokio::test]
    async fn test_upload_plan_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(upload_plan(dir.path(), PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_plan_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("frames");

        assert!(matches!(
            upload_plan(&missing, PREFIX).await,
            Err(StorageError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_stops_at_first_failure() {
        let attempted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let record = attempted.clone();
        let result = upload_in_order(frame_plan(3), 1, move |_, key| {
            let record = record.clone();
            async move {
                record.lock().unwrap().push(key.clone());
                if key.ends_with("00000.jpg") {
                    Err(StorageError::Upload {
                        key,
                        message: "AccessDenied".to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        match result {
            Err(StorageError::Upload { key, .. }) => {
                assert_eq!(key, "videos/clip1.mp4/00000.jpg")
            }
            other => panic!("Expected Upload error, got {:?}", other),
        }
        assert_eq!(*attempted.lock().unwrap(), vec!["videos/clip1.mp4/00000.jpg"]);
    }

    #[tokio::test]
    async fn test_concurrent_upload_keeps_plan_order() {
        let keys = upload_in_order(frame_plan(4), 3, |_, _| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            keys,
            vec![
                "videos/clip1.mp4/00000.jpg",
                "videos/clip1.mp4/00001.jpg",
                "videos/clip1.mp4/00002.jpg",
                "videos/clip1.mp4/00003.jpg",
            ]
        );
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("00000.jpg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("00000.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("00000.png")), "image/png");
        assert_eq!(content_type_for(Path::new("00000")), "application/octet-stream");
    }
}
