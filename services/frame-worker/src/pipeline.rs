//! Download -> extract -> upload for a single object key.
//!
//! Every invocation works inside its own scratch directory, so concurrent
//! workers sharing a filesystem never collide and nothing is left on disk once
//! `process` returns, whichever stage failed.

use crate::frame_extractor::{ExtractError, ExtractionOutcome, FrameExtractor};
use crate::object_store::{ObjectStore, StorageError};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_VIDEO_EXTENSION: &str = "mp4";
const FRAMES_DIR_NAME: &str = "frames";

/// Errors that end the processing of one key
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Message body is not an object key: body is empty")]
    EmptyKey,

    #[error("Failed to prepare scratch directory under {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download {key}: {source}")]
    Download {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Frame extraction for {key} failed with {status}: {stderr}")]
    ExtractionFailed {
        key: String,
        status: String,
        stderr: String,
    },

    #[error("Frame extraction for {key} could not run: {source}")]
    Extractor {
        key: String,
        #[source]
        source: ExtractError,
    },

    #[error("Failed to upload frames of {key}: {source}")]
    Upload {
        key: String,
        #[source]
        source: StorageError,
    },
}

/// Object key of a source video. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Take a message body as the key, byte for byte. S3 keys may carry
    /// leading or trailing whitespace, so only a blank body is rejected.
    pub fn parse(body: &str) -> Result<Self, PipelineError> {
        if body.trim().is_empty() {
            return Err(PipelineError::EmptyKey);
        }
        Ok(Self(body.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extension used for the local copy of the video
    pub fn video_extension(&self) -> &str {
        let file_name = self.0.rsplit('/').next().unwrap_or_default();
        match file_name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.is_empty()
                    && !ext.is_empty()
                    && ext.len() <= 8
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext
            }
            _ => DEFAULT_VIDEO_EXTENSION,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a successful run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionReport {
    /// Frames written by the extractor
    pub frames: usize,
    /// Keys of the uploaded frame objects
    pub uploaded: Vec<String>,
}

/// Orchestrates the object store and the frame extractor
pub struct ConversionPipeline<S, E> {
    store: S,
    extractor: E,
    scratch_root: PathBuf,
}

impl<S, E> ConversionPipeline<S, E>
where
    S: ObjectStore,
    E: FrameExtractor,
{
    pub fn new(store: S, extractor: E, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            extractor,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Convert the video at `key` into frames uploaded under `key`.
    ///
    /// Each stage failure is logged here with the key and returned; nothing
    /// is retried.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn process(&self, key: &ObjectKey) -> Result<ConversionReport, PipelineError> {
        debug!("Processing file to convert into frames");

        let workspace = self.create_workspace().await?;
        let video_path = workspace
            .path()
            .join(format!("source.{}", key.video_extension()));
        let frames_dir = workspace.path().join(FRAMES_DIR_NAME);

        let result = self.run_stages(key, &video_path, &frames_dir).await;

        if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove scratch directory");
        }

        result
    }

    async fn run_stages(
        &self,
        key: &ObjectKey,
        video_path: &Path,
        frames_dir: &Path,
    ) -> Result<ConversionReport, PipelineError> {
        if let Err(source) = self.store.download(key.as_str(), video_path).await {
            error!(key = %key, error = %source, "Failed to download source video");
            return Err(PipelineError::Download {
                key: key.to_string(),
                source,
            });
        }
        info!(key = %key, path = %video_path.display(), "Downloaded source video");

        let frames = match self.extractor.extract_frames(video_path, frames_dir).await {
            Ok(ExtractionOutcome::Completed { frames }) => frames.len(),
            Ok(ExtractionOutcome::Failed { status, stderr }) => {
                error!(key = %key, status = %status, stderr = %stderr, "Frame extraction failed");
                return Err(PipelineError::ExtractionFailed {
                    key: key.to_string(),
                    status,
                    stderr,
                });
            }
            Err(source) => {
                error!(key = %key, error = %source, "Frame extraction could not run");
                return Err(PipelineError::Extractor {
                    key: key.to_string(),
                    source,
                });
            }
        };

        let uploaded = match self.store.upload_directory(frames_dir, key.as_str()).await {
            Ok(uploaded) => uploaded,
            Err(source) => {
                error!(key = %key, error = %source, "Failed to upload frames");
                return Err(PipelineError::Upload {
                    key: key.to_string(),
                    source,
                });
            }
        };

        info!(key = %key, frames, uploaded = uploaded.len(), "Frames uploaded");

        Ok(ConversionReport { frames, uploaded })
    }

    async fn create_workspace(&self) -> Result<tempfile::TempDir, PipelineError> {
        let workspace_err = |source| PipelineError::Workspace {
            path: self.scratch_root.clone(),
            source,
        };

        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(workspace_err)?;

        tempfile::Builder::new()
            .prefix("frame-worker-")
            .tempdir_in(&self.scratch_root)
            .map_err(workspace_err)
    }
}
