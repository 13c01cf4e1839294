//! Video to still-frame decomposition through an external ffmpeg process.

use crate::config::ExtractorConfig;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

/// Width of the zero-padded frame index in file names
pub const FRAME_INDEX_WIDTH: usize = 5;

/// Faults outside the tool's own exit status
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Failed to create frames directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to execute {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list frames in {path}: {source}")]
    ListFrames {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of one extraction run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Tool exited with status 0. Frames are in index order.
    Completed { frames: Vec<PathBuf> },
    /// Tool exited non-zero
    Failed { status: String, stderr: String },
}

/// Decomposes a video file into a numbered image sequence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    /// Write the frames of `source` into `dest_dir`.
    ///
    /// A non-zero exit of the tool is reported as [`ExtractionOutcome::Failed`];
    /// only faults around the invocation itself are returned as errors.
    async fn extract_frames(
        &self,
        source: &Path,
        dest_dir: &Path,
    ) -> Result<ExtractionOutcome, ExtractError>;
}

/// ffmpeg-backed [`FrameExtractor`]
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    config: ExtractorConfig,
}

impl FfmpegExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Output file pattern passed to ffmpeg, e.g. `frames/%05d.jpg`
    pub fn output_pattern(&self, dest_dir: &Path) -> PathBuf {
        dest_dir.join(format!(
            "%0{}d.{}",
            FRAME_INDEX_WIDTH, self.config.image_extension
        ))
    }

    /// Full argument list for one invocation
    pub fn build_args(&self, source: &Path, dest_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.config.extra_args.iter().map(OsString::from).collect();

        args.push("-i".into());
        args.push(source.as_os_str().to_owned());
        args.push("-q:v".into());
        args.push(self.config.quality.to_string().into());
        args.push("-start_number".into());
        args.push(self.config.start_number.to_string().into());
        args.push(self.output_pattern(dest_dir).into_os_string());

        args
    }

    /// Check if the binary can be executed
    pub async fn check_availability(&self) -> Result<(), ExtractError> {
        let output = Command::new(&self.config.binary_path)
            .arg("-version")
            .output()
            .await
            .map_err(|source| ExtractError::Spawn {
                binary: self.config.binary_path.clone(),
                source,
            })?;

        if output.status.success() {
            info!(binary = %self.config.binary_path, "Frame extraction tool is available");
        } else {
            warn!(
                binary = %self.config.binary_path,
                status = %output.status,
                "Frame extraction tool version check failed"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    #[instrument(skip_all, fields(source = %source.display()))]
    async fn extract_frames(
        &self,
        source: &Path,
        dest_dir: &Path,
    ) -> Result<ExtractionOutcome, ExtractError> {
        debug!(dest = %dest_dir.display(), "Converting video into frames");

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| ExtractError::CreateDir {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let output = Command::new(&self.config.binary_path)
            .args(self.build_args(source, dest_dir))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| ExtractError::Spawn {
                binary: self.config.binary_path.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                source = %source.display(),
                status = %output.status,
                stderr = %stderr,
                "Failed to convert video to frames"
            );
            return Ok(ExtractionOutcome::Failed {
                status: describe_status(output.status),
                stderr,
            });
        }

        let frames = list_frames(dest_dir, &self.config.image_extension)
            .await
            .map_err(|source| ExtractError::ListFrames {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        info!(
            dest = %dest_dir.display(),
            frames = frames.len(),
            "Video converted to frames"
        );

        Ok(ExtractionOutcome::Completed { frames })
    }
}

/// File name of the frame at `index`
pub fn frame_file_name(index: u32, extension: &str) -> String {
    format!("{:0width$}.{}", index, extension, width = FRAME_INDEX_WIDTH)
}

/// Frame files in `dir` with the given extension, in index order
pub async fn list_frames(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if matches {
            frames.push(path);
        }
    }

    // Padding is a minimum width, so index 100000 outgrows it
    frames.sort_by_cached_key(|path| (frame_index(path), path.clone()));
    Ok(frames)
}

/// Numeric index of a frame file; names that are not numbers sort last
fn frame_index(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse().ok())
        .unwrap_or(u64::MAX)
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn extractor() -> FfmpegExtractor {
        FfmpegExtractor::new(ExtractorConfig::default())
    }

    #[test]
    fn test_build_args() {
        let args = extractor().build_args(Path::new("/tmp/w/source.mp4"), Path::new("/tmp/w/frames"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();

        assert_eq!(
            args,
            vec![
                "-i",
                "/tmp/w/source.mp4",
                "-q:v",
                "2",
                "-start_number",
                "0",
                "/tmp/w/frames/%05d.jpg",
            ]
        );
    }

    #[test]
    fn test_extra_args_precede_input() {
        let config = ExtractorConfig {
            extra_args: vec!["-hide_banner".to_string(), "-nostdin".to_string()],
            image_extension: "png".to_string(),
            ..ExtractorConfig::default()
        };
        let args = FfmpegExtractor::new(config).build_args(Path::new("in.mp4"), Path::new("out"));

        assert_eq!(args[0], "-hide_banner");
        assert_eq!(args[1], "-nostdin");
        assert_eq!(args[2], "-i");
        assert_eq!(args.last().unwrap(), &OsString::from("out/%05d.png"));
    }

    #[test]
    fn test_frame_file_name() {
        assert_eq!(frame_file_name(0, "jpg"), "00000.jpg");
        assert_eq!(frame_file_name(2, "jpg"), "00002.jpg");
        assert_eq!(frame_file_name(12345, "png"), "12345.png");
    }

    #[tokio::test]
    async fn test_list_frames_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        for index in [10, 2, 0, 1] {
            fs::write(dir.path().join(frame_file_name(index, "jpg")), b"").unwrap();
        }
        fs::write(dir.path().join("ffmpeg.log"), b"").unwrap();

        let frames = list_frames(dir.path(), "jpg").await.unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["00000.jpg", "00001.jpg", "00002.jpg", "00010.jpg"]);
    }

    #[tokio::test]
    async fn test_list_frames_past_padding_width() {
        let dir = tempfile::tempdir().unwrap();
        for index in [100000, 10001, 99999] {
            fs::write(dir.path().join(frame_file_name(index, "jpg")), b"").unwrap();
        }

        let frames = list_frames(dir.path(), "jpg").await.unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["10001.jpg", "99999.jpg", "100000.jpg"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let config = ExtractorConfig {
            binary_path: "frame-worker-test-no-such-binary".to_string(),
            ..ExtractorConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("frames");

        let result = FfmpegExtractor::new(config)
            .extract_frames(&dir.path().join("source.mp4"), &dest)
            .await;

        assert!(matches!(result, Err(ExtractError::Spawn { .. })));
        // Directory is created before the tool runs
        assert!(dest.is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_reported_not_raised() {
        let config = ExtractorConfig {
            binary_path: "false".to_string(),
            ..ExtractorConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();

        let outcome = FfmpegExtractor::new(config)
            .extract_frames(&dir.path().join("source.mp4"), &dir.path().join("frames"))
            .await
            .unwrap();

        match outcome {
            ExtractionOutcome::Failed { status, .. } => assert_eq!(status, "exit code 1"),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }
}
