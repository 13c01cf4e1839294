use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the frame worker
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// SQS configuration
    pub sqs: SqsConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Frame extraction tool configuration
    #[serde(default)]
    pub extractor: ExtractorConfig,
    /// Local working directory configuration
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Expose Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// SQS queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SqsConfig {
    /// Name of the queue carrying video object keys
    pub queue_name: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, ElasticMQ, etc.)
    pub endpoint_url: Option<String>,
    /// Maximum messages per receive call (SQS allows 1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Long-poll wait time in seconds (SQS allows 0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Visibility timeout override for received messages
    pub visibility_timeout_secs: Option<i32>,
    /// Queue receiving bodies of messages that failed processing
    pub dead_letter_queue_name: Option<String>,
    /// Pause after a failed receive call, in milliseconds
    #[serde(default = "default_receive_error_backoff_ms")]
    pub receive_error_backoff_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding source videos and extracted frames
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Frames uploaded in parallel for a single video
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

/// External frame extraction tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    /// Path or name of the ffmpeg binary
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// JPEG quality passed as `-q:v` (2 is near-lossless)
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Index of the first extracted frame
    #[serde(default)]
    pub start_number: u32,
    /// Extension of the written frame images
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// Arguments placed before `-i`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Local scratch space configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Directory under which per-message scratch directories are created.
    /// Defaults to the system temp directory.
    pub scratch_root: Option<PathBuf>,
}

// Default value functions
fn default_service_name() -> String {
    "frame-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_messages() -> i32 {
    10
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_receive_error_backoff_ms() -> u64 {
    1000
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_quality() -> u8 {
    2
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/frame-worker").required(false))
            .add_source(config::File::with_name("/etc/frame-worker/frame-worker").required(false))
            // Override with environment variables
            // FRAME_WORKER__SQS__QUEUE_NAME -> sqs.queue_name
            .add_source(
                config::Environment::with_prefix("FRAME_WORKER")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    /// Build and validate configuration from an arbitrary set of sources
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sqs.queue_name.trim().is_empty() {
            return Err(invalid("sqs.queue_name", "must not be empty"));
        }
        if self.s3.bucket.trim().is_empty() {
            return Err(invalid("s3.bucket", "must not be empty"));
        }
        if self.s3.upload_concurrency == 0 {
            return Err(invalid("s3.upload_concurrency", "must be at least 1"));
        }
        if self.extractor.image_extension.trim().is_empty() {
            return Err(invalid("extractor.image_extension", "must not be empty"));
        }
        Ok(())
    }

    /// Get the receive backoff as Duration
    pub fn receive_error_backoff(&self) -> Duration {
        Duration::from_millis(self.sqs.receive_error_backoff_ms)
    }

    /// Scratch root, falling back to the system temp directory
    pub fn scratch_root(&self) -> PathBuf {
        self.worker
            .scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl SqsConfig {
    /// Max messages clamped to what SQS accepts
    pub fn max_messages(&self) -> i32 {
        self.max_messages.clamp(1, 10)
    }

    /// Wait time clamped to what SQS accepts
    pub fn wait_time_secs(&self) -> i32 {
        self.wait_time_secs.clamp(0, 20)
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_enabled: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            quality: default_quality(),
            start_number: 0,
            image_extension: default_image_extension(),
            extra_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ConfigBuilder<DefaultState> {
        config::Config::builder()
            .set_override("sqs.queue_name", "video-uploads")
            .unwrap()
            .set_override("s3.bucket", "media")
            .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = Config::from_builder(minimal()).unwrap();

        assert_eq!(config.service.name, "frame-worker");
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.sqs.region, "us-east-1");
        assert_eq!(config.sqs.max_messages(), 10);
        assert_eq!(config.sqs.wait_time_secs(), 20);
        assert!(config.sqs.dead_letter_queue_name.is_none());
        assert_eq!(config.s3.upload_concurrency, 1);
        assert_eq!(config.extractor.binary_path, "ffmpeg");
        assert_eq!(config.extractor.quality, 2);
        assert_eq!(config.extractor.start_number, 0);
        assert_eq!(config.extractor.image_extension, "jpg");
        assert_eq!(config.scratch_root(), std::env::temp_dir());
    }

    #[test]
    fn test_overrides() {
        let builder = minimal()
            .set_override("sqs.dead_letter_queue_name", "video-uploads-dlq")
            .unwrap()
            .set_override("sqs.max_messages", 25)
            .unwrap()
            .set_override("extractor.image_extension", "png")
            .unwrap()
            .set_override("worker.scratch_root", "/var/tmp/frames")
            .unwrap();

        let config = Config::from_builder(builder).unwrap();

        assert_eq!(
            config.sqs.dead_letter_queue_name.as_deref(),
            Some("video-uploads-dlq")
        );
        assert_eq!(config.sqs.max_messages(), 10);
        assert_eq!(config.extractor.image_extension, "png");
        assert_eq!(config.scratch_root(), PathBuf::from("/var/tmp/frames"));
    }

    #[test]
    fn test_missing_queue_name_is_rejected() {
        let builder = config::Config::builder()
            .set_override("s3.bucket", "media")
            .unwrap();

        assert!(matches!(
            Config::from_builder(builder),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_zero_upload_concurrency_is_rejected() {
        let builder = minimal().set_override("s3.upload_concurrency", 0).unwrap();

        match Config::from_builder(builder) {
            Err(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "s3.upload_concurrency");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }
}
