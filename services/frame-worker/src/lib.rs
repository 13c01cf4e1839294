//! Frame Worker
//!
//! Drains an SQS queue whose messages each name a video stored in S3. For
//! every message the worker downloads the video, splits it into still frames
//! with ffmpeg, uploads the frames under the video's own key, and deletes the
//! message.
//!
//! ## Delivery semantics
//!
//! - A message is deleted exactly once per delivery, after its processing
//!   attempt finishes, whether that attempt succeeded or not.
//! - A crash between receive and delete leaves redelivery to SQS, so the
//!   overall guarantee is at-least-once.
//! - Failures are logged and never stop the loop. Bodies of failed messages
//!   can be forwarded to a dead-letter queue before deletion.
//!
//! ## Architecture
//!
//! ```text
//! SQS Queue                    Scratch dir                   S3 Bucket
//! ┌──────────────┐            ┌──────────────┐             ┌────────────────────┐
//! │ object key   │            │ source.mp4   │◀── download ─│ videos/clip1.mp4   │
//! └──────────────┘            │ frames/      │             │                    │
//!        │                    │   00000.jpg  │── upload ──▶│ videos/clip1.mp4/  │
//!        ▼                    │   00001.jpg  │             │   00000.jpg ...    │
//! ┌──────────────┐            └──────────────┘             └────────────────────┘
//! │ FrameWorker  │                   ▲
//! └──────────────┘                   │ ffmpeg -i source.mp4 -q:v 2
//!        │                           │        -start_number 0 frames/%05d.jpg
//!        ▼                           │
//! ┌──────────────┐            ┌──────────────┐
//! │ Conversion   │───────────▶│ Frame        │
//! │ Pipeline     │            │ Extractor    │
//! └──────────────┘            └──────────────┘
//! ```

pub mod config;
pub mod frame_extractor;
pub mod object_store;
pub mod pipeline;
pub mod queue;
pub mod worker;

pub use config::Config;
pub use frame_extractor::{ExtractError, ExtractionOutcome, FfmpegExtractor, FrameExtractor};
pub use object_store::{ObjectStore, S3ObjectStore, StorageError};
pub use pipeline::{ConversionPipeline, ConversionReport, ObjectKey, PipelineError};
pub use queue::{MessageQueue, QueueError, QueueHandle, QueueMessage, SqsQueue};
pub use worker::{FrameWorker, MessageOutcome};
