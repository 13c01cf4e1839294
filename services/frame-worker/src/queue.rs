//! SQS-backed message queue.
//!
//! The worker only needs four primitives from the queue service: resolving a
//! queue name to its URL, receiving a batch, deleting a delivery by its receipt
//! handle, and sending a body (used for dead-lettering). They sit behind the
//! [`MessageQueue`] trait so the processing loop can be exercised without AWS.

use crate::config::SqsConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Builder as SqsConfigBuilder;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::Client as SqsClient;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur while talking to the queue service
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to resolve queue {name}: {message}")]
    Resolve { name: String, message: String },

    #[error("Failed to receive messages: {0}")]
    Receive(String),

    #[error("Failed to delete message: {0}")]
    Delete(String),

    #[error("Failed to send message: {0}")]
    Send(String),
}

/// Resolved queue, immutable for the lifetime of the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    /// Queue name the handle was resolved from
    pub name: String,
    /// Queue URL used by every subsequent call
    pub url: String,
}

/// One delivery of a queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message ID assigned by the queue service
    pub id: String,
    /// Message body, the object key of a source video
    pub body: String,
    /// Token proving possession of this delivery
    pub receipt_handle: String,
}

impl QueueMessage {
    pub fn new(
        id: impl Into<String>,
        body: impl Into<String>,
        receipt_handle: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            receipt_handle: receipt_handle.into(),
        }
    }
}

/// Queue primitives used by the processing loop
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Resolve a queue name to a handle
    async fn resolve_queue(&self, name: &str) -> Result<QueueHandle, QueueError>;

    /// Receive zero or more messages
    async fn receive(&self, queue: &QueueHandle) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a delivered message
    async fn delete(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), QueueError>;

    /// Send a new message with the given body
    async fn send(&self, queue: &QueueHandle, body: &str) -> Result<(), QueueError>;
}

/// Amazon SQS implementation of [`MessageQueue`]
pub struct SqsQueue {
    client: SqsClient,
    max_messages: i32,
    wait_time_secs: i32,
    visibility_timeout_secs: Option<i32>,
}

impl SqsQueue {
    /// Create a new SQS client
    pub async fn new(config: &SqsConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut sqs_config_builder = SqsConfigBuilder::from(&aws_config);

        // Configure custom endpoint for LocalStack/ElasticMQ
        if let Some(ref endpoint_url) = config.endpoint_url {
            sqs_config_builder = sqs_config_builder.endpoint_url(endpoint_url);
        }

        let client = SqsClient::from_conf(sqs_config_builder.build());

        info!(
            queue = %config.queue_name,
            region = %config.region,
            "SQS client initialized"
        );

        Self {
            client,
            max_messages: config.max_messages(),
            wait_time_secs: config.wait_time_secs(),
            visibility_timeout_secs: config.visibility_timeout_secs,
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    #[instrument(skip(self))]
    async fn resolve_queue(&self, name: &str) -> Result<QueueHandle, QueueError> {
        let output = self
            .client
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| QueueError::Resolve {
                name: name.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let url = output.queue_url().ok_or_else(|| QueueError::Resolve {
            name: name.to_string(),
            message: "response carried no queue URL".to_string(),
        })?;

        info!(queue = %name, url = %url, "Resolved queue");

        Ok(QueueHandle {
            name: name.to_string(),
            url: url.to_string(),
        })
    }

    async fn receive(&self, queue: &QueueHandle) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&queue.url)
            .max_number_of_messages(self.max_messages)
            .wait_time_seconds(self.wait_time_secs)
            .set_visibility_timeout(self.visibility_timeout_secs)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        let messages: Vec<QueueMessage> = output
            .messages()
            .iter()
            .filter_map(|message| {
                let id = message.message_id().unwrap_or("unknown");
                match message.receipt_handle() {
                    Some(receipt_handle) => Some(QueueMessage::new(
                        id,
                        message.body().unwrap_or_default(),
                        receipt_handle,
                    )),
                    None => {
                        warn!(message_id = %id, "Skipping message without receipt handle");
                        None
                    }
                }
            })
            .collect();

        debug!(queue = %queue.name, count = messages.len(), "Received messages");

        Ok(messages)
    }

    async fn delete(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&queue.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn send(&self, queue: &QueueHandle, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&queue.url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Send(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_message_new() {
        let message = QueueMessage::new("m1", "videos/clip1.mp4", "r1");

        assert_eq!(message.id, "m1");
        assert_eq!(message.body, "videos/clip1.mp4");
        assert_eq!(message.receipt_handle, "r1");
    }

    #[test]
    fn test_error_display_names_queue() {
        let err = QueueError::Resolve {
            name: "video-uploads".to_string(),
            message: "AWS.SimpleQueueService.NonExistentQueue".to_string(),
        };

        assert!(err.to_string().contains("video-uploads"));
    }
}
