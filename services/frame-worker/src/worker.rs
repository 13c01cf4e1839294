use crate::frame_extractor::FrameExtractor;
use crate::object_store::ObjectStore;
use crate::pipeline::{ConversionPipeline, ObjectKey, PipelineError};
use crate::queue::{MessageQueue, QueueError, QueueHandle, QueueMessage};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// How one message ended, after its deletion was attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Frames extracted and uploaded
    Processed { key: String, frames: usize },
    /// Processing stopped early; the message was acknowledged anyway
    Failed { error: String },
}

/// Long-running consumer feeding queue messages through the conversion pipeline
pub struct FrameWorker<Q, S, E> {
    queue: Q,
    pipeline: ConversionPipeline<S, E>,
    queue_name: String,
    dead_letter_queue_name: Option<String>,
    dead_letter: OnceLock<QueueHandle>,
    receive_error_backoff: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl<Q, S, E> FrameWorker<Q, S, E>
where
    Q: MessageQueue,
    S: ObjectStore,
    E: FrameExtractor,
{
    pub fn new(queue: Q, pipeline: ConversionPipeline<S, E>, queue_name: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            queue,
            pipeline,
            queue_name: queue_name.into(),
            dead_letter_queue_name: None,
            dead_letter: OnceLock::new(),
            receive_error_backoff: Duration::from_secs(1),
            shutdown_tx,
        }
    }

    /// Forward bodies of failed messages to this queue before deleting them
    pub fn with_dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue_name = Some(name.into());
        self
    }

    /// Pause after a failed receive call
    pub fn with_receive_error_backoff(mut self, backoff: Duration) -> Self {
        self.receive_error_backoff = backoff;
        self
    }

    /// Signal the loop to stop after the message in flight
    pub fn shutdown(&self) {
        info!("Signaling worker shutdown");
        self.shutdown_tx.send_replace(true);
    }

    /// Resolve the source queue, and the dead-letter queue when configured
    pub async fn resolve(&self) -> Result<QueueHandle, QueueError> {
        let queue = self.queue.resolve_queue(&self.queue_name).await?;

        if let Some(ref name) = self.dead_letter_queue_name {
            if self.dead_letter.get().is_none() {
                let handle = self.queue.resolve_queue(name).await?;
                let _ = self.dead_letter.set(handle);
            }
        }

        Ok(queue)
    }

    /// Resolve the queue once, then consume until shutdown
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn run(&self) -> Result<(), QueueError> {
        let queue = self.resolve().await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(url = %queue.url, "Starting message consumption loop");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Received shutdown signal");
                    break;
                }
                received = self.queue.receive(&queue) => {
                    self.dispatch(&queue, received).await;
                }
            }
        }

        info!("Message consumption loop stopped");
        Ok(())
    }

    /// One receive call and the processing of everything it returned.
    /// Returns the number of messages handled.
    pub async fn poll_once(&self, queue: &QueueHandle) -> usize {
        let received = self.queue.receive(queue).await;
        self.dispatch(queue, received).await
    }

    async fn dispatch(
        &self,
        queue: &QueueHandle,
        received: Result<Vec<QueueMessage>, QueueError>,
    ) -> usize {
        match received {
            Ok(messages) => {
                for message in &messages {
                    self.process_one(queue, message).await;
                }
                messages.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to receive messages");
                metrics::counter!("frames.queue.receive_errors").increment(1);
                tokio::time::sleep(self.receive_error_backoff).await;
                0
            }
        }
    }

    /// Run one message through the pipeline, then delete it whatever happened
    #[instrument(skip_all, fields(message_id = %message.id))]
    pub async fn process_one(&self, queue: &QueueHandle, message: &QueueMessage) -> MessageOutcome {
        debug!(message_id = %message.id, "Processing message");
        metrics::counter!("frames.messages.received").increment(1);

        let started = Instant::now();
        let result = AssertUnwindSafe(self.convert(&message.body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_message(panic)));
        metrics::histogram!("frames.pipeline.duration_seconds").record(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok((key, frames)) => {
                info!(message_id = %message.id, key = %key, frames, "Message processed");
                metrics::counter!("frames.messages.processed").increment(1);
                MessageOutcome::Processed {
                    key: key.to_string(),
                    frames,
                }
            }
            Err(error) => {
                error!(message_id = %message.id, error = %error, "Failed to process message");
                metrics::counter!("frames.messages.failed").increment(1);
                self.forward_to_dead_letter(message).await;
                MessageOutcome::Failed { error }
            }
        };

        self.acknowledge(queue, message).await;

        outcome
    }

    async fn convert(&self, body: &str) -> Result<(ObjectKey, usize), String> {
        let key = ObjectKey::parse(body).map_err(|e: PipelineError| e.to_string())?;
        let report = self.pipeline.process(&key).await.map_err(|e| e.to_string())?;
        Ok((key, report.uploaded.len()))
    }

    async fn forward_to_dead_letter(&self, message: &QueueMessage) {
        let Some(dead_letter) = self.dead_letter.get() else {
            return;
        };

        match self.queue.send(dead_letter, &message.body).await {
            Ok(()) => {
                warn!(
                    message_id = %message.id,
                    dead_letter_queue = %dead_letter.name,
                    "Message forwarded to dead-letter queue"
                );
                metrics::counter!("frames.messages.dead_lettered").increment(1);
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to forward message to dead-letter queue");
            }
        }
    }

    async fn acknowledge(&self, queue: &QueueHandle, message: &QueueMessage) {
        match self.queue.delete(queue, &message.receipt_handle).await {
            Ok(()) => {
                debug!(message_id = %message.id, "Message deleted");
                metrics::counter!("frames.messages.deleted").increment(1);
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to delete message");
                metrics::counter!("frames.messages.delete_failed").increment(1);
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Conversion panicked: {}", detail)
}
