//! Queue access for the login worker.
//!
//! The worker only needs three things from a queue: an approximate depth, a batch of messages
//! and a way to acknowledge a message by deleting it. `MessageQueue` captures that, `SqsQueue`
//! implements it on top of the AWS SDK, and `MockQueue` in memory for tests.
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client as AwsSqsSdkClient;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// SQS refuses to return more than this many messages per receive call.
pub const MAX_BATCH_SIZE: i32 = 10;

/// Longest long-polling wait SQS accepts on a receive call.
pub const MAX_WAIT_TIME_SECONDS: i32 = 20;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{operation} request failed with: {reason}")]
    RequestError { operation: String, reason: String },
    #[error("{operation} returned an invalid response: {reason}")]
    InvalidResponse { operation: String, reason: String },
    #[error("{operation} request timed out after {timeout:?}")]
    TimeoutError {
        operation: String,
        timeout: std::time::Duration,
    },
}

impl QueueError {
    /// The queue API call that failed.
    pub fn operation(&self) -> &str {
        match self {
            QueueError::RequestError { operation, .. }
            | QueueError::InvalidResponse { operation, .. }
            | QueueError::TimeoutError { operation, .. } => operation,
        }
    }
}

/// A message as received from the queue. The queue owns it until it's deleted using its
/// `receipt_handle`.
#[derive(Serialize, Debug, PartialEq, Eq, Clone)]
pub struct QueueMessage {
    #[serde(rename = "MessageId")]
    pub message_id: Option<String>,
    #[serde(rename = "ReceiptHandle")]
    pub receipt_handle: String,
    #[serde(rename = "Body")]
    pub body: String,
    /// How many times the queue has handed out this message, this delivery included.
    #[serde(rename = "ApproximateReceiveCount")]
    pub receive_count: u32,
}

impl QueueMessage {
    pub fn new(message_id: &str, receipt_handle: &str, body: &str) -> Self {
        Self {
            message_id: Some(message_id.to_owned()),
            receipt_handle: receipt_handle.to_owned(),
            body: body.to_owned(),
            receive_count: 1,
        }
    }

    /// The transport envelope as JSON, as stored in quarantine rows.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "MessageId": self.message_id,
            "ReceiptHandle": self.receipt_handle,
            "Body": self.body,
            "ApproximateReceiveCount": self.receive_count,
        })
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Eventually consistent count of visible messages.
    async fn approximate_depth(&self) -> Result<u64, QueueError>;

    /// Receive up to one batch of messages. An empty batch is a valid answer even when the
    /// depth is not zero.
    async fn receive_batch(&self) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

/// A `MessageQueue` backed by an SQS (or SQS compatible, e.g. localstack) queue.
pub struct SqsQueue {
    client: AwsSqsSdkClient,
    queue_url: String,
    batch_size: i32,
    wait_time_seconds: i32,
}

impl SqsQueue {
    /// Build an SQS client from the environment's AWS configuration, optionally pointing it to
    /// a custom endpoint.
    pub async fn new(
        queue_url: &str,
        region: &str,
        endpoint_url: Option<&str>,
        batch_size: i32,
        wait_time_seconds: i32,
    ) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()));

        if let Some(endpoint) = endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        Self::new_from_client(
            AwsSqsSdkClient::new(&aws_config),
            queue_url,
            batch_size,
            wait_time_seconds,
        )
    }

    pub fn new_from_client(
        client: AwsSqsSdkClient,
        queue_url: &str,
        batch_size: i32,
        wait_time_seconds: i32,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.to_owned(),
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            wait_time_seconds: wait_time_seconds.clamp(0, MAX_WAIT_TIME_SECONDS),
        }
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn approximate_depth(&self) -> Result<u64, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::RequestError {
                operation: "GetQueueAttributes".to_owned(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let depth = output
            .attributes
            .as_ref()
            .and_then(|attributes| attributes.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .ok_or_else(|| QueueError::InvalidResponse {
                operation: "GetQueueAttributes".to_owned(),
                reason: "ApproximateNumberOfMessages attribute missing".to_owned(),
            })?;

        parse_depth(depth)
    }

    async fn receive_batch(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.batch_size)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| QueueError::RequestError {
                operation: "ReceiveMessage".to_owned(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        let messages = output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(to_queue_message)
            .collect();

        Ok(messages)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::RequestError {
                operation: "DeleteMessage".to_owned(),
                reason: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }
}

/// Messages without a receipt handle can't be acknowledged: they are skipped and left to be
/// redelivered.
fn to_queue_message(message: Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle else {
        warn!(
            message_id = message.message_id.as_deref(),
            "received a message without a receipt handle, it will be redelivered"
        );
        return None;
    };
    let receive_count = message
        .attributes
        .as_ref()
        .and_then(|attributes| attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(1);

    Some(QueueMessage {
        message_id: message.message_id,
        receipt_handle,
        body: message.body.unwrap_or_default(),
        receive_count,
    })
}

fn parse_depth(depth: &str) -> Result<u64, QueueError> {
    depth
        .trim()
        .parse::<u64>()
        .map_err(|_| QueueError::InvalidResponse {
            operation: "GetQueueAttributes".to_owned(),
            reason: format!("{depth} is not a valid ApproximateNumberOfMessages"),
        })
}

#[derive(Default)]
struct MockQueueState {
    visible: VecDeque<QueueMessage>,
    in_flight: Vec<QueueMessage>,
    next_id: u32,
    scripted_depths: VecDeque<u64>,
    depth_failures: usize,
    delete_failures: usize,
    depth_calls: usize,
    receive_calls: usize,
    deleted: Vec<QueueMessage>,
}

/// In-memory `MessageQueue` for tests. Always available, no conditional compilation needed.
///
/// Received messages stay in flight until deleted. With redelivery enabled, every undeleted
/// in-flight message becomes visible again at the next depth check, like a queue with a zero
/// visibility timeout.
pub struct MockQueue {
    state: Mutex<MockQueueState>,
    batch_size: usize,
    redeliver: bool,
}

impl MockQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            state: Mutex::new(MockQueueState::default()),
            batch_size,
            redeliver: false,
        }
    }

    pub fn with_redelivery(mut self) -> Self {
        self.redeliver = true;
        self
    }

    /// Enqueue a message with the given body.
    pub fn push(&self, body: &str) {
        let mut state = self.lock();
        state.next_id += 1;
        let message_id = format!("message-{}", state.next_id);
        state.visible.push_back(QueueMessage {
            message_id: Some(message_id.clone()),
            receipt_handle: message_id,
            body: body.to_owned(),
            receive_count: 0,
        });
    }

    /// Report these depths, in order, before falling back to the real number of messages.
    pub fn script_depths(&self, depths: &[u64]) {
        self.lock().scripted_depths.extend(depths);
    }

    /// Fail the next `count` depth checks.
    pub fn fail_depth_checks(&self, count: usize) {
        self.lock().depth_failures = count;
    }

    /// Fail the next `count` deletes.
    pub fn fail_deletes(&self, count: usize) {
        self.lock().delete_failures = count;
    }

    pub fn depth_calls(&self) -> usize {
        self.lock().depth_calls
    }

    pub fn receive_calls(&self) -> usize {
        self.lock().receive_calls
    }

    /// Messages acknowledged so far, in deletion order.
    pub fn deleted(&self) -> Vec<QueueMessage> {
        self.lock().deleted.clone()
    }

    /// Messages received but neither deleted nor redelivered yet.
    pub fn in_flight(&self) -> Vec<QueueMessage> {
        self.lock().in_flight.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockQueueState> {
        self.state.lock().expect("poisoned MockQueue mutex")
    }
}

#[async_trait]
impl MessageQueue for MockQueue {
    async fn approximate_depth(&self) -> Result<u64, QueueError> {
        let mut state = self.lock();
        state.depth_calls += 1;

        if state.depth_failures > 0 {
            state.depth_failures -= 1;
            return Err(QueueError::RequestError {
                operation: "GetQueueAttributes".to_owned(),
                reason: "connection refused".to_owned(),
            });
        }

        if self.redeliver {
            let returning: Vec<QueueMessage> = state.in_flight.drain(..).collect();
            state.visible.extend(returning);
        }

        match state.scripted_depths.pop_front() {
            Some(depth) => Ok(depth),
            None => Ok(state.visible.len() as u64),
        }
    }

    async fn receive_batch(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.lock();
        state.receive_calls += 1;

        let count = self.batch_size.min(state.visible.len());
        let mut batch = Vec::with_capacity(count);
        for mut message in state.visible.drain(..count).collect::<Vec<_>>() {
            message.receive_count += 1;
            message.receipt_handle = format!(
                "{}-receipt-{}",
                message.message_id.as_deref().unwrap_or_default(),
                message.receive_count
            );
            batch.push(message);
        }
        state.in_flight.extend(batch.iter().cloned());

        Ok(batch)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.lock();

        if state.delete_failures > 0 {
            state.delete_failures -= 1;
            return Err(QueueError::RequestError {
                operation: "DeleteMessage".to_owned(),
                reason: "connection reset by peer".to_owned(),
            });
        }

        match state
            .in_flight
            .iter()
            .position(|message| message.receipt_handle == receipt_handle)
        {
            Some(index) => {
                let message = state.in_flight.remove(index);
                state.deleted.push(message);
                Ok(())
            }
            None => Err(QueueError::RequestError {
                operation: "DeleteMessage".to_owned(),
                reason: format!("receipt handle {receipt_handle} is not valid"),
            }),
        }
    }
}
