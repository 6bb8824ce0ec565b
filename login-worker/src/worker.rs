use std::future::Future;
use std::time;

use login_common::health::HealthHandle;
use login_common::pgstore::LoginStore;
use login_common::retry::RetryPolicy;
use login_common::sqs::{MessageQueue, QueueError, QueueMessage};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::processor::{MessageProcessor, Outcome};

/// Tally of a drain run, logged when the worker stops.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct DrainSummary {
    /// Receive calls made, empty batches included.
    pub batches: u64,
    pub messages: u64,
    pub succeeded: u64,
    pub quarantined: u64,
    /// Successfully processed messages deleted from the queue.
    pub acknowledged: u64,
    /// Quarantined messages deleted from the queue after reaching the max receive count.
    pub dropped: u64,
    pub delete_failures: u64,
}

/// A worker that drains a `MessageQueue` into a `LoginStore`, one message at a time.
pub struct LoginWorker<'a, Q: MessageQueue, S: LoginStore> {
    /// The queue we will be receiving login messages from.
    queue: &'a Q,
    /// Turns each message into a login row or a quarantine row.
    processor: MessageProcessor<'a, S>,
    /// How long to wait before polling again after an empty batch.
    poll_interval: time::Duration,
    /// Upper bound for every queue call.
    queue_timeout: time::Duration,
    /// Backoff between consecutive failed queue calls.
    retry_policy: RetryPolicy,
    /// Delete quarantined messages once they have been received this many times.
    max_receive_count: Option<u32>,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<'a, Q: MessageQueue, S: LoginStore> LoginWorker<'a, Q, S> {
    pub fn new(
        queue: &'a Q,
        store: &'a S,
        poll_interval: time::Duration,
        queue_timeout: time::Duration,
        retry_policy: RetryPolicy,
        max_receive_count: Option<u32>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            queue,
            processor: MessageProcessor::new(store),
            poll_interval,
            queue_timeout,
            retry_policy,
            max_receive_count,
            liveness,
        }
    }

    /// Run until the queue is drained.
    pub async fn run(&self) -> DrainSummary {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run_until(shutdown_rx).await
    }

    /// Run until the queue reports an approximate depth of zero, or until `shutdown` turns true.
    ///
    /// Shutdown is only checked between iterations: a batch that was received is always
    /// processed to the end. Errors never stop the loop: failed queue calls are retried with
    /// backoff and failed messages are quarantined by the `MessageProcessor`.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> DrainSummary {
        let mut summary = DrainSummary::default();
        let mut consecutive_failures = 0;

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping before the queue is drained");
                break;
            }

            let depth = match self
                .with_timeout("GetQueueAttributes", self.queue.approximate_depth())
                .await
            {
                Ok(depth) => depth,
                Err(error) => {
                    consecutive_failures += 1;
                    self.back_off(consecutive_failures, error, &mut shutdown)
                        .await;
                    continue;
                }
            };

            self.liveness.report_healthy().await;
            metrics::gauge!("login_queue_depth").set(depth as f64);
            info!(depth, "approximate number of messages in the queue");

            // Depth is approximate: a zero may hide a few in-flight messages. Those are
            // redelivered to the next run.
            if depth == 0 {
                break;
            }

            let batch = match self
                .with_timeout("ReceiveMessage", self.queue.receive_batch())
                .await
            {
                Ok(batch) => batch,
                Err(error) => {
                    consecutive_failures += 1;
                    self.back_off(consecutive_failures, error, &mut shutdown)
                        .await;
                    continue;
                }
            };
            consecutive_failures = 0;
            summary.batches += 1;

            if batch.is_empty() {
                debug!(depth, "received an empty batch while the queue is not empty");
                sleep_or_shutdown(self.poll_interval, &mut shutdown).await;
                continue;
            }

            for message in batch {
                self.handle_message(&message, &mut summary).await;
            }
        }

        info!(
            batches = summary.batches,
            messages = summary.messages,
            succeeded = summary.succeeded,
            quarantined = summary.quarantined,
            acknowledged = summary.acknowledged,
            dropped = summary.dropped,
            delete_failures = summary.delete_failures,
            "login worker finished"
        );

        summary
    }

    async fn handle_message(&self, message: &QueueMessage, summary: &mut DrainSummary) {
        summary.messages += 1;
        metrics::counter!("login_messages_total").increment(1);

        match self.processor.process(message).await {
            Outcome::Success => {
                summary.succeeded += 1;
                if self.delete_message(message).await {
                    summary.acknowledged += 1;
                    metrics::counter!("login_messages_acknowledged").increment(1);
                } else {
                    summary.delete_failures += 1;
                }
            }
            Outcome::Quarantined { stage, recorded } => {
                summary.quarantined += 1;

                // Never drop a message whose quarantine row wasn't written: it would be lost.
                if !recorded || !self.reached_max_receive_count(message) {
                    return;
                }

                warn!(
                    message_id = message.message_id.as_deref(),
                    receive_count = message.receive_count,
                    %stage,
                    "message reached the max receive count, dropping it from the queue"
                );
                if self.delete_message(message).await {
                    summary.dropped += 1;
                    metrics::counter!("login_messages_dropped").increment(1);
                } else {
                    summary.delete_failures += 1;
                }
            }
        }
    }

    fn reached_max_receive_count(&self, message: &QueueMessage) -> bool {
        match self.max_receive_count {
            Some(max_receive_count) => message.receive_count >= max_receive_count,
            None => false,
        }
    }

    /// Delete a message from the queue, returning whether it worked. A message we failed to
    /// delete is redelivered later, so the failure is only logged.
    async fn delete_message(&self, message: &QueueMessage) -> bool {
        match self
            .with_timeout(
                "DeleteMessage",
                self.queue.delete_message(&message.receipt_handle),
            )
            .await
        {
            Ok(()) => true,
            Err(error) => {
                error!(
                    message_id = message.message_id.as_deref(),
                    "failed to delete message, it will be redelivered: {}", error
                );
                let labels = [("operation", error.operation().to_owned())];
                metrics::counter!("login_queue_errors", &labels).increment(1);
                false
            }
        }
    }

    async fn with_timeout<T, F>(&self, operation: &str, future: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, QueueError>>,
    {
        tokio::time::timeout(self.queue_timeout, future)
            .await
            .map_err(|_| QueueError::TimeoutError {
                operation: operation.to_owned(),
                timeout: self.queue_timeout,
            })?
    }

    async fn back_off(
        &self,
        attempt: u32,
        error: QueueError,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let interval = self.retry_policy.retry_interval(attempt);
        let labels = [("operation", error.operation().to_owned())];
        error!(attempt, "queue request failed, retrying in {:?}: {}", interval, error);
        metrics::counter!("login_queue_errors", &labels).increment(1);

        sleep_or_shutdown(interval, shutdown).await;
    }
}

async fn sleep_or_shutdown(duration: time::Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {},
        Ok(()) = shutdown.changed() => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use login_common::health::HealthRegistry;
    use login_common::pgstore::MockLoginStore;
    use login_common::sqs::MockQueue;

    fn login_body(user_id: &str) -> String {
        format!(
            r#"{{"user_id":"{user_id}","device_type":"ios","ip":"1.2.3.4","device_id":"d1","locale":"en-US","app_version":"3.2.1"}}"#
        )
    }

    async fn liveness() -> HealthHandle {
        HealthRegistry::new("liveness")
            .register("drain_loop".to_string(), ::time::Duration::seconds(30))
            .await
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::build(1, time::Duration::from_millis(1)).provide()
    }

    async fn worker<'a>(
        queue: &'a MockQueue,
        store: &'a MockLoginStore,
        max_receive_count: Option<u32>,
    ) -> LoginWorker<'a, MockQueue, MockLoginStore> {
        LoginWorker::new(
            queue,
            store,
            time::Duration::from_millis(1),
            time::Duration::from_secs(5),
            retry_policy(),
            max_receive_count,
            liveness().await,
        )
    }

    #[tokio::test]
    async fn test_empty_queue_stops_without_receiving() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary, DrainSummary::default());
        assert_eq!(queue.depth_calls(), 1);
        assert_eq!(queue.receive_calls(), 0);
    }

    #[tokio::test]
    async fn test_drains_queue_and_acknowledges_successes_only() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();
        queue.push(&login_body("u1"));
        queue.push("not json");
        queue.push(r#"{"user_id":"u2","device_type":"android","locale":"fr-FR","app_version":"1.0"}"#);

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.quarantined, 2);
        assert_eq!(summary.acknowledged, 1);
        assert_eq!(summary.dropped, 0);
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.quarantined().len(), 2);

        let deleted = queue.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].body, login_body("u1"));
        // Quarantined messages are left in the queue for redelivery.
        assert_eq!(queue.in_flight().len(), 2);
        // The terminating iteration doesn't receive.
        assert_eq!(queue.depth_calls(), queue.receive_calls() + 1);
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_fetch_order() {
        let queue = MockQueue::new(2);
        let store = MockLoginStore::new();
        for user_id in ["u1", "u2", "u3", "u4", "u5"] {
            queue.push(&login_body(user_id));
        }

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.acknowledged, 5);
        let user_ids: Vec<_> = store
            .events()
            .into_iter()
            .map(|event| event.user_id.unwrap())
            .collect();
        assert_eq!(user_ids, vec!["u1", "u2", "u3", "u4", "u5"]);
        assert_eq!(queue.receive_calls(), 3);
        assert_eq!(queue.depth_calls(), 4);
    }

    #[tokio::test]
    async fn test_stale_depth_is_polled_again() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();
        queue.script_depths(&[2]);

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary.batches, 1);
        assert_eq!(summary.messages, 0);
        assert_eq!(queue.receive_calls(), 1);
        assert_eq!(queue.depth_calls(), 2);
    }

    #[tokio::test]
    async fn test_queue_errors_are_retried() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();
        queue.push(&login_body("u1"));
        queue.fail_depth_checks(2);

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary.acknowledged, 1);
        assert_eq!(queue.depth_calls(), 4);
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_message_in_flight() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();
        queue.push(&login_body("u1"));
        queue.fail_deletes(1);

        let summary = worker(&queue, &store, None).await.run().await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.acknowledged, 0);
        assert_eq!(summary.delete_failures, 1);
        assert_eq!(queue.in_flight().len(), 1);
    }

    #[tokio::test]
    async fn test_poison_message_is_dropped_at_max_receive_count() {
        let queue = MockQueue::new(10).with_redelivery();
        let store = MockLoginStore::new();
        queue.push("not json");

        let summary = worker(&queue, &store, Some(3)).await.run().await;

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.quarantined, 3);
        assert_eq!(summary.dropped, 1);
        assert_eq!(store.quarantined().len(), 3);
        let deleted = queue.deleted();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].receive_count, 3);
    }

    #[tokio::test]
    async fn test_unrecorded_quarantine_is_never_dropped() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new().reject_quarantine("connection reset");
        queue.push("not json");

        let summary = worker(&queue, &store, Some(1)).await.run().await;

        assert_eq!(summary.quarantined, 1);
        assert_eq!(summary.dropped, 0);
        assert!(queue.deleted().is_empty());
        assert_eq!(queue.in_flight().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_polling() {
        let queue = MockQueue::new(10);
        let store = MockLoginStore::new();
        queue.push(&login_body("u1"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let summary = worker(&queue, &store, None)
            .await
            .run_until(shutdown_rx)
            .await;

        assert_eq!(summary, DrainSummary::default());
        assert_eq!(queue.depth_calls(), 0);
        assert!(store.events().is_empty());
    }
}
