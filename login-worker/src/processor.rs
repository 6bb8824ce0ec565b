use login_common::login_event::RawLoginEvent;
use login_common::pgstore::LoginStore;
use login_common::quarantine::{FailureStage, QuarantineRecord};
use login_common::sqs::QueueMessage;
use tracing::{debug, error, warn};

use crate::error::{ProcessingError, QuarantineWriteError};

/// What happened to a single message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Outcome {
    /// The login event was written to `user_logins`: the message can be acknowledged.
    Success,
    /// Processing failed at `stage`. `recorded` tells whether the quarantine row was written.
    Quarantined { stage: FailureStage, recorded: bool },
}

/// A processing error along with the most complete payload available when it happened.
struct Failure {
    error: ProcessingError,
    payload: Option<serde_json::Value>,
}

impl Failure {
    fn new(error: impl Into<ProcessingError>, payload: Option<serde_json::Value>) -> Self {
        Self {
            error: error.into(),
            payload,
        }
    }
}

/// Turns queue messages into `user_logins` rows, quarantining anything that can't make it.
pub struct MessageProcessor<'s, S: LoginStore> {
    store: &'s S,
}

impl<'s, S: LoginStore> MessageProcessor<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Process a single message: parse, normalize and persist it.
    ///
    /// Every failure ends up as exactly one quarantine row carrying the failing stage, the error
    /// message, the message envelope and the best-effort payload:
    /// * `parse`: the body as JSON, or nothing if it isn't JSON at all.
    /// * `normalize`: the body as received.
    /// * `persist`: the normalized login event.
    pub async fn process(&self, message: &QueueMessage) -> Outcome {
        let now = tokio::time::Instant::now();

        let outcome = match self.persist(message).await {
            Ok(()) => {
                debug!(message_id = message.message_id.as_deref(), "login event inserted");
                metrics::counter!("login_events_inserted").increment(1);
                Outcome::Success
            }
            Err(failure) => self.quarantine(message, failure).await,
        };

        metrics::histogram!("login_message_processing_duration_seconds")
            .record(now.elapsed().as_secs_f64());

        outcome
    }

    async fn persist(&self, message: &QueueMessage) -> Result<(), Failure> {
        let body: serde_json::Value =
            serde_json::from_str(&message.body).map_err(|e| Failure::new(e, None))?;
        let raw: RawLoginEvent = match serde_json::from_value(body.clone()) {
            Ok(raw) => raw,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };

        let normalized = raw.normalize().map_err(|e| Failure::new(e, Some(body)))?;

        self.store
            .insert_event(&normalized)
            .await
            .map_err(|e| Failure::new(e, serde_json::to_value(&normalized).ok()))
    }

    async fn quarantine(&self, message: &QueueMessage, failure: Failure) -> Outcome {
        let stage = failure.error.stage();
        let labels = [("stage", stage.to_string())];

        warn!(
            message_id = message.message_id.as_deref(),
            %stage,
            "quarantining login message: {}",
            failure.error
        );

        let record = QuarantineRecord::new(
            stage,
            &failure.error.to_string(),
            message.envelope(),
            failure.payload,
        );

        match self.store.insert_quarantine(&record).await {
            Ok(()) => {
                metrics::counter!("login_messages_quarantined", &labels).increment(1);
                Outcome::Quarantined {
                    stage,
                    recorded: true,
                }
            }
            Err(error) => {
                let error = QuarantineWriteError { stage, error };
                error!(
                    message_id = message.message_id.as_deref(),
                    "{}, leaving it in the queue", error
                );
                metrics::counter!("login_quarantine_write_failures", &labels).increment(1);
                Outcome::Quarantined {
                    stage,
                    recorded: false,
                }
            }
        }
    }
}
