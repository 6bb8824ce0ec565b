pub mod health;
pub mod login_event;
pub mod masking;
pub mod metrics;
pub mod pgstore;
pub mod quarantine;
pub mod retry;
pub mod sqs;
