use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::masking::mask;

/// Enumeration of errors that can occur while normalizing a `RawLoginEvent`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("required field '{0}' is missing from the login event")]
    MissingField(&'static str),
}

/// A login event as published by clients. Every field is optional on the wire: a missing
/// key and an explicit `null` both deserialize to `None`.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct RawLoginEvent {
    /// Opaque: producers send it as a string or a number, it's kept in its text form.
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub user_id: Option<String>,
    pub device_type: Option<String>,
    pub ip: Option<String>,
    pub device_id: Option<String>,
    pub locale: Option<String>,
    pub app_version: Option<String>,
}

/// A login event ready to be written to `user_logins`. PII fields only exist in masked form.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct NormalizedLoginEvent {
    pub user_id: Option<String>,
    pub device_type: Option<String>,
    pub masked_ip: String,
    pub masked_device_id: String,
    pub locale: Option<String>,
    pub app_version: Option<String>,
    pub create_date: DateTime<Utc>,
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(value)) => Ok(Some(value)),
        Some(serde_json::Value::Number(value)) => Ok(Some(value.to_string())),
        Some(serde_json::Value::Bool(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or a number, found {other}"
        ))),
    }
}

impl RawLoginEvent {
    /// Normalize this event, stamping it with the current time.
    pub fn normalize(&self) -> Result<NormalizedLoginEvent, NormalizeError> {
        self.normalize_at(Utc::now())
    }

    /// Normalize this event, stamping it with `ingested_at`.
    ///
    /// `create_date` is always the ingestion time: producers don't get to pick it.
    /// Only `ip` and `device_id` are required, everything else is forwarded as-is and left
    /// for the store to validate.
    pub fn normalize_at(
        &self,
        ingested_at: DateTime<Utc>,
    ) -> Result<NormalizedLoginEvent, NormalizeError> {
        let ip = self.ip.as_deref().ok_or(NormalizeError::MissingField("ip"))?;
        let device_id = self
            .device_id
            .as_deref()
            .ok_or(NormalizeError::MissingField("device_id"))?;

        Ok(NormalizedLoginEvent {
            user_id: self.user_id.clone(),
            device_type: self.device_type.clone(),
            masked_ip: mask(ip),
            masked_device_id: mask(device_id),
            locale: self.locale.clone(),
            app_version: self.app_version.clone(),
            create_date: ingested_at,
        })
    }
}
