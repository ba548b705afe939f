// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the relay.

use reqwest::StatusCode;

/// The payload could not be turned into a valid reading. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("json unmarshal error: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing city")]
    MissingCity,
}

/// A reading could not be serialized for forwarding.
#[derive(Debug, thiserror::Error)]
#[error("failed to marshal payload: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

/// The sink did not accept a reading. Retried by policy, then dead-lettered.
#[derive(Debug, thiserror::Error)]
pub enum TransientFailure {
    #[error("unexpected status code {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("http request failed: {0}")]
    Network(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl TransientFailure {
    /// Status code returned by the sink, if the request got that far.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Publishing to, acknowledging on, or reading from the broker failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to publish to {queue}: {reason}")]
    Publish { queue: String, reason: String },

    #[error("broker refused publish to {0}")]
    PublishNacked(String),

    #[error("broker returned unroutable publish to {queue}: {reason}")]
    Unroutable { queue: String, reason: String },

    #[error("failed to {action} delivery: {reason}")]
    Acknowledge { action: &'static str, reason: String },

    #[error("failed to consume from {queue}: {reason}")]
    Consume { queue: String, reason: String },

    #[error("transport closed")]
    Closed,
}

/// Invalid relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(DecodeError::MissingCity.to_string(), "missing city");
        assert_eq!(
            ConfigError::Invalid("QUEUE_NAME cannot be empty".to_string()).to_string(),
            "Invalid configuration: QUEUE_NAME cannot be empty"
        );
        let failure = TransientFailure::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "unexpected status code 500 Internal Server Error: boom"
        );
    }

    #[test]
    fn test_transient_failure_status() {
        let failure = TransientFailure::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(failure.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(
            TransientFailure::Network("connection refused".into()).status(),
            None
        );
    }

    #[test]
    fn test_decode_error_from_json() {
        let err = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        let decode: DecodeError = err.into();
        assert!(decode.to_string().starts_with("json unmarshal error"));
    }
}
