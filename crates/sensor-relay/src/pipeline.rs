// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-delivery processing.
//!
//! ```text
//!   received ──decode──> validated ──forward──> forwarded ───────────────┐
//!      │                                  │                              │
//!      │ invalid                          │ failed                       │
//!      v                                  v                              v
//!   dead-letter publish <──exhausted── retry policy ──requeue publish──> ack
//!      │                                                      │
//!      └──────────── publish failed: reject ◄─────────────────┘
//! ```
//!
//! Every invocation ends with exactly one acknowledge or reject on the
//! originating delivery. Publishes happen before that call, so a message is
//! only acknowledged once its copy is confirmed by the broker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{self, Reading};
use crate::delivery::{self, Delivery};
use crate::errors::{DecodeError, TransientFailure, TransportError};
use crate::forwarder::Forwarder;
use crate::policy::{FailureKind, RetryPolicy, Route};
use crate::transport::{Destination, Publisher};

/// Why a delivery could not be forwarded.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("validation failed: {0}")]
    Invalid(#[from] DecodeError),

    #[error("forward failed: {0}")]
    Sink(#[from] TransientFailure),
}

impl Failure {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Invalid(_) => FailureKind::DecodeFailed,
            Self::Sink(_) => FailureKind::ForwardFailed,
        }
    }
}

/// How a pipeline invocation ended.
#[derive(Debug)]
pub enum Outcome {
    /// The sink accepted the reading; the delivery was acknowledged.
    Forwarded,
    /// A copy carrying `attempt` was published to the primary queue; the
    /// original was acknowledged.
    Requeued { attempt: u32 },
    /// The original was published to the dead-letter queue and acknowledged.
    DeadLettered { failure: Failure },
    /// Publishing to `destination` failed; the delivery was rejected.
    Rejected {
        destination: Destination,
        error: TransportError,
    },
    /// The acknowledge or reject call itself failed.
    Unsettled {
        action: &'static str,
        error: TransportError,
    },
}

impl Outcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            Self::Forwarded | Self::Requeued { .. } | Self::DeadLettered { .. }
        )
    }
}

pub struct Pipeline {
    forwarder: Arc<dyn Forwarder>,
    publisher: Arc<dyn Publisher>,
    policy: RetryPolicy,
    forward_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        forwarder: Arc<dyn Forwarder>,
        publisher: Arc<dyn Publisher>,
        policy: RetryPolicy,
        forward_timeout: Duration,
    ) -> Self {
        Self {
            forwarder,
            publisher,
            policy,
            forward_timeout,
        }
    }

    /// Runs one delivery to completion and settles it.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let attempts = delivery.attempts();
        debug!(
            len = delivery.payload().len(),
            attempts, "Pipeline | received message"
        );

        match self.try_forward(delivery.payload(), attempts).await {
            Ok(reading) => {
                info!(
                    city = %reading.city,
                    timestamp = %reading.timestamp_utc,
                    "Pipeline | processed message"
                );
                Self::acknowledge(delivery, Outcome::Forwarded).await
            }
            Err(failure) => match self.policy.route(attempts, failure.kind()) {
                Route::Requeue { attempt } => self.requeue(delivery, attempt).await,
                Route::DeadLetter => self.dead_letter(delivery, failure).await,
            },
        }
    }

    async fn try_forward(&self, payload: &[u8], attempts: u32) -> Result<Reading, Failure> {
        let reading = codec::decode(payload).map_err(|e| {
            warn!(error = %e, "Pipeline | validation failed, sending to dead-letter queue");
            e
        })?;
        let reading = codec::normalize(reading);

        self.forwarder
            .forward(&reading, self.forward_timeout)
            .await
            .map_err(|e| {
                warn!(
                    attempt = attempts.saturating_add(1),
                    max_retries = self.policy.max_retries(),
                    status = ?e.status(),
                    error = %e,
                    "Pipeline | forward failed"
                );
                e
            })?;

        Ok(reading)
    }

    async fn requeue(&self, delivery: Delivery, attempt: u32) -> Outcome {
        let metadata = delivery::with_attempts(delivery.metadata(), attempt);
        match self
            .publisher
            .publish(Destination::Primary, delivery.payload(), &metadata)
            .await
        {
            Ok(()) => {
                info!(attempt, "Pipeline | republished message for retry, acking original");
                Self::acknowledge(delivery, Outcome::Requeued { attempt }).await
            }
            Err(error) => {
                error!(attempt, error = %error, "Pipeline | failed to republish for retry");
                Self::reject(delivery, Destination::Primary, error).await
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, failure: Failure) -> Outcome {
        if let Failure::Sink(_) = failure {
            error!(
                max_retries = self.policy.max_retries(),
                "Pipeline | max retries reached, sending to dead-letter queue"
            );
        }
        match self
            .publisher
            .publish(Destination::DeadLetter, delivery.payload(), delivery.metadata())
            .await
        {
            Ok(()) => {
                info!(reason = %failure, "Pipeline | message dead-lettered");
                Self::acknowledge(delivery, Outcome::DeadLettered { failure }).await
            }
            Err(error) => {
                error!(error = %error, "Pipeline | failed to publish to dead-letter queue");
                Self::reject(delivery, Destination::DeadLetter, error).await
            }
        }
    }

    async fn acknowledge(delivery: Delivery, outcome: Outcome) -> Outcome {
        match delivery.ack().await {
            Ok(()) => outcome,
            Err(error) => {
                error!(error = %error, "Pipeline | failed to ack delivery");
                Outcome::Unsettled { action: "ack", error }
            }
        }
    }

    async fn reject(
        delivery: Delivery,
        destination: Destination,
        error: TransportError,
    ) -> Outcome {
        match delivery.reject().await {
            Ok(()) => Outcome::Rejected { destination, error },
            Err(reject_error) => {
                error!(error = %reject_error, "Pipeline | failed to reject delivery");
                Outcome::Unsettled {
                    action: "reject",
                    error: reject_error,
                }
            }
        }
    }
}
