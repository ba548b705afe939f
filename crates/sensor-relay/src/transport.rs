// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker boundary used by the pipeline and the consumer loop.

use std::fmt;

use async_trait::async_trait;

use crate::delivery::{Delivery, Metadata};
use crate::errors::TransportError;

/// Where a published copy is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Primary,
    DeadLetter,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` with `metadata` and waits for the broker to
    /// confirm it.
    async fn publish(
        &self,
        destination: Destination,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` means the broker closed the stream.
    ///
    /// Must be cancel safe: the consumer loop races it against shutdown.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, TransportError>>;

    /// Stops the subscription and releases the underlying channel.
    async fn close(&mut self) -> Result<(), TransportError>;
}
