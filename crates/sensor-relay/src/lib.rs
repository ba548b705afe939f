// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay that drains sensor readings from a broker queue, normalizes them and
//! forwards them to an HTTP ingestion endpoint, with bounded retry through the
//! queue itself and a dead-letter queue for anything that cannot be delivered.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod amqp;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod errors;
pub mod forwarder;
pub mod http;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pipeline;
pub mod policy;
pub mod transport;

pub use amqp::{AmqpPublisher, AmqpSubscription, AmqpTransport};
pub use codec::Reading;
pub use config::RelayConfig;
pub use consumer::{Consumer, ConsumerStats, ShutdownReason};
pub use delivery::{Delivery, Metadata, MetadataValue, ATTEMPTS_KEY};
pub use errors::{ConfigError, DecodeError, EncodeError, TransientFailure, TransportError};
pub use forwarder::{Forwarder, HttpForwarder};
pub use pipeline::{Failure, Outcome, Pipeline};
pub use policy::RetryPolicy;
pub use transport::{Destination, Publisher, Subscription};
