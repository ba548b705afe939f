// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process broker.
//!
//! Behaves like a single durable queue pair: primary publishes are fed back to
//! the subscriber, dead-letter publishes are retained for inspection. Every
//! settlement is recorded against the delivery id it was issued with. Used to
//! drive the pipeline and the consumer loop without a running broker. Only
//! built for tests or with the `test-util` feature.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::delivery::{Acknowledger, Delivery, Metadata};
use crate::errors::TransportError;
use crate::transport::{Destination, Publisher, Subscription};

/// A message as it sits in, or was published to, a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub payload: Vec<u8>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked(u64),
    Rejected(u64),
}

#[derive(Default)]
struct State {
    sender: Option<mpsc::UnboundedSender<StoredMessage>>,
    receiver: Option<mpsc::UnboundedReceiver<StoredMessage>>,
    published: Vec<(Destination, StoredMessage)>,
    settlements: Vec<Settlement>,
    failing: HashSet<Destination>,
}

struct Inner {
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn message(&self, payload: Vec<u8>, metadata: Metadata) -> StoredMessage {
        StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            payload,
            metadata,
        }
    }
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                state: Mutex::new(State {
                    sender: Some(sender),
                    receiver: Some(receiver),
                    ..Default::default()
                }),
            }),
        }
    }

    /// Places a message on the primary queue as a producer would. Returns its
    /// delivery id.
    pub fn enqueue(
        &self,
        payload: impl Into<Vec<u8>>,
        metadata: Metadata,
    ) -> Result<u64, TransportError> {
        let message = self.inner.message(payload.into(), metadata);
        let id = message.id;
        let state = self.inner.state();
        let sender = state.sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(message).map_err(|_| TransportError::Closed)?;
        Ok(id)
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Takes the receiving end of the primary queue. Only one subscription
    /// can exist per broker.
    pub fn subscribe(&self) -> Result<MemorySubscription, TransportError> {
        let receiver = self
            .inner
            .state()
            .receiver
            .take()
            .ok_or_else(|| TransportError::Consume {
                queue: "primary".to_string(),
                reason: "already subscribed".to_string(),
            })?;
        Ok(MemorySubscription {
            inner: Arc::clone(&self.inner),
            receiver,
        })
    }

    /// Makes every subsequent publish to `destination` fail.
    pub fn fail_publishes_to(&self, destination: Destination) {
        self.inner.state().failing.insert(destination);
    }

    /// Ends the delivery stream once the queued messages are drained.
    pub fn close(&self) {
        self.inner.state().sender = None;
    }

    pub fn published(&self, destination: Destination) -> Vec<StoredMessage> {
        self.inner
            .state()
            .published
            .iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.state().settlements.clone()
    }
}

pub struct MemoryPublisher {
    inner: Arc<Inner>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(
        &self,
        destination: Destination,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<(), TransportError> {
        let message = self.inner.message(payload.to_vec(), metadata.clone());
        let mut state = self.inner.state();
        if state.failing.contains(&destination) {
            return Err(TransportError::Publish {
                queue: destination.to_string(),
                reason: "publish refused".to_string(),
            });
        }

        if destination == Destination::Primary {
            let sender = state.sender.as_ref().ok_or(TransportError::Closed)?;
            sender
                .send(message.clone())
                .map_err(|_| TransportError::Closed)?;
        }
        state.published.push((destination, message));
        Ok(())
    }
}

pub struct MemorySubscription {
    inner: Arc<Inner>,
    receiver: mpsc::UnboundedReceiver<StoredMessage>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, TransportError>> {
        let message = self.receiver.recv().await?;
        let acker = MemoryAcker {
            inner: Arc::clone(&self.inner),
            id: message.id,
        };
        Some(Ok(Delivery::new(message.payload, message.metadata, acker)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.receiver.close();
        Ok(())
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    id: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.inner.state().settlements.push(Settlement::Acked(self.id));
        Ok(())
    }

    async fn reject(&self) -> Result<(), TransportError> {
        self.inner
            .state()
            .settlements
            .push(Settlement::Rejected(self.id));
        Ok(())
    }
}
