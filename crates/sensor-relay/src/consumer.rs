// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumer loop and shutdown coordination.
//!
//! Deliveries are pulled one at a time and handed to the pipeline on their
//! own task. A semaphore sized to the prefetch count keeps the number of
//! in-flight invocations within what the broker allows unacknowledged.
//!
//! Shutdown is cooperative: cancelling the token stops further pulls, then
//! every in-flight invocation is awaited so it can settle its delivery before
//! the subscription is closed. A broker-side end of stream is handled the
//! same way.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::TransportError;
use crate::pipeline::{Outcome, Pipeline};
use crate::transport::Subscription;

#[derive(Debug)]
pub enum ShutdownReason {
    /// The cancellation token was triggered.
    Cancelled,
    /// The broker ended the delivery stream.
    StreamClosed,
    /// The delivery stream yielded an error.
    StreamFailed(TransportError),
}

/// Tally of pipeline outcomes over the life of a consumer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub forwarded: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub rejected: u64,
    pub unsettled: u64,
    pub panicked: u64,
}

impl ConsumerStats {
    fn record(&mut self, result: Result<Outcome, JoinError>) {
        match result {
            Ok(Outcome::Forwarded) => self.forwarded += 1,
            Ok(Outcome::Requeued { .. }) => self.requeued += 1,
            Ok(Outcome::DeadLettered { .. }) => self.dead_lettered += 1,
            Ok(Outcome::Rejected { .. }) => self.rejected += 1,
            Ok(Outcome::Unsettled { .. }) => self.unsettled += 1,
            Err(e) => {
                error!("Consumer | pipeline task failed: {e}");
                self.panicked += 1;
            }
        }
    }

    pub fn processed(&self) -> u64 {
        self.forwarded + self.requeued + self.dead_lettered + self.rejected + self.unsettled
    }
}

pub struct Consumer<S> {
    subscription: S,
    pipeline: Arc<Pipeline>,
    max_in_flight: usize,
    cancel_token: CancellationToken,
}

impl<S: Subscription> Consumer<S> {
    pub fn new(
        subscription: S,
        pipeline: Arc<Pipeline>,
        prefetch: u16,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            pipeline,
            max_in_flight: usize::from(prefetch.max(1)),
            cancel_token,
        }
    }

    /// Consumes until cancelled or until the stream ends, then drains
    /// in-flight work and closes the subscription.
    pub async fn run(mut self) -> (ShutdownReason, ConsumerStats) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();
        let mut stats = ConsumerStats::default();

        let reason = loop {
            while let Some(result) = tasks.try_join_next() {
                stats.record(result);
            }

            let permit = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break ShutdownReason::Cancelled,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break ShutdownReason::Cancelled,
                },
            };

            let next = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break ShutdownReason::Cancelled,
                next = self.subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let pipeline = Arc::clone(&self.pipeline);
                    tasks.spawn(async move {
                        let outcome = pipeline.process(delivery).await;
                        drop(permit);
                        outcome
                    });
                }
                Some(Err(e)) => {
                    error!("Consumer | delivery stream failed, exiting: {e}");
                    break ShutdownReason::StreamFailed(e);
                }
                None => {
                    warn!("Consumer | deliveries channel closed, exiting");
                    break ShutdownReason::StreamClosed;
                }
            }
        };

        info!(
            in_flight = tasks.len(),
            "Consumer | stopped pulling deliveries, waiting for in-flight work"
        );
        while let Some(result) = tasks.join_next().await {
            stats.record(result);
        }

        if let Err(e) = self.subscription.close().await {
            warn!("Consumer | failed to close subscription: {e}");
        }
        debug!(?stats, "Consumer | shutdown complete");

        (reason, stats)
    }
}
