// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry and dead-letter routing.
//!
//! `max_retries` is the total number of forward attempts a reading gets. A
//! delivery that has failed `a` times is requeued while `a + 1 <= max_retries`
//! and dead-lettered after that. Decode failures skip the budget entirely:
//! retrying a malformed payload cannot succeed.

/// Why a delivery needs routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ForwardFailed,
    DecodeFailed,
}

/// Where a failed delivery goes. A failure always produces a copy somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Publish a copy to the primary queue carrying `attempt` as its counter.
    Requeue { attempt: u32 },
    /// Publish the original payload and metadata to the dead-letter queue.
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Routes a delivery that has already failed `attempts` times.
    pub fn route(&self, attempts: u32, failure: FailureKind) -> Route {
        match failure {
            FailureKind::DecodeFailed => Route::DeadLetter,
            FailureKind::ForwardFailed => match attempts.checked_add(1) {
                Some(attempt) if attempt <= self.max_retries => Route::Requeue { attempt },
                _ => Route::DeadLetter,
            },
        }
    }
}
