// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry policies for persisting buffered hints.

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use rand::Rng;
use serde_with::{DisplayFromStr, serde_as};

/// Jitter adds up to this fraction of each pause.
const JITTER_FRACTION: f32 = 0.3;
/// Lower bound of the jitter, keeps pauses off round values.
const MIN_JITTER: Duration = Duration::from_millis(3);

/// How often, and after which pauses, a failed operation is attempted again.
///
/// Configured like this in TOML:
///
/// ```toml
/// [flush-retry-policy]
/// type = "exponential"
/// initial-interval = "50ms"
/// factor = 2.0
/// max-attempts = 5
/// max-interval = "2s"
/// ```
#[serde_as]
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    None,
    FixedDelay {
        #[serde_as(as = "DisplayFromStr")]
        interval: humantime::Duration,
        /// Retries after the first attempt. Unbounded if unset.
        max_attempts: Option<NonZeroUsize>,
    },
    /// Pauses grow by `factor` per retry, capped at `max_interval`.
    Exponential {
        #[serde_as(as = "DisplayFromStr")]
        initial_interval: humantime::Duration,
        factor: f32,
        max_attempts: Option<NonZeroUsize>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        max_interval: Option<humantime::Duration>,
    },
}

impl RetryPolicy {
    /// # Panics
    /// If `max_attempts` is `Some(0)`.
    pub fn fixed_delay(interval: Duration, max_attempts: Option<usize>) -> Self {
        Self::FixedDelay {
            interval: interval.into(),
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
        }
    }

    /// # Panics
    /// If `max_attempts` is `Some(0)`.
    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<usize>,
        max_interval: Option<Duration>,
    ) -> Self {
        Self::Exponential {
            initial_interval: initial_interval.into(),
            factor,
            max_attempts: max_attempts.map(|m| NonZeroUsize::new(m).expect("non-zero")),
            max_interval: max_interval.map(Into::into),
        }
    }

    fn max_attempts(&self) -> Option<usize> {
        match self {
            RetryPolicy::None => Some(0),
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => max_attempts.map(NonZeroUsize::get),
        }
    }

    /// Runs `operation` until it succeeds, `condition` rejects its error or the policy runs
    /// out of retries. Returns the last error in the latter two cases.
    pub async fn retry_if<T, E, F, Fut, C>(self, mut operation: F, mut condition: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        let mut pauses = self.into_iter();
        loop {
            match operation().await {
                Ok(res) => return Ok(res),
                Err(err) if condition(&err) => match pauses.next() {
                    Some(pause) => tokio::time::sleep(pause).await,
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: self,
            retries: 0,
            last_pause: None,
        }
    }
}

/// The pauses before each retry, jittered.
#[derive(Debug)]
pub struct RetryIter {
    policy: RetryPolicy,
    retries: usize,
    last_pause: Option<Duration>,
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .policy
            .max_attempts()
            .is_some_and(|limit| self.retries >= limit)
        {
            return None;
        }
        self.retries += 1;

        let pause = match &self.policy {
            RetryPolicy::None => return None,
            RetryPolicy::FixedDelay { interval, .. } => (*interval).into(),
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_interval,
                ..
            } => {
                let pause = match self.last_pause {
                    Some(last) => last
                        .mul_f32(*factor)
                        .min(max_interval.map_or(Duration::MAX, Into::into)),
                    None => (*initial_interval).into(),
                };
                self.last_pause = Some(pause);
                pause
            }
        };
        Some(with_jitter(pause))
    }
}

fn with_jitter(pause: Duration) -> Duration {
    let max_jitter = pause.mul_f32(JITTER_FRACTION);
    if max_jitter <= MIN_JITTER {
        pause + MIN_JITTER
    } else {
        pause + rand::rng().random_range(MIN_JITTER..max_jitter)
    }
}
