//! Retry scheduling with quadratic backoff.
//!
//! The retry count rides on the delivery's `retry_count` header (absent
//! means zero). A failed attempt is republished to the same queue after
//! `n²` seconds, where `n` is the next attempt's retry count; once the
//! count reaches the ceiling the message is dead-lettered instead.

use std::time::Duration;

use lapin::types::FieldTable;
use manifold_broker::headers;
use manifold_core::DEFAULT_MAX_RETRIES;

/// Retry policy for one tenant consumer.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    /// Retry ceiling before dead-lettering.
    pub max_retries: i32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// Outcome of applying the retry policy to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish a copy carrying `retry_count` after `delay`.
    Retry {
        /// Retry count stamped on the republished copy.
        retry_count: i32,
        /// How long to wait before republishing.
        delay: Duration,
    },
    /// Retries exhausted; park the message in the dead-letter table.
    DeadLetter {
        /// Final retry count recorded on the dead-letter row.
        retry_count: i32,
    },
}

impl RetrySchedule {
    /// Creates a schedule with the given retry ceiling.
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    /// Decides what to do with a failed delivery carrying `retry_count`.
    pub fn decide(&self, retry_count: i32) -> RetryDecision {
        if retry_count < self.max_retries {
            let next = retry_count + 1;
            RetryDecision::Retry {
                retry_count: next,
                delay: Duration::from_secs(u64::try_from(next).unwrap_or(0).pow(2)),
            }
        } else {
            RetryDecision::DeadLetter { retry_count }
        }
    }
}

/// Reads the retry count off a delivery's headers; absent means zero.
pub fn retry_count_from_headers(table: Option<&FieldTable>) -> i32 {
    headers::get_int(table, headers::RETRY_COUNT)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use manifold_core::{MessageId, TenantId};

    use super::*;

    #[test]
    fn backoff_is_quadratic_in_next_attempt() {
        let schedule = RetrySchedule::default();

        assert_eq!(
            schedule.decide(0),
            RetryDecision::Retry { retry_count: 1, delay: Duration::from_secs(1) }
        );
        assert_eq!(
            schedule.decide(1),
            RetryDecision::Retry { retry_count: 2, delay: Duration::from_secs(4) }
        );
        assert_eq!(
            schedule.decide(2),
            RetryDecision::Retry { retry_count: 3, delay: Duration::from_secs(9) }
        );
    }

    #[test]
    fn exhausted_retries_dead_letter() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.decide(3), RetryDecision::DeadLetter { retry_count: 3 });
        assert_eq!(schedule.decide(7), RetryDecision::DeadLetter { retry_count: 7 });
    }

    #[test]
    fn backoff_delays_are_monotonic() {
        let schedule = RetrySchedule::new(10);
        let mut previous = Duration::ZERO;
        for count in 0..10 {
            match schedule.decide(count) {
                RetryDecision::Retry { delay, .. } => {
                    assert!(delay >= previous, "delay shrank at retry {count}");
                    previous = delay;
                },
                RetryDecision::DeadLetter { .. } => unreachable!("below ceiling"),
            }
        }
    }

    #[test]
    fn absent_header_counts_as_zero() {
        assert_eq!(retry_count_from_headers(None), 0);

        let table = headers::work_headers(MessageId::new(), TenantId::new(), 0, Utc::now(), None);
        assert_eq!(retry_count_from_headers(Some(&table)), 0);
    }

    #[test]
    fn header_round_trip_through_republish() {
        let now = Utc::now();
        let first = headers::with_retry(None, 1, now);
        assert_eq!(retry_count_from_headers(Some(&first)), 1);

        let second = headers::with_retry(Some(&first), 2, now);
        assert_eq!(retry_count_from_headers(Some(&second)), 2);
    }
}
