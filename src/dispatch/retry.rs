//! Per-channel retry and failover policy.

use crate::message::{Channel, DerivedMessage};
use crate::vendor::VendorId;

/// What to do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send again through `vendor`.
    Resubmit { vendor: VendorId },
    /// Retry budget exhausted; publish the raw event to the dead-letter topic.
    DeadLetter,
    /// Counted but not resubmitted.
    Exhausted,
    /// Channel has no retry policy.
    Terminal,
}

/// Retry policy of one channel.
///
/// - SMS: fail over to the alternate vendor until `max_retries`, then dead-letter
/// - push: same vendor until `max_retries`, then dead-letter
/// - WhatsApp: the count advances but nothing is resubmitted
/// - email: no retries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    channel: Channel,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(channel: Channel, max_retries: u32) -> Self {
        Self {
            channel,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Advance `msg` for its next attempt. Bumps `retry_count` and, on
    /// resubmission, pins the vendor the next attempt must use.
    pub fn next(&self, msg: &mut DerivedMessage, current: VendorId) -> RetryDecision {
        if self.channel == Channel::Email {
            return RetryDecision::Terminal;
        }

        msg.retry_count += 1;

        let vendor = match self.channel {
            Channel::Sms => current.alternate(),
            Channel::AppNotification => current,
            _ => return RetryDecision::Exhausted,
        };

        if msg.retry_count < self.max_retries {
            msg.vendor = Some(vendor);
            RetryDecision::Resubmit { vendor }
        } else {
            RetryDecision::DeadLetter
        }
    }
}
