//! Completion handling for one dispatch attempt.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::message::DerivedMessage;
use crate::store::{AckState, Attributes, VendorDeliveryUpdate};
use crate::telemetry::counters;
use crate::vendor::{RawResponse, Vendor};

use super::inflight::InFlightPermit;
use super::retry::{RetryDecision, RetryPolicy};
use super::transport::TransportError;
use super::DispatchContext;

/// Longest response body excerpt kept in `errorDetail`.
const ERROR_BODY_LIMIT: usize = 256;

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Vendor accepted the message.
    Delivered,
    /// Vendor refused the request (4xx); no retry.
    Rejected,
    /// Send again; the message already carries the bumped retry count and vendor.
    Resubmit(Resubmission),
    /// Retry budget exhausted; raw event forwarded to the dead-letter topic.
    DeadLettered,
    /// Failed with no further action for this channel.
    Abandoned,
    /// Cancelled before the vendor answered.
    Cancelled,
}

/// Next attempt of a retried message. Holds its in-flight slot so the
/// counter never drops to zero between attempts.
#[derive(Debug)]
pub struct Resubmission {
    pub msg: DerivedMessage,
    pub permit: InFlightPermit,
}

/// Bound to exactly one dispatch attempt and consumed by exactly one of
/// `on_complete`, `on_failure` or `on_cancel`. Dropping the held permit is
/// the in-flight decrement.
pub struct DeliveryCallback {
    msg: DerivedMessage,
    vendor: Arc<dyn Vendor>,
    ctx: DispatchContext,
    policy: RetryPolicy,
    permit: InFlightPermit,
    started: Instant,
}

impl DeliveryCallback {
    pub fn new(
        msg: DerivedMessage,
        vendor: Arc<dyn Vendor>,
        ctx: DispatchContext,
        policy: RetryPolicy,
        permit: InFlightPermit,
    ) -> Self {
        Self {
            msg,
            vendor,
            ctx,
            policy,
            permit,
            started: Instant::now(),
        }
    }

    pub fn message(&self) -> &DerivedMessage {
        &self.msg
    }

    /// The vendor answered with an HTTP response.
    pub async fn on_complete(self, response: RawResponse) -> AttemptOutcome {
        let elapsed = self.started.elapsed().as_secs_f64();
        let channel = self.msg.channel.label();
        let vendor = self.vendor.id();

        if response.is_success() {
            let result = self.vendor.parse_result(&response);
            if result.delivered {
                counters::vendor_response(channel, vendor.as_str(), "delivered", elapsed);
                self.record(
                    AckState::VendorDelivered,
                    &result.vendor_message_id,
                    Attributes::new(),
                );
                self.ctx.admin.inc_delivered();
                info!(
                    reference_id = %self.msg.reference_id,
                    vendor_message_id = %result.vendor_message_id,
                    "vendor accepted message"
                );
                return AttemptOutcome::Delivered;
            }

            counters::vendor_response(channel, vendor.as_str(), "vendor_error", elapsed);
            let detail = result
                .error_detail
                .unwrap_or_else(|| "vendor reported failure".to_string());
            warn!(reference_id = %self.msg.reference_id, error = %detail, "vendor reported failure");
            self.record(AckState::VendorUndelivered, "", error_detail(&detail));
            return self.retry().await;
        }

        let detail = format!("HTTP {}: {}", response.status, excerpt(&response.body));
        self.record(AckState::VendorUndelivered, "", error_detail(&detail));

        if response.is_client_error() {
            counters::vendor_response(channel, vendor.as_str(), "client_error", elapsed);
            warn!(
                reference_id = %self.msg.reference_id,
                status = response.status,
                "vendor rejected request"
            );
            self.ctx.admin.inc_failed();
            self.emit_terminal().await;
            return AttemptOutcome::Rejected;
        }

        counters::vendor_response(channel, vendor.as_str(), "server_error", elapsed);
        warn!(reference_id = %self.msg.reference_id, status = response.status, "vendor server error");
        self.retry().await
    }

    /// The request produced no response.
    pub async fn on_failure(self, error: TransportError) -> AttemptOutcome {
        counters::vendor_response(
            self.msg.channel.label(),
            self.vendor.id().as_str(),
            "transport_error",
            self.started.elapsed().as_secs_f64(),
        );
        warn!(reference_id = %self.msg.reference_id, error = %error, "vendor request failed");
        self.record(
            AckState::VendorUndelivered,
            "",
            error_detail(&error.to_string()),
        );
        self.retry().await
    }

    /// The attempt was aborted by shutdown. No retry.
    pub fn on_cancel(self) -> AttemptOutcome {
        counters::dispatch_cancelled(self.msg.channel.label());
        warn!(
            reference_id = %self.msg.reference_id,
            channel = %self.msg.channel,
            "dispatch attempt cancelled"
        );
        AttemptOutcome::Cancelled
    }

    async fn retry(self) -> AttemptOutcome {
        let DeliveryCallback {
            mut msg,
            vendor,
            ctx,
            policy,
            permit,
            ..
        } = self;

        if let Some(row) = ctx
            .store
            .get_by_reference_and_channel(&msg.reference_id, msg.channel)
        {
            if row.state.is_customer_terminal() {
                debug!(reference_id = %msg.reference_id, state = %row.state, "already terminal, not retrying");
                return AttemptOutcome::Abandoned;
            }
        }

        let outcome = match policy.next(&mut msg, vendor.id()) {
            RetryDecision::Resubmit { vendor: next } => {
                counters::dispatch_retry(msg.channel.label(), next.as_str());
                info!(
                    reference_id = %msg.reference_id,
                    retry_count = msg.retry_count,
                    from = %vendor.id(),
                    to = %next,
                    "retrying dispatch"
                );
                let next_permit = ctx.in_flight.acquire();
                return AttemptOutcome::Resubmit(Resubmission {
                    msg,
                    permit: next_permit,
                });
            }
            RetryDecision::DeadLetter => {
                record_retry_count(&ctx, &msg);
                counters::dispatch_dead_letter(msg.channel.label());
                warn!(
                    reference_id = %msg.reference_id,
                    retry_count = msg.retry_count,
                    max_retries = policy.max_retries(),
                    "retries exhausted, dead-lettering"
                );
                ctx.emitter
                    .dead_letter(&msg.reference_id, msg.raw_event.clone())
                    .await;
                AttemptOutcome::DeadLettered
            }
            RetryDecision::Exhausted => {
                record_retry_count(&ctx, &msg);
                warn!(
                    reference_id = %msg.reference_id,
                    retry_count = msg.retry_count,
                    "no failover for channel {}, not resubmitting",
                    msg.channel
                );
                AttemptOutcome::Abandoned
            }
            RetryDecision::Terminal => {
                warn!(reference_id = %msg.reference_id, channel = %msg.channel, "send failed, channel has no retry");
                AttemptOutcome::Abandoned
            }
        };

        ctx.admin.inc_failed();
        if let Some(row) = ctx
            .store
            .get_by_reference_and_channel(&msg.reference_id, msg.channel)
        {
            ctx.emitter.publish(&row, row.state).await;
        }
        drop(permit);
        outcome
    }

    fn record(&self, state: AckState, vendor_message_id: &str, attributes_delta: Attributes) {
        let update = VendorDeliveryUpdate {
            state,
            vendor_delivery_time: Utc::now(),
            vendor_message_id: vendor_message_id.to_string(),
            reference_id: self.msg.reference_id.clone(),
            attributes_delta,
            channel: self.msg.channel,
        };
        if !self.ctx.store.update_vendor_delivery(update) {
            warn!(
                reference_id = %self.msg.reference_id,
                state = %state,
                "acknowledgement not advanced"
            );
        }
    }

    async fn emit_terminal(&self) {
        if let Some(row) = self
            .ctx
            .store
            .get_by_reference_and_channel(&self.msg.reference_id, self.msg.channel)
        {
            self.ctx.emitter.publish(&row, row.state).await;
        }
    }
}

/// Persist the final retry count on the row of an abandoned message.
fn record_retry_count(ctx: &DispatchContext, msg: &DerivedMessage) {
    if let Some(mut row) = ctx
        .store
        .get_by_reference_and_channel(&msg.reference_id, msg.channel)
    {
        row.retry_count = msg.retry_count;
        ctx.store.insert(row);
    }
}

fn error_detail(detail: &str) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("errorDetail".into(), detail.into());
    attributes
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_limits_body() {
        let long = "x".repeat(1000);
        assert_eq!(excerpt(&long).len(), ERROR_BODY_LIMIT);
        assert_eq!(excerpt("short"), "short");
    }

    #[test]
    fn test_error_detail_attribute() {
        let attrs = error_detail("boom");
        assert_eq!(attrs["errorDetail"], "boom");
    }
}
