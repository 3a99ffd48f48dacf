//! Per-channel dispatch orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::message::{Channel, DerivedMessage};
use crate::store::{Acknowledgement, OptInStatus};
use crate::telemetry::counters;
use crate::vendor::{VendorError, VendorId, VendorRequest};

use super::callback::{AttemptOutcome, DeliveryCallback, Resubmission};
use super::inflight::InFlightPermit;
use super::retry::RetryPolicy;
use super::DispatchContext;

/// Why a message was not submitted.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("message for {message} sent to the {service} service")]
    WrongChannel { message: Channel, service: Channel },
    #[error("recipient has not opted in to WhatsApp")]
    NotOptedIn,
    #[error("no {vendor} capability registered for {channel}")]
    NoVendor { channel: Channel, vendor: VendorId },
    #[error("failed to build vendor request: {0}")]
    Build(#[from] VendorError),
    #[error("failed to write pending acknowledgement")]
    AckInsertFailed,
}

impl SubmitError {
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::WrongChannel { .. } => "wrong_channel",
            SubmitError::NotOptedIn => "not_opted_in",
            SubmitError::NoVendor { .. } => "no_vendor",
            SubmitError::Build(_) => "build_failed",
            SubmitError::AckInsertFailed => "ack_insert_failed",
        }
    }
}

/// A prepared attempt: request built, pending row written, slot held.
struct Attempt {
    vendor: VendorId,
    request: VendorRequest,
    callback: DeliveryCallback,
}

/// Dispatch orchestration for one channel.
pub struct DispatchService {
    channel: Channel,
    ctx: DispatchContext,
    policy: RetryPolicy,
    no_account_cooldown: chrono::Duration,
}

impl DispatchService {
    pub fn new(
        channel: Channel,
        ctx: DispatchContext,
        policy: RetryPolicy,
        no_account_cooldown: Duration,
    ) -> Self {
        Self {
            channel,
            ctx,
            policy,
            no_account_cooldown: chrono::Duration::from_std(no_account_cooldown)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Submit a message. Returns its reference id once the pending row is
    /// written and the attempt is spawned; delivery completes asynchronously.
    pub fn send(self: &Arc<Self>, msg: DerivedMessage) -> Result<String, SubmitError> {
        if msg.channel != self.channel {
            let err = SubmitError::WrongChannel {
                message: msg.channel,
                service: self.channel,
            };
            counters::dispatch_rejected(self.channel.label(), err.reason());
            return Err(err);
        }

        let permit = self.ctx.in_flight.acquire();
        let attempt = self.prepare(msg, permit)?;
        let reference_id = attempt.callback.message().reference_id.clone();

        let service = self.clone();
        tokio::spawn(async move { service.run(attempt).await });

        Ok(reference_id)
    }

    /// Gate, pick the vendor, build the request and write the pending row.
    /// Dropping `permit` on any failure releases the in-flight slot.
    fn prepare(&self, mut msg: DerivedMessage, permit: InFlightPermit) -> Result<Attempt, SubmitError> {
        let result = (|| {
            if self.channel == Channel::Whatsapp && !self.opted_in(&msg) {
                return Err(SubmitError::NotOptedIn);
            }

            let vendor_id = msg
                .vendor
                .unwrap_or_else(|| self.ctx.selector.select(self.channel));
            msg.vendor = Some(vendor_id);

            let vendor = self
                .ctx
                .registry
                .get(self.channel, vendor_id)
                .ok_or(SubmitError::NoVendor {
                    channel: self.channel,
                    vendor: vendor_id,
                })?;

            let request = vendor.build_request(&msg)?;

            if !self.ctx.store.insert(Acknowledgement::pending(&msg, vendor_id)) {
                return Err(SubmitError::AckInsertFailed);
            }

            Ok((vendor, request))
        })();

        match result {
            Ok((vendor, request)) => {
                let vendor_id = vendor.id();
                counters::dispatch_submitted(self.channel.label(), vendor_id.as_str());
                self.ctx.admin.inc_submitted();
                debug!(
                    reference_id = %msg.reference_id,
                    channel = %self.channel,
                    vendor = %vendor_id,
                    retry_count = msg.retry_count,
                    "dispatch submitted"
                );
                Ok(Attempt {
                    vendor: vendor_id,
                    request,
                    callback: DeliveryCallback::new(msg, vendor, self.ctx.clone(), self.policy, permit),
                })
            }
            Err(e) => {
                counters::dispatch_rejected(self.channel.label(), e.reason());
                match e {
                    SubmitError::NotOptedIn => {
                        debug!(reference_id = %msg.reference_id, "recipient not opted in, skipping")
                    }
                    ref other => {
                        warn!(reference_id = %msg.reference_id, channel = %self.channel, error = %other, "dispatch not submitted")
                    }
                }
                Err(e)
            }
        }
    }

    /// WhatsApp sends require an opt-in, or a NO_ACCNT record past its cooldown.
    fn opted_in(&self, msg: &DerivedMessage) -> bool {
        let Some(phone) = msg.destination.phone_number() else {
            return false;
        };
        match self.ctx.store.get_opt_in(phone) {
            Some(user) => match user.status {
                OptInStatus::OptIn => true,
                OptInStatus::NoAccnt => Utc::now() - user.updated_at >= self.no_account_cooldown,
                OptInStatus::OptOut => false,
            },
            None => false,
        }
    }

    /// Drive one message through its attempts. Retries run in this loop,
    /// one at a time, each only after the previous callback finished.
    async fn run(self: Arc<Self>, mut attempt: Attempt) {
        loop {
            match self.execute(attempt).await {
                AttemptOutcome::Resubmit(Resubmission { msg, permit }) => {
                    match self.prepare(msg, permit) {
                        Ok(next) => attempt = next,
                        Err(_) => return,
                    }
                }
                _ => return,
            }
        }
    }

    #[instrument(
        skip_all,
        fields(
            reference_id = %attempt.callback.message().reference_id,
            channel = %self.channel,
            vendor = %attempt.vendor,
            retry_count = attempt.callback.message().retry_count,
        )
    )]
    async fn execute(&self, attempt: Attempt) -> AttemptOutcome {
        let Attempt {
            vendor,
            request,
            callback,
        } = attempt;

        let outcome = tokio::select! {
            biased;

            _ = self.ctx.cancel.cancelled() => callback.on_cancel(),

            result = self.ctx.transport.execute(self.channel, vendor, request) => match result {
                Ok(response) => callback.on_complete(response).await,
                Err(e) => callback.on_failure(e).await,
            },
        };

        if !matches!(outcome, AttemptOutcome::Resubmit(_)) {
            info!(outcome = ?outcome, "dispatch attempt finished");
        }
        outcome
    }
}
