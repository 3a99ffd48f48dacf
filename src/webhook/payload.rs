//! Vendor delivery-status payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::message::Channel;
use crate::vendor::VendorId;

/// Webhook payload failure.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("malformed webhook payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("webhook payload has no {0}")]
    MissingField(&'static str),
    #[error("{0} does not send delivery webhooks")]
    Unsupported(VendorId),
}

/// Vendor status, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Submitted,
    Sent,
    Delivered,
    Read,
    Failed,
    Unknown,
}

impl WebhookStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "SUBMITTED" | "ENROUTE" | "ACCEPTED" | "BUFFERED" => Self::Submitted,
            "SENT" => Self::Sent,
            "DELIVERED" | "DELIVRD" => Self::Delivered,
            "READ" | "VIEW" | "SEEN" => Self::Read,
            "FAILED" | "UNDELIV" | "UNDELIVERED" | "REJECTED" | "EXPIRED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Statuses that mean the message is still on its way.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::Unknown | Self::Failed)
    }
}

/// Delivery-status callback after vendor-specific decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub channel: Channel,
    pub vendor: VendorId,
    pub vendor_message_id: String,
    pub status: WebhookStatus,
    /// Status as the vendor wrote it.
    pub raw_status: String,
    pub cause: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub fragment_count: Option<u32>,
}

impl WebhookEvent {
    /// Cause in canonical form: upper case, words joined by `_`.
    pub fn normalized_cause(&self) -> Option<String> {
        self.cause
            .as_deref()
            .map(|c| c.trim().to_ascii_uppercase().replace([' ', '-'], "_"))
            .filter(|c| !c.is_empty())
    }
}

/// Decode a vendor's webhook body. A body may carry one report or a batch.
pub fn parse(vendor: VendorId, body: &[u8]) -> Result<Vec<WebhookEvent>, WebhookError> {
    match vendor {
        VendorId::Gupshup => decode::<GupshupReport>(body)?
            .into_iter()
            .map(|r| r.into_event())
            .collect(),
        VendorId::Karix => decode::<KarixReport>(body)?
            .into_iter()
            .map(|r| r.into_event())
            .collect(),
        other => Err(WebhookError::Unsupported(other)),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<Vec<T>, WebhookError> {
    Ok(match serde_json::from_slice::<OneOrMany<T>>(body)? {
        OneOrMany::One(report) => vec![report],
        OneOrMany::Many(reports) => reports,
    })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, WebhookError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(WebhookError::MissingField(field))
}

fn channel_or_sms(channel: Option<&str>) -> Channel {
    channel.and_then(|c| c.parse().ok()).unwrap_or(Channel::Sms)
}

/// Gupshup delivery report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GupshupReport {
    external_id: Option<String>,
    event_type: Option<String>,
    cause: Option<String>,
    /// Epoch milliseconds.
    event_ts: Option<i64>,
    no_of_frags: Option<u32>,
    channel: Option<String>,
}

impl GupshupReport {
    fn into_event(self) -> Result<WebhookEvent, WebhookError> {
        let raw_status = required(self.event_type, "eventType")?;
        Ok(WebhookEvent {
            channel: channel_or_sms(self.channel.as_deref()),
            vendor: VendorId::Gupshup,
            vendor_message_id: required(self.external_id, "externalId")?,
            status: WebhookStatus::parse(&raw_status),
            raw_status,
            cause: self.cause,
            delivered_at: self
                .event_ts
                .and_then(|ts| Utc.timestamp_millis_opt(ts).single()),
            fragment_count: self.no_of_frags,
        })
    }
}

/// Karix delivery report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KarixReport {
    mid: Option<String>,
    status: Option<String>,
    reason: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    parts: Option<u32>,
    channel: Option<String>,
}

impl KarixReport {
    fn into_event(self) -> Result<WebhookEvent, WebhookError> {
        let raw_status = required(self.status, "status")?;
        Ok(WebhookEvent {
            channel: channel_or_sms(self.channel.as_deref()),
            vendor: VendorId::Karix,
            vendor_message_id: required(self.mid, "mid")?,
            status: WebhookStatus::parse(&raw_status),
            raw_status,
            cause: self.reason,
            delivered_at: self.delivered_at,
            fragment_count: self.parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gupshup_report() {
        let body = br#"{"externalId":"gs-1","eventType":"DELIVERED","cause":"SUCCESS",
                        "eventTs":1767225600000,"noOfFrags":2}"#;
        let events = parse(VendorId::Gupshup, body).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel, Channel::Sms);
        assert_eq!(event.vendor_message_id, "gs-1");
        assert_eq!(event.status, WebhookStatus::Delivered);
        assert_eq!(event.fragment_count, Some(2));
        assert_eq!(event.delivered_at.unwrap().timestamp(), 1_767_225_600);
    }

    #[test]
    fn test_parse_gupshup_batch_with_channel() {
        let body = br#"[{"externalId":"a","eventType":"VIEW","channel":"WHATSAPP"},
                        {"externalId":"b","eventType":"FAILED","cause":"unknown subscriber"}]"#;
        let events = parse(VendorId::Gupshup, body).unwrap();
        assert_eq!(events[0].channel, Channel::Whatsapp);
        assert_eq!(events[0].status, WebhookStatus::Read);
        assert_eq!(
            events[1].normalized_cause().as_deref(),
            Some("UNKNOWN_SUBSCRIBER")
        );
    }

    #[test]
    fn test_parse_karix_report() {
        let body = br#"{"mid":"kx-9","status":"sent","deliveredAt":"2026-01-01T00:00:00Z","channel":"WHATSAPP"}"#;
        let events = parse(VendorId::Karix, body).unwrap();
        assert_eq!(events[0].vendor, VendorId::Karix);
        assert_eq!(events[0].status, WebhookStatus::Sent);
        assert_eq!(events[0].raw_status, "sent");
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(matches!(
            parse(VendorId::Gupshup, b"not json"),
            Err(WebhookError::Malformed(_))
        ));
        assert!(matches!(
            parse(VendorId::Gupshup, br#"{"eventType":"SENT"}"#),
            Err(WebhookError::MissingField("externalId"))
        ));
        assert!(matches!(
            parse(VendorId::Fcm, b"{}"),
            Err(WebhookError::Unsupported(VendorId::Fcm))
        ));
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(WebhookStatus::parse("enroute"), WebhookStatus::Submitted);
        assert_eq!(WebhookStatus::parse("DELIVRD"), WebhookStatus::Delivered);
        assert_eq!(WebhookStatus::parse("bogus"), WebhookStatus::Unknown);
        assert!(WebhookStatus::Failed.is_in_flight());
        assert!(!WebhookStatus::Read.is_in_flight());
    }
}
