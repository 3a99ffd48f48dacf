//! Inbound message-request event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Channel;
use crate::vendor::VendorId;

/// Raw message request as consumed from the inbound stream.
///
/// One request fans out to one message per listed channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub channels: Vec<Channel>,
    pub actor_id: u64,
    #[serde(default)]
    pub actor_type: String,
    #[serde(default)]
    pub contact: Contact,
    pub template_name: String,
    #[serde(default)]
    pub placeholders: HashMap<String, String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Optional vendor pin; bypasses weighted selection.
    #[serde(default)]
    pub vendor: Option<VendorId>,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub parent_reference_id: Option<String>,
}

/// Contact points of the target actor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub fcm_token: Option<String>,
    #[serde(default)]
    pub fcm_api_key: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Media attached to a WhatsApp message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    pub url: String,
    /// `image`, `document`, `video`
    pub kind: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_request() {
        let raw = r#"{"channels":["SMS","EMAIL"],"actorId":42,"templateName":"otp"}"#;
        let req: MessageRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.channels, vec![Channel::Sms, Channel::Email]);
        assert_eq!(req.actor_id, 42);
        assert!(req.placeholders.is_empty());
        assert!(req.vendor.is_none());
    }

    #[test]
    fn test_parse_full_request() {
        let raw = r#"{
            "channels": ["WHATSAPP"],
            "actorId": 7,
            "actorType": "CUSTOMER",
            "contact": {"phoneNumber": "919800000001"},
            "templateName": "order_shipped",
            "placeholders": {"order": "A-1"},
            "vendor": "karix",
            "media": {"url": "https://cdn/x.png", "kind": "image"},
            "campaignName": "CMP_diwali"
        }"#;
        let req: MessageRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.vendor, Some(VendorId::Karix));
        assert_eq!(req.contact.phone_number.as_deref(), Some("919800000001"));
        assert_eq!(req.media.unwrap().kind, "image");
    }
}
