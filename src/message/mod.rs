//! Message model shared by derivation, dispatch and acknowledgement tracking.

mod request;

pub use request::{Contact, MediaDescriptor, MessageRequest};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::vendor::VendorId;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Sms,
    Whatsapp,
    AppNotification,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Sms,
        Channel::Whatsapp,
        Channel::AppNotification,
        Channel::Email,
    ];

    /// Wire name of the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "SMS",
            Self::Whatsapp => "WHATSAPP",
            Self::AppNotification => "APP_NOTIFICATION",
            Self::Email => "EMAIL",
        }
    }

    /// Lowercase label used for metrics and partition names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::AppNotification => "push",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMS" => Ok(Self::Sms),
            "WHATSAPP" => Ok(Self::Whatsapp),
            "APP_NOTIFICATION" | "PUSH" => Ok(Self::AppNotification),
            "EMAIL" => Ok(Self::Email),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// Channel-specific destination attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelAttributes {
    Sms {
        phone_number: String,
    },
    Whatsapp {
        phone_number: String,
        media: Option<MediaDescriptor>,
    },
    Push {
        fcm_token: String,
        api_key: String,
        title: Option<String>,
    },
    Email {
        address: String,
        recipients: Vec<String>,
        subject: String,
    },
}

impl ChannelAttributes {
    /// Primary contact identifier (phone, token or address).
    pub fn contact_id(&self) -> &str {
        match self {
            Self::Sms { phone_number } | Self::Whatsapp { phone_number, .. } => phone_number,
            Self::Push { fcm_token, .. } => fcm_token,
            Self::Email { address, .. } => address,
        }
    }

    /// Phone number, for channels addressed by one.
    pub fn phone_number(&self) -> Option<&str> {
        match self {
            Self::Sms { phone_number } | Self::Whatsapp { phone_number, .. } => Some(phone_number),
            _ => None,
        }
    }
}

/// One message ready to send on one channel.
///
/// Created once by the deriver and owned by the dispatch attempt holding it.
/// Only `retry_count` and `vendor` change after creation.
#[derive(Debug, Clone)]
pub struct DerivedMessage {
    pub reference_id: String,
    pub channel: Channel,
    /// Pinned or resolved vendor. `None` until the selector picks one.
    pub vendor: Option<VendorId>,
    pub content: String,
    pub unicode: bool,
    pub language: String,
    pub template_name: String,
    pub placeholders: HashMap<String, String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub retry_count: u32,
    pub campaign_name: Option<String>,
    pub parent_reference_id: Option<String>,
    pub actor_id: u64,
    pub actor_type: String,
    pub destination: ChannelAttributes,
    /// Raw inbound event, forwarded verbatim on dead-letter.
    pub raw_event: Bytes,
}

impl DerivedMessage {
    pub fn contact_id(&self) -> &str {
        self.destination.contact_id()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn message(channel: Channel, destination: ChannelAttributes) -> DerivedMessage {
        DerivedMessage {
            reference_id: "ref-1".into(),
            channel,
            vendor: None,
            content: "Your code is 1234".into(),
            unicode: false,
            language: "en".into(),
            template_name: "otp".into(),
            placeholders: HashMap::from([("code".to_string(), "1234".to_string())]),
            attributes: serde_json::Map::new(),
            retry_count: 0,
            campaign_name: None,
            parent_reference_id: None,
            actor_id: 42,
            actor_type: "CUSTOMER".into(),
            destination,
            raw_event: Bytes::from_static(b"{\"raw\":true}"),
        }
    }

    pub fn sms(phone: &str) -> DerivedMessage {
        message(
            Channel::Sms,
            ChannelAttributes::Sms {
                phone_number: phone.into(),
            },
        )
    }

    pub fn whatsapp(phone: &str) -> DerivedMessage {
        message(
            Channel::Whatsapp,
            ChannelAttributes::Whatsapp {
                phone_number: phone.into(),
                media: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(
            serde_json::to_string(&Channel::AppNotification).unwrap(),
            "\"APP_NOTIFICATION\""
        );
        let parsed: Channel = serde_json::from_str("\"WHATSAPP\"").unwrap();
        assert_eq!(parsed, Channel::Whatsapp);
    }

    #[test]
    fn test_channel_from_str() {
        assert_eq!("sms".parse::<Channel>().unwrap(), Channel::Sms);
        assert_eq!("push".parse::<Channel>().unwrap(), Channel::AppNotification);
        assert!("fax".parse::<Channel>().is_err());
    }

    #[test]
    fn test_contact_id() {
        let attrs = ChannelAttributes::Email {
            address: "a@example.com".into(),
            recipients: vec!["b@example.com".into()],
            subject: "hi".into(),
        };
        assert_eq!(attrs.contact_id(), "a@example.com");
        assert_eq!(attrs.phone_number(), None);
    }
}
