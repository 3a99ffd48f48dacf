//! Message derivation.
//!
//! Turns one raw message-request event into a [`DerivedMessage`] per listed
//! channel: resolves language and template, renders content, picks the
//! destination attributes and assigns a fresh reference id. A channel that
//! cannot be derived is logged, counted and skipped; the others still go out.

mod template;

pub use template::{
    render, DefaultLanguageResolver, LanguageResolver, StaticTemplateCatalog, Template,
    TemplateCatalog,
};

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{Channel, ChannelAttributes, DerivedMessage, MessageRequest};
use crate::telemetry::counters;
use crate::vendor::VendorId;

/// Derivation failure.
#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("malformed message request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message request lists no channels")]
    NoChannels,
    #[error("no template {name} for {channel} in language {language}")]
    UnknownTemplate {
        name: String,
        channel: Channel,
        language: String,
    },
    #[error("contact has no {field} for {channel}")]
    MissingContact {
        channel: Channel,
        field: &'static str,
    },
}

impl DeriveError {
    pub fn reason(&self) -> &'static str {
        match self {
            DeriveError::Malformed(_) => "malformed",
            DeriveError::NoChannels => "no_channels",
            DeriveError::UnknownTemplate { .. } => "unknown_template",
            DeriveError::MissingContact { .. } => "missing_contact",
        }
    }
}

/// Derives channel messages from inbound events.
pub struct EventDeriver {
    templates: Arc<dyn TemplateCatalog>,
    languages: Arc<dyn LanguageResolver>,
}

impl EventDeriver {
    pub fn new(templates: Arc<dyn TemplateCatalog>, languages: Arc<dyn LanguageResolver>) -> Self {
        Self {
            templates,
            languages,
        }
    }

    /// Derive one message per channel of the event. Fails only when the event
    /// is unreadable or no channel could be derived.
    pub fn derive(&self, raw: Bytes) -> Result<Vec<DerivedMessage>, DeriveError> {
        let request: MessageRequest = serde_json::from_slice(&raw).map_err(|e| {
            counters::derive_failure("none", "malformed");
            DeriveError::from(e)
        })?;

        if request.channels.is_empty() {
            counters::derive_failure("none", "no_channels");
            return Err(DeriveError::NoChannels);
        }

        let language = self.languages.resolve(&request);
        let mut channels = request.channels.clone();
        channels.sort();
        channels.dedup();

        let mut messages = Vec::with_capacity(channels.len());
        let mut first_error = None;

        for channel in channels {
            match self.derive_channel(&request, channel, &language, &raw) {
                Ok(msg) => {
                    debug!(
                        reference_id = %msg.reference_id,
                        channel = %channel,
                        template = %msg.template_name,
                        language = %msg.language,
                        "message derived"
                    );
                    messages.push(msg);
                }
                Err(e) => {
                    counters::derive_failure(channel.label(), e.reason());
                    warn!(
                        channel = %channel,
                        actor_id = request.actor_id,
                        template = %request.template_name,
                        error = %e,
                        "skipping channel"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match (messages.is_empty(), first_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(messages),
        }
    }

    fn derive_channel(
        &self,
        request: &MessageRequest,
        channel: Channel,
        language: &str,
        raw: &Bytes,
    ) -> Result<DerivedMessage, DeriveError> {
        let template = self
            .templates
            .lookup(&request.template_name, channel, language)
            .ok_or_else(|| DeriveError::UnknownTemplate {
                name: request.template_name.clone(),
                channel,
                language: language.to_string(),
            })?;

        let content = render(&template.body, &request.placeholders);
        let subject = template
            .subject
            .as_deref()
            .map(|s| render(s, &request.placeholders));
        let destination = destination(request, channel, subject)?;

        Ok(DerivedMessage {
            reference_id: Uuid::new_v4().to_string(),
            channel,
            vendor: request.vendor.filter(|v| serves(*v, channel)),
            unicode: template.unicode.unwrap_or(!content.is_ascii()),
            content,
            language: template.language,
            template_name: template.name,
            placeholders: request.placeholders.clone(),
            attributes: request.attributes.clone(),
            retry_count: 0,
            campaign_name: request.campaign_name.clone(),
            parent_reference_id: request.parent_reference_id.clone(),
            actor_id: request.actor_id,
            actor_type: request.actor_type.clone(),
            destination,
            raw_event: raw.clone(),
        })
    }
}

/// Whether a vendor pin applies to a channel of a multi-channel request.
fn serves(vendor: VendorId, channel: Channel) -> bool {
    match vendor {
        VendorId::Gupshup | VendorId::Karix => {
            matches!(channel, Channel::Sms | Channel::Whatsapp)
        }
        VendorId::Fcm => channel == Channel::AppNotification,
        VendorId::Netcore => channel == Channel::Email,
    }
}

fn destination(
    request: &MessageRequest,
    channel: Channel,
    template_subject: Option<String>,
) -> Result<ChannelAttributes, DeriveError> {
    let contact = &request.contact;
    let required = |value: &Option<String>, field: &'static str| {
        value
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or(DeriveError::MissingContact { channel, field })
    };

    Ok(match channel {
        Channel::Sms => ChannelAttributes::Sms {
            phone_number: required(&contact.phone_number, "phoneNumber")?,
        },
        Channel::Whatsapp => ChannelAttributes::Whatsapp {
            phone_number: required(&contact.phone_number, "phoneNumber")?,
            media: request.media.clone(),
        },
        Channel::AppNotification => ChannelAttributes::Push {
            fcm_token: required(&contact.fcm_token, "fcmToken")?,
            api_key: required(&contact.fcm_api_key, "fcmApiKey")?,
            title: contact.title.clone().or(template_subject),
        },
        Channel::Email => ChannelAttributes::Email {
            address: required(&contact.email, "email")?,
            recipients: contact.cc.clone(),
            subject: contact
                .subject
                .clone()
                .or(template_subject)
                .unwrap_or_else(|| request.template_name.clone()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateConfig;

    fn template(channel: Channel, body: &str, subject: Option<&str>) -> TemplateConfig {
        TemplateConfig {
            name: "otp".into(),
            channel,
            language: "en".into(),
            body: body.into(),
            subject: subject.map(str::to_string),
            unicode: None,
        }
    }

    fn deriver() -> EventDeriver {
        let catalog = StaticTemplateCatalog::new(
            &[
                template(Channel::Sms, "Your code is {{code}}", None),
                template(Channel::Whatsapp, "Code: {{code}} ✅", None),
                template(Channel::Email, "<p>{{code}}</p>", Some("Code {{code}}")),
            ],
            "en",
        );
        EventDeriver::new(Arc::new(catalog), Arc::new(DefaultLanguageResolver::new("en")))
    }

    fn event(json: &str) -> Bytes {
        Bytes::from(json.to_string())
    }

    #[test]
    fn test_derive_fans_out_per_channel() {
        let raw = event(
            r#"{"channels":["SMS","WHATSAPP","SMS"],"actorId":42,"actorType":"CUSTOMER",
                "contact":{"phoneNumber":"919800000001"},"templateName":"otp",
                "placeholders":{"code":"1234"},"campaignName":"CMP_X"}"#,
        );
        let messages = deriver().derive(raw.clone()).unwrap();
        assert_eq!(messages.len(), 2);

        let sms = messages.iter().find(|m| m.channel == Channel::Sms).unwrap();
        assert_eq!(sms.content, "Your code is 1234");
        assert!(!sms.unicode);
        assert_eq!(sms.language, "en");
        assert_eq!(sms.contact_id(), "919800000001");
        assert_eq!(sms.campaign_name.as_deref(), Some("CMP_X"));
        assert_eq!(sms.raw_event, raw);
        assert_eq!(sms.retry_count, 0);

        let wa = messages.iter().find(|m| m.channel == Channel::Whatsapp).unwrap();
        assert!(wa.unicode);
        assert_ne!(wa.reference_id, sms.reference_id);
    }

    #[test]
    fn test_vendor_pin_only_where_served() {
        let raw = event(
            r#"{"channels":["SMS","EMAIL"],"actorId":1,"vendor":"karix","templateName":"otp",
                "contact":{"phoneNumber":"9198","email":"a@example.com"},
                "placeholders":{"code":"9"}}"#,
        );
        let messages = deriver().derive(raw).unwrap();
        let sms = messages.iter().find(|m| m.channel == Channel::Sms).unwrap();
        let email = messages.iter().find(|m| m.channel == Channel::Email).unwrap();
        assert_eq!(sms.vendor, Some(VendorId::Karix));
        assert_eq!(email.vendor, None);

        match &email.destination {
            ChannelAttributes::Email { subject, .. } => assert_eq!(subject, "Code 9"),
            other => panic!("unexpected destination {:?}", other),
        }
    }

    #[test]
    fn test_failed_channel_is_skipped() {
        let raw = event(
            r#"{"channels":["SMS","APP_NOTIFICATION"],"actorId":1,"templateName":"otp",
                "contact":{"phoneNumber":"9198"}}"#,
        );
        let messages = deriver().derive(raw).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel, Channel::Sms);
    }

    #[test]
    fn test_all_channels_failing_is_an_error() {
        let raw = event(r#"{"channels":["SMS"],"actorId":1,"templateName":"otp","contact":{}}"#);
        let err = deriver().derive(raw).unwrap_err();
        assert!(matches!(
            err,
            DeriveError::MissingContact {
                field: "phoneNumber",
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_and_empty_events() {
        assert!(matches!(
            deriver().derive(event("not json")),
            Err(DeriveError::Malformed(_))
        ));
        assert!(matches!(
            deriver().derive(event(r#"{"channels":[],"actorId":1,"templateName":"otp"}"#)),
            Err(DeriveError::NoChannels)
        ));
    }
}
