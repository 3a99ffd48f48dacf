//! Template and language lookups used during derivation.

use std::collections::HashMap;

use crate::config::TemplateConfig;
use crate::message::{Channel, MessageRequest};

/// A message template for one channel and language.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub channel: Channel,
    pub language: String,
    pub body: String,
    pub subject: Option<String>,
    /// Explicit encoding; inferred from the rendered content when unset.
    pub unicode: Option<bool>,
}

impl From<&TemplateConfig> for Template {
    fn from(cfg: &TemplateConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            channel: cfg.channel,
            language: cfg.language.clone(),
            body: cfg.body.clone(),
            subject: cfg.subject.clone(),
            unicode: cfg.unicode,
        }
    }
}

/// Template lookup.
pub trait TemplateCatalog: Send + Sync {
    fn lookup(&self, name: &str, channel: Channel, language: &str) -> Option<Template>;
}

/// Language resolution for a request.
pub trait LanguageResolver: Send + Sync {
    fn resolve(&self, request: &MessageRequest) -> String;
}

/// Catalog built from the `templates` configuration section.
///
/// Falls back to the default language when the requested one has no
/// variant of the template.
#[derive(Debug, Default)]
pub struct StaticTemplateCatalog {
    templates: HashMap<(String, Channel, String), Template>,
    default_language: String,
}

impl StaticTemplateCatalog {
    pub fn new(templates: &[TemplateConfig], default_language: &str) -> Self {
        let templates = templates
            .iter()
            .map(|cfg| {
                (
                    (cfg.name.clone(), cfg.channel, cfg.language.clone()),
                    Template::from(cfg),
                )
            })
            .collect();
        Self {
            templates,
            default_language: default_language.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateCatalog for StaticTemplateCatalog {
    fn lookup(&self, name: &str, channel: Channel, language: &str) -> Option<Template> {
        let key = |lang: &str| (name.to_string(), channel, lang.to_string());
        self.templates
            .get(&key(language))
            .or_else(|| self.templates.get(&key(&self.default_language)))
            .cloned()
    }
}

/// Uses the request's language, else a configured default.
#[derive(Debug, Clone)]
pub struct DefaultLanguageResolver {
    default_language: String,
}

impl DefaultLanguageResolver {
    pub fn new(default_language: &str) -> Self {
        Self {
            default_language: default_language.to_string(),
        }
    }
}

impl LanguageResolver for DefaultLanguageResolver {
    fn resolve(&self, request: &MessageRequest) -> String {
        request
            .language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.default_language)
            .to_ascii_lowercase()
    }
}

/// Substitute `{{key}}` placeholders. Unknown keys are left as written.
pub fn render(body: &str, placeholders: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match placeholders.get(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
