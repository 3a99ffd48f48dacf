use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, SinkKind};

/// Upper bound on publish attempts; backoff doubles between them.
const MAX_PUBLISH_ATTEMPTS: u32 = 10;

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.vendors.is_empty() {
            anyhow::bail!("at least one vendor must be defined");
        }

        let mut vendor_names = HashSet::new();
        for vendor in &self.vendors {
            if !vendor_names.insert(vendor.vendor) {
                anyhow::bail!("duplicate vendor: {}", vendor.vendor);
            }
            if vendor.base_url.is_empty() {
                anyhow::bail!("vendor '{}' has an empty base_url", vendor.vendor);
            }
        }

        for (channel, weights) in &self.selector {
            for (vendor, weight) in weights {
                if *weight == 0 {
                    anyhow::bail!(
                        "selector weight for {} on {} must be positive",
                        vendor,
                        channel
                    );
                }
                let serves = self
                    .vendor(*vendor)
                    .map(|v| v.channels.iter().any(|c| c.channel == *channel))
                    .unwrap_or(false);
                if !serves {
                    anyhow::bail!(
                        "selector references vendor '{}' which is not configured for {}",
                        vendor,
                        channel
                    );
                }
            }
        }

        if self.retry.max_retries == 0 || self.retry.channels.values().any(|r| *r == 0) {
            anyhow::bail!("retry.max_retries must be at least 1");
        }

        if self.events.sink == SinkKind::Http && self.events.url.is_none() {
            anyhow::bail!("events.url is required for the http sink");
        }

        if !(1..=MAX_PUBLISH_ATTEMPTS).contains(&self.events.publish_attempts) {
            anyhow::bail!(
                "events.publish_attempts must be between 1 and {}",
                MAX_PUBLISH_ATTEMPTS
            );
        }

        info!("configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::message::Channel;
    use crate::vendor::VendorId;
    use std::time::Duration;

    const VENDORS: &str = r#"
vendors:
  - vendor: gupshup
    base_url: "https://enterprise.gupshup.test"
    credentials:
      user: "2000"
      password: secret
    channels:
      - channel: SMS
        connect_timeout: 2s
        read_timeout: 5s
      - channel: WHATSAPP
  - vendor: karix
    base_url: "https://api.karix.test"
    credentials:
      api_key: k
    channels:
      - channel: SMS
"#;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_yaml(VENDORS).unwrap();
        assert_eq!(config.vendors.len(), 2);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.events.publish_attempts, 2);
        assert_eq!(config.events.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.webhook.max_local_retries, 2);
        assert_eq!(config.store.backend, StorageBackend::Memory);
        assert_eq!(
            config.optin.no_account_cooldown,
            Duration::from_secs(60 * 86_400)
        );

        let sms = &config.vendors[0].channels[0];
        assert_eq!(sms.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.vendors[0].channels[1].read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_selector_weights() {
        let yaml = format!(
            "{}\nselector:\n  SMS:\n    gupshup: 70\n    karix: 30\n",
            VENDORS
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let weights = config.selector_weights();
        assert_eq!(weights[&Channel::Sms][&VendorId::Gupshup], 70);
        assert_eq!(weights[&Channel::Sms][&VendorId::Karix], 30);
    }

    #[test]
    fn test_zero_weight_rejected() {
        let yaml = format!("{}\nselector:\n  SMS:\n    gupshup: 0\n", VENDORS);
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("must be positive"));
    }

    #[test]
    fn test_selector_unknown_vendor_rejected() {
        let yaml = format!("{}\nselector:\n  WHATSAPP:\n    karix: 10\n", VENDORS);
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("not configured"));
    }

    #[test]
    fn test_retry_override() {
        let yaml = format!(
            "{}\nretry:\n  max_retries: 4\n  channels:\n    APP_NOTIFICATION: 2\n",
            VENDORS
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.retry.max_retries_for(Channel::Sms), 4);
        assert_eq!(config.retry.max_retries_for(Channel::AppNotification), 2);
    }

    #[test]
    fn test_http_sink_requires_url() {
        let yaml = format!("{}\nevents:\n  sink: http\n", VENDORS);
        let result = Config::from_yaml(&yaml);
        assert!(result.unwrap_err().to_string().contains("events.url"));
    }

    #[test]
    fn test_publish_attempts_bounded() {
        let yaml = format!("{}\nevents:\n  publish_attempts: 40\n", VENDORS);
        let result = Config::from_yaml(&yaml);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("events.publish_attempts"));
    }

    #[test]
    fn test_no_vendors() {
        let result = Config::from_yaml("vendors: []\n");
        assert!(result.unwrap_err().to_string().contains("at least one vendor"));
    }

    #[test]
    fn test_duplicate_vendor() {
        let yaml = r#"
vendors:
  - vendor: fcm
    base_url: "https://fcm.test"
  - vendor: fcm
    base_url: "https://fcm2.test"
"#;
        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("duplicate vendor"));
    }
}
