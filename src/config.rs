//! Service configuration, read from the `abrp` table of the Rocket figment.
//!
//! ```toml
//! [default.abrp]
//! base_url = "https://api.iternio.com/1"
//! scan_interval_secs = 300
//! fast_scan_interval_secs = 15
//! credential_flow = "api_key"
//! ```

use std::time::Duration;

use rocket::figment::Figment;
use serde::Deserialize;

use crate::coordinator::PollIntervals;

pub const DEFAULT_BASE_URL: &str = "https://api.iternio.com/1";
pub const DEFAULT_AUTH_URL: &str = "https://abetterrouteplanner.com/oauth/auth";

/// How config entries acquire their credentials. Only one of them is enabled
/// per deployment.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialFlow {
    /// The user pastes an API key and a user token.
    #[default]
    ApiKey,
    /// The user is redirected to ABRP and we exchange the returned code.
    Oauth,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Also used as the API key of the entries created through this flow.
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AbrpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_fast_scan_interval")]
    pub fast_scan_interval_secs: u64,
    #[serde(default)]
    pub credential_flow: CredentialFlow,
    #[serde(default)]
    pub oauth: Option<OAuthConfig>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_scan_interval() -> u64 {
    300
}

fn default_fast_scan_interval() -> u64 {
    15
}

impl Default for AbrpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_url: default_auth_url(),
            request_timeout_secs: default_request_timeout(),
            scan_interval_secs: default_scan_interval(),
            fast_scan_interval_secs: default_fast_scan_interval(),
            credential_flow: CredentialFlow::default(),
            oauth: None,
        }
    }
}

impl TryFrom<&Figment> for AbrpConfig {
    type Error = anyhow::Error;

    fn try_from(figment: &Figment) -> Result<Self, Self::Error> {
        let config: AbrpConfig = if figment.contains("abrp") {
            figment.extract_inner("abrp")?
        } else {
            AbrpConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl AbrpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.credential_flow == CredentialFlow::Oauth && self.oauth.is_none() {
            anyhow::bail!("abrp.credential_flow is \"oauth\" but abrp.oauth is not configured");
        }
        if self.scan_interval_secs == 0 || self.fast_scan_interval_secs == 0 {
            anyhow::bail!("abrp scan intervals must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_intervals(&self) -> PollIntervals {
        PollIntervals {
            base: Duration::from_secs(self.scan_interval_secs),
            fast: Duration::from_secs(self.fast_scan_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::figment::providers::Serialized;

    #[test]
    fn defaults_without_table() {
        let config = AbrpConfig::try_from(&Figment::new()).unwrap();
        assert_eq!(config, AbrpConfig::default());
        assert_eq!(config.poll_intervals().base, Duration::from_secs(300));
        assert_eq!(config.poll_intervals().fast, Duration::from_secs(15));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let figment = Figment::new()
            .merge(Serialized::default("abrp.base_url", "http://localhost:1234"))
            .merge(Serialized::default("abrp.fast_scan_interval_secs", 30));
        let config = AbrpConfig::try_from(&figment).unwrap();
        assert_eq!(config.base_url, "http://localhost:1234");
        assert_eq!(config.fast_scan_interval_secs, 30);
        assert_eq!(config.scan_interval_secs, 300);
        assert_eq!(config.credential_flow, CredentialFlow::ApiKey);
    }

    #[test]
    fn oauth_flow_requires_oauth_table() {
        let figment =
            Figment::new().merge(Serialized::default("abrp.credential_flow", "oauth"));
        assert!(AbrpConfig::try_from(&figment).is_err());

        let figment = figment
            .merge(Serialized::default("abrp.oauth.client_id", "client"))
            .merge(Serialized::default("abrp.oauth.client_secret", "secret"))
            .merge(Serialized::default(
                "abrp.oauth.redirect_uri",
                "http://localhost:8000/entries/oauth/callback",
            ));
        let config = AbrpConfig::try_from(&figment).unwrap();
        assert_eq!(config.credential_flow, CredentialFlow::Oauth);
        assert_eq!(config.oauth.unwrap().client_id, "client");
    }
}
