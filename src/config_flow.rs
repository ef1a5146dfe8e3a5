//! Credential acquisition for new config entries.
//!
//! Two mutually exclusive flows exist, selected per deployment with
//! [CredentialFlow](crate::config::CredentialFlow):
//!
//! - API key: the user provides an API key and a user token, we validate the
//!   token against `oauth/me` ([validate_credentials]).
//! - OAuth: the user is redirected to ABRP, comes back with a code, and we
//!   exchange it for an access token ([exchange_and_validate]).
//!
//! Both end with a validated [NewEntry] or a [ConfigFlowError] whose
//! [code](ConfigFlowError::code) is what the user gets to see. Nothing is
//! persisted here; storing the entry is up to the caller.

use crate::abrp::{AbrpError, Credentials, IternioApiHandler};
use crate::config::OAuthConfig;

/// A validated entry, ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub title: String,
    pub credentials: Credentials,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFlowError {
    #[error("invalid credentials: {0}")]
    InvalidAuth(AbrpError),
    #[error("cannot connect to ABRP: {0}")]
    CannotConnect(AbrpError),
    #[error("this user token is already configured")]
    AlreadyConfigured,
    #[error("unknown or expired OAuth state")]
    InvalidState,
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl ConfigFlowError {
    /// The error code surfaced to the user.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigFlowError::InvalidAuth(_) => "invalid_auth",
            ConfigFlowError::CannotConnect(_) => "cannot_connect",
            ConfigFlowError::AlreadyConfigured => "already_configured",
            ConfigFlowError::InvalidState => "invalid_state",
            ConfigFlowError::Unknown(_) => "unknown",
        }
    }
}

impl From<AbrpError> for ConfigFlowError {
    fn from(err: AbrpError) -> Self {
        match err {
            AbrpError::Communication(_) => ConfigFlowError::CannotConnect(err),
            AbrpError::Decode(e) => ConfigFlowError::Unknown(e.to_string()),
            // Any rejection of the token counts as bad credentials
            other => ConfigFlowError::InvalidAuth(other),
        }
    }
}

/// Checks the user token and names the entry after the vehicle.
pub async fn validate_credentials(
    api: &IternioApiHandler,
    credentials: Credentials,
) -> Result<NewEntry, ConfigFlowError> {
    if credentials.api_key.trim().is_empty() || credentials.user_token.trim().is_empty() {
        return Err(ConfigFlowError::InvalidAuth(AbrpError::Auth(
            "api_key and user_token are required".to_string(),
        )));
    }
    let title = api.get_vehicle_name(&credentials.user_token).await?;
    log::info!("ABRP: validated credentials for vehicle {}", title);
    Ok(NewEntry { title, credentials })
}

/// Exchanges an authorization code and validates the resulting token. The
/// client secret doubles as the API key of the entry.
pub async fn exchange_and_validate(
    api: &IternioApiHandler,
    oauth: &OAuthConfig,
    code: &str,
) -> Result<NewEntry, ConfigFlowError> {
    let access_token = api.exchange_code(oauth, code).await?;
    validate_credentials(api, Credentials::new(oauth.client_secret.clone(), access_token)).await
}
