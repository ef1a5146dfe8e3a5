use reqwest::StatusCode;

/// Errors raised while talking to the ABRP API.
#[derive(Debug, thiserror::Error)]
pub enum AbrpError {
    /// The API key or the user token was rejected. The entry needs new
    /// credentials before polling can succeed again.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("bad request to API: {0}")]
    BadRequest(String),

    /// Transport-level failure: DNS, connect, TLS, timeout...
    #[error("error communicating with API: {0}")]
    Communication(#[from] reqwest::Error),

    /// Any other non-200 answer. The poll cycle fails for this round.
    #[error("API returned status {0}")]
    Status(StatusCode),

    /// The API answered 200 but reported a failure in the body.
    #[error("API returned error: {0}")]
    Api(String),

    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl AbrpError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AbrpError::Auth(_))
    }

    /// Maps the common status codes to their error, `None` on 200.
    pub(crate) fn from_status(status: StatusCode, context: &str) -> Option<Self> {
        match status {
            StatusCode::OK => None,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Some(AbrpError::Auth(format!("{} rejected with {}", context, status)))
            }
            StatusCode::BAD_REQUEST => {
                Some(AbrpError::BadRequest(format!("{} rejected with {}", context, status)))
            }
            other => Some(AbrpError::Status(other)),
        }
    }
}

pub type AbrpResult<T> = Result<T, AbrpError>;
