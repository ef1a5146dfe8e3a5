use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;

use crate::config::{AbrpConfig, OAuthConfig};
use crate::send_telemetry::TelemetryPayload;
use crate::telemetry::{TelemetryEnvelope, TelemetrySnapshot};

use super::error::{AbrpError, AbrpResult};
use super::simplify_token;

/// Scopes requested during the OAuth authorization step.
pub const OAUTH_SCOPE: &str = "set_telemetry,get_telemetry";

/// The credentials of one config entry.
///
/// The API key identifies the application, the user token identifies the
/// vehicle owner (it is the `access_token` when the entry was created through
/// the OAuth flow).
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub user_token: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, user_token: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            user_token: user_token.into(),
        }
    }

    fn authorization(&self) -> String {
        format!("APIKEY {}", self.api_key)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &simplify_token(&self.api_key))
            .field("user_token", &simplify_token(&self.user_token))
            .finish()
    }
}

/// Answer of `oauth/me`, used to validate a user token.
#[derive(Deserialize, Debug)]
struct MeResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    vehicle_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SendResponse {
    #[serde(default)]
    status: Option<String>,
}

/// The API handler for the Iternio (A Better Route Planner) API.
///
/// Only the endpoints needed to read and push live telemetry and to acquire
/// a user token are implemented. The handler owns a single
/// [reqwest::Client], so every config entry shares the same connection pool
/// and the same per-request timeout.
pub struct IternioApiHandler {
    client: reqwest::Client,
    base_url: String,
    auth_url: String,
}

impl IternioApiHandler {
    pub fn new(config: &AbrpConfig) -> AbrpResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Retrieves the latest telemetry of the vehicle bound to the user token.
    pub async fn get_telemetry(&self, credentials: &Credentials) -> AbrpResult<TelemetrySnapshot> {
        let response = self
            .client
            .get(self.endpoint("tlm/get_telemetry"))
            .query(&[("token", credentials.user_token.as_str())])
            .header(AUTHORIZATION, credentials.authorization())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if let Some(err) = AbrpError::from_status(response.status(), "get_telemetry") {
            return Err(err);
        }

        let content = response.text().await?;
        let envelope: TelemetryEnvelope = serde_json::from_str(&content)?;
        let snapshot = TelemetrySnapshot::from_envelope(envelope);
        log::debug!(
            "ABRP: fetched {} telemetry fields for {}",
            snapshot.len(),
            simplify_token(&credentials.user_token)
        );
        Ok(snapshot)
    }

    /// Validates a user token and returns the name of its vehicle.
    pub async fn get_vehicle_name(&self, user_token: &str) -> AbrpResult<String> {
        let response = self
            .client
            .get(self.endpoint("oauth/me"))
            .query(&[("access_token", user_token)])
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if let Some(err) = AbrpError::from_status(response.status(), "oauth/me") {
            return Err(err);
        }

        let content = response.text().await?;
        let me: MeResponse = serde_json::from_str(&content)?;
        if me.status.as_deref() != Some("ok") {
            return Err(AbrpError::Auth(format!(
                "oauth/me answered with status {:?}",
                me.status
            )));
        }
        me.vehicle_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AbrpError::Auth("oauth/me returned no vehicle name".to_string()))
    }

    /// Builds the URL the user is sent to in order to grant us access.
    pub fn authorize_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        state: &str,
    ) -> AbrpResult<reqwest::Url> {
        reqwest::Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", client_id),
                ("scope", OAUTH_SCOPE),
                ("response_type", "code"),
                ("redirect_uri", redirect_uri),
                ("state", state),
            ],
        )
        .map_err(|e| AbrpError::BadRequest(format!("invalid authorization URL: {}", e)))
    }

    /// Exchanges an authorization code for an access token.
    pub async fn exchange_code(&self, oauth: &OAuthConfig, code: &str) -> AbrpResult<String> {
        let form = [
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", oauth.redirect_uri.as_str()),
        ];
        let response = self
            .client
            .post(self.endpoint("oauth/token"))
            .form(&form)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if let Some(err) = AbrpError::from_status(response.status(), "oauth/token") {
            return Err(err);
        }

        let content = response.text().await?;
        let token: TokenResponse = serde_json::from_str(&content)?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AbrpError::Auth("no access token in response".to_string()))
    }

    /// Pushes one telemetry sample to ABRP.
    pub async fn send_telemetry(
        &self,
        credentials: &Credentials,
        payload: &TelemetryPayload,
    ) -> AbrpResult<()> {
        let tlm = serde_json::to_string(payload)?;
        log::debug!("ABRP: sending telemetry {}", tlm);
        let response = self
            .client
            .get(self.endpoint("tlm/send"))
            .query(&[("tlm", tlm.as_str())])
            .header(AUTHORIZATION, credentials.authorization())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if let Some(err) = AbrpError::from_status(response.status(), "tlm/send") {
            return Err(err);
        }

        let content = response.text().await?;
        let result: SendResponse = serde_json::from_str(&content)?;
        match result.status.as_deref() {
            Some("ok") => Ok(()),
            _ => Err(AbrpError::Api(content)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{FieldValue, TelemetryField};
    use mockito::{Matcher, Server};
    use reqwest::StatusCode;
    use serde_json::json;

    fn handler(server: &Server) -> IternioApiHandler {
        let config = AbrpConfig {
            base_url: server.url(),
            auth_url: "https://abetterrouteplanner.com/oauth/auth".to_string(),
            ..AbrpConfig::default()
        };
        IternioApiHandler::new(&config).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials::new("api-key-1234", "user-token-5678")
    }

    #[rocket::async_test]
    async fn get_telemetry_sends_key_and_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/tlm/get_telemetry")
            .match_query(Matcher::UrlEncoded("token".into(), "user-token-5678".into()))
            .match_header("authorization", "APIKEY api-key-1234")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "result": {
                        "telemetry": {"soc": 42, "power": 11.5},
                        "timestamp": "2024-05-01 10:00:00",
                        "telemetry_type": "live"
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let snapshot = handler(&server).get_telemetry(&credentials()).await.unwrap();
        assert_eq!(snapshot.get(TelemetryField::Soc), Some(&FieldValue::Number(42.into())));
        assert_eq!(snapshot.timestamp(), Some("2024-05-01 10:00:00"));
        assert_eq!(snapshot.len(), 4);
        mock.assert_async().await;
    }

    #[rocket::async_test]
    async fn get_telemetry_maps_status_codes() {
        let mut server = Server::new_async().await;
        let api = handler(&server);

        let mock = server
            .mock("GET", "/tlm/get_telemetry")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        assert!(api.get_telemetry(&credentials()).await.unwrap_err().is_auth());
        mock.remove_async().await;

        let mock = server
            .mock("GET", "/tlm/get_telemetry")
            .match_query(Matcher::Any)
            .with_status(400)
            .create_async()
            .await;
        assert!(matches!(
            api.get_telemetry(&credentials()).await,
            Err(AbrpError::BadRequest(_))
        ));
        mock.remove_async().await;

        server
            .mock("GET", "/tlm/get_telemetry")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        assert!(matches!(
            api.get_telemetry(&credentials()).await,
            Err(AbrpError::Status(StatusCode::SERVICE_UNAVAILABLE))
        ));
    }

    #[rocket::async_test]
    async fn get_telemetry_rejects_non_json() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/tlm/get_telemetry")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        assert!(matches!(
            handler(&server).get_telemetry(&credentials()).await,
            Err(AbrpError::Decode(_))
        ));
    }

    #[rocket::async_test]
    async fn unreachable_api_is_a_communication_error() {
        let config = AbrpConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            ..AbrpConfig::default()
        };
        let api = IternioApiHandler::new(&config).unwrap();
        assert!(matches!(
            api.get_telemetry(&credentials()).await,
            Err(AbrpError::Communication(_))
        ));
    }

    #[rocket::async_test]
    async fn silent_api_times_out() {
        // Accepts connections but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = AbrpConfig {
            base_url: format!("http://{}", listener.local_addr().unwrap()),
            request_timeout_secs: 1,
            ..AbrpConfig::default()
        };
        let api = IternioApiHandler::new(&config).unwrap();

        let started = std::time::Instant::now();
        match api.get_telemetry(&credentials()).await {
            Err(AbrpError::Communication(e)) => assert!(e.is_timeout(), "{}", e),
            other => panic!("expected a timeout, got {:?}", other.map(|s| s.len())),
        }
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        drop(listener);
    }

    #[rocket::async_test]
    async fn vehicle_name_validates_token() {
        let mut server = Server::new_async().await;
        let api = handler(&server);

        let mock = server
            .mock("GET", "/oauth/me")
            .match_query(Matcher::UrlEncoded("access_token".into(), "good".into()))
            .with_status(200)
            .with_body(json!({"status": "ok", "vehicle_name": "Model 3"}).to_string())
            .create_async()
            .await;
        assert_eq!(api.get_vehicle_name("good").await.unwrap(), "Model 3");
        mock.assert_async().await;

        server
            .mock("GET", "/oauth/me")
            .match_query(Matcher::UrlEncoded("access_token".into(), "nameless".into()))
            .with_status(200)
            .with_body(json!({"status": "ok"}).to_string())
            .create_async()
            .await;
        assert!(api.get_vehicle_name("nameless").await.unwrap_err().is_auth());

        server
            .mock("GET", "/oauth/me")
            .match_query(Matcher::UrlEncoded("access_token".into(), "bad".into()))
            .with_status(200)
            .with_body(json!({"status": "error"}).to_string())
            .create_async()
            .await;
        assert!(api.get_vehicle_name("bad").await.unwrap_err().is_auth());
    }

    #[test]
    fn authorize_url_carries_all_parameters() {
        let api = IternioApiHandler::new(&AbrpConfig::default()).unwrap();
        let url = api
            .authorize_url("client", "http://localhost:8000/cb", "xyz")
            .unwrap();
        assert_eq!(url.host_str(), Some("abetterrouteplanner.com"));
        assert_eq!(url.path(), "/oauth/auth");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("client_id".to_string(), "client".to_string()),
                ("scope".to_string(), OAUTH_SCOPE.to_string()),
                ("response_type".to_string(), "code".to_string()),
                ("redirect_uri".to_string(), "http://localhost:8000/cb".to_string()),
                ("state".to_string(), "xyz".to_string()),
            ]
        );
    }

    #[rocket::async_test]
    async fn exchange_code_posts_form() {
        let mut server = Server::new_async().await;
        let oauth = OAuthConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost:8000/cb".to_string(),
        };
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("client_id".into(), "client".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret".into()),
                Matcher::UrlEncoded("code".into(), "the-code".into()),
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("redirect_uri".into(), "http://localhost:8000/cb".into()),
            ]))
            .with_status(200)
            .with_body(json!({"access_token": "fresh-token"}).to_string())
            .create_async()
            .await;

        let api = handler(&server);
        assert_eq!(api.exchange_code(&oauth, "the-code").await.unwrap(), "fresh-token");
        mock.assert_async().await;
    }

    #[rocket::async_test]
    async fn exchange_code_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(401)
            .create_async()
            .await;
        let oauth = OAuthConfig {
            client_id: "client".to_string(),
            client_secret: "wrong".to_string(),
            redirect_uri: "http://localhost:8000/cb".to_string(),
        };
        assert!(handler(&server)
            .exchange_code(&oauth, "code")
            .await
            .unwrap_err()
            .is_auth());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let printed = format!("{:?}", credentials());
        assert!(!printed.contains("api-key-1234"));
        assert!(!printed.contains("user-token-5678"));
    }
}
