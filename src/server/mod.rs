//! The HTTP face of the service.
//!
//! Config entries are created through one of the two credential flows, and
//! each entry then exposes its sensors and the send-telemetry service under
//! `/entries/<entry_id>/`. Every route is rate limited per client IP.

pub mod entries;
pub mod integrations;

use std::sync::Arc;

use chrono::Utc;
use governor::Quota;
use rocket::fairing::{self, AdHoc};
use rocket::figment::Figment;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::response::{self, status, Redirect, Responder};
use rocket::serde::json::Json;
use rocket::{catchers, delete, get, post, routes, Build, Request, Rocket, State};
use rocket_db_pools::{Connection, Database};
use rocket_governor::{rocket_governor_catcher, RocketGovernable, RocketGovernor};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::abrp::{AbrpError, Credentials};
use crate::config::{AbrpConfig, CredentialFlow, OAuthConfig};
use crate::config_flow::{self, ConfigFlowError, NewEntry};
use crate::send_telemetry::{SendTelemetryRequest, TelemetryPayload, ValidationError};
use crate::sensor::{self, DeviceInfo, SensorReading};

use entries::{ConfigEntry, Entries};
use integrations::{Integration, IntegrationContext, Integrations, IntegrationsFairing};

pub struct RateLimitGuard;

impl<'r> RocketGovernable<'r> for RateLimitGuard {
    fn quota(_method: rocket_governor::Method, _route_name: &str) -> governor::Quota {
        Quota::per_second(Self::nonzero(5u32))
    }
}

/// Passes only when entries are created with an API key and a user token.
pub struct ApiKeyFlow;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiKeyFlow {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.rocket().state::<AbrpConfig>() {
            Some(config) if config.credential_flow == CredentialFlow::ApiKey => {
                Outcome::Success(ApiKeyFlow)
            }
            _ => Outcome::Forward(Status::NotFound),
        }
    }
}

/// Passes only when entries are created through OAuth.
pub struct OAuthFlow<'r>(&'r OAuthConfig);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for OAuthFlow<'r> {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.rocket().state::<AbrpConfig>() {
            Some(AbrpConfig {
                credential_flow: CredentialFlow::Oauth,
                oauth: Some(oauth),
                ..
            }) => Outcome::Success(OAuthFlow(oauth)),
            _ => Outcome::Forward(Status::NotFound),
        }
    }
}

/// Errors answered to API clients as `{"error": code, "message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Flow(#[from] ConfigFlowError),
    #[error("invalid telemetry: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Abrp(#[from] AbrpError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::Flow(_) | ApiError::Validation(_) => Status::BadRequest,
            ApiError::Abrp(_) => Status::BadGateway,
            ApiError::Database(_) => Status::InternalServerError,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Flow(e) => e.code(),
            ApiError::Validation(_) => "invalid_telemetry",
            ApiError::Abrp(AbrpError::Auth(_)) => "invalid_auth",
            ApiError::Abrp(AbrpError::Communication(_)) => "cannot_connect",
            ApiError::Abrp(_) => "send_failed",
            ApiError::Database(_) => "unknown",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let message = match &self {
            ApiError::Database(e) => {
                log::error!("{} {}: {}", request.method(), request.uri(), e);
                "internal error".to_string()
            }
            other => {
                log::warn!("{} {}: {}", request.method(), request.uri(), other);
                other.to_string()
            }
        };
        let body = ErrorBody {
            error: self.code(),
            message,
        };
        (status, Json(body)).respond_to(request)
    }
}

#[derive(Deserialize)]
pub struct CreateEntryRequest {
    pub api_key: String,
    pub user_token: String,
}

#[derive(Serialize, Debug)]
pub struct EntryCreated {
    pub entry_id: String,
    pub title: String,
}

impl From<&ConfigEntry> for EntryCreated {
    fn from(entry: &ConfigEntry) -> Self {
        Self {
            entry_id: entry.entry_id.clone(),
            title: entry.title.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct EntrySensors {
    pub entry_id: String,
    pub device: DeviceInfo,
    pub last_update_success: bool,
    pub reauth_required: bool,
    pub update_interval_secs: u64,
    pub sensors: Vec<SensorReading>,
}

#[derive(Serialize)]
pub struct TelemetrySent {
    pub status: &'static str,
    pub tlm: TelemetryPayload,
}

/// Stores a validated entry and starts polling it.
async fn register(
    db: &mut SqliteConnection,
    integrations: &Integrations,
    new_entry: NewEntry,
) -> Result<Arc<Integration>, ApiError> {
    if entries::find_by_user_token(&mut *db, &new_entry.credentials.user_token)
        .await?
        .is_some()
    {
        return Err(ConfigFlowError::AlreadyConfigured.into());
    }
    // A concurrent request may have stored the same token since the check
    let entry = entries::insert(&mut *db, &new_entry.title, &new_entry.credentials)
        .await
        .map_err(|e| {
            if entries::is_unique_violation(&e) {
                ApiError::from(ConfigFlowError::AlreadyConfigured)
            } else {
                ApiError::from(e)
            }
        })?;
    Ok(integrations.setup(entry).await)
}

fn created(integration: &Integration) -> status::Created<Json<EntryCreated>> {
    let location = format!("/entries/{}/sensors", integration.entry.entry_id);
    status::Created::new(location).body(Json(EntryCreated::from(&integration.entry)))
}

/************************* ROUTES *************************/

#[get("/")]
async fn index(_ratelimit: RocketGovernor<'_, RateLimitGuard>) -> String {
    "PONG".to_string()
}

#[post("/entries", data = "<body>")]
async fn create_entry(
    _flow: ApiKeyFlow,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    mut db: Connection<Entries>,
    integrations: &State<Integrations>,
    body: Json<CreateEntryRequest>,
) -> Result<status::Created<Json<EntryCreated>>, ApiError> {
    let body = body.into_inner();
    let credentials = Credentials::new(body.api_key, body.user_token);
    let new_entry = config_flow::validate_credentials(integrations.api(), credentials).await?;
    let integration = register(&mut db, integrations, new_entry).await?;
    Ok(created(&integration))
}

#[get("/entries/oauth/authorize")]
async fn oauth_authorize(
    flow: OAuthFlow<'_>,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    mut db: Connection<Entries>,
    integrations: &State<Integrations>,
) -> Result<Redirect, ApiError> {
    let state = entries::create_oauth_state(&mut **db).await?;
    let url = integrations
        .api()
        .authorize_url(&flow.0.client_id, &flow.0.redirect_uri, &state)?;
    Ok(Redirect::to(url.to_string()))
}

#[get("/entries/oauth/callback?<code>&<state>")]
async fn oauth_callback(
    flow: OAuthFlow<'_>,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    mut db: Connection<Entries>,
    integrations: &State<Integrations>,
    code: &str,
    state: &str,
) -> Result<status::Created<Json<EntryCreated>>, ApiError> {
    if !entries::take_oauth_state(&mut **db, state).await? {
        return Err(ConfigFlowError::InvalidState.into());
    }
    let new_entry = config_flow::exchange_and_validate(integrations.api(), flow.0, code).await?;
    let integration = register(&mut db, integrations, new_entry).await?;
    Ok(created(&integration))
}

#[delete("/entries/<entry_id>")]
async fn delete_entry(
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    mut db: Connection<Entries>,
    integrations: &State<Integrations>,
    entry_id: &str,
) -> Result<Option<Status>, ApiError> {
    let unloaded = integrations.unload(entry_id).await;
    let deleted = entries::delete(&mut **db, entry_id).await?;
    if deleted {
        log::info!("ABRP: deleted entry {}", entry_id);
    }
    Ok((unloaded || deleted).then_some(Status::NoContent))
}

#[get("/entries/<_>/sensors")]
async fn sensors(
    integration: IntegrationContext,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
) -> Json<EntrySensors> {
    let status = integration.coordinator.status().await;
    let snapshot = integration.coordinator.snapshot().await;
    let entry_id = integration.entry.entry_id.clone();
    Json(EntrySensors {
        sensors: sensor::readings(&entry_id, snapshot.as_deref()),
        entry_id,
        device: integration.device_info(),
        last_update_success: status.last_update_success,
        reauth_required: status.reauth_required,
        update_interval_secs: status.interval.as_secs(),
    })
}

#[get("/entries/<_>/sensors/<key>")]
async fn sensor_reading(
    integration: IntegrationContext,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    key: &str,
) -> Option<Json<SensorReading>> {
    let descriptor = sensor::descriptor(key)?;
    let snapshot = integration.coordinator.snapshot().await;
    Some(Json(
        descriptor.reading(&integration.entry.entry_id, snapshot.as_deref()),
    ))
}

#[post("/entries/<_>/send_telemetry", data = "<body>")]
async fn send_telemetry(
    integration: IntegrationContext,
    _ratelimit: RocketGovernor<'_, RateLimitGuard>,
    integrations: &State<Integrations>,
    body: Json<SendTelemetryRequest>,
) -> Result<Json<TelemetrySent>, ApiError> {
    let payload = body.into_inner().into_payload(Utc::now())?;
    integrations
        .api()
        .send_telemetry(&integration.entry.credentials(), &payload)
        .await?;
    Ok(Json(TelemetrySent {
        status: "ok",
        tlm: payload,
    }))
}

async fn run_migrations(rocket: Rocket<Build>) -> fairing::Result {
    let result = match Entries::fetch(&rocket) {
        Some(db) => sqlx::migrate!("./migrations")
            .run(&**db)
            .await
            .map_err(anyhow::Error::from),
        None => Err(anyhow::anyhow!("config_entries database is not initialized")),
    };
    match result {
        Ok(()) => Ok(rocket),
        Err(e) => {
            log::error!("Failed to migrate config entries: {}", e);
            Err(rocket)
        }
    }
}

/// The app, configured from `Rocket.toml` and `ROCKET_*` variables.
pub fn build() -> Rocket<Build> {
    build_with(rocket::Config::figment())
}

pub fn build_with(figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(Entries::init())
        .attach(AdHoc::try_on_ignite("Setup DB", run_migrations))
        .attach(IntegrationsFairing)
        .mount(
            "/",
            routes![
                index,
                create_entry,
                oauth_authorize,
                oauth_callback,
                delete_entry,
                sensors,
                sensor_reading,
                send_telemetry
            ],
        )
        .register("/", catchers![rocket_governor_catcher])
}
