//! Lifecycle of the configured integrations.
//!
//! Each stored [ConfigEntry] becomes one [Integration]: the entry, its
//! credentials, and a [TelemetryCoordinator] whose poll loop runs in its own
//! task. Integrations are kept in the Rocket-managed [Integrations] registry
//! and handed to the routes by the [IntegrationContext] request guard.
//!
//! The [IntegrationsFairing] builds the registry when the Rocket app is
//! ignited, sets up every stored entry on liftoff, and stops every poll loop
//! on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::tokio::sync::RwLock;
use rocket::tokio::task::JoinHandle;
use rocket_db_pools::Database;

use crate::abrp::IternioApiHandler;
use crate::config::AbrpConfig;
use crate::coordinator::{PollIntervals, TelemetryCoordinator, TelemetryFetcher};
use crate::sensor::DeviceInfo;

use super::entries::{self, ConfigEntry, Entries};

pub type Coordinator = TelemetryCoordinator<TelemetryFetcher>;

/// Everything belonging to one configured vehicle.
pub struct Integration {
    pub entry: ConfigEntry,
    pub coordinator: Arc<Coordinator>,
    task: JoinHandle<()>,
}

impl Integration {
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(&self.entry.title)
    }
}

/// The registry of running integrations, keyed by entry id.
pub struct Integrations {
    api: Arc<IternioApiHandler>,
    intervals: PollIntervals,
    running: RwLock<HashMap<String, Arc<Integration>>>,
}

impl Integrations {
    pub fn new(api: Arc<IternioApiHandler>, intervals: PollIntervals) -> Self {
        Self {
            api,
            intervals,
            running: RwLock::new(HashMap::new()),
        }
    }

    pub fn api(&self) -> &IternioApiHandler {
        &self.api
    }

    /// Starts polling for an entry.
    ///
    /// The first refresh happens before this returns so the sensors have data
    /// right away. If it fails the entry is still set up and the poll loop
    /// retries at the next interval.
    pub async fn setup(&self, entry: ConfigEntry) -> Arc<Integration> {
        let coordinator = self.coordinator(&entry);
        if let Err(e) = coordinator.refresh(Utc::now()).await {
            log::warn!(
                "ABRP: first refresh of entry {} ({}) failed: {}",
                entry.entry_id,
                entry.title,
                e
            );
        }

        let task = rocket::tokio::spawn(coordinator.clone().run());
        self.insert(entry, coordinator, task).await
    }

    /// Starts polling for an entry without waiting for the first refresh.
    pub async fn start(&self, entry: ConfigEntry) -> Arc<Integration> {
        let coordinator = self.coordinator(&entry);
        let task = rocket::tokio::spawn(coordinator.clone().start());
        self.insert(entry, coordinator, task).await
    }

    fn coordinator(&self, entry: &ConfigEntry) -> Arc<Coordinator> {
        let fetcher = TelemetryFetcher::new(self.api.clone(), entry.credentials());
        Arc::new(TelemetryCoordinator::new(
            entry.title.clone(),
            fetcher,
            self.intervals,
        ))
    }

    async fn insert(
        &self,
        entry: ConfigEntry,
        coordinator: Arc<Coordinator>,
        task: JoinHandle<()>,
    ) -> Arc<Integration> {
        let integration = Arc::new(Integration {
            entry,
            coordinator,
            task,
        });

        let previous = self
            .running
            .write()
            .await
            .insert(integration.entry.entry_id.clone(), integration.clone());
        if let Some(previous) = previous {
            previous.task.abort();
        }

        log::info!(
            "ABRP: set up entry {} ({})",
            integration.entry.entry_id,
            integration.entry.title
        );
        integration
    }

    pub async fn get(&self, entry_id: &str) -> Option<Arc<Integration>> {
        self.running.read().await.get(entry_id).cloned()
    }

    /// Stops polling for an entry. Returns false if it was not running.
    pub async fn unload(&self, entry_id: &str) -> bool {
        match self.running.write().await.remove(entry_id) {
            Some(integration) => {
                integration.task.abort();
                log::info!("ABRP: unloaded entry {}", entry_id);
                true
            }
            None => false,
        }
    }

    pub async fn unload_all(&self) {
        let mut running = self.running.write().await;
        for (_, integration) in running.drain() {
            integration.task.abort();
        }
    }

    pub async fn len(&self) -> usize {
        self.running.read().await.len()
    }
}

/// Request guard resolving the `<entry_id>` segment of `/entries/<entry_id>/...`
/// to its running [Integration]. Unknown ids forward to a 404.
pub struct IntegrationContext(pub Arc<Integration>);

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for IntegrationContext {
    type Error = ();

    async fn from_request(
        request: &'r rocket::Request<'_>,
    ) -> rocket::request::Outcome<Self, Self::Error> {
        let Some(integrations) = request.rocket().state::<Integrations>() else {
            log::error!("ABRP: integrations registry is not managed");
            return rocket::request::Outcome::Error((
                rocket::http::Status::InternalServerError,
                (),
            ));
        };

        let entry_id = request.routed_segment(1).map(|s| s.to_string());
        match entry_id {
            Some(entry_id) => match integrations.get(&entry_id).await {
                Some(integration) => rocket::request::Outcome::Success(IntegrationContext(integration)),
                None => {
                    log::info!("ABRP: unknown entry {}", entry_id);
                    rocket::request::Outcome::Forward(rocket::http::Status::NotFound)
                }
            },
            None => rocket::request::Outcome::Forward(rocket::http::Status::NotFound),
        }
    }
}

impl std::ops::Deref for IntegrationContext {
    type Target = Integration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Creates the [Integrations] registry and keeps the stored entries polling
/// for as long as the app runs.
pub struct IntegrationsFairing;

#[rocket::async_trait]
impl Fairing for IntegrationsFairing {
    fn info(&self) -> Info {
        Info {
            name: "ABRP Integrations",
            kind: Kind::Ignite | Kind::Liftoff | Kind::Shutdown,
        }
    }

    /// Reads the `abrp` configuration and manages it together with the
    /// registry. Ignition fails on an invalid configuration.
    async fn on_ignite(&self, rocket: rocket::Rocket<rocket::Build>) -> rocket::fairing::Result {
        let config = match AbrpConfig::try_from(rocket.figment()) {
            Ok(config) => config,
            Err(e) => {
                log::error!("ABRP: invalid configuration: {}", e);
                return Err(rocket);
            }
        };
        let api = match IternioApiHandler::new(&config) {
            Ok(api) => Arc::new(api),
            Err(e) => {
                log::error!("ABRP: failed to build HTTP client: {}", e);
                return Err(rocket);
            }
        };

        log::info!(
            "ABRP: polling {} every {}s ({}s while driving), {:?} credential flow",
            config.base_url,
            config.scan_interval_secs,
            config.fast_scan_interval_secs,
            config.credential_flow
        );
        let integrations = Integrations::new(api, config.poll_intervals());
        Ok(rocket.manage(config).manage(integrations))
    }

    async fn on_liftoff(&self, rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Err(e) = setup_stored_entries(rocket).await {
            log::error!("ABRP: failed to set up stored entries: {}", e);
        }
    }

    async fn on_shutdown(&self, rocket: &rocket::Rocket<rocket::Orbit>) {
        if let Some(integrations) = rocket.state::<Integrations>() {
            integrations.unload_all().await;
        }
    }
}

async fn setup_stored_entries(rocket: &rocket::Rocket<rocket::Orbit>) -> anyhow::Result<()> {
    let db = Entries::fetch(rocket).ok_or_else(|| anyhow::anyhow!("database is not initialized"))?;
    let integrations = rocket
        .state::<Integrations>()
        .ok_or_else(|| anyhow::anyhow!("integrations registry is not managed"))?;

    let purged = entries::purge_oauth_states(&**db).await?;
    if purged > 0 {
        log::info!("ABRP: purged {} expired OAuth states", purged);
    }

    let stored = entries::list(&**db).await?;
    log::info!("ABRP: setting up {} stored entries", stored.len());
    for entry in stored {
        integrations.start(entry).await;
    }
    Ok(())
}
