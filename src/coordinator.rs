//! Scheduled polling of the telemetry API.
//!
//! A [TelemetryCoordinator] owns the latest [TelemetrySnapshot] of one config
//! entry and the [PollState] deciding when the next fetch happens. The poll
//! loop ([TelemetryCoordinator::run]) is the only writer; sensors read the
//! snapshot through [TelemetryCoordinator::snapshot], which hands out the
//! whole previous or the whole current snapshot, never a mix of both.
//!
//! The interval adapts to the vehicle: while ABRP keeps receiving fresh
//! telemetry (the reported timestamp is younger than the base interval) we
//! poll every [PollIntervals::fast], otherwise every [PollIntervals::base] to
//! spare the API quota of a parked car.
//!
//! A failed poll keeps the previous snapshot and the current interval; there
//! is no retry, the next attempt simply happens at the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rocket::tokio::sync::{Mutex, RwLock};

use crate::abrp::{AbrpError, AbrpResult, Credentials, IternioApiHandler};
use crate::telemetry::{parse_timestamp, TelemetrySnapshot};

/// Something able to produce a fresh snapshot.
///
/// [TelemetryFetcher] is the production implementation; tests provide their
/// own.
#[rocket::async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self) -> AbrpResult<TelemetrySnapshot>;
}

/// Fetches the telemetry of one set of credentials through the shared API
/// handler.
pub struct TelemetryFetcher {
    api: Arc<IternioApiHandler>,
    credentials: Credentials,
}

impl TelemetryFetcher {
    pub fn new(api: Arc<IternioApiHandler>, credentials: Credentials) -> Self {
        Self { api, credentials }
    }
}

#[rocket::async_trait]
impl TelemetrySource for TelemetryFetcher {
    async fn fetch(&self) -> AbrpResult<TelemetrySnapshot> {
        self.api.get_telemetry(&self.credentials).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub base: Duration,
    pub fast: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(300),
            fast: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    pub interval: Duration,
}

impl PollState {
    pub fn new(intervals: &PollIntervals) -> Self {
        Self {
            interval: intervals.base,
        }
    }

    /// Recomputes the interval from the telemetry timestamp.
    ///
    /// A missing or unparseable timestamp leaves the interval untouched.
    /// Returns true when the interval changed.
    pub fn adapt(
        &mut self,
        timestamp: Option<&str>,
        now: DateTime<Utc>,
        intervals: &PollIntervals,
    ) -> bool {
        let Some(raw) = timestamp else {
            return false;
        };
        let reported_at = match parse_timestamp(raw) {
            Ok(reported_at) => reported_at,
            Err(e) => {
                log::debug!("ABRP: keeping poll interval, {}", e);
                return false;
            }
        };

        // A timestamp in the future fails the conversion and counts as fresh
        let fresh = match (now - reported_at).to_std() {
            Ok(age) => age < intervals.base,
            Err(_) => true,
        };
        let interval = if fresh { intervals.fast } else { intervals.base };

        let changed = interval != self.interval;
        self.interval = interval;
        changed
    }
}

/// Point-in-time view of the coordinator, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub last_update_success: bool,
    pub reauth_required: bool,
    pub interval: Duration,
}

pub struct TelemetryCoordinator<S: TelemetrySource> {
    name: String,
    source: S,
    intervals: PollIntervals,
    poll: Mutex<PollState>,
    snapshot: RwLock<Option<Arc<TelemetrySnapshot>>>,
    last_update_success: AtomicBool,
    reauth_required: AtomicBool,
}

impl<S: TelemetrySource> TelemetryCoordinator<S> {
    pub fn new(name: impl Into<String>, source: S, intervals: PollIntervals) -> Self {
        Self {
            name: name.into(),
            source,
            intervals,
            poll: Mutex::new(PollState::new(&intervals)),
            snapshot: RwLock::new(None),
            last_update_success: AtomicBool::new(false),
            reauth_required: AtomicBool::new(false),
        }
    }

    /// Performs one poll cycle.
    ///
    /// On success the snapshot is replaced and the interval recomputed. On
    /// failure the previous snapshot is kept and the error is returned to the
    /// caller, after being logged.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<(), AbrpError> {
        match self.source.fetch().await {
            Ok(snapshot) => {
                {
                    let mut poll = self.poll.lock().await;
                    if poll.adapt(snapshot.timestamp(), now, &self.intervals) {
                        log::info!(
                            "ABRP [{}]: poll interval is now {}s",
                            self.name,
                            poll.interval.as_secs()
                        );
                    }
                }
                self.snapshot.write().await.replace(Arc::new(snapshot));
                self.last_update_success.store(true, Ordering::Relaxed);
                self.reauth_required.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if e.is_auth() {
                    log::error!(
                        "ABRP [{}]: credentials rejected, re-authentication required: {}",
                        self.name,
                        e
                    );
                    self.reauth_required.store(true, Ordering::Relaxed);
                } else {
                    log::warn!("ABRP [{}]: update failed: {}", self.name, e);
                }
                self.last_update_success.store(false, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Refreshes right away, then keeps polling.
    pub async fn start(self: Arc<Self>) {
        let _ = self.refresh(Utc::now()).await;
        self.run().await
    }

    /// The poll loop. Expects the first refresh to have happened already, so
    /// it starts by sleeping for the current interval.
    pub async fn run(self: Arc<Self>) {
        loop {
            let interval = self.interval().await;
            rocket::tokio::time::sleep(interval).await;
            // Errors are logged and reflected in the status by refresh()
            let _ = self.refresh(Utc::now()).await;
        }
    }

    pub async fn snapshot(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.snapshot.read().await.clone()
    }

    pub async fn interval(&self) -> Duration {
        self.poll.lock().await.interval
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            last_update_success: self.last_update_success.load(Ordering::Relaxed),
            reauth_required: self.reauth_required.load(Ordering::Relaxed),
            interval: self.interval().await,
        }
    }
}
