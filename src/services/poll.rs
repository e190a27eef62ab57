use crate::client::{FetchError, OilfoxClient};
use crate::services::sync::{SyncError, SyncReport, TreeSynchronizer};
use crate::store::StateStore;
use crate::watchdog::Watchdog;
use log::{debug, info};
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum PollError {
    Fetch(FetchError),
    Sync(SyncError),
}

impl PollError {
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Fetch(e) => e.kind(),
            PollError::Sync(_) => "store",
        }
    }
}

impl Display for PollError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Fetch(e) => write!(f, "fetch failed: {}", e),
            PollError::Sync(e) => write!(f, "sync failed: {}", e),
        }
    }
}

impl std::error::Error for PollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Fetch(e) => Some(e),
            PollError::Sync(e) => Some(e),
        }
    }
}

impl From<FetchError> for PollError {
    fn from(value: FetchError) -> Self {
        PollError::Fetch(value)
    }
}

impl From<SyncError> for PollError {
    fn from(value: SyncError) -> Self {
        PollError::Sync(value)
    }
}

/// Runs poll cycles: fetch, declare slots, write values.
///
/// Cycles take `&mut self`, so two of them can never run at once.
pub struct Poller<S: StateStore> {
    client: OilfoxClient,
    store: S,
    sync: TreeSynchronizer,
    watchdog: Option<Duration>,
}

impl<S: StateStore> Poller<S> {
    pub fn new(client: OilfoxClient, store: S, sync: TreeSynchronizer, watchdog: Option<Duration>) -> Self {
        Poller {
            client,
            store,
            sync,
            watchdog,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// One complete fetch-and-synchronise pass.
    ///
    /// Writes issued before a failure stay in place.
    pub fn run_cycle(&mut self) -> Result<SyncReport, PollError> {
        let _watchdog = self.watchdog.map(Watchdog::arm);
        let started = Instant::now();

        let doc = self.client.fetch_summary()?;
        debug!(
            "Fetched summary: {} info field(s), {} {} record(s)",
            doc.info.len(),
            doc.devices.len(),
            doc.collection
        );

        let created = self.sync.ensure_schema(&mut self.store, &doc)?;
        let mut report = self.sync.apply_values(&mut self.store, &doc)?;
        report.created += created;

        info!(
            "Poll cycle done in {}ms: devices={}, slots_created={}, values_written={}, skipped={}, missing={}",
            started.elapsed().as_millis(),
            doc.devices.len(),
            report.created,
            report.written,
            report.skipped_devices.len(),
            report.missing_devices.len()
        );
        Ok(report)
    }
}
