use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use fieldx::fxstruct;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::ReplicatorConfig;
use crate::error::DbError;
use crate::error::ReplicatorError;
use crate::traits::Connector;
use crate::traits::Replicable;
use crate::types::LogEntry;
use crate::types::LogId;
use crate::types::ReplicatorState;
use crate::types::TailPoll;

/// How many times [`Replicator::resync`] retries caches that fail to populate.
pub const MAX_RESYNC_ROUNDS: usize = 20;

/// Keeps registered caches in sync with the database by following the change log.
///
/// The background thread connects, populates every cache, then tails the change log and hands each entry to the
/// caches backed by the entry's collection. Any database error ends the cycle; after `retry_interval` the thread
/// reconnects, repopulates and resumes tailing right after the last entry it processed, so entries are delivered at
/// least once. If the capped log has already evicted entries the replicator did not read, it starts over from the
/// log's current end instead, and the repopulate covers whatever was lost.
#[fxstruct(
    sync,
    rc,
    no_new,
    default(off),
    builder(
        opt_in,
        doc("Builder object of [`Replicator`]."),
        method_doc("Implement builder pattern for [`Replicator`].")
    )
)]
pub struct Replicator {
    #[fieldx(get(clone), builder(required))]
    connector:      Arc<dyn Connector>,
    #[fieldx(get, builder(into), default(ReplicatorConfig::default().log_collection().clone()))]
    log_collection: String,
    #[fieldx(get(copy), builder, default(ReplicatorConfig::default().retry_interval()))]
    retry_interval: Duration,
    #[fieldx(get(copy), builder, default(ReplicatorConfig::default().poll_interval()))]
    poll_interval:  Duration,
    caches:         RwLock<Vec<Arc<dyn Replicable>>>,
    #[fieldx(default(Mutex::new(ReplicatorState::Idle)))]
    state:          Mutex<ReplicatorState>,
    last_seen:      Mutex<Option<LogId>>,
    started:        AtomicBool,
    // Stop request; guarded by a mutex so pauses can wait on it.
    stop_requested: Mutex<bool>,
    wakeup:         Condvar,
    thread:         Mutex<Option<JoinHandle<()>>>,
    resync_busy:    Mutex<()>,
}

impl ReplicatorBuilder {
    /// Take the log collection and the intervals from a configuration section.
    pub fn config(self, config: &ReplicatorConfig) -> Self {
        self.log_collection(config.log_collection().clone())
            .retry_interval(config.retry_interval())
            .poll_interval(config.poll_interval())
    }
}

impl Replicator {
    /// Populate `cache` and add it to the replicated set. A cache that cannot be populated is not registered.
    #[instrument(level = "debug", skip_all, fields(cache = cache.name()))]
    pub fn register(&self, cache: Arc<dyn Replicable>) -> Result<(), ReplicatorError> {
        if !cache.populate() {
            return Err(ReplicatorError::PopulateFailed(cache.name().to_string()));
        }
        debug!("registered {} for collection '{}'", cache.name(), cache.collection());
        self.caches.write().push(cache);
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<(), ReplicatorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ReplicatorError::AlreadyStarted);
        }
        let replicator = self.clone();
        let handle = thread::Builder::new()
            .name("replicator".into())
            .spawn(move || replicator.run())
            .inspect_err(|_| self.started.store(false, Ordering::SeqCst))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the thread and wait for it. Returns within one poll interval unless a cache is blocked on the database.
    pub fn stop(&self) {
        {
            let mut stop = self.stop_requested.lock();
            *stop = true;
            self.wakeup.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("replicator thread terminated abnormally");
            }
        }
        self.set_state(ReplicatorState::Stopped);
    }

    #[inline]
    pub fn state(&self) -> ReplicatorState {
        *self.state.lock()
    }

    /// Position of the last change-log entry handed to the caches.
    #[inline]
    pub fn last_seen(&self) -> Option<LogId> {
        *self.last_seen.lock()
    }

    pub fn cache_count(&self) -> usize {
        self.caches.read().len()
    }

    /// Repopulate every cache from the calling thread, retrying the ones that fail up to [`MAX_RESYNC_ROUNDS`]
    /// times. Returns `false` if a resync is already running or some cache never succeeded.
    #[instrument(level = "debug", skip(self))]
    pub fn resync(&self) -> bool {
        let Some(_busy) = self.resync_busy.try_lock()
        else {
            info!("resync already in progress, skipping");
            return false;
        };

        let mut pending = self.caches();
        for round in 1..=MAX_RESYNC_ROUNDS {
            pending.retain(|cache| !cache.populate());
            if pending.is_empty() {
                return true;
            }
            debug!("resync round {round}: {} caches failed", pending.len());
            if round < MAX_RESYNC_ROUNDS && self.pause(self.poll_interval) {
                break;
            }
        }

        for cache in &pending {
            error!("{} could not be resynchronised", cache.name());
        }
        false
    }

    fn caches(&self) -> Vec<Arc<dyn Replicable>> {
        self.caches.read().clone()
    }

    fn set_state(&self, state: ReplicatorState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("replicator {} -> {}", *current, state);
            *current = state;
        }
    }

    #[inline]
    fn stopping(&self) -> bool {
        *self.stop_requested.lock()
    }

    // Sleep for `duration` or until stopped. Returns true if a stop was requested.
    fn pause(&self, duration: Duration) -> bool {
        let mut stop = self.stop_requested.lock();
        if !*stop {
            self.wakeup.wait_for(&mut stop, duration);
        }
        *stop
    }

    fn run(self: Arc<Self>) {
        info!("replicator started on '{}'", self.log_collection);
        // Set until a cycle has recorded where the log ends.
        let mut capture = true;
        while !self.stopping() {
            self.set_state(ReplicatorState::Disconnected);
            match self.cycle(&mut capture) {
                Ok(()) => break,
                Err(DbError::PositionLost(log)) => {
                    warn!("fell behind the capped change log '{log}', starting over from its end");
                    capture = true;
                    if self.pause(self.poll_interval) {
                        break;
                    }
                }
                Err(err) => {
                    self.set_state(ReplicatorState::Disconnected);
                    error!("replication interrupted: {err}; retrying in {:?}", self.retry_interval);
                    if self.pause(self.retry_interval) {
                        break;
                    }
                }
            }
        }
        self.set_state(ReplicatorState::Stopped);
        info!("replicator stopped");
    }

    // One connect/populate/tail round. Returns Ok only when stopped.
    fn cycle(&self, capture: &mut bool) -> Result<(), DbError> {
        let mut conn = self.connector.connect()?;

        if *capture {
            // Whatever is logged from here on is replayed after the populate below.
            *self.last_seen.lock() = conn.latest_position(&self.log_collection)?;
            *capture = false;
        }

        self.set_state(ReplicatorState::Populating);
        for cache in self.caches() {
            if !cache.populate() {
                return Err(DbError::operation(
                    "populate",
                    cache.collection(),
                    format!("{} failed to populate", cache.name()),
                ));
            }
        }

        self.set_state(ReplicatorState::Tailing);
        let mut cursor = conn.tail(&self.log_collection, self.last_seen())?;
        while !self.stopping() {
            let poll = match cursor.poll() {
                // A cursor killed on the server may surface as an error instead.
                Err(DbError::CursorDead(reason)) => {
                    debug!("change-log cursor killed: {reason}");
                    TailPoll::Dead
                }
                other => other?,
            };
            match poll {
                TailPoll::Entry(entry) => {
                    self.dispatch(&entry)?;
                    *self.last_seen.lock() = Some(entry.id);
                }
                TailPoll::Empty => {
                    if self.pause(self.poll_interval) {
                        break;
                    }
                }
                TailPoll::Dead => {
                    debug!("change-log cursor died, reopening after {:?}", self.last_seen());
                    if self.pause(self.poll_interval) {
                        break;
                    }
                    cursor = conn.tail(&self.log_collection, self.last_seen())?;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, entry: &LogEntry) -> Result<(), DbError> {
        let (Some(collection), Some(id)) = (entry.collection(), entry.row_id())
        else {
            warn!("skipping malformed change-log entry {}", entry.id);
            return Ok(());
        };

        for cache in self.caches().iter().filter(|c| c.collection() == collection) {
            if !cache.replicate(id) {
                // Left unconsumed; the next cycle repopulates and replays it.
                return Err(DbError::operation(
                    "replicate",
                    collection,
                    format!("{} failed to refresh id {id}", cache.name()),
                ));
            }
        }
        Ok(())
    }
}

impl Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("log_collection", &self.log_collection)
            .field("state", &self.state())
            .field("last_seen", &self.last_seen())
            .field("caches", &self.cache_count())
            .finish()
    }
}
