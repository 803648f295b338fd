//! Store file change detection with debounced delivery.
//!
//! The watcher observes the directory that holds the database, keeps only events for
//! the database file and its `-wal`/`-journal` companions, and confirms a real change
//! by comparing file metadata with what it saw last. Confirmed changes feed a
//! [`Debouncer`], so a burst of writes produces one callback per subscriber.

use dashmap::DashMap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::ChartConfig;
use crate::error::AppResult;
use crate::store::TimeSeriesStore;

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;
type Subscribers = DashMap<Uuid, ChangeCallback>;

// =============================================================================
// Debouncer
// =============================================================================

struct DebounceState {
    window: Duration,
    deadline: Mutex<Option<Instant>>,
    callback: Box<dyn Fn() + Send + Sync>,
}

/// Coalesces bursts of notifications into one callback.
///
/// Each [`notify`](Debouncer::notify) pushes the deadline out by the window. The
/// first notification of a batch starts a timer thread, which fires the callback
/// once the deadline passes without being pushed again.
#[derive(Clone)]
pub struct Debouncer {
    state: Arc<DebounceState>,
}

impl Debouncer {
    /// Debouncer calling `callback` once per quiet `window`.
    pub fn new<F>(window: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(DebounceState {
                window,
                deadline: Mutex::new(None),
                callback: Box::new(callback),
            }),
        }
    }

    /// Push the deadline out by one window.
    pub fn notify(&self) {
        let arm_timer = {
            let mut deadline = self.state.deadline.lock();
            let idle = deadline.is_none();
            *deadline = Some(Instant::now() + self.state.window);
            idle
        };
        if !arm_timer {
            return;
        }

        let state = self.state.clone();
        let spawned = thread::Builder::new()
            .name("debounce".to_string())
            .spawn(move || state.run_timer());
        if let Err(e) = spawned {
            warn!("Failed to start debounce timer, firing immediately: {e}");
            self.state.deadline.lock().take();
            (self.state.callback)();
        }
    }

    /// Whether a batch is waiting for its deadline.
    pub fn is_pending(&self) -> bool {
        self.state.deadline.lock().is_some()
    }
}

impl DebounceState {
    fn run_timer(&self) {
        loop {
            let wait = {
                let mut deadline = self.deadline.lock();
                match *deadline {
                    Some(when) => {
                        let now = Instant::now();
                        if now >= when {
                            *deadline = None;
                            break;
                        }
                        when - now
                    }
                    None => return,
                }
            };
            thread::sleep(wait);
        }
        (self.callback)();
    }
}

// =============================================================================
// ChangeWatcher
// =============================================================================

/// `(modified, len)` of each store file that could be stat'ed.
type Signature = Vec<(OsString, SystemTime, u64)>;

struct ChangeDetector {
    directory: PathBuf,
    names: Vec<OsString>,
    last_seen: Mutex<Signature>,
}

impl ChangeDetector {
    fn new(db_path: &Path) -> Self {
        let directory = match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base = db_path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        let names = ["", "-wal", "-journal"]
            .iter()
            .map(|suffix| {
                let mut name = base.clone();
                name.push(suffix);
                name
            })
            .collect();
        let detector = Self {
            directory,
            names,
            last_seen: Mutex::new(Vec::new()),
        };
        *detector.last_seen.lock() = detector.signature();
        detector
    }

    fn is_related(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.names.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    /// Stat every store file, skipping the ones that cannot be read right now.
    fn signature(&self) -> Signature {
        self.names
            .iter()
            .filter_map(|name| {
                let metadata = std::fs::metadata(self.directory.join(name)).ok()?;
                let modified = metadata.modified().ok()?;
                Some((name.clone(), modified, metadata.len()))
            })
            .collect()
    }

    /// Whether the store files changed since the last call.
    fn changed(&self) -> bool {
        let current = self.signature();
        if current.is_empty() {
            return false;
        }
        let mut last = self.last_seen.lock();
        if *last == current {
            return false;
        }
        *last = current;
        true
    }
}

/// Watches a store's backing files and calls subscribers after each burst of writes.
pub struct ChangeWatcher {
    db_path: PathBuf,
    subscribers: Arc<Subscribers>,
    debouncer: Debouncer,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    /// Watch `db_path`, coalescing changes within `debounce`.
    pub fn new(db_path: impl AsRef<Path>, debounce: Duration) -> AppResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let subscribers: Arc<Subscribers> = Arc::new(DashMap::new());

        let fan_out = Arc::downgrade(&subscribers);
        let debouncer = Debouncer::new(debounce, move || deliver(&fan_out));

        let detector = Arc::new(ChangeDetector::new(&db_path));
        let handler_detector = detector.clone();
        let handler_debouncer = debouncer.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !event.paths.iter().any(|p| handler_detector.is_related(p)) {
                    return;
                }
                if handler_detector.changed() {
                    trace!(kind = ?event.kind, "Store files changed");
                    handler_debouncer.notify();
                }
            }
            Err(e) => warn!("File watcher error: {e}"),
        })?;
        watcher.watch(&detector.directory, RecursiveMode::NonRecursive)?;
        info!("Watching {} for changes", db_path.display());

        Ok(Self {
            db_path,
            subscribers,
            debouncer,
            _watcher: watcher,
        })
    }

    /// Watcher on the store's database file.
    pub fn for_store(store: &TimeSeriesStore, config: &ChartConfig) -> AppResult<Self> {
        Self::new(store.path(), config.debounce())
    }

    /// Watched database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Register `callback`; it stays registered until the returned handle is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, Arc::new(callback));
        debug!(%id, "Change subscriber added");
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Report a change without a filesystem event. Goes through the debouncer.
    pub fn notify_changed(&self) {
        self.debouncer.notify();
    }
}

fn deliver(subscribers: &Weak<Subscribers>) {
    let Some(subscribers) = subscribers.upgrade() else {
        return;
    };
    // Clone out first so callbacks run without holding map shards.
    let callbacks: Vec<ChangeCallback> = subscribers.iter().map(|e| e.value().clone()).collect();
    for callback in callbacks {
        callback();
    }
}

/// Keeps a change callback registered. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    subscribers: Weak<Subscribers>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(&self.id);
            debug!(id = %self.id, "Change subscriber removed");
        }
    }
}
