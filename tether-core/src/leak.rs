//! # Leak Registry
//!
//! Every tracing resource registers a [`TraceRecord`] here at construction,
//! together with a weak handle on the object that owns it. Registration never
//! keeps anything alive: the registry holds `Weak` handles only.
//!
//! A resource leaves the registry when:
//!
//! - it is released (count reaches zero) or closed, or
//! - a [`sweep`](LeakRegistry::sweep) finds its owner dropped while the count
//!   was still positive. That is a leak, logged on the `tether::leak` target
//!   and returned in the [`SweepReport`].
//!
//! Iteration works on a snapshot taken under the read lock, so sweeps tolerate
//! concurrent registration and release.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::TracingConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::reference::ReferenceOwner;
use crate::stack_trace::StackTrace;

// ============================================================================
// Identity
// ============================================================================

/// Registry identity of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(u64);

impl MonitorId {
    /// Raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "monitor#{}", self.0)
    }
}

/// Which capability a registry entry tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// A closeable resource; outstanding means "still open".
    Closeable,
    /// A reference-counted resource; outstanding means "count above zero".
    ReferenceCounted,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Closeable => write!(f, "closeable"),
            TrackKind::ReferenceCounted => write!(f, "reference-counted"),
        }
    }
}

// ============================================================================
// History
// ============================================================================

/// Kind of lifecycle event recorded in a resource's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// A reference was reserved.
    Reserved,
    /// A reference was released.
    Released,
    /// A reference moved between owners.
    Transferred,
    /// The resource was closed.
    Closed,
    /// Teardown forced the count to zero.
    ForceReleased,
}

/// One entry of a resource's history.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    /// What happened.
    pub kind: HistoryKind,
    /// Owner involved, if any.
    pub owner: Option<ReferenceOwner>,
    /// Count after the event.
    pub count: u64,
    /// Thread that performed the event.
    pub thread_name: Option<String>,
    /// Backtrace of the event, when operation capture is enabled.
    pub trace: Option<StackTrace>,
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(owner) = self.owner {
            write!(f, " by {owner}")?;
        }
        write!(
            f,
            " -> {} on thread {}",
            self.count,
            self.thread_name.as_deref().unwrap_or("<unnamed>")
        )
    }
}

#[derive(Debug)]
struct History {
    capacity: usize,
    events: VecDeque<HistoryEvent>,
    dropped: u64,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(16)),
            dropped: 0,
        }
    }

    fn push(&mut self, event: HistoryEvent) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }
}

// ============================================================================
// Trace Records
// ============================================================================

/// Diagnostic state shared between a tracing resource and the registry.
pub(crate) struct TraceRecord {
    id: MonitorId,
    kind: TrackKind,
    type_name: &'static str,
    unique_id: String,
    created_here: StackTrace,
    /// Mirror of the outstanding count (open = 1 for closeables).
    gauge: AtomicU64,
    unmonitored: AtomicBool,
    capture_operations: bool,
    history: Mutex<History>,
}

impl TraceRecord {
    pub(crate) fn id(&self) -> MonitorId {
        self.id
    }

    pub(crate) fn kind(&self) -> TrackKind {
        self.kind
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub(crate) fn created_here(&self) -> &StackTrace {
        &self.created_here
    }

    pub(crate) fn gauge(&self) -> u64 {
        self.gauge.load(Ordering::Acquire)
    }

    pub(crate) fn set_gauge(&self, count: u64) {
        self.gauge.store(count, Ordering::Release);
    }

    pub(crate) fn is_unmonitored(&self) -> bool {
        self.unmonitored.load(Ordering::Acquire)
    }

    /// Append an event to the capped history.
    #[track_caller]
    pub(crate) fn note(&self, kind: HistoryKind, owner: Option<ReferenceOwner>, count: u64) {
        let location = std::panic::Location::caller();
        let trace = self
            .capture_operations
            .then(|| StackTrace::at(format!("{kind:?} {}", self.type_name), location, true));
        let event = HistoryEvent {
            kind,
            owner,
            count,
            thread_name: std::thread::current().name().map(str::to_owned),
            trace,
        };
        self.history.lock().push(event);
    }

    /// Copy of the retained history, oldest first.
    pub(crate) fn history(&self) -> Vec<HistoryEvent> {
        self.history.lock().events.iter().cloned().collect()
    }

    /// Number of events discarded because the history was full.
    pub(crate) fn history_dropped(&self) -> u64 {
        self.history.lock().dropped
    }
}

impl fmt::Debug for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("unique_id", &self.unique_id)
            .field("gauge", &self.gauge())
            .finish()
    }
}

/// Forced teardown of a live tracked object.
pub(crate) trait Teardown: Send + Sync {
    /// Force the object to its released state. Returns false when the object
    /// cannot be released from outside (closeables).
    fn force_release(&self) -> bool;
}

struct Entry {
    record: Arc<TraceRecord>,
    live: Weak<dyn Teardown>,
}

// ============================================================================
// Reports
// ============================================================================

/// A resource whose owner was dropped while references were outstanding.
#[derive(Debug, Clone)]
pub struct LeakReport {
    /// Registry identity.
    pub id: MonitorId,
    /// Tracked capability.
    pub kind: TrackKind,
    /// Type of the leaked resource.
    pub type_name: &'static str,
    /// Caller-supplied identity (file name, address, ...).
    pub unique_id: String,
    /// Outstanding count when the leak was found.
    pub outstanding: u64,
    /// Where the resource was created.
    pub created_here: StackTrace,
    /// Retained lifecycle history, oldest first.
    pub history: Vec<HistoryEvent>,
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({}) leaked with {} outstanding",
            self.kind, self.type_name, self.unique_id, self.outstanding
        )?;
        write!(f, "  {}", self.created_here)?;
        for event in &self.history {
            write!(f, "\n  {event}")?;
        }
        Ok(())
    }
}

/// Result of a registry sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Leaks found by this sweep.
    pub leaks: Vec<LeakReport>,
    /// Dead entries removed whose count had already reached zero.
    pub pruned: usize,
    /// Entries still live after the sweep.
    pub live: usize,
}

impl SweepReport {
    /// True when the sweep found no leaks.
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Entries currently tracked.
    pub tracked: usize,
    /// Total registrations.
    pub registered: u64,
    /// Entries removed by a normal release or close.
    pub released: u64,
    /// Leaks found by sweeps.
    pub leaks: u64,
    /// Entries force-released at teardown.
    pub force_released: u64,
    /// Entries removed by unmonitor.
    pub unmonitored: u64,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    released: AtomicU64,
    leaks: AtomicU64,
    force_released: AtomicU64,
    unmonitored: AtomicU64,
}

// ============================================================================
// Registry
// ============================================================================

/// Weak registry of tracing resources.
pub struct LeakRegistry {
    config: TracingConfig,
    next_id: AtomicU64,
    entries: RwLock<HashMap<MonitorId, Entry>>,
    counters: Counters,
}

impl LeakRegistry {
    /// Create an empty registry.
    pub fn new(config: TracingConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Tracing settings records in this registry are created with.
    pub fn tracing_config(&self) -> &TracingConfig {
        &self.config
    }

    /// Create a record. It is not tracked until [`track`](Self::track) is called.
    pub(crate) fn new_record(
        &self,
        kind: TrackKind,
        type_name: &'static str,
        unique_id: String,
        created_here: StackTrace,
        initial: u64,
    ) -> Arc<TraceRecord> {
        Arc::new(TraceRecord {
            id: MonitorId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            kind,
            type_name,
            unique_id,
            created_here,
            gauge: AtomicU64::new(initial),
            unmonitored: AtomicBool::new(false),
            capture_operations: self.config.capture_operations,
            history: Mutex::new(History::new(self.config.history_capacity)),
        })
    }

    /// Start tracking `record`, with `live` as the liveness handle of its owner.
    pub(crate) fn track(&self, record: Arc<TraceRecord>, live: Weak<dyn Teardown>) {
        let id = record.id();
        tracing::debug!(
            target: "tether::refcount",
            id = id.as_u64(),
            type_name = record.type_name(),
            unique_id = record.unique_id(),
            "tracking resource"
        );
        self.entries.write().insert(id, Entry { record, live });
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop tracking after a normal release or close.
    pub(crate) fn deregister(&self, id: MonitorId) -> bool {
        let removed = self.entries.write().remove(&id).is_some();
        if removed {
            self.counters.released.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Stop tracking after a forced release. Counted by the teardown hook.
    pub(crate) fn forget(&self, id: MonitorId) -> bool {
        self.entries.write().remove(&id).is_some()
    }

    /// Remove a resource from tracking without releasing it.
    pub fn unmonitor(&self, id: MonitorId) -> bool {
        let Some(entry) = self.entries.write().remove(&id) else {
            return false;
        };
        entry.record.unmonitored.store(true, Ordering::Release);
        self.counters.unmonitored.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "tether::unmonitor",
            id = id.as_u64(),
            type_name = entry.record.type_name(),
            "resource unmonitored"
        );
        true
    }

    /// Whether `id` is currently tracked.
    pub fn is_monitored(&self, id: MonitorId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(Arc<TraceRecord>, Weak<dyn Teardown>)> {
        self.entries
            .read()
            .values()
            .map(|entry| (Arc::clone(&entry.record), Weak::clone(&entry.live)))
            .collect()
    }

    fn report_leak(&self, record: &TraceRecord, outstanding: u64) -> LeakReport {
        self.counters.leaks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "tether::leak",
            kind = %record.kind(),
            type_name = record.type_name(),
            unique_id = record.unique_id(),
            outstanding,
            created_here = %record.created_here(),
            "resource discarded without being released"
        );
        LeakReport {
            id: record.id(),
            kind: record.kind(),
            type_name: record.type_name(),
            unique_id: record.unique_id().to_owned(),
            outstanding,
            created_here: record.created_here().clone(),
            history: record.history(),
        }
    }

    /// Find entries whose owner was dropped, reporting those still outstanding as leaks.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut dead = Vec::new();

        for (record, live) in self.snapshot() {
            if live.strong_count() > 0 {
                report.live += 1;
                continue;
            }
            match record.gauge() {
                0 => report.pruned += 1,
                outstanding => report.leaks.push(self.report_leak(&record, outstanding)),
            }
            dead.push(record.id());
        }

        if !dead.is_empty() {
            let mut entries = self.entries.write();
            for id in dead {
                entries.remove(&id);
            }
        }
        report
    }

    /// Teardown hook: force-release every live reference-counted entry and warn
    /// about every open closeable. Dropped owners are reported as leaks.
    ///
    /// Returns the number of entries that were still outstanding.
    pub fn warn_and_release_outstanding(&self) -> usize {
        let mut outstanding = 0;
        for (record, live) in self.snapshot() {
            let count = record.gauge();
            match live.upgrade() {
                Some(owner) => {
                    if count == 0 {
                        continue;
                    }
                    outstanding += 1;
                    if owner.force_release() {
                        self.counters.force_released.fetch_add(1, Ordering::Relaxed);
                    } else {
                        tracing::warn!(
                            target: "tether::leak",
                            kind = %record.kind(),
                            type_name = record.type_name(),
                            unique_id = record.unique_id(),
                            created_here = %record.created_here(),
                            "resource still open at teardown"
                        );
                    }
                }
                None if count > 0 => {
                    outstanding += 1;
                    self.report_leak(&record, count);
                }
                None => {}
            }
            self.entries.write().remove(&record.id());
        }
        outstanding
    }

    /// Strict teardown: fail if anything tracked is still outstanding.
    pub fn assert_all_released(&self) -> ResourceResult<()> {
        let pending: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(record, _)| record.gauge() > 0)
            .map(|(record, _)| {
                format!(
                    "{} {} ({}) outstanding {}",
                    record.kind(),
                    record.type_name(),
                    record.unique_id(),
                    record.gauge()
                )
            })
            .collect();

        if pending.is_empty() {
            Ok(())
        } else {
            Err(ResourceError::Outstanding {
                count: pending.len(),
                summary: pending.join("; "),
            })
        }
    }

    /// Drop all entries without reporting anything.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tracked: self.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            leaks: self.counters.leaks.load(Ordering::Relaxed),
            force_released: self.counters.force_released.load(Ordering::Relaxed),
            unmonitored: self.counters.unmonitored.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakRegistry")
            .field("tracked", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

/// Global leak registry instance.
static REGISTRY: OnceLock<Arc<LeakRegistry>> = OnceLock::new();

/// Get the process-wide leak registry.
pub fn registry() -> &'static Arc<LeakRegistry> {
    REGISTRY.get_or_init(|| Arc::new(LeakRegistry::new(crate::config().tracing.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Holder(bool);

    impl Teardown for Holder {
        fn force_release(&self) -> bool {
            self.0
        }
    }

    fn registry_with(capacity: usize) -> LeakRegistry {
        LeakRegistry::new(TracingConfig {
            enabled: true,
            capture_operations: false,
            history_capacity: capacity,
        })
    }

    fn tracked(registry: &LeakRegistry, holder: &Arc<Holder>, initial: u64) -> Arc<TraceRecord> {
        let record = registry.new_record(
            TrackKind::ReferenceCounted,
            "Holder",
            "holder-1".into(),
            StackTrace::here("created"),
            initial,
        );
        let weak: Weak<Holder> = Arc::downgrade(holder);
        let live: Weak<dyn Teardown> = weak;
        registry.track(Arc::clone(&record), live);
        record
    }

    #[test]
    fn test_sweep_reports_dropped_owner() {
        let registry = registry_with(8);
        let holder = Arc::new(Holder(true));
        let record = tracked(&registry, &holder, 1);
        assert_eq!(registry.sweep().live, 1);

        drop(holder);
        let report = registry.sweep();
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].type_name, "Holder");
        assert_eq!(report.leaks[0].id, record.id());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().leaks, 1);
    }

    #[test]
    fn test_sweep_prunes_released() {
        let registry = registry_with(8);
        let holder = Arc::new(Holder(true));
        let record = tracked(&registry, &holder, 1);
        record.set_gauge(0);
        drop(holder);

        let report = registry.sweep();
        assert!(report.is_clean());
        assert_eq!(report.pruned, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unmonitor_marks_record() {
        let registry = registry_with(8);
        let holder = Arc::new(Holder(true));
        let record = tracked(&registry, &holder, 1);

        assert!(registry.unmonitor(record.id()));
        assert!(!registry.unmonitor(record.id()));
        assert!(record.is_unmonitored());
        assert!(!registry.is_monitored(record.id()));
        assert_eq!(registry.stats().unmonitored, 1);
    }

    #[test]
    fn test_assert_all_released() {
        let registry = registry_with(8);
        let holder = Arc::new(Holder(true));
        let record = tracked(&registry, &holder, 2);

        let err = registry.assert_all_released().unwrap_err();
        assert!(matches!(err, ResourceError::Outstanding { count: 1, .. }));
        record.set_gauge(0);
        assert!(registry.assert_all_released().is_ok());
    }

    #[test]
    fn test_teardown_warns_for_closeables() {
        let registry = registry_with(8);
        let closeable = Arc::new(Holder(false));
        let counted = Arc::new(Holder(true));
        tracked(&registry, &closeable, 1);
        tracked(&registry, &counted, 1);

        assert_eq!(registry.warn_and_release_outstanding(), 2);
        assert_eq!(registry.stats().force_released, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_history_is_capped() {
        let registry = registry_with(3);
        let holder = Arc::new(Holder(true));
        let record = tracked(&registry, &holder, 1);
        for count in 0..10 {
            record.note(HistoryKind::Reserved, Some(ReferenceOwner::INIT), count);
        }
        let history = record.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].count, 7);
        assert_eq!(record.history_dropped(), 7);
    }
}
