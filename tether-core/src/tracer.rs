//! # Reference Count Implementations
//!
//! Two implementations of [`ReferenceCountedTracer`]:
//!
//! - [`VanillaReferenceCounted`]: an atomic count and a release action.
//! - [`TracingReferenceCounted`]: also records where it was created, who holds
//!   each reservation and a capped event history, and registers with a
//!   [`LeakRegistry`] until released.
//!
//! Resources pick one through [`on_released`], which consults the
//! process-wide tracing flag once per construction. The vanilla hot path never
//! checks the flag.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::closeable::QueryCloseable;
use crate::error::{ResourceError, ResourceResult};
use crate::leak::{self, HistoryKind, LeakRegistry, MonitorId, Teardown, TraceRecord, TrackKind};
use crate::reference::{
    Listeners, ReferenceChangeListener, ReferenceCounted, ReferenceCountedTracer, ReferenceOwner,
};
use crate::stack_trace::StackTrace;
use crate::unmonitor::OwnedResources;

/// Action run when a count reaches zero.
pub type ReleaseAction = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Vanilla
// ============================================================================

/// Atomic reference count with a release action.
pub struct VanillaReferenceCounted {
    count: AtomicU64,
    on_release: Mutex<Option<ReleaseAction>>,
    type_name: &'static str,
    listeners: Listeners,
}

impl VanillaReferenceCounted {
    /// Create a count of one, held by [`ReferenceOwner::INIT`].
    pub fn new<F>(on_release: F, type_name: &'static str) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            count: AtomicU64::new(1),
            on_release: Mutex::new(Some(Box::new(on_release))),
            type_name,
            listeners: Listeners::default(),
        }
    }

    fn run_release(&self) {
        let action = self.on_release.lock().take();
        if let Some(action) = action {
            action();
        }
    }
}

impl QueryCloseable for VanillaReferenceCounted {
    fn is_closed(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}

impl ReferenceCounted for VanillaReferenceCounted {
    fn reserve(&self, owner: ReferenceOwner) -> ResourceResult<u64> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(ResourceError::AlreadyReleased {
                    type_name: self.type_name,
                });
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.listeners.notify(|l| l.on_reference_added(owner));
        Ok(current + 1)
    }

    fn release(&self, owner: ReferenceOwner) -> ResourceResult<u64> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(ResourceError::DoubleRelease {
                    type_name: self.type_name,
                    owner,
                });
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.listeners.notify(|l| l.on_reference_removed(owner));
        if current == 1 {
            self.run_release();
        }
        Ok(current - 1)
    }

    fn release_last(&self, owner: ReferenceOwner) -> ResourceResult<()> {
        match self
            .count
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.listeners.notify(|l| l.on_reference_removed(owner));
                self.run_release();
                Ok(())
            }
            Err(0) => Err(ResourceError::AlreadyReleased {
                type_name: self.type_name,
            }),
            Err(count) => Err(ResourceError::NotLastReference {
                type_name: self.type_name,
                count,
            }),
        }
    }

    fn reserve_transfer(&self, from: ReferenceOwner, to: ReferenceOwner) -> ResourceResult<()> {
        self.throw_if_released()?;
        self.listeners.notify(|l| l.on_reference_transferred(from, to));
        Ok(())
    }

    fn ref_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn add_reference_change_listener(&self, listener: Arc<dyn ReferenceChangeListener>) {
        self.listeners.add(listener);
    }

    fn remove_reference_change_listener(&self, listener: &Arc<dyn ReferenceChangeListener>) {
        self.listeners.remove(listener);
    }
}

impl ReferenceCountedTracer for VanillaReferenceCounted {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn warn_and_release_if_not_released(&self) -> bool {
        let outstanding = self.count.swap(0, Ordering::AcqRel);
        if outstanding == 0 {
            return false;
        }
        tracing::warn!(
            target: "tether::leak",
            type_name = self.type_name,
            outstanding,
            "resource not released, forcing release"
        );
        self.run_release();
        true
    }
}

impl OwnedResources for VanillaReferenceCounted {
    fn is_unmonitor_excluded(&self) -> bool {
        true
    }
}

impl fmt::Debug for VanillaReferenceCounted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VanillaReferenceCounted")
            .field("type_name", &self.type_name)
            .field("count", &self.ref_count())
            .finish()
    }
}

// ============================================================================
// Tracing
// ============================================================================

struct TracerState {
    owners: HashMap<ReferenceOwner, u32>,
    on_release: Option<ReleaseAction>,
}

struct TracerCore {
    record: Arc<TraceRecord>,
    registry: Arc<LeakRegistry>,
    state: Mutex<TracerState>,
    listeners: Listeners,
}

impl TracerCore {
    fn type_name(&self) -> &'static str {
        self.record.type_name()
    }

    /// Deregister and run the action once the count has reached zero.
    fn finish_release(&self, action: Option<ReleaseAction>, forced: bool) {
        if forced {
            self.registry.forget(self.record.id());
        } else {
            self.registry.deregister(self.record.id());
        }
        if let Some(action) = action {
            action();
        }
    }
}

impl Teardown for TracerCore {
    fn force_release(&self) -> bool {
        let (outstanding, holders, action) = {
            let mut state = self.state.lock();
            let outstanding = self.record.gauge();
            if outstanding == 0 {
                return false;
            }
            let holders: Vec<String> = state.owners.keys().map(ToString::to_string).collect();
            state.owners.clear();
            self.record.set_gauge(0);
            self.record.note(HistoryKind::ForceReleased, None, 0);
            (outstanding, holders, state.on_release.take())
        };
        tracing::warn!(
            target: "tether::leak",
            type_name = self.type_name(),
            unique_id = self.record.unique_id(),
            outstanding,
            holders = %holders.join(", "),
            created_here = %self.record.created_here(),
            "resource not released, forcing release"
        );
        self.finish_release(action, true);
        true
    }
}

/// Reference count that records owners, history and creation site.
///
/// Every reservation is attributed to an owner: releasing with an owner that
/// holds no reservation fails with [`ResourceError::NotReserved`] and leaves
/// the count untouched.
pub struct TracingReferenceCounted {
    core: Arc<TracerCore>,
}

impl TracingReferenceCounted {
    /// Create a tracing count registered in the global registry.
    #[track_caller]
    pub fn new<F>(on_release: F, unique_id: impl Into<String>, type_name: &'static str) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(
            leak::registry(),
            Box::new(on_release),
            unique_id.into(),
            type_name,
            Location::caller(),
        )
    }

    /// Create a tracing count registered in `registry`.
    #[track_caller]
    pub fn in_registry<F>(
        registry: &Arc<LeakRegistry>,
        on_release: F,
        unique_id: impl Into<String>,
        type_name: &'static str,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(
            registry,
            Box::new(on_release),
            unique_id.into(),
            type_name,
            Location::caller(),
        )
    }

    fn build(
        registry: &Arc<LeakRegistry>,
        on_release: ReleaseAction,
        unique_id: String,
        type_name: &'static str,
        location: &'static Location<'static>,
    ) -> Self {
        let created_here = StackTrace::at(format!("{type_name} created here"), location, true);
        let record = registry.new_record(
            TrackKind::ReferenceCounted,
            type_name,
            unique_id,
            created_here,
            1,
        );

        let mut owners = HashMap::new();
        owners.insert(ReferenceOwner::INIT, 1);
        let core = Arc::new(TracerCore {
            record: Arc::clone(&record),
            registry: Arc::clone(registry),
            state: Mutex::new(TracerState {
                owners,
                on_release: Some(on_release),
            }),
            listeners: Listeners::default(),
        });

        let weak: Weak<TracerCore> = Arc::downgrade(&core);
        let live: Weak<dyn Teardown> = weak;
        registry.track(record, live);
        Self { core }
    }

    fn released(&self) -> ResourceError {
        ResourceError::AlreadyReleased {
            type_name: self.core.type_name(),
        }
    }

    /// Owners currently holding at least one reservation, with their counts.
    pub fn holders(&self) -> Vec<(ReferenceOwner, u32)> {
        let state = self.core.state.lock();
        state.owners.iter().map(|(owner, n)| (*owner, *n)).collect()
    }

    /// The unique id supplied at construction.
    pub fn unique_id(&self) -> &str {
        self.core.record.unique_id()
    }

    /// Retained history of reserve/release events, oldest first.
    pub fn history(&self) -> Vec<leak::HistoryEvent> {
        self.core.record.history()
    }

    /// Drop one reservation of `owner` while the state lock is held.
    ///
    /// Returns the new count and, when it reached zero, the release action.
    #[track_caller]
    fn release_locked(
        &self,
        state: &mut TracerState,
        owner: ReferenceOwner,
    ) -> ResourceResult<(u64, Option<ReleaseAction>)> {
        let current = self.core.record.gauge();
        if current == 0 {
            return Err(ResourceError::DoubleRelease {
                type_name: self.core.type_name(),
                owner,
            });
        }
        match state.owners.get(&owner).copied() {
            None | Some(0) => {
                return Err(ResourceError::NotReserved {
                    type_name: self.core.type_name(),
                    owner,
                });
            }
            Some(1) => {
                state.owners.remove(&owner);
            }
            Some(held) => {
                state.owners.insert(owner, held - 1);
            }
        }
        let count = current - 1;
        self.core.record.set_gauge(count);
        self.core.record.note(HistoryKind::Released, Some(owner), count);
        let action = if count == 0 {
            state.on_release.take()
        } else {
            None
        };
        Ok((count, action))
    }

    fn after_release(&self, owner: ReferenceOwner, count: u64, action: Option<ReleaseAction>) {
        self.core.listeners.notify(|l| l.on_reference_removed(owner));
        if count == 0 {
            tracing::debug!(
                target: "tether::refcount",
                type_name = self.core.type_name(),
                unique_id = self.core.record.unique_id(),
                "resource released"
            );
            self.core.finish_release(action, false);
        }
    }
}

impl QueryCloseable for TracingReferenceCounted {
    fn is_closed(&self) -> bool {
        self.core.record.gauge() == 0
    }
}

impl ReferenceCounted for TracingReferenceCounted {
    #[track_caller]
    fn reserve(&self, owner: ReferenceOwner) -> ResourceResult<u64> {
        let count = {
            let mut state = self.core.state.lock();
            let current = self.core.record.gauge();
            if current == 0 {
                return Err(self.released());
            }
            *state.owners.entry(owner).or_insert(0) += 1;
            self.core.record.set_gauge(current + 1);
            self.core.record.note(HistoryKind::Reserved, Some(owner), current + 1);
            current + 1
        };
        self.core.listeners.notify(|l| l.on_reference_added(owner));
        Ok(count)
    }

    #[track_caller]
    fn release(&self, owner: ReferenceOwner) -> ResourceResult<u64> {
        let (count, action) = {
            let mut state = self.core.state.lock();
            self.release_locked(&mut state, owner)?
        };
        self.after_release(owner, count, action);
        Ok(count)
    }

    #[track_caller]
    fn release_last(&self, owner: ReferenceOwner) -> ResourceResult<()> {
        let (count, action) = {
            let mut state = self.core.state.lock();
            match self.core.record.gauge() {
                0 => return Err(self.released()),
                1 => {}
                count => {
                    return Err(ResourceError::NotLastReference {
                        type_name: self.core.type_name(),
                        count,
                    });
                }
            }
            self.release_locked(&mut state, owner)?
        };
        self.after_release(owner, count, action);
        Ok(())
    }

    #[track_caller]
    fn reserve_transfer(&self, from: ReferenceOwner, to: ReferenceOwner) -> ResourceResult<()> {
        {
            let mut state = self.core.state.lock();
            let current = self.core.record.gauge();
            if current == 0 {
                return Err(self.released());
            }
            match state.owners.get(&from).copied() {
                None | Some(0) => {
                    return Err(ResourceError::NotReserved {
                        type_name: self.core.type_name(),
                        owner: from,
                    });
                }
                Some(1) => {
                    state.owners.remove(&from);
                }
                Some(held) => {
                    state.owners.insert(from, held - 1);
                }
            }
            *state.owners.entry(to).or_insert(0) += 1;
            self.core.record.note(HistoryKind::Transferred, Some(to), current);
        }
        self.core.listeners.notify(|l| l.on_reference_transferred(from, to));
        Ok(())
    }

    fn ref_count(&self) -> u64 {
        self.core.record.gauge()
    }

    fn add_reference_change_listener(&self, listener: Arc<dyn ReferenceChangeListener>) {
        self.core.listeners.add(listener);
    }

    fn remove_reference_change_listener(&self, listener: &Arc<dyn ReferenceChangeListener>) {
        self.core.listeners.remove(listener);
    }

    fn untrack_references(&self) -> bool {
        self.core.registry.unmonitor(self.core.record.id())
    }
}

impl ReferenceCountedTracer for TracingReferenceCounted {
    fn type_name(&self) -> &'static str {
        self.core.type_name()
    }

    fn warn_and_release_if_not_released(&self) -> bool {
        self.core.force_release()
    }

    fn created_here(&self) -> Option<&StackTrace> {
        Some(self.core.record.created_here())
    }

    fn monitor_id(&self) -> Option<MonitorId> {
        Some(self.core.record.id())
    }

    fn is_monitored(&self) -> bool {
        self.core.registry.is_monitored(self.core.record.id())
    }
}

impl OwnedResources for TracingReferenceCounted {
    fn is_unmonitor_excluded(&self) -> bool {
        self.core.record.is_unmonitored()
    }

    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        Some(self)
    }
}

impl fmt::Debug for TracingReferenceCounted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingReferenceCounted")
            .field("type_name", &self.core.type_name())
            .field("unique_id", &self.core.record.unique_id())
            .field("count", &self.ref_count())
            .field("monitor_id", &self.core.record.id())
            .finish()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Chooses between vanilla and tracing counts.
///
/// The process-wide factory is [`TracerFactory::global`]; tests build their own
/// to avoid depending on the environment.
#[derive(Debug, Clone)]
pub struct TracerFactory {
    registry: Option<Arc<LeakRegistry>>,
}

impl TracerFactory {
    /// A factory producing vanilla counts.
    pub fn vanilla() -> Self {
        Self { registry: None }
    }

    /// A factory producing tracing counts registered in `registry`.
    pub fn tracing(registry: Arc<LeakRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// The factory selected by the process-wide tracing flag.
    pub fn global() -> Self {
        if crate::is_resource_tracing() {
            Self::tracing(Arc::clone(leak::registry()))
        } else {
            Self::vanilla()
        }
    }

    /// Whether this factory produces tracing counts.
    pub fn is_tracing(&self) -> bool {
        self.registry.is_some()
    }

    /// Create a count for a resource. `unique_id` is only evaluated when tracing.
    #[track_caller]
    pub fn on_released<F, U>(
        &self,
        on_release: F,
        unique_id: U,
        type_name: &'static str,
    ) -> Box<dyn ReferenceCountedTracer>
    where
        F: FnOnce() + Send + 'static,
        U: FnOnce() -> String,
    {
        match &self.registry {
            Some(registry) => Box::new(TracingReferenceCounted::build(
                registry,
                Box::new(on_release),
                unique_id(),
                type_name,
                Location::caller(),
            )),
            None => Box::new(VanillaReferenceCounted::new(on_release, type_name)),
        }
    }
}

/// Create a count for a resource, tracing if the process-wide flag is set.
#[track_caller]
pub fn on_released<F, U>(
    on_release: F,
    unique_id: U,
    type_name: &'static str,
) -> Box<dyn ReferenceCountedTracer>
where
    F: FnOnce() + Send + 'static,
    U: FnOnce() -> String,
{
    TracerFactory::global().on_released(on_release, unique_id, type_name)
}

/// [`on_released`] with the type name of `T`.
#[track_caller]
pub fn for_type<T: ?Sized, F, U>(on_release: F, unique_id: U) -> Box<dyn ReferenceCountedTracer>
where
    F: FnOnce() + Send + 'static,
    U: FnOnce() -> String,
{
    on_released(on_release, unique_id, type_name::<T>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracingConfig;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<LeakRegistry> {
        Arc::new(LeakRegistry::new(TracingConfig {
            enabled: true,
            capture_operations: false,
            history_capacity: 16,
        }))
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&fired);
        (fired, move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn both() -> Vec<(Box<dyn ReferenceCountedTracer>, Arc<AtomicUsize>)> {
        let (fired_v, action_v) = counter();
        let (fired_t, action_t) = counter();
        vec![
            (
                TracerFactory::vanilla().on_released(action_v, || "v".into(), "Buffer"),
                fired_v,
            ),
            (
                TracerFactory::tracing(registry()).on_released(action_t, || "t".into(), "Buffer"),
                fired_t,
            ),
        ]
    }

    #[test]
    fn test_release_runs_once_at_zero() {
        for (refs, fired) in both() {
            let owner = ReferenceOwner::temporary("reader");
            assert_eq!(refs.reserve(owner).unwrap(), 2);
            assert_eq!(refs.release(owner).unwrap(), 1);
            assert_eq!(fired.load(Ordering::SeqCst), 0);
            assert_eq!(refs.release(ReferenceOwner::INIT).unwrap(), 0);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(refs.is_closed());
        }
    }

    #[test]
    fn test_no_resurrection() {
        for (refs, fired) in both() {
            refs.release(ReferenceOwner::INIT).unwrap();
            let err = refs.reserve(ReferenceOwner::INIT).unwrap_err();
            assert!(matches!(err, ResourceError::AlreadyReleased { .. }));
            assert!(!refs.try_reserve(ReferenceOwner::INIT));
            let err = refs.release(ReferenceOwner::INIT).unwrap_err();
            assert!(matches!(err, ResourceError::DoubleRelease { .. }));
            assert_eq!(refs.ref_count(), 0);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_release_last() {
        for (refs, fired) in both() {
            let owner = ReferenceOwner::temporary("writer");
            refs.reserve(owner).unwrap();
            let err = refs.release_last(owner).unwrap_err();
            assert!(matches!(err, ResourceError::NotLastReference { count: 2, .. }));
            assert_eq!(refs.ref_count(), 2);

            refs.release(owner).unwrap();
            refs.release_last(ReferenceOwner::INIT).unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(refs.release_last(ReferenceOwner::INIT).unwrap_err().is_released());
        }
    }

    #[test]
    fn test_throw_if_released_and_not_released() {
        for (refs, _) in both() {
            assert!(refs.throw_if_released().is_ok());
            assert!(matches!(
                refs.throw_if_not_released(),
                Err(ResourceError::NotReleased { count: 1, .. })
            ));
            refs.release(ReferenceOwner::INIT).unwrap();
            assert!(refs.throw_if_released().unwrap_err().is_released());
            assert!(refs.throw_if_not_released().is_ok());
        }
    }

    #[test]
    fn test_warn_and_release_skips_listeners() {
        struct Removed(AtomicUsize);
        impl ReferenceChangeListener for Removed {
            fn on_reference_removed(&self, _owner: ReferenceOwner) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        for (refs, fired) in both() {
            let listener = Arc::new(Removed(AtomicUsize::new(0)));
            refs.add_reference_change_listener(listener.clone());
            refs.reserve(ReferenceOwner::temporary("leaky")).unwrap();

            assert!(refs.warn_and_release_if_not_released());
            assert!(!refs.warn_and_release_if_not_released());
            assert_eq!(refs.ref_count(), 0);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(listener.0.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn test_listeners_observe_changes() {
        #[derive(Default)]
        struct Log(parking_lot::Mutex<Vec<String>>);
        impl ReferenceChangeListener for Log {
            fn on_reference_added(&self, owner: ReferenceOwner) {
                self.0.lock().push(format!("+{}", owner.name()));
            }
            fn on_reference_removed(&self, owner: ReferenceOwner) {
                self.0.lock().push(format!("-{}", owner.name()));
            }
            fn on_reference_transferred(&self, from: ReferenceOwner, to: ReferenceOwner) {
                self.0.lock().push(format!("{}>{}", from.name(), to.name()));
            }
        }

        for (refs, _) in both() {
            let log = Arc::new(Log::default());
            let as_dyn: Arc<dyn ReferenceChangeListener> = log.clone();
            refs.add_reference_change_listener(as_dyn.clone());

            let a = ReferenceOwner::temporary("a");
            let b = ReferenceOwner::temporary("b");
            refs.reserve(a).unwrap();
            refs.reserve_transfer(a, b).unwrap();
            refs.release(b).unwrap();
            refs.remove_reference_change_listener(&as_dyn);
            refs.release(ReferenceOwner::INIT).unwrap();

            assert_eq!(*log.0.lock(), vec!["+a", "a>b", "-b"]);
        }
    }

    #[test]
    fn test_tracing_rejects_unknown_owner() {
        let registry = registry();
        let refs = TracingReferenceCounted::in_registry(&registry, || {}, "file-1", "MappedFile");
        let stranger = ReferenceOwner::temporary("stranger");

        let err = refs.release(stranger).unwrap_err();
        assert!(matches!(err, ResourceError::NotReserved { .. }));
        assert_eq!(refs.ref_count(), 1);

        let err = refs.reserve_transfer(stranger, ReferenceOwner::INIT).unwrap_err();
        assert!(matches!(err, ResourceError::NotReserved { .. }));
    }

    #[test]
    fn test_tracing_registration_lifecycle() {
        let registry = registry();
        let refs = TracingReferenceCounted::in_registry(&registry, || {}, "file-2", "MappedFile");
        let id = refs.monitor_id().unwrap();
        assert!(registry.is_monitored(id));
        assert_eq!(refs.unique_id(), "file-2");
        assert_eq!(refs.created_here().unwrap().location().file(), file!());

        let owner = ReferenceOwner::temporary("tailer");
        refs.reserve(owner).unwrap();
        assert_eq!(refs.holders().len(), 2);
        refs.release(owner).unwrap();
        refs.release(ReferenceOwner::INIT).unwrap();

        assert!(!registry.is_monitored(id));
        let kinds: Vec<_> = refs.history().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![HistoryKind::Reserved, HistoryKind::Released, HistoryKind::Released]
        );
    }

    #[test]
    fn test_history_records_call_site() {
        let registry = Arc::new(LeakRegistry::new(TracingConfig {
            enabled: true,
            capture_operations: true,
            history_capacity: 16,
        }));
        let refs = TracingReferenceCounted::in_registry(&registry, || {}, "file-5", "MappedFile");
        let owner = ReferenceOwner::temporary("tailer");
        refs.reserve(owner).unwrap();
        refs.reserve_transfer(owner, ReferenceOwner::INIT).unwrap();
        refs.release(ReferenceOwner::INIT).unwrap();

        let history = refs.history();
        assert_eq!(history.len(), 3);
        for event in &history {
            let trace = event.trace.as_ref().unwrap();
            assert_eq!(trace.location().file(), file!());
        }
    }

    #[test]
    fn test_tracing_untrack_references() {
        let registry = registry();
        let refs = TracingReferenceCounted::in_registry(&registry, || {}, "file-3", "MappedFile");
        assert!(refs.untrack_references());
        assert!(!refs.untrack_references());
        assert!(refs.is_unmonitor_excluded());
        assert!(registry.is_empty());
        drop(refs);
        assert!(registry.sweep().is_clean());
    }

    #[test]
    fn test_dropped_tracer_is_a_leak() {
        let registry = registry();
        let refs = TracingReferenceCounted::in_registry(&registry, || {}, "file-4", "MappedFile");
        drop(refs);
        let report = registry.sweep();
        assert_eq!(report.leaks.len(), 1);
        assert_eq!(report.leaks[0].type_name, "MappedFile");
        assert_eq!(report.leaks[0].unique_id, "file-4");
    }

    #[test]
    fn test_vanilla_factory_skips_unique_id() {
        let refs = TracerFactory::vanilla().on_released(
            || {},
            || panic!("unique id evaluated"),
            "Buffer",
        );
        assert!(refs.created_here().is_none());
        assert!(refs.monitor_id().is_none());
    }
}
