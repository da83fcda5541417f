//! # Reference Counting Capability
//!
//! A reference-counted resource starts with one reference held by its creator
//! ([`ReferenceOwner::INIT`]). Every [`reserve`](ReferenceCounted::reserve)
//! adds a holder, every [`release`](ReferenceCounted::release) removes one, and
//! the resource's release action runs exactly once, on the release that takes
//! the count to zero.
//!
//! ## Invariants
//!
//! - A released resource cannot be resurrected: `reserve` on a zero count
//!   fails with `AlreadyReleased`.
//! - The count never underflows: `release` on a zero count fails with
//!   `DoubleRelease`.
//! - `ref_count` is a snapshot. It never disagrees with some strict ordering of
//!   the reserve/release calls made so far, but may be stale by the time the
//!   caller looks at it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::closeable::QueryCloseable;
use crate::error::{ResourceError, ResourceResult};
use crate::leak::MonitorId;
use crate::stack_trace::StackTrace;

/// Counter for temporary owner ids. Zero is reserved for [`ReferenceOwner::INIT`].
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a reference holder.
///
/// Owners are cheap copyable tokens. Two owners are equal when their ids are
/// equal; the name is only used in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceOwner {
    id: u64,
    name: &'static str,
}

impl ReferenceOwner {
    /// The reference held by whoever constructed the resource.
    pub const INIT: ReferenceOwner = ReferenceOwner { id: 0, name: "init" };

    /// Allocate a fresh owner identity.
    pub fn temporary(name: &'static str) -> Self {
        Self {
            id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    /// The numeric identity of this owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The diagnostic name of this owner.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ReferenceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}#{}", self.name, self.id)
        }
    }
}

impl fmt::Debug for ReferenceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceOwner({self})")
    }
}

/// Observer of reference changes on a single resource.
///
/// Listeners are notified after the count has changed. They are not notified
/// when teardown force-releases a resource.
pub trait ReferenceChangeListener: Send + Sync {
    /// A reference was reserved by `owner`.
    fn on_reference_added(&self, owner: ReferenceOwner) {
        let _ = owner;
    }

    /// A reference held by `owner` was released.
    fn on_reference_removed(&self, owner: ReferenceOwner) {
        let _ = owner;
    }

    /// A reference moved from `from` to `to` without changing the count.
    fn on_reference_transferred(&self, from: ReferenceOwner, to: ReferenceOwner) {
        let _ = (from, to);
    }
}

/// Acquire/release counting contract.
pub trait ReferenceCounted: QueryCloseable + Send + Sync {
    /// Add a reference held by `owner` and return the new count.
    fn reserve(&self, owner: ReferenceOwner) -> ResourceResult<u64>;

    /// Like [`reserve`](Self::reserve) but reports failure as `false`.
    fn try_reserve(&self, owner: ReferenceOwner) -> bool {
        self.reserve(owner).is_ok()
    }

    /// Drop the reference held by `owner` and return the new count.
    ///
    /// The release action runs before this returns when the count reaches zero.
    fn release(&self, owner: ReferenceOwner) -> ResourceResult<u64>;

    /// Release the final reference, failing without side effects if others remain.
    fn release_last(&self, owner: ReferenceOwner) -> ResourceResult<()>;

    /// Move a reference from one owner to another.
    fn reserve_transfer(&self, from: ReferenceOwner, to: ReferenceOwner) -> ResourceResult<()>;

    /// Current reference count.
    fn ref_count(&self) -> u64;

    /// Register a listener for reference changes.
    fn add_reference_change_listener(&self, listener: Arc<dyn ReferenceChangeListener>);

    /// Remove a previously registered listener.
    fn remove_reference_change_listener(&self, listener: &Arc<dyn ReferenceChangeListener>);

    /// Stop leak tracking of this resource without releasing it.
    ///
    /// Returns true if the resource was being tracked.
    fn untrack_references(&self) -> bool {
        false
    }
}

/// A [`ReferenceCounted`] implementation with diagnostic entry points.
pub trait ReferenceCountedTracer: ReferenceCounted {
    /// Type of the resource this count guards.
    fn type_name(&self) -> &'static str;

    /// Fail with `AlreadyReleased` when the count is zero.
    fn throw_if_released(&self) -> ResourceResult<()> {
        if self.ref_count() == 0 {
            Err(ResourceError::AlreadyReleased {
                type_name: self.type_name(),
            })
        } else {
            Ok(())
        }
    }

    /// Force the count to zero, running the release action and logging a
    /// warning if references were still outstanding.
    ///
    /// Intended for teardown. Listeners are not notified. Returns true if a
    /// release happened.
    fn warn_and_release_if_not_released(&self) -> bool;

    /// Fail with `NotReleased` if references are still outstanding.
    fn throw_if_not_released(&self) -> ResourceResult<()> {
        match self.ref_count() {
            0 => Ok(()),
            count => Err(ResourceError::NotReleased {
                type_name: self.type_name(),
                count,
            }),
        }
    }

    /// Where the resource was created, when tracing.
    fn created_here(&self) -> Option<&StackTrace> {
        None
    }

    /// Leak-registry identity, when tracing.
    fn monitor_id(&self) -> Option<MonitorId> {
        None
    }

    /// Whether the leak registry currently tracks this resource.
    fn is_monitored(&self) -> bool {
        false
    }
}

/// Listener list with a lock-free empty check.
#[derive(Default)]
pub(crate) struct Listeners {
    any: AtomicBool,
    list: RwLock<Vec<Arc<dyn ReferenceChangeListener>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn ReferenceChangeListener>) {
        let mut list = self.list.write();
        list.push(listener);
        self.any.store(true, Ordering::Release);
    }

    pub(crate) fn remove(&self, listener: &Arc<dyn ReferenceChangeListener>) {
        let mut list = self.list.write();
        list.retain(|l| !Arc::ptr_eq(l, listener));
        self.any.store(!list.is_empty(), Ordering::Release);
    }

    /// Call `f` for every listener, outside the list lock.
    pub(crate) fn notify(&self, f: impl Fn(&dyn ReferenceChangeListener)) {
        if !self.any.load(Ordering::Acquire) {
            return;
        }
        let snapshot = self.list.read().clone();
        for listener in &snapshot {
            f(listener.as_ref());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}
