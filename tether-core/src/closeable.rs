//! # Closeable Capability
//!
//! [`Closeable::close`] is idempotent: any number of calls from any thread leave
//! the resource closed, and only the first runs the close action. [`CloseCell`]
//! implements that tri-state protocol for resource types to embed.
//!
//! Batch close goes through [`CloseQuietly`], implemented for trait objects,
//! smart pointers, weak references, options and the standard containers.
//! Element failures and panics are logged on `tether::close` and swallowed so
//! one bad element never stops the rest from closing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::Backoff;

use crate::error::{ResourceError, ResourceResult};
use crate::leak::{self, HistoryKind, LeakRegistry, Teardown, TraceRecord, TrackKind};
use crate::stack_trace::StackTrace;
use crate::unmonitor::OwnedResources;

/// Cheap, thread-safe state queries.
pub trait QueryCloseable {
    /// True once the resource is fully closed.
    fn is_closed(&self) -> bool;

    /// True while a close is in progress or after it completed.
    fn is_closing(&self) -> bool {
        self.is_closed()
    }
}

/// Idempotent close contract.
pub trait Closeable: QueryCloseable + Send + Sync {
    /// Close the resource. Repeated calls return `Ok(())` without side effects.
    fn close(&self) -> ResourceResult<()>;

    /// Stop leak tracking of this resource without closing it.
    ///
    /// Returns true if the resource was being tracked.
    fn untrack_close(&self) -> bool {
        false
    }
}

// ============================================================================
// Close State
// ============================================================================

/// State of a [`CloseCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseState {
    /// Usable.
    Open = 0,
    /// A close action is running.
    Closing = 1,
    /// Closed for good.
    Closed = 2,
}

impl CloseState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseState::Open,
            1 => CloseState::Closing,
            _ => CloseState::Closed,
        }
    }
}

struct CloseTracking {
    record: Arc<TraceRecord>,
    registry: Arc<LeakRegistry>,
    // Dropped with the cell, which is what the registry watches.
    _liveness: Arc<Liveness>,
}

struct Liveness;

impl Teardown for Liveness {
    fn force_release(&self) -> bool {
        false
    }
}

/// Atomic open/closing/closed state with optional leak tracking.
pub struct CloseCell {
    state: AtomicU8,
    type_name: &'static str,
    tracking: Option<CloseTracking>,
}

impl CloseCell {
    /// Create an open cell, tracked if resource tracing is enabled.
    #[track_caller]
    pub fn new(type_name: &'static str) -> Self {
        if crate::is_resource_tracing() {
            Self::tracked(leak::registry(), type_name, Location::caller())
        } else {
            Self::untracked(type_name)
        }
    }

    /// [`CloseCell::new`] with the type name of `T`.
    #[track_caller]
    pub fn for_type<T: ?Sized>() -> Self {
        Self::new(std::any::type_name::<T>())
    }

    /// Create an open cell that is never tracked.
    pub fn untracked(type_name: &'static str) -> Self {
        Self {
            state: AtomicU8::new(CloseState::Open as u8),
            type_name,
            tracking: None,
        }
    }

    /// Create an open cell tracked in `registry`.
    #[track_caller]
    pub fn tracked_in(registry: &Arc<LeakRegistry>, type_name: &'static str) -> Self {
        Self::tracked(registry, type_name, Location::caller())
    }

    fn tracked(
        registry: &Arc<LeakRegistry>,
        type_name: &'static str,
        location: &'static Location<'static>,
    ) -> Self {
        let created_here = StackTrace::at(format!("{type_name} opened here"), location, true);
        let record = registry.new_record(
            TrackKind::Closeable,
            type_name,
            type_name.to_owned(),
            created_here,
            1,
        );
        let liveness = Arc::new(Liveness);
        let weak: Weak<Liveness> = Arc::downgrade(&liveness);
        let live: Weak<dyn Teardown> = weak;
        registry.track(Arc::clone(&record), live);
        Self {
            state: AtomicU8::new(CloseState::Open as u8),
            type_name,
            tracking: Some(CloseTracking {
                record,
                registry: Arc::clone(registry),
                _liveness: liveness,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CloseState {
        CloseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether leak tracking is active for this cell.
    pub fn is_tracked(&self) -> bool {
        self.tracking
            .as_ref()
            .is_some_and(|t| !t.record.is_unmonitored() && t.record.gauge() > 0)
    }

    /// Fail with [`ResourceError::Closed`] unless open.
    pub fn check_open(&self) -> ResourceResult<()> {
        match self.state() {
            CloseState::Open => Ok(()),
            _ => Err(ResourceError::Closed {
                type_name: self.type_name,
            }),
        }
    }

    /// Run `action` if this call wins the open-to-closing transition.
    ///
    /// Losers wait for the winner to finish and then return `Ok(())`, so every
    /// call returns with the cell closed. The cell ends closed whether the
    /// action succeeds, fails or panics. Closing the same cell from inside
    /// `action` never returns.
    pub fn close_with<E, F>(&self, action: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        if self
            .state
            .compare_exchange(
                CloseState::Open as u8,
                CloseState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.wait_closed();
            return Ok(());
        }
        let _finish = FinishClose(self);
        action()
    }

    fn wait_closed(&self) {
        let backoff = Backoff::new();
        while self.state() != CloseState::Closed {
            backoff.snooze();
        }
    }

    fn finish_close(&self) {
        self.state.store(CloseState::Closed as u8, Ordering::Release);
        if let Some(tracking) = &self.tracking {
            tracking.record.set_gauge(0);
            tracking.record.note(HistoryKind::Closed, None, 0);
            tracking.registry.deregister(tracking.record.id());
        }
    }
}

struct FinishClose<'a>(&'a CloseCell);

impl Drop for FinishClose<'_> {
    fn drop(&mut self) {
        self.0.finish_close();
    }
}

impl QueryCloseable for CloseCell {
    fn is_closed(&self) -> bool {
        self.state() == CloseState::Closed
    }

    fn is_closing(&self) -> bool {
        self.state() != CloseState::Open
    }
}

impl Closeable for CloseCell {
    fn close(&self) -> ResourceResult<()> {
        self.close_with(|| Ok(()))
    }

    fn untrack_close(&self) -> bool {
        match &self.tracking {
            Some(tracking) => tracking.registry.unmonitor(tracking.record.id()),
            None => false,
        }
    }
}

impl OwnedResources for CloseCell {
    fn is_unmonitor_excluded(&self) -> bool {
        self.tracking
            .as_ref()
            .is_none_or(|t| t.record.is_unmonitored())
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        Some(self)
    }
}

impl fmt::Debug for CloseCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseCell")
            .field("type_name", &self.type_name)
            .field("state", &self.state())
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

// ============================================================================
// Batch Close
// ============================================================================

/// Close everything reachable from `self`, logging and swallowing failures.
pub trait CloseQuietly {
    /// Close each closeable element. Never fails, never panics.
    fn close_quietly(&self);
}

/// Close one resource, logging any error or panic.
pub fn close_one(closeable: &dyn Closeable) {
    match panic::catch_unwind(AssertUnwindSafe(|| closeable.close())) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(target: "tether::close", error = %err, "error while closing resource");
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            tracing::warn!(target: "tether::close", panic = %message, "panic while closing resource");
        }
    }
}

/// Implement [`CloseQuietly`] for [`Closeable`] types by closing them directly.
#[macro_export]
macro_rules! impl_close_quietly {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::closeable::CloseQuietly for $ty {
                fn close_quietly(&self) {
                    $crate::closeable::close_one(self)
                }
            }
        )+
    };
}

/// Close every argument quietly. Arguments may be of different types.
#[macro_export]
macro_rules! close_quietly {
    ($($item:expr),* $(,)?) => {
        $( $crate::closeable::CloseQuietly::close_quietly(&$item); )*
    };
}

impl CloseQuietly for dyn Closeable {
    fn close_quietly(&self) {
        close_one(self)
    }
}

impl<T: CloseQuietly + ?Sized> CloseQuietly for &T {
    fn close_quietly(&self) {
        (**self).close_quietly()
    }
}

impl<T: CloseQuietly + ?Sized> CloseQuietly for Box<T> {
    fn close_quietly(&self) {
        (**self).close_quietly()
    }
}

impl<T: CloseQuietly + ?Sized> CloseQuietly for Arc<T> {
    fn close_quietly(&self) {
        (**self).close_quietly()
    }
}

impl<T: CloseQuietly + ?Sized> CloseQuietly for Weak<T> {
    fn close_quietly(&self) {
        if let Some(referent) = self.upgrade() {
            referent.close_quietly();
        }
    }
}

impl<T: CloseQuietly> CloseQuietly for Option<T> {
    fn close_quietly(&self) {
        if let Some(inner) = self {
            inner.close_quietly();
        }
    }
}

impl<T: CloseQuietly> CloseQuietly for [T] {
    fn close_quietly(&self) {
        self.iter().for_each(CloseQuietly::close_quietly);
    }
}

impl<T: CloseQuietly, const N: usize> CloseQuietly for [T; N] {
    fn close_quietly(&self) {
        self.iter().for_each(CloseQuietly::close_quietly);
    }
}

impl<T: CloseQuietly> CloseQuietly for Vec<T> {
    fn close_quietly(&self) {
        self.as_slice().close_quietly();
    }
}

impl<T: CloseQuietly> CloseQuietly for VecDeque<T> {
    fn close_quietly(&self) {
        self.iter().for_each(CloseQuietly::close_quietly);
    }
}

impl<K, V: CloseQuietly, S> CloseQuietly for HashMap<K, V, S> {
    fn close_quietly(&self) {
        self.values().for_each(CloseQuietly::close_quietly);
    }
}

impl<K, V: CloseQuietly> CloseQuietly for BTreeMap<K, V> {
    fn close_quietly(&self) {
        self.values().for_each(CloseQuietly::close_quietly);
    }
}

impl<T: CloseQuietly, S> CloseQuietly for HashSet<T, S> {
    fn close_quietly(&self) {
        self.iter().for_each(CloseQuietly::close_quietly);
    }
}

/// Elements are closed from a snapshot taken under the lock, so close actions
/// may lock and modify the vector.
impl<T: CloseQuietly + Clone> CloseQuietly for parking_lot::Mutex<Vec<T>> {
    fn close_quietly(&self) {
        let snapshot = self.lock().clone();
        snapshot.close_quietly();
    }
}

/// Take every element out of `items`, then close them.
pub fn close_and_clear<T: CloseQuietly>(items: &parking_lot::Mutex<Vec<T>>) {
    let drained = std::mem::take(&mut *items.lock());
    drained.close_quietly();
}

macro_rules! no_close {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl CloseQuietly for $ty {
                fn close_quietly(&self) {}
            }
        )+
    };
}

no_close!(
    (), bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    str, String,
);

impl_close_quietly!(CloseCell);

/// True for I/O errors that mean the other side or the stream is already closed.
pub fn is_closed_io_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => true,
        _ => {
            let message = err.to_string().to_ascii_lowercase();
            message.contains("closed") || message.contains("reset by peer")
        }
    }
}
