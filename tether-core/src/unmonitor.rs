//! # Unmonitor Walk
//!
//! Removes a resource, and the resources it owns, from leak tracking without
//! closing or releasing anything. Used when ownership moves somewhere the
//! registry should not follow, such as a pool or a harness with its own
//! teardown.
//!
//! Types opt in by implementing [`OwnedResources`] and listing their owned
//! children in [`visit_owned`](OwnedResources::visit_owned). The walk is
//! bounded: the root is level 0 and children are visited down to the
//! configured depth (default 4). Anything deeper is left tracked.
//!
//! A child that cannot be inspected (for example a mutex held by another
//! thread) is reported as [`Field::Denied`]; the walk logs it, records it in
//! the [`UnmonitorReport`] and carries on with the siblings. A partial walk can
//! leave resources tracked that the caller meant to release from tracking;
//! the report's `denied` list is the only signal of that.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::closeable::Closeable;
use crate::reference::ReferenceCounted;

/// One owned child reported by [`OwnedResources::visit_owned`].
pub enum Field<'a> {
    /// An accessible child.
    Value {
        /// Field name, for diagnostics.
        name: &'static str,
        /// The child.
        value: &'a dyn OwnedResources,
    },
    /// A child that could not be inspected.
    Denied {
        /// Field name, for diagnostics.
        name: &'static str,
        /// Why it could not be inspected.
        reason: String,
    },
}

impl<'a> Field<'a> {
    /// Shorthand for [`Field::Value`].
    pub fn value(name: &'static str, value: &'a dyn OwnedResources) -> Self {
        Field::Value { name, value }
    }
}

/// Exposes the tracked capabilities and owned children of an object.
pub trait OwnedResources {
    /// Stop the walk here. Plain data and untracked resources return true.
    fn is_unmonitor_excluded(&self) -> bool {
        false
    }

    /// The object as a closeable resource, if it is one.
    fn as_closeable(&self) -> Option<&dyn Closeable> {
        None
    }

    /// The object as a reference-counted resource, if it is one.
    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        None
    }

    /// Report each owned child.
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        let _ = visit;
    }
}

/// A field the walk could not inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeniedField {
    /// Level of the object that owns the field.
    pub level: usize,
    /// Field name.
    pub name: &'static str,
    /// Why it could not be inspected.
    pub reason: String,
}

/// Outcome of an unmonitor walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmonitorReport {
    /// Objects visited, the root included.
    pub visited: usize,
    /// Closeables removed from tracking.
    pub closeables: usize,
    /// Reference-counted resources removed from tracking.
    pub reference_counted: usize,
    /// Fields skipped because they could not be inspected.
    pub denied: Vec<DeniedField>,
}

impl UnmonitorReport {
    /// Total resources removed from tracking.
    pub fn untracked(&self) -> usize {
        self.closeables + self.reference_counted
    }

    /// True if some field could not be inspected.
    pub fn is_partial(&self) -> bool {
        !self.denied.is_empty()
    }
}

/// Unmonitor `root` to the configured depth.
pub fn unmonitor(root: &dyn OwnedResources) -> UnmonitorReport {
    unmonitor_to_depth(root, crate::config().unmonitor.depth)
}

/// Unmonitor `root` and its owned children down to `depth` levels below it.
pub fn unmonitor_to_depth(root: &dyn OwnedResources, depth: usize) -> UnmonitorReport {
    let mut report = UnmonitorReport::default();
    walk(root, 0, depth, &mut report);
    if report.untracked() > 0 || report.is_partial() {
        tracing::debug!(
            target: "tether::unmonitor",
            visited = report.visited,
            untracked = report.untracked(),
            denied = report.denied.len(),
            "unmonitor walk finished"
        );
    }
    report
}

fn walk(object: &dyn OwnedResources, level: usize, depth: usize, report: &mut UnmonitorReport) {
    if object.is_unmonitor_excluded() {
        return;
    }
    report.visited += 1;

    if object.as_closeable().is_some_and(|c| c.untrack_close()) {
        report.closeables += 1;
    }
    if object
        .as_reference_counted()
        .is_some_and(|r| r.untrack_references())
    {
        report.reference_counted += 1;
    }

    if level >= depth {
        return;
    }
    object.visit_owned(&mut |field| match field {
        Field::Value { value, .. } => walk(value, level + 1, depth, report),
        Field::Denied { name, reason } => {
            tracing::warn!(
                target: "tether::unmonitor",
                level,
                field = name,
                reason = %reason,
                "skipping field during unmonitor"
            );
            report.denied.push(DeniedField {
                level,
                name,
                reason,
            });
        }
    });
}

// ============================================================================
// Standard implementations
// ============================================================================

impl<T: OwnedResources + ?Sized> OwnedResources for &T {
    fn is_unmonitor_excluded(&self) -> bool {
        (**self).is_unmonitor_excluded()
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        (**self).as_closeable()
    }

    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        (**self).as_reference_counted()
    }

    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        (**self).visit_owned(visit)
    }
}

impl<T: OwnedResources + ?Sized> OwnedResources for Box<T> {
    fn is_unmonitor_excluded(&self) -> bool {
        (**self).is_unmonitor_excluded()
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        (**self).as_closeable()
    }

    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        (**self).as_reference_counted()
    }

    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        (**self).visit_owned(visit)
    }
}

impl<T: OwnedResources + ?Sized> OwnedResources for Arc<T> {
    fn is_unmonitor_excluded(&self) -> bool {
        (**self).is_unmonitor_excluded()
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        (**self).as_closeable()
    }

    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        (**self).as_reference_counted()
    }

    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        (**self).visit_owned(visit)
    }
}

impl<T: OwnedResources> OwnedResources for Option<T> {
    fn is_unmonitor_excluded(&self) -> bool {
        self.as_ref().is_none_or(|inner| inner.is_unmonitor_excluded())
    }

    fn as_closeable(&self) -> Option<&dyn Closeable> {
        self.as_ref().and_then(|inner| inner.as_closeable())
    }

    fn as_reference_counted(&self) -> Option<&dyn ReferenceCounted> {
        self.as_ref().and_then(|inner| inner.as_reference_counted())
    }

    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        if let Some(inner) = self {
            inner.visit_owned(visit);
        }
    }
}

impl<T: OwnedResources> OwnedResources for Vec<T> {
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        for item in self {
            visit(Field::value("element", item));
        }
    }
}

impl<T: OwnedResources> OwnedResources for VecDeque<T> {
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        for item in self {
            visit(Field::value("element", item));
        }
    }
}

impl<K, V: OwnedResources, S> OwnedResources for HashMap<K, V, S> {
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        for value in self.values() {
            visit(Field::value("value", value));
        }
    }
}

impl<K, V: OwnedResources> OwnedResources for BTreeMap<K, V> {
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        for value in self.values() {
            visit(Field::value("value", value));
        }
    }
}

/// A mutex held elsewhere is reported as denied rather than waited on.
impl<T: OwnedResources> OwnedResources for parking_lot::Mutex<T> {
    fn visit_owned(&self, visit: &mut dyn FnMut(Field<'_>)) {
        match self.try_lock() {
            Some(guard) => visit(Field::value("guarded", &*guard)),
            None => visit(Field::Denied {
                name: "guarded",
                reason: "mutex held by another thread".to_owned(),
            }),
        }
    }
}

macro_rules! plain_data {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl OwnedResources for $ty {
                fn is_unmonitor_excluded(&self) -> bool {
                    true
                }
            }
        )+
    };
}

plain_data!(
    (), bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    str, String,
);
