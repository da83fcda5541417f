//! Shared close/release plumbing for reference-counted resources.
//!
//! A [`Lifecycle`] pairs a reference count with a closing flag. Closing
//! releases the creator's reference ([`ReferenceOwner::INIT`]) once; the
//! resource is closed when the count reaches zero, which may be later if
//! other holders still have reservations. A creator that already gave up
//! `INIT` through `release`, `release_last` or `reserve_transfer` has nothing
//! left for close to release.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ResourceResult;
use crate::reference::{ReferenceCountedTracer, ReferenceOwner};

pub(crate) struct Lifecycle {
    refs: Box<dyn ReferenceCountedTracer>,
    closing: AtomicBool,
    init_released: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new(refs: Box<dyn ReferenceCountedTracer>) -> Self {
        Self {
            refs,
            closing: AtomicBool::new(false),
            init_released: AtomicBool::new(false),
        }
    }

    pub(crate) fn refs(&self) -> &dyn ReferenceCountedTracer {
        self.refs.as_ref()
    }

    /// Fail with `AlreadyReleased` once the count has reached zero.
    pub(crate) fn check(&self) -> ResourceResult<()> {
        self.refs.throw_if_released()
    }

    /// Run `op`, which gives up a reference of `owner`, recording when it is
    /// the creator's first. The flag is restored if `op` fails.
    fn give_up<T>(
        &self,
        owner: ReferenceOwner,
        op: impl FnOnce(&dyn ReferenceCountedTracer) -> ResourceResult<T>,
    ) -> ResourceResult<T> {
        let consumes_init =
            owner == ReferenceOwner::INIT && !self.init_released.swap(true, Ordering::AcqRel);
        let result = op(self.refs());
        if consumes_init && result.is_err() {
            self.init_released.store(false, Ordering::Release);
        }
        result
    }

    pub(crate) fn release(&self, owner: ReferenceOwner) -> ResourceResult<u64> {
        self.give_up(owner, |refs| refs.release(owner))
    }

    pub(crate) fn release_last(&self, owner: ReferenceOwner) -> ResourceResult<()> {
        self.give_up(owner, |refs| refs.release_last(owner))
    }

    pub(crate) fn reserve_transfer(
        &self,
        from: ReferenceOwner,
        to: ReferenceOwner,
    ) -> ResourceResult<()> {
        self.give_up(from, |refs| refs.reserve_transfer(from, to))
    }

    pub(crate) fn close(&self) -> ResourceResult<()> {
        self.closing.store(true, Ordering::Release);
        if self.init_released.swap(true, Ordering::AcqRel) || self.refs.ref_count() == 0 {
            return Ok(());
        }
        self.refs.release(ReferenceOwner::INIT)?;
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.refs.is_closed()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.refs.is_closed()
    }
}

/// Implement the capability traits for a type given the path to its [`Lifecycle`],
/// optionally followed by `owns "name" => path` naming a field the unmonitor walk visits.
macro_rules! lifecycle_resource {
    ($ty:ty, $($field:ident).+ $(, owns $name:literal => $($owned:ident).+)?) => {
        impl $crate::closeable::QueryCloseable for $ty {
            fn is_closed(&self) -> bool {
                self.$($field).+.is_closed()
            }

            fn is_closing(&self) -> bool {
                self.$($field).+.is_closing()
            }
        }

        impl $crate::closeable::Closeable for $ty {
            fn close(&self) -> $crate::error::ResourceResult<()> {
                self.$($field).+.close()
            }
        }

        impl $crate::reference::ReferenceCounted for $ty {
            fn reserve(
                &self,
                owner: $crate::reference::ReferenceOwner,
            ) -> $crate::error::ResourceResult<u64> {
                self.$($field).+.refs().reserve(owner)
            }

            fn release(
                &self,
                owner: $crate::reference::ReferenceOwner,
            ) -> $crate::error::ResourceResult<u64> {
                self.$($field).+.release(owner)
            }

            fn release_last(
                &self,
                owner: $crate::reference::ReferenceOwner,
            ) -> $crate::error::ResourceResult<()> {
                self.$($field).+.release_last(owner)
            }

            fn reserve_transfer(
                &self,
                from: $crate::reference::ReferenceOwner,
                to: $crate::reference::ReferenceOwner,
            ) -> $crate::error::ResourceResult<()> {
                self.$($field).+.reserve_transfer(from, to)
            }

            fn ref_count(&self) -> u64 {
                self.$($field).+.refs().ref_count()
            }

            fn add_reference_change_listener(
                &self,
                listener: std::sync::Arc<dyn $crate::reference::ReferenceChangeListener>,
            ) {
                self.$($field).+.refs().add_reference_change_listener(listener)
            }

            fn remove_reference_change_listener(
                &self,
                listener: &std::sync::Arc<dyn $crate::reference::ReferenceChangeListener>,
            ) {
                self.$($field).+.refs().remove_reference_change_listener(listener)
            }

            fn untrack_references(&self) -> bool {
                self.$($field).+.refs().untrack_references()
            }
        }

        impl $crate::unmonitor::OwnedResources for $ty {
            fn is_unmonitor_excluded(&self) -> bool {
                !self.$($field).+.refs().is_monitored()
            }

            fn as_reference_counted(&self) -> Option<&dyn $crate::reference::ReferenceCounted> {
                Some(self)
            }
            $(
                fn visit_owned(
                    &self,
                    visit: &mut dyn FnMut($crate::unmonitor::Field<'_>),
                ) {
                    visit($crate::unmonitor::Field::value($name, &self.$($owned).+));
                }
            )?
        }

        $crate::impl_close_quietly!($ty);
    };
}

pub(crate) use lifecycle_resource;
