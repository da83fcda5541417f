//! # Off-Heap Values
//!
//! Value cells are words of shared memory read and written through atomics.
//! The traits describe the access protocol; the `Native*` types bind it to an
//! address inside a [`MappedRegion`] (or a caller-supplied raw address) and are
//! themselves reference-counted, closeable resources. Every access checks that
//! the cell has not been released before touching memory.
//!
//! ## Memory orderings
//!
//! | Access | Ordering |
//! |---|---|
//! | `get_value` / `set_value` / `add_value` | `Relaxed` |
//! | `get_volatile_value` | `Acquire` |
//! | `set_ordered_value` | `Release` |
//! | `set_volatile_value` / `add_atomic_value` | `SeqCst` |
//! | `compare_and_swap_value` | `AcqRel` / `Acquire` |
//!
//! ## Two-word cells
//!
//! [`TwoLongValue`] provides the optimistic pair protocol: `set_values` writes
//! word 2 then publishes word 1 with release ordering, and `get_values` reads
//! both words twice until two consecutive readings agree. Double reads alone
//! cannot reject a pair read while a writer sits between its two stores, so
//! [`NativeTwoLongValue`] also keeps a sequence word after the two values and
//! runs `set_values` as a sequence-lock writer. Its `get_values` only accepts a
//! pair read under one even, unchanged sequence number.

use std::any::type_name;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering, fence};

use crossbeam_utils::Backoff;

use crate::error::{ResourceError, ResourceResult};
use crate::lifecycle::{Lifecycle, lifecycle_resource};
use crate::reference::{ReferenceCounted, ReferenceOwner};
use crate::region::MappedRegion;
use crate::tracer;

// ============================================================================
// Traits
// ============================================================================

/// A single 64-bit value.
pub trait LongValue {
    /// Plain read.
    fn get_value(&self) -> ResourceResult<i64>;

    /// Plain write.
    fn set_value(&self, value: i64) -> ResourceResult<()>;

    /// Read with acquire ordering.
    fn get_volatile_value(&self) -> ResourceResult<i64>;

    /// Write with sequentially consistent ordering.
    fn set_volatile_value(&self, value: i64) -> ResourceResult<()>;

    /// Write with release ordering.
    fn set_ordered_value(&self, value: i64) -> ResourceResult<()>;

    /// Non-atomic add; returns the new value.
    fn add_value(&self, delta: i64) -> ResourceResult<i64>;

    /// Atomic add; returns the new value.
    fn add_atomic_value(&self, delta: i64) -> ResourceResult<i64>;

    /// Replace `expected` with `value`; true on success.
    fn compare_and_swap_value(&self, expected: i64, value: i64) -> ResourceResult<bool>;

    /// Raise the value to at least `value`.
    fn set_max_value(&self, value: i64) -> ResourceResult<()> {
        let backoff = Backoff::new();
        loop {
            let current = self.get_volatile_value()?;
            if current >= value || self.compare_and_swap_value(current, value)? {
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Lower the value to at most `value`.
    fn set_min_value(&self, value: i64) -> ResourceResult<()> {
        let backoff = Backoff::new();
        loop {
            let current = self.get_volatile_value()?;
            if current <= value || self.compare_and_swap_value(current, value)? {
                return Ok(());
            }
            backoff.spin();
        }
    }
}

/// Two independently addressable 64-bit values.
pub trait TwoLongValue: LongValue {
    /// Plain read of word 2.
    fn get_value2(&self) -> ResourceResult<i64>;

    /// Plain write of word 2.
    fn set_value2(&self, value: i64) -> ResourceResult<()>;

    /// Read word 2 with acquire ordering.
    fn get_volatile_value2(&self) -> ResourceResult<i64>;

    /// Write word 2 with sequentially consistent ordering.
    fn set_volatile_value2(&self, value: i64) -> ResourceResult<()>;

    /// Write word 2 with release ordering.
    fn set_ordered_value2(&self, value: i64) -> ResourceResult<()>;

    /// Non-atomic add to word 2; returns the new value.
    fn add_value2(&self, delta: i64) -> ResourceResult<i64>;

    /// Atomic add to word 2; returns the new value.
    fn add_atomic_value2(&self, delta: i64) -> ResourceResult<i64>;

    /// Replace `expected` with `value` in word 2; true on success.
    fn compare_and_swap_value2(&self, expected: i64, value: i64) -> ResourceResult<bool>;

    /// Raise word 2 to at least `value`. Word 2 never decreases.
    fn set_max_value2(&self, value: i64) -> ResourceResult<()> {
        let backoff = Backoff::new();
        loop {
            let current = self.get_volatile_value2()?;
            if current >= value || self.compare_and_swap_value2(current, value)? {
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Lower word 2 to at most `value`. Word 2 never increases.
    fn set_min_value2(&self, value: i64) -> ResourceResult<()> {
        let backoff = Backoff::new();
        loop {
            let current = self.get_volatile_value2()?;
            if current <= value || self.compare_and_swap_value2(current, value)? {
                return Ok(());
            }
            backoff.spin();
        }
    }

    /// Write word 2, then publish word 1 with release ordering.
    fn set_values(&self, value: i64, value2: i64) -> ResourceResult<()> {
        self.set_value2(value2)?;
        self.set_ordered_value(value)
    }

    /// Read both words until two consecutive readings agree.
    fn get_values(&self) -> ResourceResult<(i64, i64)> {
        let mut value = self.get_volatile_value()?;
        let mut value2 = self.get_volatile_value2()?;
        loop {
            let again = self.get_volatile_value()?;
            let again2 = self.get_volatile_value2()?;
            if value == again && value2 == again2 {
                return Ok((value, value2));
            }
            value = again;
            value2 = again2;
        }
    }
}

/// A single 32-bit value.
pub trait IntValue {
    /// Plain read.
    fn get_value(&self) -> ResourceResult<i32>;

    /// Plain write.
    fn set_value(&self, value: i32) -> ResourceResult<()>;

    /// Read with acquire ordering.
    fn get_volatile_value(&self) -> ResourceResult<i32>;

    /// Write with sequentially consistent ordering.
    fn set_volatile_value(&self, value: i32) -> ResourceResult<()>;

    /// Write with release ordering.
    fn set_ordered_value(&self, value: i32) -> ResourceResult<()>;

    /// Non-atomic add; returns the new value.
    fn add_value(&self, delta: i32) -> ResourceResult<i32>;

    /// Atomic add; returns the new value.
    fn add_atomic_value(&self, delta: i32) -> ResourceResult<i32>;

    /// Replace `expected` with `value`; true on success.
    fn compare_and_swap_value(&self, expected: i32, value: i32) -> ResourceResult<bool>;
}

/// A single 64-bit floating point value.
pub trait DoubleValue {
    /// Plain read.
    fn get_value(&self) -> ResourceResult<f64>;

    /// Plain write.
    fn set_value(&self, value: f64) -> ResourceResult<()>;

    /// Read with acquire ordering.
    fn get_volatile_value(&self) -> ResourceResult<f64>;

    /// Write with sequentially consistent ordering.
    fn set_volatile_value(&self, value: f64) -> ResourceResult<()>;

    /// Write with release ordering.
    fn set_ordered_value(&self, value: f64) -> ResourceResult<()>;

    /// Non-atomic add; returns the new value.
    fn add_value(&self, delta: f64) -> ResourceResult<f64>;

    /// Atomic add; returns the new value.
    fn add_atomic_value(&self, delta: f64) -> ResourceResult<f64>;

    /// Replace `expected` with `value`, comparing bit patterns; true on success.
    fn compare_and_swap_value(&self, expected: f64, value: f64) -> ResourceResult<bool>;
}

// ============================================================================
// Binding
// ============================================================================

/// A typed cell address plus the lifecycle guarding it.
struct Binding<C> {
    cell: NonNull<C>,
    lifecycle: Lifecycle,
    // Keeps the mapping alive while the cell exists.
    region: Option<Arc<MappedRegion>>,
}

// Safety: `C` is made of atomics and the address stays valid while the
// binding exists (the region is kept alive, or the caller of `from_raw`
// guaranteed it).
unsafe impl<C: Sync> Send for Binding<C> {}
unsafe impl<C: Sync> Sync for Binding<C> {}

impl<C> Binding<C> {
    #[track_caller]
    fn in_region(
        region: &Arc<MappedRegion>,
        offset: usize,
        type_name: &'static str,
    ) -> ResourceResult<Self> {
        let address = region.address_for(offset, size_of::<C>(), align_of::<C>())?;
        let owner = ReferenceOwner::temporary(type_name);
        region.reserve(owner)?;

        let held = Arc::clone(region);
        let refs = tracer::on_released(
            move || {
                if let Err(err) = held.release(owner) {
                    tracing::warn!(
                        target: "tether::refcount",
                        error = %err,
                        "failed to release region reservation"
                    );
                }
            },
            || format!("{type_name}@{:#x}", address.as_ptr() as usize),
            type_name,
        );
        Ok(Self {
            cell: address.cast(),
            lifecycle: Lifecycle::new(refs),
            region: Some(Arc::clone(region)),
        })
    }

    #[track_caller]
    unsafe fn raw(address: NonNull<u8>, type_name: &'static str) -> ResourceResult<Self> {
        let align = align_of::<C>();
        if address.as_ptr() as usize % align != 0 {
            return Err(ResourceError::Misaligned {
                address: address.as_ptr() as usize,
                align,
            });
        }
        let refs = tracer::on_released(
            || {},
            || format!("{type_name}@{:#x}", address.as_ptr() as usize),
            type_name,
        );
        Ok(Self {
            cell: address.cast(),
            lifecycle: Lifecycle::new(refs),
            region: None,
        })
    }

    fn get(&self) -> ResourceResult<&C> {
        self.lifecycle.check()?;
        // Safety: the address is aligned and valid for the binding's lifetime.
        Ok(unsafe { self.cell.as_ref() })
    }

    fn address(&self) -> usize {
        self.cell.as_ptr() as usize
    }
}

impl<C> fmt::Debug for Binding<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("ref_count", &self.lifecycle.refs().ref_count())
            .field("in_region", &self.region.is_some())
            .finish()
    }
}

// ============================================================================
// Native Long
// ============================================================================

/// A [`LongValue`] stored in shared memory.
#[derive(Debug)]
pub struct NativeLongValue {
    binding: Binding<AtomicI64>,
}

impl NativeLongValue {
    /// Bytes occupied by the cell.
    pub const SIZE: usize = size_of::<AtomicI64>();

    /// Bind a cell at `offset` in `region`, reserving the region.
    #[track_caller]
    pub fn new(region: &Arc<MappedRegion>, offset: usize) -> ResourceResult<Self> {
        Ok(Self {
            binding: Binding::in_region(region, offset, type_name::<Self>())?,
        })
    }

    /// Bind a cell at a raw address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads and writes of 8 bytes for as long as
    /// the returned value exists, and must only be accessed atomically.
    #[track_caller]
    pub unsafe fn from_raw(address: NonNull<u8>) -> ResourceResult<Self> {
        Ok(Self {
            binding: unsafe { Binding::raw(address, type_name::<Self>())? },
        })
    }

    /// Address of the cell.
    pub fn address(&self) -> usize {
        self.binding.address()
    }
}

impl LongValue for NativeLongValue {
    fn get_value(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.load(Ordering::Relaxed))
    }

    fn set_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn get_volatile_value(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.load(Ordering::Acquire))
    }

    fn set_volatile_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn set_ordered_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::Release);
        Ok(())
    }

    fn add_value(&self, delta: i64) -> ResourceResult<i64> {
        let cell = self.binding.get()?;
        let value = cell.load(Ordering::Relaxed).wrapping_add(delta);
        cell.store(value, Ordering::Relaxed);
        Ok(value)
    }

    fn add_atomic_value(&self, delta: i64) -> ResourceResult<i64> {
        let cell = self.binding.get()?;
        Ok(cell.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta))
    }

    fn compare_and_swap_value(&self, expected: i64, value: i64) -> ResourceResult<bool> {
        let cell = self.binding.get()?;
        Ok(cell
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }
}

lifecycle_resource!(NativeLongValue, binding.lifecycle, owns "region" => binding.region);

// ============================================================================
// Native Two Long
// ============================================================================

/// In-memory layout of a two-word cell.
#[repr(C)]
struct TwoLongCell {
    value: AtomicI64,
    value2: AtomicI64,
    /// Odd while a `set_values` is in progress.
    sequence: AtomicU64,
}

/// A [`TwoLongValue`] stored in shared memory as `[value][value2][sequence]`.
#[derive(Debug)]
pub struct NativeTwoLongValue {
    binding: Binding<TwoLongCell>,
}

impl NativeTwoLongValue {
    /// Bytes occupied by the cell.
    pub const SIZE: usize = size_of::<TwoLongCell>();

    /// Bind a cell at `offset` in `region`, reserving the region.
    #[track_caller]
    pub fn new(region: &Arc<MappedRegion>, offset: usize) -> ResourceResult<Self> {
        Ok(Self {
            binding: Binding::in_region(region, offset, type_name::<Self>())?,
        })
    }

    /// Bind a cell at a raw address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads and writes of [`Self::SIZE`] bytes
    /// for as long as the returned value exists, and must only be accessed
    /// atomically.
    #[track_caller]
    pub unsafe fn from_raw(address: NonNull<u8>) -> ResourceResult<Self> {
        Ok(Self {
            binding: unsafe { Binding::raw(address, type_name::<Self>())? },
        })
    }

    /// Address of the cell.
    pub fn address(&self) -> usize {
        self.binding.address()
    }
}

impl LongValue for NativeTwoLongValue {
    fn get_value(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.value.load(Ordering::Relaxed))
    }

    fn set_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn get_volatile_value(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.value.load(Ordering::Acquire))
    }

    fn set_volatile_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn set_ordered_value(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value.store(value, Ordering::Release);
        Ok(())
    }

    fn add_value(&self, delta: i64) -> ResourceResult<i64> {
        let cell = &self.binding.get()?.value;
        let value = cell.load(Ordering::Relaxed).wrapping_add(delta);
        cell.store(value, Ordering::Relaxed);
        Ok(value)
    }

    fn add_atomic_value(&self, delta: i64) -> ResourceResult<i64> {
        let cell = &self.binding.get()?.value;
        Ok(cell.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta))
    }

    fn compare_and_swap_value(&self, expected: i64, value: i64) -> ResourceResult<bool> {
        let cell = &self.binding.get()?.value;
        Ok(cell
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }
}

impl TwoLongValue for NativeTwoLongValue {
    fn get_value2(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.value2.load(Ordering::Relaxed))
    }

    fn set_value2(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value2.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn get_volatile_value2(&self) -> ResourceResult<i64> {
        Ok(self.binding.get()?.value2.load(Ordering::Acquire))
    }

    fn set_volatile_value2(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value2.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn set_ordered_value2(&self, value: i64) -> ResourceResult<()> {
        self.binding.get()?.value2.store(value, Ordering::Release);
        Ok(())
    }

    fn add_value2(&self, delta: i64) -> ResourceResult<i64> {
        let cell = &self.binding.get()?.value2;
        let value = cell.load(Ordering::Relaxed).wrapping_add(delta);
        cell.store(value, Ordering::Relaxed);
        Ok(value)
    }

    fn add_atomic_value2(&self, delta: i64) -> ResourceResult<i64> {
        let cell = &self.binding.get()?.value2;
        Ok(cell.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta))
    }

    fn compare_and_swap_value2(&self, expected: i64, value: i64) -> ResourceResult<bool> {
        let cell = &self.binding.get()?.value2;
        Ok(cell
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    fn set_values(&self, value: i64, value2: i64) -> ResourceResult<()> {
        let cell = self.binding.get()?;
        let backoff = Backoff::new();
        let mut sequence = cell.sequence.load(Ordering::Relaxed);
        loop {
            if sequence & 1 == 1 {
                backoff.snooze();
                sequence = cell.sequence.load(Ordering::Relaxed);
                continue;
            }
            match cell.sequence.compare_exchange_weak(
                sequence,
                sequence.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    sequence = actual;
                    backoff.spin();
                }
            }
        }
        // Orders the odd sequence before the value stores.
        fence(Ordering::Release);
        cell.value2.store(value2, Ordering::Relaxed);
        cell.value.store(value, Ordering::Release);
        cell.sequence.store(sequence.wrapping_add(2), Ordering::Release);
        Ok(())
    }

    fn get_values(&self) -> ResourceResult<(i64, i64)> {
        let cell = self.binding.get()?;
        let backoff = Backoff::new();
        loop {
            let before = cell.sequence.load(Ordering::Acquire);
            let value = cell.value.load(Ordering::Acquire);
            let value2 = cell.value2.load(Ordering::Relaxed);
            let again = cell.value.load(Ordering::Acquire);
            let again2 = cell.value2.load(Ordering::Relaxed);
            // Orders the value loads before the second sequence load.
            fence(Ordering::Acquire);
            let after = cell.sequence.load(Ordering::Relaxed);

            if before & 1 == 0 && before == after && value == again && value2 == again2 {
                return Ok((value, value2));
            }
            backoff.snooze();
        }
    }
}

lifecycle_resource!(NativeTwoLongValue, binding.lifecycle, owns "region" => binding.region);

// ============================================================================
// Native Int
// ============================================================================

/// An [`IntValue`] stored in shared memory.
#[derive(Debug)]
pub struct NativeIntValue {
    binding: Binding<AtomicI32>,
}

impl NativeIntValue {
    /// Bytes occupied by the cell.
    pub const SIZE: usize = size_of::<AtomicI32>();

    /// Bind a cell at `offset` in `region`, reserving the region.
    #[track_caller]
    pub fn new(region: &Arc<MappedRegion>, offset: usize) -> ResourceResult<Self> {
        Ok(Self {
            binding: Binding::in_region(region, offset, type_name::<Self>())?,
        })
    }

    /// Bind a cell at a raw address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads and writes of 4 bytes for as long as
    /// the returned value exists, and must only be accessed atomically.
    #[track_caller]
    pub unsafe fn from_raw(address: NonNull<u8>) -> ResourceResult<Self> {
        Ok(Self {
            binding: unsafe { Binding::raw(address, type_name::<Self>())? },
        })
    }
}

impl IntValue for NativeIntValue {
    fn get_value(&self) -> ResourceResult<i32> {
        Ok(self.binding.get()?.load(Ordering::Relaxed))
    }

    fn set_value(&self, value: i32) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn get_volatile_value(&self) -> ResourceResult<i32> {
        Ok(self.binding.get()?.load(Ordering::Acquire))
    }

    fn set_volatile_value(&self, value: i32) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn set_ordered_value(&self, value: i32) -> ResourceResult<()> {
        self.binding.get()?.store(value, Ordering::Release);
        Ok(())
    }

    fn add_value(&self, delta: i32) -> ResourceResult<i32> {
        let cell = self.binding.get()?;
        let value = cell.load(Ordering::Relaxed).wrapping_add(delta);
        cell.store(value, Ordering::Relaxed);
        Ok(value)
    }

    fn add_atomic_value(&self, delta: i32) -> ResourceResult<i32> {
        let cell = self.binding.get()?;
        Ok(cell.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta))
    }

    fn compare_and_swap_value(&self, expected: i32, value: i32) -> ResourceResult<bool> {
        let cell = self.binding.get()?;
        Ok(cell
            .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }
}

lifecycle_resource!(NativeIntValue, binding.lifecycle, owns "region" => binding.region);

// ============================================================================
// Native Double
// ============================================================================

/// A [`DoubleValue`] stored in shared memory as IEEE-754 bits.
#[derive(Debug)]
pub struct NativeDoubleValue {
    binding: Binding<AtomicU64>,
}

impl NativeDoubleValue {
    /// Bytes occupied by the cell.
    pub const SIZE: usize = size_of::<AtomicU64>();

    /// Bind a cell at `offset` in `region`, reserving the region.
    #[track_caller]
    pub fn new(region: &Arc<MappedRegion>, offset: usize) -> ResourceResult<Self> {
        Ok(Self {
            binding: Binding::in_region(region, offset, type_name::<Self>())?,
        })
    }

    /// Bind a cell at a raw address.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads and writes of 8 bytes for as long as
    /// the returned value exists, and must only be accessed atomically.
    #[track_caller]
    pub unsafe fn from_raw(address: NonNull<u8>) -> ResourceResult<Self> {
        Ok(Self {
            binding: unsafe { Binding::raw(address, type_name::<Self>())? },
        })
    }
}

impl DoubleValue for NativeDoubleValue {
    fn get_value(&self) -> ResourceResult<f64> {
        Ok(f64::from_bits(self.binding.get()?.load(Ordering::Relaxed)))
    }

    fn set_value(&self, value: f64) -> ResourceResult<()> {
        self.binding.get()?.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn get_volatile_value(&self) -> ResourceResult<f64> {
        Ok(f64::from_bits(self.binding.get()?.load(Ordering::Acquire)))
    }

    fn set_volatile_value(&self, value: f64) -> ResourceResult<()> {
        self.binding.get()?.store(value.to_bits(), Ordering::SeqCst);
        Ok(())
    }

    fn set_ordered_value(&self, value: f64) -> ResourceResult<()> {
        self.binding.get()?.store(value.to_bits(), Ordering::Release);
        Ok(())
    }

    fn add_value(&self, delta: f64) -> ResourceResult<f64> {
        let cell = self.binding.get()?;
        let value = f64::from_bits(cell.load(Ordering::Relaxed)) + delta;
        cell.store(value.to_bits(), Ordering::Relaxed);
        Ok(value)
    }

    fn add_atomic_value(&self, delta: f64) -> ResourceResult<f64> {
        let cell = self.binding.get()?;
        let backoff = Backoff::new();
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let value = f64::from_bits(current) + delta;
            match cell.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(value),
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    fn compare_and_swap_value(&self, expected: f64, value: f64) -> ResourceResult<bool> {
        let cell = self.binding.get()?;
        Ok(cell
            .compare_exchange(
                expected.to_bits(),
                value.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }
}

lifecycle_resource!(NativeDoubleValue, binding.lifecycle, owns "region" => binding.region);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closeable::{Closeable, QueryCloseable};
    use crate::unmonitor::{Field, OwnedResources};

    fn region() -> Arc<MappedRegion> {
        MappedRegion::anonymous(4096).unwrap()
    }

    /// Heap pair relying on the provided `set_values`/`get_values`. Volatile
    /// reads of word 1 are served from `script` first to mimic a racing writer.
    #[derive(Default)]
    struct HeapPair {
        words: [AtomicI64; 2],
        script: parking_lot::Mutex<std::collections::VecDeque<i64>>,
        reads: AtomicU64,
    }

    impl LongValue for HeapPair {
        fn get_value(&self) -> ResourceResult<i64> {
            Ok(self.words[0].load(Ordering::Relaxed))
        }

        fn set_value(&self, value: i64) -> ResourceResult<()> {
            self.words[0].store(value, Ordering::Relaxed);
            Ok(())
        }

        fn get_volatile_value(&self) -> ResourceResult<i64> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            match self.script.lock().pop_front() {
                Some(value) => Ok(value),
                None => Ok(self.words[0].load(Ordering::Acquire)),
            }
        }

        fn set_volatile_value(&self, value: i64) -> ResourceResult<()> {
            self.words[0].store(value, Ordering::SeqCst);
            Ok(())
        }

        fn set_ordered_value(&self, value: i64) -> ResourceResult<()> {
            self.words[0].store(value, Ordering::Release);
            Ok(())
        }

        fn add_value(&self, delta: i64) -> ResourceResult<i64> {
            self.add_atomic_value(delta)
        }

        fn add_atomic_value(&self, delta: i64) -> ResourceResult<i64> {
            Ok(self.words[0].fetch_add(delta, Ordering::SeqCst) + delta)
        }

        fn compare_and_swap_value(&self, expected: i64, value: i64) -> ResourceResult<bool> {
            Ok(self.words[0]
                .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok())
        }
    }

    impl TwoLongValue for HeapPair {
        fn get_value2(&self) -> ResourceResult<i64> {
            Ok(self.words[1].load(Ordering::Relaxed))
        }

        fn set_value2(&self, value: i64) -> ResourceResult<()> {
            self.words[1].store(value, Ordering::Relaxed);
            Ok(())
        }

        fn get_volatile_value2(&self) -> ResourceResult<i64> {
            Ok(self.words[1].load(Ordering::Acquire))
        }

        fn set_volatile_value2(&self, value: i64) -> ResourceResult<()> {
            self.words[1].store(value, Ordering::SeqCst);
            Ok(())
        }

        fn set_ordered_value2(&self, value: i64) -> ResourceResult<()> {
            self.words[1].store(value, Ordering::Release);
            Ok(())
        }

        fn add_value2(&self, delta: i64) -> ResourceResult<i64> {
            self.add_atomic_value2(delta)
        }

        fn add_atomic_value2(&self, delta: i64) -> ResourceResult<i64> {
            Ok(self.words[1].fetch_add(delta, Ordering::SeqCst) + delta)
        }

        fn compare_and_swap_value2(&self, expected: i64, value: i64) -> ResourceResult<bool> {
            Ok(self.words[1]
                .compare_exchange(expected, value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok())
        }
    }

    #[test]
    fn test_provided_pair_protocol_round_trip() {
        let pair = HeapPair::default();
        pair.set_values(7, -7).unwrap();
        assert_eq!(pair.get_values().unwrap(), (7, -7));
        assert_eq!(pair.get_value().unwrap(), 7);
        assert_eq!(pair.get_value2().unwrap(), -7);
        assert_eq!(pair.reads.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_provided_get_values_rereads_until_stable() {
        let pair = HeapPair::default();
        pair.set_values(3, 30).unwrap();
        pair.script.lock().extend([1, 2, 2]);

        assert_eq!(pair.get_values().unwrap(), (2, 30));
        assert_eq!(pair.reads.load(Ordering::Relaxed), 3);

        pair.script.lock().extend([5, 6, 7]);
        assert_eq!(pair.get_values().unwrap(), (3, 30));
        assert_eq!(pair.reads.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_cells_expose_their_region() {
        let region = region();
        let cell = region.long_value(0).unwrap();
        let mut owned = Vec::new();
        cell.visit_owned(&mut |field| {
            if let Field::Value { name, .. } = field {
                owned.push(name);
            }
        });
        assert_eq!(owned, vec!["region"]);
    }

    #[test]
    fn test_long_value_operations() {
        let region = region();
        let value = region.long_value(0).unwrap();
        assert_eq!(value.get_value().unwrap(), 0);

        value.set_value(5).unwrap();
        assert_eq!(value.add_value(3).unwrap(), 8);
        assert_eq!(value.add_atomic_value(-10).unwrap(), -2);
        assert!(value.compare_and_swap_value(-2, 40).unwrap());
        assert!(!value.compare_and_swap_value(-2, 41).unwrap());
        value.set_volatile_value(41).unwrap();
        assert_eq!(value.get_volatile_value().unwrap(), 41);

        value.set_max_value(30).unwrap();
        assert_eq!(value.get_value().unwrap(), 41);
        value.set_max_value(50).unwrap();
        assert_eq!(value.get_value().unwrap(), 50);
        value.set_min_value(60).unwrap();
        assert_eq!(value.get_value().unwrap(), 50);
        value.set_min_value(-1).unwrap();
        assert_eq!(value.get_value().unwrap(), -1);
    }

    #[test]
    fn test_cells_share_memory() {
        let region = region();
        let a = region.long_value(8).unwrap();
        let b = region.long_value(8).unwrap();
        a.set_ordered_value(99).unwrap();
        assert_eq!(b.get_volatile_value().unwrap(), 99);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_two_long_value_operations() {
        let region = region();
        let value = region.two_long_value(64).unwrap();
        value.set_values(3, 6).unwrap();
        assert_eq!(value.get_values().unwrap(), (3, 6));
        assert_eq!(value.get_value().unwrap(), 3);
        assert_eq!(value.get_value2().unwrap(), 6);

        assert_eq!(value.add_atomic_value2(4).unwrap(), 10);
        value.set_max_value2(7).unwrap();
        assert_eq!(value.get_volatile_value2().unwrap(), 10);
        value.set_max_value2(12).unwrap();
        value.set_min_value2(11).unwrap();
        assert_eq!(value.get_volatile_value2().unwrap(), 11);
        assert!(value.compare_and_swap_value2(11, 1).unwrap());
        assert_eq!(value.get_values().unwrap(), (3, 1));
    }

    #[test]
    fn test_two_long_layout() {
        assert_eq!(NativeTwoLongValue::SIZE, 24);
        let region = region();
        let pair = region.two_long_value(0).unwrap();
        let word1 = region.long_value(0).unwrap();
        let word2 = region.long_value(8).unwrap();
        pair.set_values(1, 2).unwrap();
        assert_eq!(word1.get_volatile_value().unwrap(), 1);
        assert_eq!(word2.get_volatile_value().unwrap(), 2);
    }

    #[test]
    fn test_int_and_double_values() {
        let region = region();
        let int = region.int_value(4).unwrap();
        int.set_value(i32::MAX).unwrap();
        assert_eq!(int.add_value(1).unwrap(), i32::MIN);
        assert!(int.compare_and_swap_value(i32::MIN, 7).unwrap());
        assert_eq!(int.add_atomic_value(3).unwrap(), 10);

        let double = region.double_value(16).unwrap();
        double.set_volatile_value(1.5).unwrap();
        assert_eq!(double.add_atomic_value(2.25).unwrap(), 3.75);
        assert_eq!(double.add_value(0.25).unwrap(), 4.0);
        assert!(double.compare_and_swap_value(4.0, -1.0).unwrap());
        assert_eq!(double.get_volatile_value().unwrap(), -1.0);
    }

    #[test]
    fn test_released_cell_rejects_access() {
        let region = region();
        let value = region.two_long_value(0).unwrap();
        value.close().unwrap();
        assert!(value.is_closed());
        assert!(value.get_values().unwrap_err().is_released());
        assert!(value.set_values(1, 2).unwrap_err().is_released());
        assert!(value.set_max_value2(5).unwrap_err().is_released());
        value.close().unwrap();
    }

    #[test]
    fn test_from_raw() {
        let mut words = Box::new([0u64; 4]);
        let base = NonNull::from(&mut words[0]).cast::<u8>();

        let value = unsafe { NativeTwoLongValue::from_raw(base) }.unwrap();
        value.set_values(10, 20).unwrap();
        assert_eq!(value.get_values().unwrap(), (10, 20));

        let misaligned = unsafe { NativeLongValue::from_raw(base.add(1)) };
        assert!(matches!(misaligned, Err(ResourceError::Misaligned { align: 8, .. })));

        value.close().unwrap();
        drop(value);
        assert_eq!(words[0], 10);
        assert_eq!(words[1], 20);
        assert_eq!(words[2], 2);
    }
}
