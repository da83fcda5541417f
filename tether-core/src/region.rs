//! # Mapped Regions
//!
//! A [`MappedRegion`] is an anonymous or file-backed memory mapping that off-heap
//! value cells are bound into. The region is reference counted: its creator
//! holds the first reference and every bound cell holds one more, so the region
//! is only released once it has been closed and every cell bound to it has been
//! released.
//!
//! Release marks the region unusable (binding new cells fails with
//! `AlreadyReleased`). The mapping itself is unmapped when the last `Arc`
//! handle is dropped, so a cell that outlives a release never touches
//! unmapped memory.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{ResourceError, ResourceResult};
use crate::lifecycle::{Lifecycle, lifecycle_resource};
use crate::tracer;
use crate::values::{NativeDoubleValue, NativeIntValue, NativeLongValue, NativeTwoLongValue};

/// What a region is mapped from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Private anonymous memory.
    Anonymous,
    /// A shared file mapping.
    File(Option<PathBuf>),
}

/// A reference-counted memory mapping.
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
    lifecycle: Lifecycle,
    map: MmapMut,
}

// Safety: the mapping is only accessed through atomic value cells, and
// `base` stays valid for as long as `map` is alive.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of zeroed anonymous memory.
    #[track_caller]
    pub fn anonymous(len: usize) -> ResourceResult<Arc<Self>> {
        let map = MmapMut::map_anon(len)?;
        Ok(Self::from_map(map, Backing::Anonymous))
    }

    /// Map the first `len` bytes of `file`, growing the file if it is shorter.
    #[track_caller]
    pub fn map_file(file: &File, len: usize) -> ResourceResult<Arc<Self>> {
        Self::map_file_at(file, len, None)
    }

    /// Open or create the file at `path` and map its first `len` bytes.
    #[track_caller]
    pub fn open(path: impl AsRef<Path>, len: usize) -> ResourceResult<Arc<Self>> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::map_file_at(&file, len, Some(path.to_path_buf()))
    }

    #[track_caller]
    fn map_file_at(file: &File, len: usize, path: Option<PathBuf>) -> ResourceResult<Arc<Self>> {
        if file.metadata()?.len() < len as u64 {
            file.set_len(len as u64)?;
        }
        // Safety: the mapping is shared; concurrent modification by other
        // processes is expected and only observed through atomics.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self::from_map(map, Backing::File(path)))
    }

    #[track_caller]
    fn from_map(mut map: MmapMut, backing: Backing) -> Arc<Self> {
        let len = map.len();
        let base = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        let label = match &backing {
            Backing::Anonymous => "anonymous".to_owned(),
            Backing::File(Some(path)) => path.display().to_string(),
            Backing::File(None) => "file".to_owned(),
        };
        let unique_id = format!("{label}@{:#x}+{len}", base.as_ptr() as usize);
        let refs = tracer::for_type::<MappedRegion, _, _>(
            move || {
                tracing::debug!(target: "tether::refcount", region = %label, len, "region released");
            },
            || unique_id,
        );
        Arc::new(Self {
            base,
            len,
            backing,
            lifecycle: Lifecycle::new(refs),
            map,
        })
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length mapping.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// What this region maps.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Flush file-backed changes to disk.
    pub fn flush(&self) -> ResourceResult<()> {
        self.lifecycle.check()?;
        self.map.flush()?;
        Ok(())
    }

    /// Address of a `size`-byte, `align`-aligned cell at `offset`.
    pub(crate) fn address_for(
        &self,
        offset: usize,
        size: usize,
        align: usize,
    ) -> ResourceResult<NonNull<u8>> {
        self.lifecycle.check()?;
        let end = offset.checked_add(size).filter(|end| *end <= self.len);
        if end.is_none() {
            return Err(ResourceError::OutOfBounds {
                offset,
                len: size,
                capacity: self.len,
            });
        }
        // Safety: offset + size is within the mapping.
        let address = unsafe { self.base.add(offset) };
        if address.as_ptr() as usize % align != 0 {
            return Err(ResourceError::Misaligned {
                address: address.as_ptr() as usize,
                align,
            });
        }
        Ok(address)
    }

    /// Bind a [`NativeLongValue`] at `offset`.
    #[track_caller]
    pub fn long_value(self: &Arc<Self>, offset: usize) -> ResourceResult<NativeLongValue> {
        NativeLongValue::new(self, offset)
    }

    /// Bind a [`NativeTwoLongValue`] at `offset`.
    #[track_caller]
    pub fn two_long_value(self: &Arc<Self>, offset: usize) -> ResourceResult<NativeTwoLongValue> {
        NativeTwoLongValue::new(self, offset)
    }

    /// Bind a [`NativeIntValue`] at `offset`.
    #[track_caller]
    pub fn int_value(self: &Arc<Self>, offset: usize) -> ResourceResult<NativeIntValue> {
        NativeIntValue::new(self, offset)
    }

    /// Bind a [`NativeDoubleValue`] at `offset`.
    #[track_caller]
    pub fn double_value(self: &Arc<Self>, offset: usize) -> ResourceResult<NativeDoubleValue> {
        NativeDoubleValue::new(self, offset)
    }
}

lifecycle_resource!(MappedRegion, lifecycle);

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("backing", &self.backing)
            .field("ref_count", &self.lifecycle.refs().ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closeable::{Closeable, QueryCloseable};
    use crate::reference::{ReferenceCounted, ReferenceOwner};
    use crate::values::LongValue;

    #[test]
    fn test_anonymous_region() {
        let region = MappedRegion::anonymous(4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.backing(), &Backing::Anonymous);
        assert_eq!(region.ref_count(), 1);
        assert_eq!(region.as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn test_bounds_and_alignment() {
        let region = MappedRegion::anonymous(64).unwrap();
        assert!(matches!(
            region.long_value(60),
            Err(ResourceError::OutOfBounds { offset: 60, .. })
        ));
        assert!(matches!(
            region.long_value(usize::MAX),
            Err(ResourceError::OutOfBounds { .. })
        ));
        assert!(matches!(region.long_value(4), Err(ResourceError::Misaligned { align: 8, .. })));
        assert!(region.long_value(56).is_ok());
    }

    #[test]
    fn test_cells_hold_region_reservations() {
        let region = MappedRegion::anonymous(64).unwrap();
        let cell = region.long_value(0).unwrap();
        assert_eq!(region.ref_count(), 2);

        region.close().unwrap();
        assert!(region.is_closing());
        assert!(!region.is_closed());
        cell.set_value(7).unwrap();

        cell.close().unwrap();
        assert!(region.is_closed());
        assert!(region.long_value(8).unwrap_err().is_released());
    }

    #[test]
    fn test_explicit_reservation() {
        let region = MappedRegion::anonymous(64).unwrap();
        let owner = ReferenceOwner::temporary("pool");
        region.reserve(owner).unwrap();
        region.close().unwrap();
        assert!(!region.is_closed());
        region.release(owner).unwrap();
        assert!(region.is_closed());
    }

    #[test]
    fn test_file_backed_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.dat");

        {
            let region = MappedRegion::open(&path, 128).unwrap();
            let cell = region.long_value(64).unwrap();
            cell.set_ordered_value(42).unwrap();
            region.flush().unwrap();
            cell.close().unwrap();
            region.close().unwrap();
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 128);
        let region = MappedRegion::open(&path, 128).unwrap();
        let cell = region.long_value(64).unwrap();
        assert_eq!(cell.get_volatile_value().unwrap(), 42);
        assert!(matches!(region.backing(), Backing::File(Some(_))));
    }
}
