//! Error types for resource lifecycle operations.
//!
//! Errors that indicate a caller bug (`AlreadyReleased`, `DoubleRelease`,
//! `NotReserved`) are returned synchronously from the failing call. Leak
//! detection, partial unmonitor walks and batch-close failures never surface
//! here; they are logged and reported through their own report types.

use std::io;

use thiserror::Error;

use crate::reference::ReferenceOwner;

/// Result alias used throughout the crate.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors raised by reference-counted and closeable resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource's reference count is already zero.
    #[error("{type_name} released")]
    AlreadyReleased {
        /// Type of the released resource.
        type_name: &'static str,
    },

    /// `release` was called on a resource whose count had already reached zero.
    #[error("{type_name} released more often than reserved (by {owner})")]
    DoubleRelease {
        /// Type of the resource.
        type_name: &'static str,
        /// Owner that attempted the extra release.
        owner: ReferenceOwner,
    },

    /// The releasing owner holds no reservation (tracing resources only).
    #[error("{owner} holds no reservation on {type_name}")]
    NotReserved {
        /// Type of the resource.
        type_name: &'static str,
        /// Owner that attempted the release.
        owner: ReferenceOwner,
    },

    /// The resource still has outstanding references.
    #[error("{type_name} not released, {count} references outstanding")]
    NotReleased {
        /// Type of the resource.
        type_name: &'static str,
        /// Outstanding reference count.
        count: u64,
    },

    /// `release_last` was called while other references were still held.
    #[error("{type_name} has {count} references, release_last requires exactly one")]
    NotLastReference {
        /// Type of the resource.
        type_name: &'static str,
        /// Reference count at the time of the call.
        count: u64,
    },

    /// Operation on a closed resource.
    #[error("{type_name} closed")]
    Closed {
        /// Type of the closed resource.
        type_name: &'static str,
    },

    /// Registry-wide strict teardown found resources that were never released.
    #[error("{count} resources not released: {summary}")]
    Outstanding {
        /// Number of unreleased resources.
        count: usize,
        /// One line per resource.
        summary: String,
    },

    /// A value cell would extend past the end of its region.
    #[error("offset {offset} + {len} exceeds region capacity {capacity}")]
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Bytes required at that offset.
        len: usize,
        /// Region capacity.
        capacity: usize,
    },

    /// A value cell address does not satisfy the cell's alignment.
    #[error("address {address:#x} is not aligned to {align} bytes")]
    Misaligned {
        /// Offending address.
        address: usize,
        /// Required alignment.
        align: usize,
    },

    /// Mapping or file error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ResourceError {
    /// True for errors caused by using a resource after it was released or closed.
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            ResourceError::AlreadyReleased { .. } | ResourceError::Closed { .. }
        )
    }
}
