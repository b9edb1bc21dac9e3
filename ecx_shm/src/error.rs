//! Error types for the shared bus resources.

use ecx::bus::PdDirection;
use nix::errno::Errno;
use thiserror::Error;

/// Errors returned by the segment, directory, broker and accessor layers.
#[derive(Error, Debug)]
pub enum ShmError {
    /// A segment with this name already exists and could not be replaced.
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name.
        name: String,
    },

    /// An attacher asked for a resource the owner has not created yet.
    #[error("Shared resource not ready: {name} (master not started?)")]
    NotReady {
        /// Resource name (segment or semaphore).
        name: String,
    },

    /// A segment has an unexpected byte size.
    #[error("Invalid segment size: {size} bytes (limit {limit})")]
    InvalidSize {
        /// Actual or requested size in bytes.
        size: usize,
        /// Exact size (directory) or ceiling (process-data image).
        limit: usize,
    },

    /// The segment does not start with the bus-directory magic.
    #[error("Segment {name} is not a bus directory (bad magic)")]
    BadMagic {
        /// Segment name.
        name: String,
    },

    /// The segment was published by a build with a different directory layout.
    #[error("Directory layout mismatch: segment {found:#010x}, this build {expected:#010x}")]
    LayoutMismatch {
        /// Layout version compiled into this build.
        expected: u32,
        /// Layout version found in the segment header.
        found: u32,
    },

    /// A byte access fell outside the region.
    #[error("Access out of bounds: offset {offset} + len {len} exceeds region of {region} bytes")]
    OutOfBounds {
        /// Requested start offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Region length.
        region: usize,
    },

    /// The caller's value type does not match the discovered variable size.
    #[error("Size mismatch: variable is {var} bytes, caller asked for {requested}")]
    SizeMismatch {
        /// Discovered variable size in bytes.
        var: usize,
        /// Size of the caller's value type in bytes.
        requested: usize,
    },

    /// No slave with this id on the published bus.
    #[error("Slave {id} not found ({count} slaves on the bus)")]
    SlaveNotFound {
        /// Requested slave id.
        id: usize,
        /// Number of slaves actually published.
        count: usize,
    },

    /// No variable with this name in the given direction of the slave.
    #[error("No {dir} variable named '{name}' on slave {slave}")]
    VarNotFound {
        /// Slave id.
        slave: usize,
        /// Direction that was searched.
        dir: PdDirection,
        /// Requested variable name.
        name: String,
    },

    /// A per-direction variable index past the end of the slave's table.
    #[error("{dir} variable index {index} out of range on slave {slave} ({count} variables)")]
    VarIndexOutOfRange {
        /// Slave id.
        slave: usize,
        /// Direction that was indexed.
        dir: PdDirection,
        /// Requested index.
        index: usize,
        /// Number of variables in that direction.
        count: usize,
    },

    /// Every consumer slot is already registered.
    #[error("All {capacity} consumer slots are registered")]
    CapacityExceeded {
        /// Total number of consumer slots.
        capacity: usize,
    },

    /// A semaphore call failed.
    #[error("Semaphore {name}: {op} failed: {errno}")]
    Semaphore {
        /// Semaphore name.
        name: String,
        /// The libc call that failed.
        op: &'static str,
        /// OS error.
        errno: Errno,
    },

    /// An underlying filesystem or mapping call failed.
    #[error("IO error: {source}")]
    Io {
        /// OS error.
        #[from]
        source: std::io::Error,
    },
}

/// Shorthand result for this crate.
pub type ShmResult<T> = Result<T, ShmError>;
