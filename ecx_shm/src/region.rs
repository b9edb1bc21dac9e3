//! Raw process-data image regions.
//!
//! A region is a plain byte window over one direction of the process-data
//! image, backed by a file under `/dev/shm`. The master creates one region
//! per direction and copies the fieldbus image into (and out of) it every
//! cycle; attachers read and write through offset-checked accessors. The
//! region itself knows nothing about slaves or variables — the layout lives
//! in the bus directory.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::error::{ShmError, ShmResult};
use ecx::consts::PD_IMAGE_MAX_SIZE;

/// Directory where named segments live.
const SHM_DIR: &str = "/dev/shm";

/// Filesystem path of a named segment.
pub(crate) fn segment_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

/// Role split shared by every resource in this crate: the owner clears
/// leftovers and creates fresh, an attacher only opens what already exists
/// and never destroys anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates, initializes and later tears down the resource.
    Owner,
    /// Opens an existing resource read/write; fails if it is absent.
    Attacher,
}

/// One direction of the process-data image.
///
/// The mapping is at least one byte long even for an empty image, because
/// zero-length mappings are rejected by the kernel; `len` is the logical
/// size and every accessor checks against it.
#[derive(Debug)]
pub struct ProcessDataRegion {
    name: String,
    len: usize,
    map: MmapMut,
}

impl ProcessDataRegion {
    /// Create a fresh region of `size` bytes, replacing any leftover segment
    /// of the same name from an earlier run.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        if size > PD_IMAGE_MAX_SIZE {
            return Err(ShmError::InvalidSize {
                size,
                limit: PD_IMAGE_MAX_SIZE,
            });
        }
        let path = segment_path(name);
        // A leftover segment describes the previous run's topology.
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(segment = name, "removed stale segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let file = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(0o666)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ShmError::AlreadyExists {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.set_len(size as u64)?;
        // SAFETY: the file stays open for the lifetime of the mapping and is
        // never truncated afterwards.
        let map = unsafe {
            MmapOptions::new()
                .len(size.max(1))
                .populate()
                .map_mut(&file)?
        };
        info!(segment = name, size, "created process-data region");
        Ok(Self {
            name: name.to_string(),
            len: size,
            map,
        })
    }

    /// Open a region created by the master. Fails with [`ShmError::NotReady`]
    /// while the master has not published it yet.
    pub fn open(name: &str) -> ShmResult<Self> {
        let path = segment_path(name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShmError::NotReady {
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len() as usize;
        if len > PD_IMAGE_MAX_SIZE {
            return Err(ShmError::InvalidSize {
                size: len,
                limit: PD_IMAGE_MAX_SIZE,
            });
        }
        // SAFETY: as above; the mapping length is pinned to one byte minimum
        // and all byte access goes through the logical-length checks.
        let map = unsafe { MmapOptions::new().len(len.max(1)).map_mut(&file)? };
        debug!(segment = name, len, "attached process-data region");
        Ok(Self {
            name: name.to_string(),
            len,
            map,
        })
    }

    /// Remove a region's backing file. Returns `false` if it did not exist.
    pub fn unlink(name: &str) -> ShmResult<bool> {
        match std::fs::remove_file(segment_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` for a zero-size image (a bus with no variables in this
    /// direction).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> ShmResult<()> {
        let end = offset.checked_add(len).ok_or(ShmError::OutOfBounds {
            offset,
            len,
            region: self.len,
        })?;
        if end > self.len {
            return Err(ShmError::OutOfBounds {
                offset,
                len,
                region: self.len,
            });
        }
        Ok(())
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> ShmResult<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.map[offset..offset + len])
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> ShmResult<()> {
        self.check(offset, bytes.len())?;
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    pub fn view_mut(&mut self, offset: usize, len: usize) -> ShmResult<&mut [u8]> {
        self.check(offset, len)?;
        Ok(&mut self.map[offset..offset + len])
    }

    /// The whole image.
    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }

    /// The whole image, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..self.len]
    }
}

// ─────────────────────────────── Tests ───────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("ecx_test_region_{}_{}", tag, std::process::id())
    }

    #[test]
    fn create_write_open_read() {
        let name = test_name("roundtrip");
        let mut owner = ProcessDataRegion::create(&name, 64).unwrap();
        owner.write_at(10, &[0xAA, 0xBB, 0xCC]).unwrap();

        let attacher = ProcessDataRegion::open(&name).unwrap();
        assert_eq!(attacher.len(), 64);
        assert_eq!(attacher.read_at(10, 3).unwrap(), &[0xAA, 0xBB, 0xCC]);

        ProcessDataRegion::unlink(&name).unwrap();
    }

    #[test]
    fn create_replaces_stale_segment() {
        let name = test_name("stale");
        {
            let mut old = ProcessDataRegion::create(&name, 8).unwrap();
            old.write_at(0, &[1; 8]).unwrap();
        }
        let fresh = ProcessDataRegion::create(&name, 8).unwrap();
        assert_eq!(fresh.read_at(0, 8).unwrap(), &[0; 8]);
        ProcessDataRegion::unlink(&name).unwrap();
    }

    #[test]
    fn bounds_are_enforced() {
        let name = test_name("bounds");
        let mut region = ProcessDataRegion::create(&name, 16).unwrap();

        assert!(matches!(
            region.read_at(15, 2),
            Err(ShmError::OutOfBounds { offset: 15, len: 2, region: 16 })
        ));
        assert!(matches!(
            region.write_at(16, &[0]),
            Err(ShmError::OutOfBounds { .. })
        ));
        // Offset arithmetic must not wrap.
        assert!(matches!(
            region.read_at(usize::MAX, 2),
            Err(ShmError::OutOfBounds { .. })
        ));
        ProcessDataRegion::unlink(&name).unwrap();
    }

    #[test]
    fn zero_size_region_rejects_every_access() {
        let name = test_name("empty");
        let mut owner = ProcessDataRegion::create(&name, 0).unwrap();
        assert!(owner.is_empty());
        assert!(matches!(
            owner.read_at(0, 1),
            Err(ShmError::OutOfBounds { .. })
        ));
        assert!(matches!(
            owner.write_at(0, &[0]),
            Err(ShmError::OutOfBounds { .. })
        ));

        let attacher = ProcessDataRegion::open(&name).unwrap();
        assert!(attacher.is_empty());
        assert!(matches!(
            attacher.read_at(0, 1),
            Err(ShmError::OutOfBounds { .. })
        ));
        ProcessDataRegion::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_is_not_ready() {
        assert!(matches!(
            ProcessDataRegion::open(&test_name("missing")),
            Err(ShmError::NotReady { .. })
        ));
    }

    #[test]
    fn oversize_create_is_rejected() {
        assert!(matches!(
            ProcessDataRegion::create(&test_name("huge"), PD_IMAGE_MAX_SIZE + 1),
            Err(ShmError::InvalidSize { .. })
        ));
    }
}
