//! The shared bus directory segment.
//!
//! One segment per master instance, holding a 64-byte validated header and
//! the published [`EcatBus`] payload. The master creates and fills it after
//! discovery; any number of attachers map it to look up slaves, variables,
//! cycle statistics and the mailbox bytes. Attach fails hard when the
//! segment was published by a build with a different `EcatBus` layout.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use memmap2::{MmapMut, MmapOptions};
use static_assertions::const_assert_eq;
use tracing::{debug, info};

use crate::error::{ShmError, ShmResult};
use crate::region::{Role, segment_path};
use ecx::bus::{BUS_LAYOUT_VERSION, EcatBus, PdDirection, PdVar, Slave};
use ecx::consts::{SYNC_SLOTS, bus_segment_name};

/// Magic bytes identifying a bus-directory segment.
pub const ECX_BUS_MAGIC: [u8; 8] = *b"ECXBUS1\0";

/// Directory segment header, 64 bytes, written once by the owner.
///
/// `claimed_slots` is the only field mutated after creation: attachers claim
/// consumer slots by compare-and-swap on the bitmap, so a crashed consumer's
/// slot stays claimed until the master recreates the segment.
#[repr(C, align(64))]
pub struct DirectoryHeader {
    /// Magic bytes, [`ECX_BUS_MAGIC`].
    pub magic: [u8; 8],
    /// `struct_version_hash::<EcatBus>()` of the publishing build.
    pub layout_version: u32,
    _pad0: [u8; 4],
    /// Bitmap of claimed consumer slots (bit n = slot n).
    pub claimed_slots: AtomicU32,
    _pad1: [u8; 44],
}

const_assert_eq!(core::mem::size_of::<DirectoryHeader>(), 64);
const_assert_eq!(core::mem::align_of::<DirectoryHeader>(), 64);

impl DirectoryHeader {
    fn new() -> Self {
        Self {
            magic: ECX_BUS_MAGIC,
            layout_version: BUS_LAYOUT_VERSION,
            _pad0: [0; 4],
            claimed_slots: AtomicU32::new(0),
            _pad1: [0; 44],
        }
    }
}

/// Total byte size of the directory segment.
pub const DIRECTORY_SEGMENT_SIZE: usize =
    core::mem::size_of::<DirectoryHeader>() + core::mem::size_of::<EcatBus>();

const BUS_OFFSET: usize = core::mem::size_of::<DirectoryHeader>();

/// Mapped bus directory for one master instance.
#[derive(Debug)]
pub struct BusDirectory {
    name: String,
    role: Role,
    map: MmapMut,
}

impl BusDirectory {
    /// Create (owner) or open (attacher) the directory segment `name`.
    pub fn open_or_create(name: &str, role: Role) -> ShmResult<Self> {
        match role {
            Role::Owner => Self::create(name),
            Role::Attacher => Self::attach(name),
        }
    }

    /// Directory for master instance `instance` under the canonical name.
    pub fn for_instance(instance: u32, role: Role) -> ShmResult<Self> {
        Self::open_or_create(&bus_segment_name(instance), role)
    }

    fn create(name: &str) -> ShmResult<Self> {
        let path = segment_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(segment = name, "removed stale directory"),
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
        file.set_len(DIRECTORY_SEGMENT_SIZE as u64)?;
        // SAFETY: the file stays open for the lifetime of the mapping.
        let mut map = unsafe { MmapOptions::new().populate().map_mut(&file)? };

        // Payload first, then the header that publishes it.
        //
        // SAFETY: the mapping is DIRECTORY_SEGMENT_SIZE bytes, its base is
        // page-aligned, and both structs are repr(C) with any byte pattern
        // valid; BUS_OFFSET satisfies EcatBus's alignment.
        unsafe {
            let bus = map.as_mut_ptr().add(BUS_OFFSET) as *mut EcatBus;
            bus.write(EcatBus::new());
            let header = map.as_mut_ptr() as *mut DirectoryHeader;
            header.write(DirectoryHeader::new());
        }
        fence(Ordering::Release);
        info!(
            segment = name,
            size = DIRECTORY_SEGMENT_SIZE,
            layout = format_args!("{BUS_LAYOUT_VERSION:#010x}"),
            "created bus directory"
        );
        Ok(Self {
            name: name.to_string(),
            role: Role::Owner,
            map,
        })
    }

    fn attach(name: &str) -> ShmResult<Self> {
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
        if len != DIRECTORY_SEGMENT_SIZE {
            return Err(ShmError::InvalidSize {
                size: len,
                limit: DIRECTORY_SEGMENT_SIZE,
            });
        }
        // SAFETY: as in create; length was just validated.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        let directory = Self {
            name: name.to_string(),
            role: Role::Attacher,
            map,
        };
        let header = directory.header();
        if header.magic != ECX_BUS_MAGIC {
            return Err(ShmError::BadMagic {
                name: name.to_string(),
            });
        }
        if header.layout_version != BUS_LAYOUT_VERSION {
            return Err(ShmError::LayoutMismatch {
                expected: BUS_LAYOUT_VERSION,
                found: header.layout_version,
            });
        }
        debug!(segment = name, "attached bus directory");
        Ok(directory)
    }

    /// Remove a directory's backing file. Returns `false` if it did not
    /// exist.
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

    /// Role this handle was opened with.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The segment header.
    pub fn header(&self) -> &DirectoryHeader {
        // SAFETY: the mapping is page-aligned and at least
        // DIRECTORY_SEGMENT_SIZE bytes; header layout is locked by the
        // const asserts above.
        unsafe { &*(self.map.as_ptr() as *const DirectoryHeader) }
    }

    /// The published bus payload.
    pub fn bus(&self) -> &EcatBus {
        // SAFETY: BUS_OFFSET is within the validated mapping and satisfies
        // EcatBus's alignment; every byte pattern is a valid EcatBus.
        unsafe { &*(self.map.as_ptr().add(BUS_OFFSET) as *const EcatBus) }
    }

    /// The published bus payload, mutable.
    pub fn bus_mut(&mut self) -> &mut EcatBus {
        // SAFETY: as in `bus`, and we hold the only `&mut self`.
        unsafe { &mut *(self.map.as_mut_ptr().add(BUS_OFFSET) as *mut EcatBus) }
    }

    /// Slave by id, bounds-checked against the published count.
    pub fn slave(&self, id: usize) -> ShmResult<&Slave> {
        let bus = self.bus();
        bus.slave(id).ok_or(ShmError::SlaveNotFound {
            id,
            count: bus.slaves().len(),
        })
    }

    /// First slave with this name, if any.
    pub fn find_slave_by_name(&self, name: &str) -> Option<(usize, &Slave)> {
        self.bus().find_slave_by_name(name)
    }

    /// Variable by name within one direction of a slave.
    pub fn find_var(
        &self,
        slave: usize,
        dir: PdDirection,
        name: &str,
    ) -> ShmResult<(usize, &PdVar)> {
        self.slave(slave)?
            .find_var(dir, name)
            .ok_or_else(|| ShmError::VarNotFound {
                slave,
                dir,
                name: name.to_string(),
            })
    }

    /// Claim the lowest free consumer slot, or `None` when all are taken.
    pub(crate) fn claim_slot(&self) -> Option<usize> {
        let slots = &self.header().claimed_slots;
        let mut current = slots.load(Ordering::Acquire);
        loop {
            let free = (0..SYNC_SLOTS).find(|&bit| current & (1 << bit) == 0)?;
            match slots.compare_exchange(
                current,
                current | (1 << free),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(free),
                Err(actual) => current = actual,
            }
        }
    }

    /// Give a claimed slot back (registration rollback).
    pub(crate) fn release_slot(&self, slot: usize) {
        self.header()
            .claimed_slots
            .fetch_and(!(1u32 << slot), Ordering::AcqRel);
    }
}

// ─────────────────────────────── Tests ───────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ecx::state::AlState;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn test_name(tag: &str) -> String {
        format!("ecx_test_dir_{}_{}", tag, std::process::id())
    }

    #[test]
    fn owner_creates_attacher_validates() {
        let name = test_name("roundtrip");
        let mut owner = BusDirectory::open_or_create(&name, Role::Owner).unwrap();
        assert_eq!(owner.role(), Role::Owner);
        owner.bus_mut().slave_num = 2;
        owner.bus_mut().slave_mut(0).unwrap().set_name("drive_left");

        let attacher = BusDirectory::open_or_create(&name, Role::Attacher).unwrap();
        assert_eq!(attacher.bus().slave_num, 2);
        assert_eq!(attacher.slave(0).unwrap().name(), "drive_left");
        assert_eq!(attacher.bus().current_state, AlState::Init.as_u8());
        assert!(matches!(
            attacher.slave(2),
            Err(ShmError::SlaveNotFound { id: 2, count: 2 })
        ));

        BusDirectory::unlink(&name).unwrap();
    }

    #[test]
    fn attach_missing_is_not_ready() {
        assert!(matches!(
            BusDirectory::open_or_create(&test_name("missing"), Role::Attacher),
            Err(ShmError::NotReady { .. })
        ));
    }

    #[test]
    fn attach_rejects_wrong_size() {
        let name = test_name("short");
        std::fs::write(segment_path(&name), [0u8; 128]).unwrap();
        assert!(matches!(
            BusDirectory::open_or_create(&name, Role::Attacher),
            Err(ShmError::InvalidSize { size: 128, .. })
        ));
        BusDirectory::unlink(&name).unwrap();
    }

    #[test]
    fn attach_rejects_bad_magic() {
        let name = test_name("magic");
        std::fs::write(segment_path(&name), vec![0u8; DIRECTORY_SEGMENT_SIZE]).unwrap();
        assert!(matches!(
            BusDirectory::open_or_create(&name, Role::Attacher),
            Err(ShmError::BadMagic { .. })
        ));
        BusDirectory::unlink(&name).unwrap();
    }

    #[test]
    fn attach_rejects_layout_mismatch() {
        let name = test_name("layout");
        let _owner = BusDirectory::open_or_create(&name, Role::Owner).unwrap();

        // Flip one bit of the stored layout version.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(segment_path(&name))
            .unwrap();
        file.seek(SeekFrom::Start(8)).unwrap();
        let mut version = [0u8; 4];
        file.read_exact(&mut version).unwrap();
        version[0] ^= 0x01;
        file.seek(SeekFrom::Start(8)).unwrap();
        file.write_all(&version).unwrap();

        assert!(matches!(
            BusDirectory::open_or_create(&name, Role::Attacher),
            Err(ShmError::LayoutMismatch { .. })
        ));
        BusDirectory::unlink(&name).unwrap();
    }

    #[test]
    fn owner_recreate_clears_claims_and_payload() {
        let name = test_name("recreate");
        {
            let mut owner = BusDirectory::open_or_create(&name, Role::Owner).unwrap();
            owner.bus_mut().slave_num = 5;
            assert_eq!(owner.claim_slot(), Some(0));
        }
        let owner = BusDirectory::open_or_create(&name, Role::Owner).unwrap();
        assert_eq!(owner.bus().slave_num, 0);
        assert_eq!(owner.header().claimed_slots.load(Ordering::Acquire), 0);
        BusDirectory::unlink(&name).unwrap();
    }

    #[test]
    fn slot_bitmap_exhausts_and_releases() {
        let name = test_name("slots");
        let owner = BusDirectory::open_or_create(&name, Role::Owner).unwrap();
        for expected in 0..SYNC_SLOTS {
            assert_eq!(owner.claim_slot(), Some(expected));
        }
        assert_eq!(owner.claim_slot(), None);
        owner.release_slot(3);
        assert_eq!(owner.claim_slot(), Some(3));
        BusDirectory::unlink(&name).unwrap();
    }
}
