//! Per-consumer tick semaphores.
//!
//! Cycle synchronization runs over a fixed set of POSIX named semaphores,
//! one per consumer slot. The owner creates every slot with one credit at
//! startup; registration claims a slot in the directory bitmap, opens its
//! semaphore and drains any stale credit, so a consumer's first wait always
//! blocks until the next completed cycle. After each cycle the owner tops
//! every slot back up to exactly one credit: a consumer that skipped some
//! ticks finds a single pending credit, never a backlog.

use std::ffi::CString;
use std::ptr::NonNull;

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::directory::BusDirectory;
use crate::error::{ShmError, ShmResult};
use crate::region::Role;
use ecx::consts::{SYNC_SLOTS, tick_semaphore_name};

/// Proof of one registered consumer slot.
///
/// Returned by [`SyncBroker::register`] and required by every wait; holding
/// the token is the only thing that ties a caller to its slot. Dropping it
/// does not free the slot — slots come back when the master recreates the
/// bus.
#[derive(Debug)]
pub struct SlotToken {
    slot: usize,
}

impl SlotToken {
    /// Slot number this token was registered for.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Owned handle to one named semaphore.
#[derive(Debug)]
struct TickSem {
    name: CString,
    handle: NonNull<libc::sem_t>,
}

// SAFETY: POSIX named semaphores are process-shared kernel objects; the
// handle may be used concurrently from any thread.
unsafe impl Send for TickSem {}
unsafe impl Sync for TickSem {}

impl TickSem {
    fn sem_name(name: &str) -> ShmResult<CString> {
        CString::new(name).map_err(|_| ShmError::Semaphore {
            name: name.to_string(),
            op: "sem_open",
            errno: Errno::EINVAL,
        })
    }

    /// Unlink any stale semaphore of this name and create it fresh with one
    /// credit.
    fn open_create(name: &str) -> ShmResult<Self> {
        let cname = Self::sem_name(name)?;
        // Stale semaphores carry credits from the previous run.
        unsafe { libc::sem_unlink(cname.as_ptr()) };
        let handle = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                1 as libc::c_uint,
            )
        };
        let handle = NonNull::new(handle)
            .filter(|p| p.as_ptr() != libc::SEM_FAILED)
            .ok_or_else(|| ShmError::Semaphore {
                name: name.to_string(),
                op: "sem_open",
                errno: Errno::last(),
            })?;
        Ok(Self {
            name: cname,
            handle,
        })
    }

    /// Open an existing semaphore; `NotReady` while the owner has not
    /// created it.
    fn open_existing(name: &str) -> ShmResult<Self> {
        let cname = Self::sem_name(name)?;
        let handle = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        let handle = NonNull::new(handle)
            .filter(|p| p.as_ptr() != libc::SEM_FAILED)
            .ok_or_else(|| match Errno::last() {
                Errno::ENOENT => ShmError::NotReady {
                    name: name.to_string(),
                },
                errno => ShmError::Semaphore {
                    name: name.to_string(),
                    op: "sem_open",
                    errno,
                },
            })?;
        Ok(Self {
            name: cname,
            handle,
        })
    }

    fn display_name(&self) -> String {
        self.name.to_string_lossy().into_owned()
    }

    fn failed(&self, op: &'static str) -> ShmError {
        ShmError::Semaphore {
            name: self.display_name(),
            op,
            errno: Errno::last(),
        }
    }

    fn wait(&self) -> ShmResult<()> {
        loop {
            // SAFETY: handle is a live semaphore for the lifetime of self.
            if unsafe { libc::sem_wait(self.handle.as_ptr()) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                _ => return Err(self.failed("sem_wait")),
            }
        }
    }

    fn try_wait(&self) -> ShmResult<bool> {
        loop {
            // SAFETY: as in `wait`.
            if unsafe { libc::sem_trywait(self.handle.as_ptr()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EAGAIN => return Ok(false),
                Errno::EINTR => continue,
                _ => return Err(self.failed("sem_trywait")),
            }
        }
    }

    fn value(&self) -> ShmResult<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: as in `wait`; `value` outlives the call.
        if unsafe { libc::sem_getvalue(self.handle.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(self.failed("sem_getvalue"))
        }
    }

    fn post(&self) -> ShmResult<()> {
        // SAFETY: as in `wait`.
        if unsafe { libc::sem_post(self.handle.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(self.failed("sem_post"))
        }
    }
}

impl Drop for TickSem {
    fn drop(&mut self) {
        // Close the handle only; the name persists until the next owner
        // startup unlinks it.
        // SAFETY: handle is live and not used after drop.
        unsafe { libc::sem_close(self.handle.as_ptr()) };
    }
}

/// The tick-distribution endpoint for one bus instance.
///
/// The owner side holds all slot semaphores and posts them after each
/// cycle; the attacher side starts empty and opens one semaphore per
/// [`register`](Self::register) call.
#[derive(Debug)]
pub struct SyncBroker {
    role: Role,
    instance: u32,
    sems: [Option<TickSem>; SYNC_SLOTS],
}

impl SyncBroker {
    /// Owner: unlink stale semaphores and create every slot fresh with one
    /// credit.
    pub fn create(instance: u32) -> ShmResult<Self> {
        let mut sems = [const { None }; SYNC_SLOTS];
        for (slot, entry) in sems.iter_mut().enumerate() {
            *entry = Some(TickSem::open_create(&tick_semaphore_name(instance, slot))?);
        }
        info!(instance, slots = SYNC_SLOTS, "created tick semaphores");
        Ok(Self {
            role: Role::Owner,
            instance,
            sems,
        })
    }

    /// Attacher: no semaphores opened until registration.
    pub fn attach(instance: u32) -> ShmResult<Self> {
        Ok(Self {
            role: Role::Attacher,
            instance,
            sems: [const { None }; SYNC_SLOTS],
        })
    }

    /// Role this broker was opened with.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Claim a consumer slot and open its semaphore.
    ///
    /// Drains the slot's stale credit so the first [`wait`](Self::wait)
    /// blocks until the next completed cycle. Fails with
    /// [`ShmError::CapacityExceeded`] once all slots are claimed; the claim
    /// is rolled back if the semaphore cannot be opened.
    pub fn register(&mut self, directory: &BusDirectory) -> ShmResult<SlotToken> {
        let slot = directory
            .claim_slot()
            .ok_or(ShmError::CapacityExceeded {
                capacity: SYNC_SLOTS,
            })?;
        let name = tick_semaphore_name(self.instance, slot);
        let sem = match TickSem::open_existing(&name).and_then(|sem| {
            while sem.try_wait()? {}
            Ok(sem)
        }) {
            Ok(sem) => sem,
            Err(e) => {
                directory.release_slot(slot);
                return Err(e);
            }
        };
        debug!(instance = self.instance, slot, "registered consumer slot");
        self.sems[slot] = Some(sem);
        Ok(SlotToken { slot })
    }

    fn slot_sem(&self, token: &SlotToken) -> ShmResult<&TickSem> {
        self.sems[token.slot].as_ref().ok_or(ShmError::NotReady {
            name: tick_semaphore_name(self.instance, token.slot),
        })
    }

    /// Block until the next cycle tick for this slot.
    pub fn wait(&self, token: &SlotToken) -> ShmResult<()> {
        self.slot_sem(token)?.wait()
    }

    /// Consume a pending tick if one is there; `Ok(false)` when none is.
    pub fn try_wait(&self, token: &SlotToken) -> ShmResult<bool> {
        self.slot_sem(token)?.try_wait()
    }

    /// Owner, once per completed cycle: top every slot that has no pending
    /// credit back up to one. Per-slot failures are logged and skipped so
    /// one broken semaphore cannot starve the others.
    pub fn signal_cycle(&self) {
        for sem in self.sems.iter().flatten() {
            match sem.value() {
                Ok(value) if value < 1 => {
                    if let Err(e) = sem.post() {
                        warn!(error = %e, "tick post failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "tick value probe failed"),
            }
        }
    }

    /// Unlink every slot semaphore of an instance, ignoring absent ones.
    pub fn unlink_all(instance: u32) {
        for slot in 0..SYNC_SLOTS {
            if let Ok(cname) = TickSem::sem_name(&tick_semaphore_name(instance, slot)) {
                // SAFETY: plain name-based unlink, no handle involved.
                unsafe { libc::sem_unlink(cname.as_ptr()) };
            }
        }
    }
}

// ─────────────────────────────── Tests ───────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_instance(tag: u32) -> u32 {
        std::process::id().wrapping_mul(64).wrapping_add(tag)
    }

    fn test_directory(tag: &str) -> (String, BusDirectory) {
        let name = format!("ecx_test_sync_{}_{}", tag, std::process::id());
        let dir = BusDirectory::open_or_create(&name, Role::Owner).unwrap();
        (name, dir)
    }

    #[test]
    fn first_wait_blocks_until_next_tick() {
        let instance = test_instance(1);
        let (dir_name, dir) = test_directory("first");
        let owner = SyncBroker::create(instance).unwrap();

        let mut client = SyncBroker::attach(instance).unwrap();
        let token = client.register(&dir).unwrap();
        // The creation credit must have been drained at registration.
        assert!(!client.try_wait(&token).unwrap());

        owner.signal_cycle();
        assert!(client.try_wait(&token).unwrap());
        assert!(!client.try_wait(&token).unwrap());

        SyncBroker::unlink_all(instance);
        BusDirectory::unlink(&dir_name).unwrap();
    }

    #[test]
    fn missed_ticks_do_not_pile_up() {
        let instance = test_instance(2);
        let (dir_name, dir) = test_directory("pileup");
        let owner = SyncBroker::create(instance).unwrap();

        let mut client = SyncBroker::attach(instance).unwrap();
        let token = client.register(&dir).unwrap();
        for _ in 0..3 {
            owner.signal_cycle();
        }
        assert!(client.try_wait(&token).unwrap());
        assert!(!client.try_wait(&token).unwrap());

        SyncBroker::unlink_all(instance);
        BusDirectory::unlink(&dir_name).unwrap();
    }

    #[test]
    fn wait_unblocks_on_signal() {
        let instance = test_instance(3);
        let (dir_name, dir) = test_directory("unblock");
        let owner = SyncBroker::create(instance).unwrap();

        let mut client = SyncBroker::attach(instance).unwrap();
        let token = client.register(&dir).unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            client.wait(&token).unwrap();
            tx.send(()).unwrap();
        });

        // No tick yet, so the waiter must still be parked.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        owner.signal_cycle();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();

        SyncBroker::unlink_all(instance);
        BusDirectory::unlink(&dir_name).unwrap();
    }

    #[test]
    fn eleventh_registration_is_rejected() {
        let instance = test_instance(4);
        let (dir_name, dir) = test_directory("capacity");
        let _owner = SyncBroker::create(instance).unwrap();

        let mut client = SyncBroker::attach(instance).unwrap();
        let mut tokens = Vec::new();
        for _ in 0..SYNC_SLOTS {
            tokens.push(client.register(&dir).unwrap());
        }
        assert!(matches!(
            client.register(&dir),
            Err(ShmError::CapacityExceeded { capacity }) if capacity == SYNC_SLOTS
        ));

        SyncBroker::unlink_all(instance);
        BusDirectory::unlink(&dir_name).unwrap();
    }

    #[test]
    fn register_without_owner_rolls_back_claim() {
        let instance = test_instance(5);
        let (dir_name, dir) = test_directory("rollback");
        SyncBroker::unlink_all(instance);

        let mut client = SyncBroker::attach(instance).unwrap();
        assert!(matches!(
            client.register(&dir),
            Err(ShmError::NotReady { .. })
        ));
        // The failed registration must have given its slot back.
        assert_eq!(dir.claim_slot(), Some(0));

        BusDirectory::unlink(&dir_name).unwrap();
    }
}
