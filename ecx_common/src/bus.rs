//! Fixed-layout bus directory structs shared across process boundaries.
//!
//! The whole directory is one `#[repr(C)]` value containing nothing but
//! numeric fields and fixed-capacity arrays - the same byte image is mapped
//! at a different virtual address in every attaching process, so an embedded
//! pointer or length-prefixed container would be meaningless there. Names are
//! NUL-padded byte arrays with accessor methods.
//!
//! All-zero bytes are a valid value of every struct here (zeroed `Default`),
//! and every size is locked by a compile-time assertion: an accidental field
//! edit fails the build instead of silently shifting offsets under running
//! consumers.

use core::fmt;

use static_assertions::const_assert_eq;

use crate::consts::{MAX_PD_NAME_LEN, MAX_PD_VARS, MAX_SLAVE_NAME_LEN, MAX_SLAVES};
use crate::state::AlState;

// ─── Name codecs ────────────────────────────────────────────────────

/// Decode a NUL-padded name field. Returns the bytes before the first NUL;
/// invalid UTF-8 (possible only if a foreign writer corrupted the field)
/// decodes as the empty string rather than panicking.
fn str_from_padded(raw: &[u8]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..end]).unwrap_or("")
}

/// Encode `name` into a NUL-padded field, truncating at a character boundary
/// so the stored bytes always decode back to valid UTF-8. The final byte is
/// always NUL.
fn write_padded(dst: &mut [u8], name: &str) {
    dst.fill(0);
    let mut n = name.len().min(dst.len().saturating_sub(1));
    while n > 0 && !name.is_char_boundary(n) {
        n -= 1;
    }
    dst[..n].copy_from_slice(&name.as_bytes()[..n]);
}

// ─── Direction ──────────────────────────────────────────────────────

/// Process-data direction, seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdDirection {
    /// Slave → master (TxPDO side).
    Input,
    /// Master → slave (RxPDO side).
    Output,
}

impl PdDirection {
    /// Lower-case label for log lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for PdDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Directory structs ──────────────────────────────────────────────

/// One named process variable: a byte window into the owning direction's
/// process-data image.
///
/// Size: 80 bytes (72-byte name + 2×u32).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PdVar {
    /// NUL-padded variable name (object-dictionary entry description).
    pub name: [u8; MAX_PD_NAME_LEN],
    /// Byte offset into the direction's process-data image. Offsets are
    /// global across the whole image, not slave-local.
    pub offset: u32,
    /// Size in whole bytes. Sub-byte fields are recorded with the floor of
    /// their bit length / 8 and are not separately addressable.
    pub size: u32,
}

impl PdVar {
    /// Build a variable entry with an encoded name.
    pub fn new(name: &str, offset: u32, size: u32) -> Self {
        let mut var = Self::default();
        var.set_name(name);
        var.offset = offset;
        var.size = size;
        var
    }

    /// Decoded variable name.
    pub fn name(&self) -> &str {
        str_from_padded(&self.name)
    }

    /// Encode (and if necessary truncate) the variable name.
    pub fn set_name(&mut self, name: &str) {
        write_padded(&mut self.name, name);
    }

    /// One past the last byte this variable covers.
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// One slave's directory entry: identity plus its ordered variable lists.
///
/// Variable order equals discovery order (declaration order in the PDO
/// mapping) and is never re-sorted.
///
/// Size: 4092 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Slave {
    /// Zero-based slave id (topology order).
    pub id: u32,
    /// NUL-padded slave name from the stack.
    pub name: [u8; MAX_SLAVE_NAME_LEN],
    /// Number of valid entries in `input_vars`.
    pub input_var_num: u32,
    /// Number of valid entries in `output_vars`.
    pub output_var_num: u32,
    /// Input (slave → master) variables, discovery order.
    pub input_vars: [PdVar; MAX_PD_VARS],
    /// Output (master → slave) variables, discovery order.
    pub output_vars: [PdVar; MAX_PD_VARS],
}

impl Slave {
    /// Decoded slave name.
    pub fn name(&self) -> &str {
        str_from_padded(&self.name)
    }

    /// Encode (and if necessary truncate) the slave name.
    pub fn set_name(&mut self, name: &str) {
        write_padded(&mut self.name, name);
    }

    /// Number of valid variables for one direction.
    pub fn var_count(&self, dir: PdDirection) -> usize {
        let n = match dir {
            PdDirection::Input => self.input_var_num,
            PdDirection::Output => self.output_var_num,
        };
        // Clamp so a corrupted count can never index past the array.
        (n as usize).min(MAX_PD_VARS)
    }

    /// Valid variables for one direction, discovery order.
    pub fn vars(&self, dir: PdDirection) -> &[PdVar] {
        let n = self.var_count(dir);
        match dir {
            PdDirection::Input => &self.input_vars[..n],
            PdDirection::Output => &self.output_vars[..n],
        }
    }

    /// Variable by per-direction index.
    pub fn var(&self, dir: PdDirection, index: usize) -> Option<&PdVar> {
        self.vars(dir).get(index)
    }

    /// First variable with an exactly matching name, in declaration order.
    pub fn find_var(&self, dir: PdDirection, name: &str) -> Option<(usize, &PdVar)> {
        self.vars(dir)
            .iter()
            .enumerate()
            .find(|(_, v)| v.name() == name)
    }

    /// Append a discovered variable. Returns `false` (entry dropped) when the
    /// direction's list is full.
    pub fn push_var(&mut self, dir: PdDirection, var: PdVar) -> bool {
        let n = self.var_count(dir);
        if n >= MAX_PD_VARS {
            return false;
        }
        match dir {
            PdDirection::Input => {
                self.input_vars[n] = var;
                self.input_var_num = (n + 1) as u32;
            }
            PdDirection::Output => {
                self.output_vars[n] = var;
                self.output_var_num = (n + 1) as u32;
            }
        }
        true
    }
}

/// Root of the shared bus directory.
///
/// The master process is the sole writer of every field except the two
/// consumer mailboxes `request_state` and `reset_cycle_stats`. Cycle times
/// are published in microseconds.
///
/// Size: 204 656 bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EcatBus {
    /// Wall-clock time of the last completed cycle, microseconds since the
    /// Unix epoch.
    pub timestamp: i64,
    /// Minimum observed cycle time [µs] since start or last reset.
    pub min_cycle_us: f64,
    /// Maximum observed cycle time [µs] since start or last reset.
    pub max_cycle_us: f64,
    /// Average cycle time [µs] since start or last reset.
    pub avg_cycle_us: f64,
    /// Duration of the last completed cycle [µs].
    pub current_cycle_us: f64,
    /// Number of valid entries in `slaves`.
    pub slave_num: u32,
    /// Current AL state of the bus (raw value; see [`AlState::from_u8`]).
    pub current_state: u8,
    /// Consumer mailbox: AL state the bus should transition to. Applied and
    /// mirrored into `next_expected_state` by the master each cycle.
    pub request_state: u8,
    /// AL state the master is currently driving the bus towards.
    pub next_expected_state: u8,
    /// Nonzero once the bus reached OP; cleared on master shutdown.
    pub is_authorized: u8,
    /// Consumer mailbox: nonzero requests a min/max/avg reset before the next
    /// published sample. Cleared by the master.
    pub reset_cycle_stats: u8,
    _pad: [u8; 7],
    /// Slave entries, topology order. Only `slaves[..slave_num]` are valid.
    pub slaves: [Slave; MAX_SLAVES],
}

impl EcatBus {
    /// Fresh directory value: zeroed, current state INIT, requested state OP.
    pub fn new() -> Self {
        let mut bus = Self::default();
        bus.current_state = AlState::Init.as_u8();
        bus.request_state = AlState::Op.as_u8();
        bus.next_expected_state = AlState::Op.as_u8();
        bus
    }

    /// Valid slave entries, topology order.
    pub fn slaves(&self) -> &[Slave] {
        // Same clamp rationale as `Slave::var_count`.
        let n = (self.slave_num as usize).min(MAX_SLAVES);
        &self.slaves[..n]
    }

    /// Slave by zero-based id.
    pub fn slave(&self, id: usize) -> Option<&Slave> {
        self.slaves().get(id)
    }

    /// Mutable slave entry by zero-based id (master side).
    pub fn slave_mut(&mut self, id: usize) -> Option<&mut Slave> {
        let n = (self.slave_num as usize).min(MAX_SLAVES);
        self.slaves[..n].get_mut(id)
    }

    /// First slave with an exactly matching name, in topology order.
    pub fn find_slave_by_name(&self, name: &str) -> Option<(usize, &Slave)> {
        self.slaves()
            .iter()
            .enumerate()
            .find(|(_, s)| s.name() == name)
    }
}

// ─── Zeroed defaults ────────────────────────────────────────────────

macro_rules! impl_default_zeroed {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    // SAFETY: All fields are numeric primitives or fixed-size
                    // arrays of numeric primitives. Zero is a valid value for
                    // every field.
                    unsafe { core::mem::zeroed() }
                }
            }
        )*
    };
}

impl_default_zeroed!(PdVar, Slave, EcatBus);

// ─── Layout locks ───────────────────────────────────────────────────

const_assert_eq!(core::mem::size_of::<PdVar>(), 80);
const_assert_eq!(core::mem::align_of::<PdVar>(), 4);
const_assert_eq!(core::mem::size_of::<Slave>(), 4092);
const_assert_eq!(core::mem::size_of::<EcatBus>(), 204_656);
const_assert_eq!(core::mem::align_of::<EcatBus>(), 8);

/// Compile-time version hash for struct compatibility detection.
///
/// Hashes `size_of::<T>()` and `align_of::<T>()`; if the layout changes, the
/// hash changes and attacher/owner builds refuse to connect. Field reordering
/// within the same size/alignment is not detected, which is acceptable for
/// `#[repr(C)]` structs with explicit padding and locked sizes.
pub const fn struct_version_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E37_79B9) ^ align.wrapping_mul(0x517C_C1B7)
}

/// Layout version of the shared directory payload, embedded in the segment
/// header by the owner and checked by every attacher.
pub const BUS_LAYOUT_VERSION: u32 = struct_version_hash::<EcatBus>();
