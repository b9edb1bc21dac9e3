//! Fieldbus stack abstraction.
//!
//! Everything the master needs from an EtherCAT stack is collected in the
//! [`MasterStack`] trait: bus enumeration, process-data mapping, mailbox
//! (SDO) transfers, EEPROM access, state control and the cyclic exchange. The
//! discovery engine and the orchestrator are written against this trait
//! only, so the simulated backend in [`crate::sim`] exercises the exact
//! same code paths a hardware stack would.
//!
//! Slave positions are 1-based; position 0 addresses the whole bus (state
//! requests) or the whole process image (image accessors), matching the
//! addressing convention of common EtherCAT stacks.

use std::time::Duration;

use thiserror::Error;

// ─── Protocol constants ─────────────────────────────────────────────

/// CoE object: sync-manager communication types (subindex `iSM + 1` holds
/// the type of sync manager `iSM`).
pub const SM_COMM_TYPE: u16 = 0x1C00;
/// CoE object: PDO assignment for the output sync manager (RxPDO).
pub const PDO_ASSIGN_OUTPUTS: u16 = 0x1C12;
/// CoE object: PDO assignment for the input sync manager (TxPDO).
pub const PDO_ASSIGN_INPUTS: u16 = 0x1C13;

/// SII/EEPROM category holding the TxPDO (input) section.
pub const SII_CAT_TXPDO: u16 = 50;
/// SII/EEPROM category holding the RxPDO (output) section.
pub const SII_CAT_RXPDO: u16 = 51;

/// Sync-manager comm type carrying outputs (master to slave).
pub const SM_TYPE_OUTPUTS: u8 = 3;
/// Sync-manager comm type carrying inputs (slave to master).
pub const SM_TYPE_INPUTS: u8 = 4;

/// Highest sync-manager count a slave can report.
pub const MAX_SM: usize = 8;

// ─── Timeouts ───────────────────────────────────────────────────────

/// Cyclic frame return timeout.
pub const RETURN_TIMEOUT: Duration = Duration::from_micros(2_000);
/// Mailbox (SDO) request timeout.
pub const SDO_TIMEOUT: Duration = Duration::from_micros(700_000);
/// Full state-transition timeout.
pub const STATE_TIMEOUT: Duration = Duration::from_micros(2_000_000);
/// Short per-attempt timeout for state rechecks inside a retry loop.
pub const STATE_RECHECK_TIMEOUT: Duration = Duration::from_millis(50);

// ─── Errors ─────────────────────────────────────────────────────────

/// Fatal fieldbus errors; everything recoverable is reported through
/// working counters and the stack's error list instead.
#[derive(Error, Debug)]
pub enum StackError {
    /// The network interface could not be opened.
    #[error("network interface '{ifname}' could not be opened")]
    InterfaceOpen {
        /// Interface name as configured.
        ifname: String,
    },

    /// Bus enumeration found no slaves.
    #[error("no slaves found on the bus")]
    NoSlaves,

    /// Process-data mapping failed.
    #[error("process-data mapping failed: {detail}")]
    Mapping {
        /// Stack-specific detail.
        detail: String,
    },
}

// ─── Stack trait ────────────────────────────────────────────────────

/// The fieldbus operations the master is built on.
pub trait MasterStack {
    /// Bind the stack to a network interface.
    fn init(&mut self, ifname: &str) -> Result<(), StackError>;

    /// Enumerate the bus; returns the number of slaves found and leaves
    /// them in PRE-OP.
    fn config_init(&mut self) -> Result<usize, StackError>;

    /// Build the process-data image and bring the slaves to SAFE-OP.
    /// Returns the total mapped image size in bytes.
    fn config_map(&mut self) -> Result<usize, StackError>;

    /// Number of slaves found by [`config_init`](Self::config_init).
    fn slave_count(&self) -> usize;

    /// Identity name of a slave, from its EEPROM.
    fn slave_name(&self, slave: u16) -> &str;

    /// Mapped (input, output) byte sizes of one slave.
    fn slave_io_bytes(&self, slave: u16) -> (usize, usize);

    /// `true` if the slave's mailbox supports CoE.
    fn has_coe(&self, slave: u16) -> bool;

    /// Work counter a fully successful cycle returns: outputs counted
    /// twice, inputs once.
    fn expected_wkc(&self) -> i32;

    /// Request an application-layer state (slave 0 = whole bus). Returns
    /// without waiting; pair with [`check_state`](Self::check_state).
    fn request_state(&mut self, slave: u16, state: u8);

    /// Wait up to `timeout` for a state to be reached; returns the state
    /// actually observed.
    fn check_state(&mut self, slave: u16, state: u8, timeout: Duration) -> u8;

    /// Lowest application-layer state currently on the bus.
    fn read_state(&mut self) -> u8;

    /// CoE SDO upload into `buf`. Returns the work counter (0 on failure)
    /// and the number of bytes written.
    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> (i32, usize);

    /// CoE SDO download of `bytes` into one object-dictionary entry.
    /// Returns the work counter (0 on failure).
    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub: u8,
        bytes: &[u8],
        timeout: Duration,
    ) -> i32;

    /// Object-dictionary entry name, if the slave can provide one.
    fn od_entry_name(&mut self, slave: u16, index: u16, sub: u8) -> Option<String>;

    /// Find an EEPROM category; returns the byte address of its length
    /// word.
    fn sii_find(&mut self, slave: u16, category: u16) -> Option<u16>;

    /// One EEPROM byte.
    fn sii_byte(&mut self, slave: u16, addr: u16) -> Option<u8>;

    /// A string from the EEPROM strings section, 1-based; index 0 means
    /// "no string".
    fn sii_string(&mut self, slave: u16, index: u8) -> Option<String>;

    /// One cyclic exchange: send outputs, then wait up to `timeout` for
    /// the frame to return with the inputs. Returns the work counter of
    /// the round trip.
    fn exchange(&mut self, timeout: Duration) -> i32;

    /// Input bytes of one slave (slave 0 = the whole input image).
    fn input_image(&self, slave: u16) -> &[u8];

    /// Output bytes of one slave (slave 0 = the whole output image).
    fn output_image(&self, slave: u16) -> &[u8];

    /// Mutable output bytes (slave 0 = the whole output image).
    fn output_image_mut(&mut self, slave: u16) -> &mut [u8];

    /// Pop the next queued stack error message, oldest first.
    fn next_error(&mut self) -> Option<String>;

    /// Release the interface and leave the bus in INIT.
    fn close(&mut self);
}
