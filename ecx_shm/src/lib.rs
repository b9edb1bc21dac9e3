//! # ECX Shared Bus Publication
//!
//! The shared-memory face of the ECX EtherCAT master. The master publishes
//! the discovered bus topology, both process-data images and its cycle
//! statistics into named segments under `/dev/shm`; any number of consumer
//! processes attach, look up variables by name and exchange process data in
//! lockstep with the fieldbus cycle.
//!
//! ## Features
//!
//! - **Single Owner, Many Attachers**: the master creates and tears down,
//!   consumers only open what exists
//! - **Validated Attach**: magic bytes plus a compile-time layout hash
//!   reject segments from incompatible builds before any field is touched
//! - **Typed Process Values**: a sealed set of little-endian POD types,
//!   size-checked against the discovered variable layout on every access
//! - **Cycle Ticks Without Backlog**: per-consumer semaphores hold at most
//!   one pending credit, so a slow consumer never replays missed cycles
//! - **No Sentinels**: every fallible operation returns `Result`
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────┐     ┌──────────────┐
//! │  ECX Master  │     │ /dev/shm              │     │  Consumer 1  │
//! │              │     │                       │     │              │
//! │ discovery    ├────►│ ecx_bus_0  (topology) ├────►│  BusClient   │
//! │ cyclic loop  ├────►│ ecx_pdi_0  (inputs)   ├────►│              │
//! │              │◄────┤ ecx_pdo_0  (outputs)  │◄────┤              │
//! └──────┬───────┘     └───────────────────────┘     └──────▲───────┘
//!        │                                                  │
//!        │             /ecx_tick_0_<slot>                   │
//!        └────────────► one semaphore per ─────────────────-┘
//!                       consumer slot
//! ```
//!
//! ## Consumer Usage
//!
//! ```rust,no_run
//! use ecx_shm::BusClient;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut bus = BusClient::attach(0)?;
//! let token = bus.register()?;
//!
//! loop {
//!     bus.wait_cycle(&token)?;
//!     let status: u16 = bus.input_by_name(0, "Statusword")?;
//!     bus.set_output_by_name(0, "Controlword", 0x000Fu16)?;
//!     # let _ = status; break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ShmError>` with the failing resource in
//! the error:
//!
//! ```rust,no_run
//! use ecx_shm::{BusClient, ShmError};
//!
//! match BusClient::attach(0) {
//!     Ok(bus) => { /* use bus */ }
//!     Err(ShmError::NotReady { name }) => {
//!         eprintln!("'{name}' missing - is the master running?");
//!     }
//!     Err(e) => eprintln!("attach failed: {e}"),
//! }
//! ```
//!
//! ## Thread Safety
//!
//! - **BusClient**: reads are fine from one thread at a time; writes need
//!   `&mut self` - wrap in a mutex to share
//! - **SyncBroker**: waits may run concurrently on different tokens
//! - **Directory mailbox bytes**: single-byte flags, last writer wins
//!
//! ## Persistence
//!
//! Segments and semaphores deliberately outlive the master so late tools
//! can still inspect the last published state. The next master startup
//! removes and recreates everything it owns.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod directory;
pub mod error;
pub mod region;
pub mod sync;

pub use access::{BusClient, CycleTimes, PdValue, read_value, resolve_var, write_value};
pub use directory::{BusDirectory, DIRECTORY_SEGMENT_SIZE, DirectoryHeader, ECX_BUS_MAGIC};
pub use error::{ShmError, ShmResult};
pub use region::{ProcessDataRegion, Role};
pub use sync::{SlotToken, SyncBroker};
