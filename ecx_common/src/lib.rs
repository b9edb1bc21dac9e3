//! ECX Common Library
//!
//! Shared constants and the fixed-layout bus data model for all ECX
//! workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Capacities, image ceiling, segment/semaphore name templates
//! - [`state`] - EtherCAT application-layer state values
//! - [`bus`] - Bus directory structs shared across process boundaries
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with an alias for shorter imports:
//! ```toml
//! [dependencies]
//! ecx = { package = "ecx_common", path = "../ecx_common" }
//! ```
//!
//! Then import:
//! ```rust,ignore
//! use ecx::bus::EcatBus;
//! use ecx::consts::*;
//! ```

pub mod bus;
pub mod consts;
pub mod state;
