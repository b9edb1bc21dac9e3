//! # ECX Master Library
//!
//! EtherCAT master daemon with a shared-memory publication layer. Brings
//! the bus from INIT to OP, discovers every slave's named process
//! variables over CoE (with an EEPROM fallback), and runs the cyclic
//! exchange, mirroring both process images into `/dev/shm` segments that
//! any process on the host can map through `ecx_shm`.
//!
//! ## Crate layout
//!
//! - [`stack`] — the [`MasterStack`](stack::MasterStack) trait the rest
//!   of the crate is written against, plus protocol constants and
//!   timeouts.
//! - [`sim`] — in-memory stack implementation for development and tests.
//! - [`discovery`] — PDO walker publishing named variables.
//! - [`cycle`] — bring-up, the cyclic loop, RT setup.
//! - [`config`] — TOML configuration with validation.
//!
//! ## Zero-allocation cyclic loop
//!
//! Everything the cycle touches is pre-allocated at bring-up: the process
//! images live in the stack, the shared regions are mapped once, and the
//! per-cycle statistics are plain counters. The loop performs no heap
//! allocation.

#![deny(clippy::disallowed_types)]

pub mod config;
pub mod cycle;
pub mod discovery;
pub mod sim;
pub mod stack;
