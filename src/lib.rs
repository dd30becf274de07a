#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate provides a library for talking to JBD (Jiabaida) BMS (Battery Management System)
//! devices over their UART / RS-485 port.
//!
//! The device answers four commands: read the status block, read the cell voltages, read the
//! hardware id and switch the charge and discharge MOSFETs. Frames start with `0xDD`, end with
//! `0x77` and carry a 16 bit additive checksum.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jbdbms` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables a client on top of the `serialport` crate.
//!   Without it, implement [`engine::Transport`] for any blocking byte stream.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `jbdbms` binary executable.

/// Client with the operations of the device.
mod bms;
/// Transaction handling, pacing and the transport abstraction.
pub mod engine;
/// Contains error types for the library.
mod error;
/// Defines the communication protocol for JBD BMS.
pub mod protocol;

pub use bms::JbdBms;
pub use error::{Error, ErrorKind};

/// Synchronous client on a local serial port.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
