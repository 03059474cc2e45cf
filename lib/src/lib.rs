//! # Lab device provisioning
//!
//! This crate flashes a caller-supplied OS image onto a physical test
//! device through its control host, seeds a login for the test account,
//! boots the device into the new image and verifies it came up. It also
//! implements the recovery path that forces a device back into its
//! control image so the next job starts from a known state.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod bootmode;
pub mod budget;
pub mod cli;
pub mod config;
mod error;
pub mod flash;
pub mod image;
pub mod imageserver;
pub mod inspect;
pub mod maas;
pub(crate) mod mount;
pub mod provision;
pub mod recovery;
pub mod remote;
pub mod seed;
pub mod task;
pub mod verify;

#[cfg(test)]
mod fixture;

pub use error::{Error, Result, PROVISIONING_EXIT_CODE, RECOVERY_EXIT_CODE};
