//! Core types shared by the Keystone crates.
//!
//! - [`Error`] and [`Result`]: configuration, parsing and I/O failures
//! - [`load`]: typed loading of TOML, YAML and JSON documents

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod load;

pub use error::{Error, Result};
