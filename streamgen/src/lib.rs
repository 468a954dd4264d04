//! The streamgen Redis stream load generation tool.
//!
//! This library supports the `streamgen` and `streamtail` binaries found
//! elsewhere in this project. `streamgen` spams labeled messages into a single
//! Redis stream from a fixed number of workers, `streamtail` reads them back
//! through a consumer group.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod consumer;
pub mod generator;
#[cfg(test)]
pub(crate) mod memory;
pub mod message;
pub mod store;
