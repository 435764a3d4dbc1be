//! Two-way ranging for the DW3000 UWB transceiver
//!
//! This crate measures the distance between two radios by exchanging
//! timestamped frames and computing the time of flight, either single-sided
//! (two messages) or double-sided (three messages, cancels clock drift).
//!
//! The recommended entry point is the [exchange state machine], which drives a
//! [`RadioPort`] through one ranging cycle at a time. The building blocks it
//! uses are public as well:
//!
//! - [`time`]: 40-bit timestamps with wraparound-safe arithmetic
//! - [`frame`]: the POLL / RESP / FINAL wire format
//! - [`scheduler`]: delayed transmission planning
//! - [`ranging`]: the SS-TWR and DS-TWR formulas
//! - [`drift`]: clock drift estimation between two radios
//!
//! The radio itself is reached through the [`RadioPort`] trait. This crate ships
//! an implementation for the DW3000 on top of [`embedded-hal`], and (with the
//! `std` feature) a simulated radio for tests and host-side experiments.
//!
//! [exchange state machine]: exchange/index.html
//! [`embedded-hal`]: https://crates.io/crates/embedded-hal
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "async")]
use maybe_async::must_be_async as maybe_async_attr;
#[cfg(not(feature = "async"))]
use maybe_async::must_be_sync as maybe_async_attr;

#[cfg(not(feature = "async"))]
use embedded_hal as hal;
#[cfg(feature = "async")]
use embedded_hal_async as hal;

// Must come first, the macros are used by every other module.
mod fmt;

pub mod configs;
pub mod drift;
pub mod exchange;
pub mod fast_command;
pub mod frame;
pub mod ll;
pub mod port;
pub mod ranging;
pub mod scheduler;
pub mod time;

pub use crate::{
    configs::{Config, Protocol, RangingConfig, Role},
    exchange::{Error, Exchange, Outcome, State},
    frame::RangingMessage,
    port::{RadioPort, Status},
    ranging::RangingResult,
    time::{Duration, Instant},
};
