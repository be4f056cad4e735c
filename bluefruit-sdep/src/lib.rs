//! A `no_std` driver for the BLE coprocessor on the Bluefruit LE SPI Friend.
//!
//! The coprocessor speaks SDEP, a fixed 20-byte frame protocol, over a
//! half-duplex 4 MHz SPI link with three sideband GPIOs (chip select, an
//! IRQ line raised when response data is queued, and reset). ASCII AT
//! commands are fragmented across SDEP packets and answered by one or more
//! response frames ending in an `OK` or `ERROR` line.
//!
//! The driver is built on the blocking `embedded-hal` traits and a small
//! [`time::Clock`] millisecond source; every wait is a bounded spin with a
//! deadline, so no call blocks longer than its timeout. Up to two commands
//! may be in flight at once; the driver tracks them in a response ring and
//! abandons the head once it is two timeouts overdue, which keeps a stuck
//! coprocessor from wedging the caller.
//!
//! See the `bluefruit-hid` crate for the keyboard service built on top of
//! this driver.

#![cfg_attr(not(test), no_std)]

pub mod sdep;
pub mod time;

mod ble;
pub use ble::*;
