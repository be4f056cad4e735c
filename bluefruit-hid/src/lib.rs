//! A `no_std` BLE HID keyboard service for the Bluefruit LE SPI Friend.
//!
//! Sits on top of the `bluefruit-sdep` transport and turns queued HID
//! reports (key, consumer-control, and mouse) into the coprocessor's AT
//! command dialect. The receive latency of the coprocessor is high relative
//! to a key-scan loop, so reports are parked in a bounded FIFO and a
//! periodic [`BleKeyboard::task`] pump forwards at most one report per
//! invocation, never sending while a previous command still awaits its
//! reply. The same pump keeps the connection state fresh (via event
//! notifications where the coprocessor firmware supports them, polling
//! otherwise) and samples the battery voltage every few seconds.
//!
//! All waits are bounded spins with deadlines; the service never blocks
//! longer than one SDEP timeout and recovers from a stuck coprocessor by
//! abandoning the outstanding command.
//!
//! See `examples/simple_keyboard.rs` for a host-runnable demo against a
//! scripted coprocessor.

#![cfg_attr(not(test), no_std)]

pub mod keyboard;
pub mod report;

pub use keyboard::{BleKeyboard, KeyboardConfig};
pub use report::{Report, MOUSE_BTN_LEFT, MOUSE_BTN_MIDDLE, MOUSE_BTN_RIGHT};
