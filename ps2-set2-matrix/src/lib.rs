//! A `no_std` decoder for PS/2 Scan Code Set 2 byte streams.
//!
//! Scan Code Set 2 is a prefix/postfix-encoded stream: `F0` marks a break,
//! `E0` escapes the extended keys, and a handful of keys (PrintScreen,
//! Pause, F7) need exceptional handling. This crate collapses that stream
//! into a sparse 32-row by 8-column bitmap of currently pressed keys, which
//! a host layer can diff into key events.
//!
//! The decoder is polled: each call to [`Ps2Decoder::scan`] consumes at most
//! one byte from a [`Ps2Source`] and applies at most one matrix transition.
//! Pause has no break code on the wire, so it is reported as a one-scan
//! pulse: the bit is set when the make sequence completes and cleared again
//! at the top of the next scan.
//!
//! # Usage
//!
//! ```
//! use ps2_set2_matrix::{Ps2Decoder, Ps2Source, Ps2BusError, row, col};
//!
//! struct SliceSource<'a> {
//!     bytes: &'a [u8],
//! }
//!
//! impl Ps2Source for SliceSource<'_> {
//!     fn recv(&mut self) -> Result<Option<u8>, Ps2BusError> {
//!         match self.bytes.split_first() {
//!             Some((&b, rest)) => {
//!                 self.bytes = rest;
//!                 Ok(Some(b))
//!             }
//!             None => Ok(None),
//!         }
//!     }
//! }
//!
//! // "A" pressed, then released: 1C, F0 1C.
//! let mut source = SliceSource { bytes: &[0x1C, 0xF0, 0x1C] };
//! let mut decoder = Ps2Decoder::new();
//!
//! decoder.scan(&mut source);
//! assert!(decoder.matrix().is_on(row(0x1C), col(0x1C)));
//!
//! decoder.scan(&mut source);
//! decoder.scan(&mut source);
//! assert_eq!(decoder.matrix().key_count(), 0);
//! ```

#![cfg_attr(not(test), no_std)]

pub mod decoder;
pub mod matrix;

pub use decoder::{Ps2BusError, Ps2Decoder, Ps2Source, ScanOutcome};
pub use matrix::{col, row, KeyMatrix, KC_F7, MATRIX_ROWS, PAUSE, PRINT_SCREEN};
