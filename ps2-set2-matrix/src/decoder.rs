//! The Scan Code Set 2 state machine.
//!
//! Several keys are encoded exceptionally, with sequences that vary by
//! modifier and Num-Lock state:
//!
//! 1. The cursor/navigation block and keypad `/` are wrapped in `E0 12` /
//!    `E0 59` shift-synthesis prefixes that fake a Shift release. These
//!    carry no information of their own and are swallowed.
//! 2. PrintScreen arrives as `E0 12 E0 7C` (or plain `84` when Alt is held);
//!    both spellings map to the PrintScreen position.
//! 3. Pause has a make sequence (`E1 14 77 E1 F0 14 F0 77`, or `E0 7E E0 F0
//!    7E` under Control) and *no break sequence*, so the matrix bit is
//!    pulsed: set when the sequence completes, cleared at the top of the
//!    next scan.
//!
//! Any unexpected byte at or above 0x80 outside the escape chains means the
//! bus lost sync; the matrix is cleared and the caller is told to release
//! any keys the host still believes are down.

use log::{trace, warn};

use crate::matrix::{col, row, KeyMatrix, KC_F7, PAUSE, PRINT_SCREEN};

/// Parity or framing failure reported by the PS/2 bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ps2BusError;

/// One byte at a time from the PS/2 bus.
///
/// `Ok(None)` means no byte was pending this poll. `Err` means the byte was
/// corrupted on the wire; the decoder drops the poll and leaves its state
/// untouched.
pub trait Ps2Source {
    fn recv(&mut self) -> Result<Option<u8>, Ps2BusError>;
}

/// What the host needs to act on after a scan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Nothing beyond ordinary matrix updates happened.
    Idle,
    /// The stream desynchronised or the keyboard reported an overrun. The
    /// matrix has been cleared; the host must release any held keys.
    LostSync,
    /// The keyboard completed its basic assurance test; the host should
    /// refresh the lock LEDs.
    SelfTest { passed: bool },
}

/// Scan-code prefix consumed so far. Each variant is named after the byte
/// sequence that leads to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    F0,
    E0,
    E0F0,
    // Pause: E1 14 77 E1 F0 14 F0 77
    E1,
    E114,
    E11477,
    E11477E1,
    E11477E1F0,
    E11477E1F014,
    E11477E1F014F0,
    // Control'd Pause: E0 7E E0 F0 7E
    E07E,
    E07EE0,
    E07EE0F0,
}

/// Decoder for a Scan Code Set 2 byte stream, driving a [`KeyMatrix`].
pub struct Ps2Decoder {
    state: State,
    matrix: KeyMatrix,
}

impl Ps2Decoder {
    pub const fn new() -> Self {
        Self {
            state: State::Init,
            matrix: KeyMatrix::new(),
        }
    }

    /// The current key state.
    pub fn matrix(&self) -> &KeyMatrix {
        &self.matrix
    }

    /// Polls one byte from `source` and advances the state machine.
    ///
    /// Also performs the Pause pseudo-break: Pause has no break code, so a
    /// set Pause bit is cleared here, one scan after its make.
    pub fn scan<S: Ps2Source>(&mut self, source: &mut S) -> ScanOutcome {
        self.matrix.reset_modified();

        if self.matrix.is_on(row(PAUSE), col(PAUSE)) {
            self.matrix.release(PAUSE);
        }

        let code = match source.recv() {
            Ok(Some(code)) => code,
            Ok(None) => return ScanOutcome::Idle,
            Err(Ps2BusError) => {
                // TODO: request a resend (0xFE) once a host-to-keyboard
                // send path exists.
                trace!("ps2: bus error, byte dropped");
                return ScanOutcome::Idle;
            }
        };
        trace!("ps2: {code:02X}");

        match self.state {
            State::Init => match code {
                0xE0 => self.step(State::E0),
                0xF0 => self.step(State::F0),
                0xE1 => self.step(State::E1),
                KC_F7 => self.press(KC_F7),
                0x84 => self.press(PRINT_SCREEN), // Alt'd PrintScreen
                0x00 => {
                    warn!("ps2: overrun");
                    self.lose_sync()
                }
                0xAA | 0xFC => {
                    // Self-test result right after power-up or reset.
                    self.state = State::Init;
                    ScanOutcome::SelfTest {
                        passed: code == 0xAA,
                    }
                }
                _ if code < 0x80 => self.press(code),
                _ => self.desync(code),
            },
            State::E0 => match code {
                // Shift-synthesis prefixes, swallowed.
                0x12 | 0x59 => self.step(State::Init),
                0x7E => self.step(State::E07E),
                0xF0 => self.step(State::E0F0),
                _ if code < 0x80 => self.press(code | 0x80),
                _ => self.desync(code),
            },
            State::F0 => match code {
                KC_F7 => self.release(KC_F7),
                0x84 => self.release(PRINT_SCREEN),
                _ if code < 0x80 => self.release(code),
                _ => self.desync(code),
            },
            State::E0F0 => match code {
                0x12 | 0x59 => self.step(State::Init),
                _ if code < 0x80 => self.release(code | 0x80),
                _ => self.desync(code),
            },
            // The Pause chain: any mismatch silently resets, the partial
            // sequence is harmless garbage.
            State::E1 => self.expect(code, 0x14, State::E114),
            State::E114 => self.expect(code, 0x77, State::E11477),
            State::E11477 => self.expect(code, 0xE1, State::E11477E1),
            State::E11477E1 => self.expect(code, 0xF0, State::E11477E1F0),
            State::E11477E1F0 => self.expect(code, 0x14, State::E11477E1F014),
            State::E11477E1F014 => self.expect(code, 0xF0, State::E11477E1F014F0),
            State::E11477E1F014F0 => {
                if code == 0x77 {
                    self.matrix.press(PAUSE);
                }
                self.step(State::Init)
            }
            State::E07E => self.expect(code, 0xE0, State::E07EE0),
            State::E07EE0 => self.expect(code, 0xF0, State::E07EE0F0),
            State::E07EE0F0 => {
                if code == 0x7E {
                    self.matrix.press(PAUSE);
                }
                self.step(State::Init)
            }
        }
    }

    fn step(&mut self, next: State) -> ScanOutcome {
        self.state = next;
        ScanOutcome::Idle
    }

    fn expect(&mut self, code: u8, wanted: u8, next: State) -> ScanOutcome {
        self.state = if code == wanted { next } else { State::Init };
        ScanOutcome::Idle
    }

    fn press(&mut self, pos: u8) -> ScanOutcome {
        self.matrix.press(pos);
        self.step(State::Init)
    }

    fn release(&mut self, pos: u8) -> ScanOutcome {
        self.matrix.release(pos);
        self.step(State::Init)
    }

    fn desync(&mut self, code: u8) -> ScanOutcome {
        warn!("ps2: unexpected scan code at {:?}: {code:02X}", self.state);
        self.lose_sync()
    }

    fn lose_sync(&mut self) -> ScanOutcome {
        self.matrix.clear();
        self.state = State::Init;
        ScanOutcome::LostSync
    }
}

impl Default for Ps2Decoder {
    fn default() -> Self {
        Self::new()
    }
}
