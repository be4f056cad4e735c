//! The 32x8 key matrix backing the decoder.
//!
//! Scan Code Set 2 is assigned into a 256-cell (32x8) matrix. Codes below
//! 0x80 keep their own value as the matrix position; `E0`-prefixed codes use
//! `code | 0x80`. Three positions are exceptional: F7 sends 0x83 (a plain
//! code beyond 0x7F), and PrintScreen/Pause have no single code of their own
//! so they are parked on synthetic positions.

use core::fmt;

/// Number of 8-bit rows in the matrix.
pub const MATRIX_ROWS: usize = 32;

/// F7 sends the plain scan code 0x83, the only normal code beyond 0x7F.
pub const KC_F7: u8 = 0x83;
/// Synthetic position for PrintScreen.
pub const PRINT_SCREEN: u8 = 0xFC;
/// Synthetic position for Pause.
pub const PAUSE: u8 = 0xFE;

/// Row index of a matrix position.
pub const fn row(code: u8) -> u8 {
    code >> 3
}

/// Column index of a matrix position.
pub const fn col(code: u8) -> u8 {
    code & 0x07
}

/// Bitmap of currently pressed key positions.
///
/// Bit `col` of row `row` is set iff the key at that position is down.
/// `press` and `release` are idempotent and raise the modified flag only
/// when a bit actually flips; `clear` zeroes every row without touching the
/// flag.
pub struct KeyMatrix {
    rows: [u8; MATRIX_ROWS],
    modified: bool,
}

impl KeyMatrix {
    /// Creates an empty matrix, all keys up.
    pub const fn new() -> Self {
        Self {
            rows: [0; MATRIX_ROWS],
            modified: false,
        }
    }

    /// Marks the key at `code` as pressed.
    pub fn press(&mut self, code: u8) {
        if !self.is_on(row(code), col(code)) {
            self.rows[row(code) as usize] |= 1 << col(code);
            self.modified = true;
        }
    }

    /// Marks the key at `code` as released.
    pub fn release(&mut self, code: u8) {
        if self.is_on(row(code), col(code)) {
            self.rows[row(code) as usize] &= !(1 << col(code));
            self.modified = true;
        }
    }

    /// Zeroes every row. The modified flag is left alone.
    pub fn clear(&mut self) {
        self.rows = [0; MATRIX_ROWS];
    }

    /// Returns whether the key at `row`/`col` is down.
    pub fn is_on(&self, row: u8, col: u8) -> bool {
        (self.rows[row as usize] & (1 << col)) != 0
    }

    /// Returns one row of the bitmap.
    pub fn row(&self, row: u8) -> u8 {
        self.rows[row as usize]
    }

    /// Number of keys currently down.
    pub fn key_count(&self) -> u8 {
        self.rows.iter().map(|r| r.count_ones() as u8).sum()
    }

    /// Whether any bit flipped since the start of the current scan.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn reset_modified(&mut self) {
        self.modified = false;
    }
}

impl Default for KeyMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KeyMatrix {
    /// Renders the bitmap one row per line, column 0 leftmost.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "r/c 01234567")?;
        for (i, r) in self.rows.iter().enumerate() {
            write!(f, "{i:02x}: ")?;
            for c in 0..8 {
                write!(f, "{}", (r >> c) & 1)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
