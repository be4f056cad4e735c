//! Error types for the SDEP driver.

use core::fmt::{self, Debug};

/// An error during an SPI bus operation.
pub enum SpiError<TSPIERR> {
    /// A `write` failed.
    Write(TSPIERR),
    /// A `transfer` or `read` failed.
    Transfer(TSPIERR),
}

impl<TSPIERR: Debug> Debug for SpiError<TSPIERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(err) => write!(f, "Write({err:?})"),
            Self::Transfer(err) => write!(f, "Transfer({err:?})"),
        }
    }
}

/// An error on one of the sideband GPIOs.
pub enum PinError<TPINERR> {
    /// An output pin (CS or RESET) failed.
    Output(TPINERR),
    /// The IRQ input failed.
    Input(TPINERR),
}

impl<TPINERR: Debug> Debug for PinError<TPINERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output(err) => write!(f, "Output({err:?})"),
            Self::Input(err) => write!(f, "Input({err:?})"),
        }
    }
}

/// The main error type for the SDEP driver.
pub enum SdepError<TSPIERR, TPINERR> {
    /// An SPI-related error.
    Spi(SpiError<TSPIERR>),
    /// A pin-related error.
    Pin(PinError<TPINERR>),
    /// The deadline elapsed while the coprocessor stayed busy or silent.
    Timeout,
    /// A received frame had an unexpected type or an out-of-range length.
    Frame,
    /// The command's response did not end with an `OK` line.
    Command,
}

impl<TSPIERR: Debug, TPINERR: Debug> Debug for SdepError<TSPIERR, TPINERR> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(err) => write!(f, "Spi({err:?})"),
            Self::Pin(err) => write!(f, "Pin({err:?})"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Frame => write!(f, "Frame"),
            Self::Command => write!(f, "Command"),
        }
    }
}

impl<TSPIERR, TPINERR> From<SpiError<TSPIERR>> for SdepError<TSPIERR, TPINERR> {
    fn from(spi_err: SpiError<TSPIERR>) -> Self {
        SdepError::Spi(spi_err)
    }
}

impl<TSPIERR, TPINERR> From<PinError<TPINERR>> for SdepError<TSPIERR, TPINERR> {
    fn from(pin_err: PinError<TPINERR>) -> Self {
        SdepError::Pin(pin_err)
    }
}
