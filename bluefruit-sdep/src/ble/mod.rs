//! The SDEP transport driver.

pub(crate) mod err;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use heapless::Deque;
use log::{debug, trace, warn};

use crate::sdep::{BleCommand, SdepMsg, SdepType, SDEP_MAX_PAYLOAD};
use crate::time::{millis_since, Clock};

pub use err::{PinError, SdepError, SpiError};

/// Deadline for one SDEP exchange.
pub const SDEP_TIMEOUT_MS: u16 = 150;
/// Deadline used for sends from the polling pump, so a busy coprocessor
/// does not stall the scan loop.
pub const SDEP_SHORT_TIMEOUT_MS: u16 = 10;
/// Chip-select release time after a `SlaveNotReady` handshake.
pub const SDEP_BACKOFF_US: u32 = 25;

/// Up to two commands may be outstanding before the sender must wait.
pub const MAX_PENDING_RESPONSES: usize = 2;

/// Driver for the Bluefruit LE SPI Friend.
///
/// Owns the SPI bus and the three sideband pins (chip select, the IRQ line
/// the coprocessor raises when response data is queued, and reset), plus a
/// delay provider and a millisecond clock for deadlines.
///
/// Chip select is driven manually rather than through an `SpiDevice`
/// because the `SlaveNotReady` back-off releases and re-asserts CS in the
/// middle of a logical transaction.
pub struct BluefruitLe<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK> {
    spi: TSPI,
    cs: TCS,
    irq: TIRQ,
    reset: TRST,
    delay: TDELAY,
    clock: TCLK,
    /// Dispatch timestamps of commands still awaiting a response.
    resp_queue: Deque<u16, MAX_PENDING_RESPONSES>,
}

impl<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK, TSPIERR, TPINERR>
    BluefruitLe<TSPI, TCS, TIRQ, TRST, TDELAY, TCLK>
where
    TSPIERR: core::fmt::Debug,
    TPINERR: core::fmt::Debug,
    TSPI: SpiBus<u8, Error = TSPIERR>,
    TCS: OutputPin<Error = TPINERR>,
    TIRQ: InputPin<Error = TPINERR>,
    TRST: OutputPin<Error = TPINERR>,
    TDELAY: DelayNs,
    TCLK: Clock,
{
    /// Creates a new driver instance.
    ///
    /// # Arguments
    ///
    /// * `spi` - The SPI bus shared with the coprocessor (4 MHz, mode 0).
    /// * `cs` - Chip select output, active low.
    /// * `irq` - Data-ready input, active high.
    /// * `reset` - Reset output, active low pulse.
    /// * `delay` - A blocking delay provider.
    /// * `clock` - A wrapping millisecond counter.
    pub fn new(spi: TSPI, cs: TCS, irq: TIRQ, reset: TRST, delay: TDELAY, clock: TCLK) -> Self {
        Self {
            spi,
            cs,
            irq,
            reset,
            delay,
            clock,
            resp_queue: Deque::new(),
        }
    }

    /// Pulses the reset pin and waits for the module to boot.
    ///
    /// There is no success probe; the module answers nothing until it is
    /// spoken to.
    pub fn hardware_reset(&mut self) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        debug!("sdep: hardware reset");
        self.cs.set_high().map_err(PinError::Output)?;
        self.reset.set_high().map_err(PinError::Output)?;
        self.reset.set_low().map_err(PinError::Output)?;
        self.delay.delay_ms(10);
        self.reset.set_high().map_err(PinError::Output)?;
        // Give it a second to initialize.
        self.delay.delay_ms(1000);
        Ok(())
    }

    /// Checks the data-ready line.
    pub fn irq_asserted(&mut self) -> bool {
        self.irq.is_high().unwrap_or(false)
    }

    /// Current clock reading.
    pub fn now_ms(&mut self) -> u16 {
        self.clock.now_ms()
    }

    /// Blocks for `ms` milliseconds.
    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Whether any command is still awaiting its response.
    pub fn responses_pending(&self) -> bool {
        !self.resp_queue.is_empty()
    }

    /// Number of commands awaiting a response, at most two.
    pub fn pending_responses(&self) -> usize {
        self.resp_queue.len()
    }

    /// Sends one SDEP packet.
    ///
    /// Asserts CS and writes the type byte; while the echoed byte reads
    /// `SlaveNotReady` the driver releases CS for 25 us and retries, up to
    /// `timeout_ms`. Once the coprocessor accepts, the remaining header and
    /// `len` payload bytes are streamed out.
    pub fn send_pkt(
        &mut self,
        msg: &SdepMsg,
        timeout_ms: u16,
    ) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        self.cs.set_low().map_err(PinError::Output)?;
        let start = self.clock.now_ms();
        let result = self.send_frame(msg, start, timeout_ms);
        let raised = self.cs.set_high().map_err(PinError::Output);
        result?;
        raised?;
        Ok(())
    }

    fn send_frame(
        &mut self,
        msg: &SdepMsg,
        start: u16,
        timeout_ms: u16,
    ) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        loop {
            let mut echo = [0u8; 1];
            self.spi
                .transfer(&mut echo, &[msg.msg_type])
                .map_err(SpiError::Transfer)?;
            if echo[0] != SdepType::SlaveNotReady as u8 {
                break;
            }
            // Release the bus and let the coprocessor catch up.
            self.back_off()?;
            if millis_since(self.clock.now_ms(), start) >= timeout_ms {
                return Err(SdepError::Timeout);
            }
        }

        let header = msg.header();
        self.spi.write(&header[1..]).map_err(SpiError::Write)?;
        self.spi.write(msg.payload()).map_err(SpiError::Write)?;
        self.spi.flush().map_err(SpiError::Write)?;
        Ok(())
    }

    /// Receives one SDEP packet.
    ///
    /// Waits for the IRQ line within `timeout_ms`, then clocks the frame
    /// in, backing off on `SlaveNotReady`/`SlaveOverflow` type bytes within
    /// the same deadline. Frames claiming more than 16 payload bytes are
    /// rejected.
    pub fn recv_pkt(&mut self, timeout_ms: u16) -> Result<SdepMsg, SdepError<TSPIERR, TPINERR>> {
        let start = self.clock.now_ms();
        while !self.irq_asserted() {
            if millis_since(self.clock.now_ms(), start) >= timeout_ms {
                return Err(SdepError::Timeout);
            }
            self.delay.delay_us(1);
        }

        self.cs.set_low().map_err(PinError::Output)?;
        let result = self.recv_frame(start, timeout_ms);
        let raised = self.cs.set_high().map_err(PinError::Output);
        let msg = result?;
        raised?;
        Ok(msg)
    }

    fn recv_frame(
        &mut self,
        start: u16,
        timeout_ms: u16,
    ) -> Result<SdepMsg, SdepError<TSPIERR, TPINERR>> {
        loop {
            let mut msg_type = [0u8; 1];
            self.spi.read(&mut msg_type).map_err(SpiError::Transfer)?;
            if msg_type[0] == SdepType::SlaveNotReady as u8
                || msg_type[0] == SdepType::SlaveOverflow as u8
            {
                self.back_off()?;
                if millis_since(self.clock.now_ms(), start) < timeout_ms {
                    continue;
                }
                return Err(SdepError::Timeout);
            }

            let mut header = [0u8; 3];
            self.spi.read(&mut header).map_err(SpiError::Transfer)?;
            let len = usize::from(header[2] & 0x7F);
            if len > SDEP_MAX_PAYLOAD {
                warn!("sdep: frame claims {len} payload bytes");
                return Err(SdepError::Frame);
            }

            let mut payload = [0u8; SDEP_MAX_PAYLOAD];
            self.spi
                .read(&mut payload[..len])
                .map_err(SpiError::Transfer)?;
            self.spi.flush().map_err(SpiError::Transfer)?;
            return Ok(SdepMsg::from_wire(msg_type[0], header, payload));
        }
    }

    fn back_off(&mut self) -> Result<(), PinError<TPINERR>> {
        self.cs.set_high().map_err(PinError::Output)?;
        self.delay.delay_us(SDEP_BACKOFF_US);
        self.cs.set_low().map_err(PinError::Output)
    }

    /// Issues an AT command without reading its response.
    ///
    /// The command is fragmented into `AtWrapper` packets and its dispatch
    /// timestamp is pushed onto the response queue; if both slots are taken
    /// the call drains responses until one frees up. The reply is collected
    /// later by [`drain_responses`](Self::drain_responses).
    pub fn at_command(
        &mut self,
        cmd: &str,
        timeout_ms: u16,
    ) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        trace!("sdep: send {cmd}");
        self.send_at_fragments(cmd, timeout_ms)?;

        let queued_at = self.clock.now_ms();
        while self.resp_queue.push_back(queued_at).is_err() {
            self.drain_responses(false);
        }
        let waited = millis_since(self.clock.now_ms(), queued_at);
        if waited > 0 {
            debug!("sdep: waited {waited}ms for a response slot");
        }
        Ok(())
    }

    /// Issues an AT command and reads its full response.
    ///
    /// Any in-flight responses are drained first so the reply read here
    /// unambiguously belongs to this command. Response frames are
    /// concatenated into `resp` (excess is dropped) until one arrives with
    /// the `more` bit clear. The final line of the reply must be `OK`;
    /// the preceding lines are returned with trailing CR/LF stripped.
    pub fn at_command_with_response<'r>(
        &mut self,
        cmd: &str,
        resp: &'r mut [u8],
        timeout_ms: u16,
    ) -> Result<&'r str, SdepError<TSPIERR, TPINERR>> {
        trace!("sdep: send {cmd}");
        self.flush_responses();
        self.send_at_fragments(cmd, timeout_ms)?;
        self.read_response(resp)
    }

    fn send_at_fragments(
        &mut self,
        cmd: &str,
        timeout_ms: u16,
    ) -> Result<(), SdepError<TSPIERR, TPINERR>> {
        let mut rest = cmd.as_bytes();
        while rest.len() > SDEP_MAX_PAYLOAD {
            let msg = SdepMsg::command(BleCommand::AtWrapper, &rest[..SDEP_MAX_PAYLOAD], true);
            self.send_pkt(&msg, timeout_ms)?;
            rest = &rest[SDEP_MAX_PAYLOAD..];
        }
        let msg = SdepMsg::command(BleCommand::AtWrapper, rest, false);
        self.send_pkt(&msg, timeout_ms)
    }

    fn read_response<'r>(
        &mut self,
        resp: &'r mut [u8],
    ) -> Result<&'r str, SdepError<TSPIERR, TPINERR>> {
        let mut filled = 0;
        loop {
            let msg = self.recv_pkt(2 * SDEP_TIMEOUT_MS)?;
            if msg.msg_type != SdepType::Response as u8 {
                warn!("sdep: expected a response frame, got type {:02X}", msg.msg_type);
                return Err(SdepError::Frame);
            }

            let chunk = msg.payload();
            let take = chunk.len().min(resp.len() - filled);
            resp[filled..filled + take].copy_from_slice(&chunk[..take]);
            filled += take;

            if !msg.more() {
                break;
            }
        }

        let resp: &'r [u8] = resp;
        let trimmed = trim_crlf(&resp[..filled]);
        let last_line_at = match trimmed.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if &trimmed[last_line_at..] != b"OK" {
            warn!(
                "sdep: command failed: {}",
                core::str::from_utf8(trimmed).unwrap_or("<non-ascii response>")
            );
            return Err(SdepError::Command);
        }

        let body = trim_crlf(&trimmed[..last_line_at]);
        core::str::from_utf8(body).map_err(|_| SdepError::Frame)
    }

    /// Collects replies to previously issued commands.
    ///
    /// While a command is outstanding: if the IRQ line is high, one packet
    /// is received and the head entry is retired when its final fragment
    /// arrives (greedily repeating while more data is ready); if the line
    /// is low and the head is more than two timeouts old, the command is
    /// abandoned so the link cannot deadlock on a lost reply.
    pub fn drain_responses(&mut self, greedy: bool) {
        while let Some(&sent_at) = self.resp_queue.front() {
            if self.irq_asserted() {
                if let Ok(msg) = self.recv_pkt(SDEP_TIMEOUT_MS) {
                    if !msg.more() {
                        self.resp_queue.pop_front();
                        let now = self.clock.now_ms();
                        debug!("sdep: recv latency {}ms", millis_since(now, sent_at));
                    }
                    if greedy && self.irq_asserted() {
                        continue;
                    }
                }
                return;
            }

            let now = self.clock.now_ms();
            if millis_since(now, sent_at) > 2 * SDEP_TIMEOUT_MS {
                debug!(
                    "sdep: response timed out, {} outstanding",
                    self.resp_queue.len()
                );
                self.resp_queue.pop_front();
            }
            return;
        }
    }

    /// Drains until no command is outstanding.
    ///
    /// Bounded by the head-of-line timeout: every entry either completes or
    /// is abandoned within two timeouts.
    pub fn flush_responses(&mut self) {
        let mut logged = false;
        while !self.resp_queue.is_empty() {
            if !logged {
                debug!("sdep: waiting for in-flight responses");
                logged = true;
            }
            self.drain_responses(true);
        }
    }
}

fn trim_crlf(mut bytes: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = bytes {
        bytes = rest;
    }
    bytes
}
